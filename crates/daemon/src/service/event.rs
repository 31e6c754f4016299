use std::fmt;

use serde::{Deserialize, Serialize};

use super::result::MountResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountEventType {
    Added,
    Changed,
    Disabled,
    Enabled,
    Removed,
    Aborted,
}

impl MountEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountEventType::Added => "MOUNT_ADDED",
            MountEventType::Changed => "MOUNT_CHANGED",
            MountEventType::Disabled => "MOUNT_DISABLED",
            MountEventType::Enabled => "MOUNT_ENABLED",
            MountEventType::Removed => "MOUNT_REMOVED",
            MountEventType::Aborted => "MOUNT_ABORTED",
        }
    }
}

impl fmt::Display for MountEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one administrative call, as reported to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEvent {
    pub name: String,
    pub kind: MountEventType,
    pub result: MountResult,
}

impl MountEvent {
    pub fn new(name: impl Into<String>, kind: MountEventType, result: MountResult) -> Self {
        Self {
            name: name.into(),
            kind,
            result,
        }
    }
}

impl fmt::Display for MountEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.kind, self.name, self.result)
    }
}

/// Where mount events are delivered
pub trait MountEventSink: Send + Sync + 'static {
    fn emit(&self, event: MountEvent);
}

impl MountEventSink for flume::Sender<MountEvent> {
    fn emit(&self, event: MountEvent) {
        if self.send(event).is_err() {
            tracing::debug!("mount event receiver dropped");
        }
    }
}

/// Sink that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MountEventSink for LogSink {
    fn emit(&self, event: MountEvent) {
        if event.result.is_success() {
            tracing::info!("{}", event);
        } else {
            tracing::warn!("{} ({})", event, event.result.description());
        }
    }
}
