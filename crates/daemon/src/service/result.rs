use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of an administrative mount operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MountResult {
    Aborted,
    BackendUnavailable,
    Busy,
    Failed,
    LocalExists,
    LocalFile,
    LocalSyncing,
    LocalTaken,
    LocalUnknown,
    NameTaken,
    NameTooLong,
    NoName,
    RemoteFile,
    RemoteUnknown,
    Success,
    Unexpected,
    Unknown,
    Unsupported,
}

impl MountResult {
    pub fn is_success(&self) -> bool {
        *self == MountResult::Success
    }

    /// Stable identifier, as reported to clients
    pub fn as_str(&self) -> &'static str {
        match self {
            MountResult::Aborted => "MOUNT_ABORTED",
            MountResult::BackendUnavailable => "MOUNT_BACKEND_UNAVAILABLE",
            MountResult::Busy => "MOUNT_BUSY",
            MountResult::Failed => "MOUNT_FAILED",
            MountResult::LocalExists => "MOUNT_LOCAL_EXISTS",
            MountResult::LocalFile => "MOUNT_LOCAL_FILE",
            MountResult::LocalSyncing => "MOUNT_LOCAL_SYNCING",
            MountResult::LocalTaken => "MOUNT_LOCAL_TAKEN",
            MountResult::LocalUnknown => "MOUNT_LOCAL_UNKNOWN",
            MountResult::NameTaken => "MOUNT_NAME_TAKEN",
            MountResult::NameTooLong => "MOUNT_NAME_TOO_LONG",
            MountResult::NoName => "MOUNT_NO_NAME",
            MountResult::RemoteFile => "MOUNT_REMOTE_FILE",
            MountResult::RemoteUnknown => "MOUNT_REMOTE_UNKNOWN",
            MountResult::Success => "MOUNT_SUCCESS",
            MountResult::Unexpected => "MOUNT_UNEXPECTED",
            MountResult::Unknown => "MOUNT_UNKNOWN",
            MountResult::Unsupported => "MOUNT_UNSUPPORTED",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            MountResult::Aborted => "The mount was aborted",
            MountResult::BackendUnavailable => "The cloud backend is unavailable",
            MountResult::Busy => "The mount is busy",
            MountResult::Failed => "The mount operation failed",
            MountResult::LocalExists => "The local path already exists",
            MountResult::LocalFile => "The local path is a file",
            MountResult::LocalSyncing => "The local path is being synchronized",
            MountResult::LocalTaken => "The local path is already used by another mount",
            MountResult::LocalUnknown => "The local path does not exist",
            MountResult::NameTaken => "The name is already used by another mount",
            MountResult::NameTooLong => "The name is too long",
            MountResult::NoName => "The mount has no name",
            MountResult::RemoteFile => "The cloud node is a file",
            MountResult::RemoteUnknown => "The cloud node does not exist",
            MountResult::Success => "Success",
            MountResult::Unexpected => "An unexpected error occurred",
            MountResult::Unknown => "No such mount",
            MountResult::Unsupported => "Mounts are not supported",
        }
    }
}

impl fmt::Display for MountResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
