//! Shared test utilities for the common crate's integration tests
#![allow(dead_code)]

use common::prelude::{NodeEvent, NodeEventType, NodeHandle, NodeInfo};

/// Metadata for a file `name` under `parent`
pub fn file(handle: u64, parent: u64, name: &str, size: u64) -> NodeInfo {
    NodeInfo {
        handle: NodeHandle::new(handle),
        parent: Some(NodeHandle::new(parent)),
        name: name.to_string(),
        is_directory: false,
        size,
        modified: 0,
    }
}

/// Metadata for a directory `name` under `parent`
pub fn directory(handle: u64, parent: u64, name: &str) -> NodeInfo {
    NodeInfo {
        is_directory: true,
        ..file(handle, parent, name, 0)
    }
}

pub fn event(sequence: u64, kind: NodeEventType, info: NodeInfo) -> NodeEvent {
    NodeEvent::new(sequence, kind, info)
}
