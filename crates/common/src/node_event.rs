//! Cloud change notifications
//!
//! The backend reports every change to the account's tree as a [`NodeEvent`]
//! carrying a sequence number that is monotonic per account. Consumers drain
//! a [`NodeEventQueue`] once and apply the events in sequence order.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::client::{NodeHandle, NodeInfo};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeEventType {
    Added,
    Modified,
    Moved,
    Permissions,
    Removed,
}

impl NodeEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeEventType::Added => "added",
            NodeEventType::Modified => "modified",
            NodeEventType::Moved => "moved",
            NodeEventType::Permissions => "permissions",
            NodeEventType::Removed => "removed",
        }
    }
}

impl fmt::Display for NodeEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single change to the cloud tree
///
/// `info` describes the node after the change, so for a move it carries the
/// new parent and name. For a removal only the handle is meaningful.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub sequence: u64,
    pub kind: NodeEventType,
    pub info: NodeInfo,
}

impl NodeEvent {
    pub fn new(sequence: u64, kind: NodeEventType, info: NodeInfo) -> Self {
        Self {
            sequence,
            kind,
            info,
        }
    }

    pub fn handle(&self) -> NodeHandle {
        self.info.handle
    }

    pub fn is_directory(&self) -> bool {
        self.info.is_directory
    }
}

/// A finite batch of change events, consumed once
pub trait NodeEventQueue: Send {
    fn pop_front(&mut self) -> Option<NodeEvent>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain the queue into a vector ordered by sequence number
    ///
    /// Events with equal sequence numbers keep their arrival order.
    fn drain_ordered(&mut self) -> Vec<NodeEvent> {
        let mut events = Vec::with_capacity(self.len());
        while let Some(event) = self.pop_front() {
            events.push(event);
        }
        events.sort_by_key(|event| event.sequence);
        events
    }
}

impl NodeEventQueue for VecDeque<NodeEvent> {
    fn pop_front(&mut self) -> Option<NodeEvent> {
        VecDeque::pop_front(self)
    }

    fn len(&self) -> usize {
        VecDeque::len(self)
    }
}

impl NodeEventQueue for std::vec::IntoIter<NodeEvent> {
    fn pop_front(&mut self) -> Option<NodeEvent> {
        self.next()
    }

    fn len(&self) -> usize {
        ExactSizeIterator::len(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(sequence: u64, kind: NodeEventType) -> NodeEvent {
        NodeEvent::new(
            sequence,
            kind,
            NodeInfo {
                handle: NodeHandle::new(sequence),
                parent: Some(NodeHandle::new(1)),
                name: format!("node-{}", sequence),
                is_directory: false,
                size: 0,
                modified: 0,
            },
        )
    }

    #[test]
    fn test_drain_orders_by_sequence() {
        let mut queue: VecDeque<NodeEvent> = VecDeque::new();
        queue.push_back(event(7, NodeEventType::Modified));
        queue.push_back(event(3, NodeEventType::Added));
        queue.push_back(event(5, NodeEventType::Removed));

        let drained = queue.drain_ordered();
        let sequences: Vec<u64> = drained.iter().map(|e| e.sequence).collect();

        assert_eq!(sequences, vec![3, 5, 7]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_vec_iter_queue() {
        let mut queue = vec![event(2, NodeEventType::Moved), event(1, NodeEventType::Added)]
            .into_iter();
        assert_eq!(NodeEventQueue::len(&queue), 2);

        let drained = queue.drain_ordered();
        assert_eq!(drained[0].kind, NodeEventType::Added);
        assert_eq!(drained[1].kind, NodeEventType::Moved);
    }
}
