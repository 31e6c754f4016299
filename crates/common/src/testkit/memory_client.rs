use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::client::{Client, ClientError, NodeHandle, NodeInfo};
use crate::node_event::{NodeEvent, NodeEventType};

struct MemoryNode {
    info: NodeInfo,
    data: Vec<u8>,
}

struct MemoryTree {
    nodes: BTreeMap<NodeHandle, MemoryNode>,
    next_handle: u64,
    sequence: u64,
    events: VecDeque<NodeEvent>,
}

impl MemoryTree {
    fn allocate(&mut self) -> NodeHandle {
        let handle = NodeHandle::new(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn record(&mut self, kind: NodeEventType, info: NodeInfo) {
        self.sequence += 1;
        self.events
            .push_back(NodeEvent::new(self.sequence, kind, info));
    }

    fn node(&self, handle: NodeHandle) -> Result<&MemoryNode, ClientError> {
        self.nodes.get(&handle).ok_or(ClientError::NotFound)
    }

    fn directory(&self, handle: NodeHandle) -> Result<&MemoryNode, ClientError> {
        let node = self.node(handle)?;
        if !node.info.is_directory {
            return Err(ClientError::NotDirectory);
        }
        Ok(node)
    }

    fn find_child(&self, parent: NodeHandle, name: &str) -> Option<&MemoryNode> {
        self.nodes
            .values()
            .find(|n| n.info.parent == Some(parent) && n.info.name == name)
    }

    fn has_children(&self, handle: NodeHandle) -> bool {
        self.nodes.values().any(|n| n.info.parent == Some(handle))
    }

    fn insert(
        &mut self,
        parent: NodeHandle,
        name: &str,
        is_directory: bool,
        data: Vec<u8>,
    ) -> Result<NodeInfo, ClientError> {
        self.directory(parent)?;
        if self.find_child(parent, name).is_some() {
            return Err(ClientError::Exists(name.to_string()));
        }

        let handle = self.allocate();
        let info = NodeInfo {
            handle,
            parent: Some(parent),
            name: name.to_string(),
            is_directory,
            size: data.len() as u64,
            modified: self.sequence as i64,
        };
        self.nodes.insert(
            handle,
            MemoryNode {
                info: info.clone(),
                data,
            },
        );
        self.record(NodeEventType::Added, info.clone());
        Ok(info)
    }
}

/// A `Client` over an in-memory tree
///
/// Counts metadata fetches and content reads so tests can assert on how
/// often the backend was consulted. Every mutation is recorded as a
/// [`NodeEvent`] with an increasing sequence number.
pub struct MemoryClient {
    root: NodeHandle,
    tree: Mutex<MemoryTree>,
    fetches: AtomicUsize,
    reads: AtomicUsize,
    latency: Mutex<Option<Duration>>,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClient {
    pub fn new() -> Self {
        let root = NodeHandle::new(0x100);
        let mut nodes = BTreeMap::new();
        nodes.insert(
            root,
            MemoryNode {
                info: NodeInfo {
                    handle: root,
                    parent: None,
                    name: String::new(),
                    is_directory: true,
                    size: 0,
                    modified: 0,
                },
                data: Vec::new(),
            },
        );

        Self {
            root,
            tree: Mutex::new(MemoryTree {
                nodes,
                next_handle: root.as_u64() + 1,
                sequence: 0,
                events: VecDeque::new(),
            }),
            fetches: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            latency: Mutex::new(None),
        }
    }

    pub fn root(&self) -> NodeHandle {
        self.root
    }

    pub fn add_directory(&self, parent: NodeHandle, name: &str) -> Result<NodeHandle, ClientError> {
        let info = self.tree.lock().insert(parent, name, true, Vec::new())?;
        Ok(info.handle)
    }

    pub fn add_file(
        &self,
        parent: NodeHandle,
        name: &str,
        data: &[u8],
    ) -> Result<NodeHandle, ClientError> {
        let info = self.tree.lock().insert(parent, name, false, data.to_vec())?;
        Ok(info.handle)
    }

    /// Replace a file's content, recording a `Modified` event
    pub fn modify_file(&self, handle: NodeHandle, data: &[u8]) -> Result<NodeInfo, ClientError> {
        let mut tree = self.tree.lock();
        let modified = tree.sequence as i64 + 1;
        let node = tree.nodes.get_mut(&handle).ok_or(ClientError::NotFound)?;
        if node.info.is_directory {
            return Err(ClientError::IsDirectory);
        }
        node.data = data.to_vec();
        node.info.size = data.len() as u64;
        node.info.modified = modified;
        let info = node.info.clone();
        tree.record(NodeEventType::Modified, info.clone());
        Ok(info)
    }

    /// Take every event recorded since the last call
    pub fn take_events(&self) -> VecDeque<NodeEvent> {
        std::mem::take(&mut self.tree.lock().events)
    }

    /// Number of metadata fetches (`get`, `child`, `children`) served
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of content downloads served
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Delay every fetch and read by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    async fn delay(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait::async_trait]
impl Client for MemoryClient {
    async fn get(&self, handle: NodeHandle) -> Result<NodeInfo, ClientError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        Ok(self.tree.lock().node(handle)?.info.clone())
    }

    async fn child(&self, parent: NodeHandle, name: &str) -> Result<NodeInfo, ClientError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let tree = self.tree.lock();
        tree.directory(parent)?;
        tree.find_child(parent, name)
            .map(|n| n.info.clone())
            .ok_or(ClientError::NotFound)
    }

    async fn children(&self, parent: NodeHandle) -> Result<Vec<NodeInfo>, ClientError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let tree = self.tree.lock();
        tree.directory(parent)?;
        Ok(tree
            .nodes
            .values()
            .filter(|n| n.info.parent == Some(parent))
            .map(|n| n.info.clone())
            .collect())
    }

    async fn read(&self, handle: NodeHandle) -> Result<Vec<u8>, ClientError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let tree = self.tree.lock();
        let node = tree.node(handle)?;
        if node.info.is_directory {
            return Err(ClientError::IsDirectory);
        }
        Ok(node.data.clone())
    }

    async fn upload(
        &self,
        parent: NodeHandle,
        name: &str,
        data: Vec<u8>,
    ) -> Result<NodeInfo, ClientError> {
        let existing = {
            let tree = self.tree.lock();
            tree.directory(parent)?;
            tree.find_child(parent, name).map(|n| n.info.clone())
        };

        match existing {
            Some(info) if info.is_directory => Err(ClientError::IsDirectory),
            Some(info) => self.modify_file(info.handle, &data),
            None => self.tree.lock().insert(parent, name, false, data),
        }
    }

    async fn make_directory(&self, parent: NodeHandle, name: &str) -> Result<NodeInfo, ClientError> {
        self.tree.lock().insert(parent, name, true, Vec::new())
    }

    async fn move_node(
        &self,
        handle: NodeHandle,
        new_parent: NodeHandle,
        new_name: &str,
    ) -> Result<NodeInfo, ClientError> {
        let mut tree = self.tree.lock();
        tree.directory(new_parent)?;
        tree.node(handle)?;
        if let Some(existing) = tree.find_child(new_parent, new_name) {
            if existing.info.handle != handle {
                return Err(ClientError::Exists(new_name.to_string()));
            }
        }

        let node = tree.nodes.get_mut(&handle).ok_or(ClientError::NotFound)?;
        node.info.parent = Some(new_parent);
        node.info.name = new_name.to_string();
        let info = node.info.clone();
        tree.record(NodeEventType::Moved, info.clone());
        Ok(info)
    }

    async fn remove(&self, handle: NodeHandle) -> Result<(), ClientError> {
        let mut tree = self.tree.lock();
        if handle == self.root {
            return Err(ClientError::AccessDenied);
        }
        if tree.has_children(handle) {
            return Err(ClientError::NotEmpty);
        }
        let node = tree.nodes.remove(&handle).ok_or(ClientError::NotFound)?;
        tree.record(NodeEventType::Removed, node.info);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tree_operations_record_events() {
        let client = MemoryClient::new();
        let docs = client.add_directory(client.root(), "docs").unwrap();
        let file = client.add_file(docs, "a.txt", b"hello").unwrap();

        let found = client.child(docs, "a.txt").await.unwrap();
        assert_eq!(found.handle, file);
        assert_eq!(found.size, 5);
        assert_eq!(client.read(file).await.unwrap(), b"hello");

        client.move_node(file, client.root(), "b.txt").await.unwrap();
        client.remove(docs).await.unwrap();

        let kinds: Vec<NodeEventType> = client.take_events().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                NodeEventType::Added,
                NodeEventType::Added,
                NodeEventType::Moved,
                NodeEventType::Removed
            ]
        );
        assert_eq!(client.fetch_count(), 1);
        assert_eq!(client.read_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_refuses_non_empty_directory() {
        let client = MemoryClient::new();
        let docs = client.add_directory(client.root(), "docs").unwrap();
        client.add_file(docs, "a.txt", b"").unwrap();

        assert_eq!(client.remove(docs).await, Err(ClientError::NotEmpty));
    }

    #[tokio::test]
    async fn test_upload_replaces_existing_file() {
        let client = MemoryClient::new();
        let file = client.add_file(client.root(), "a.txt", b"one").unwrap();

        let info = client
            .upload(client.root(), "a.txt", b"three".to_vec())
            .await
            .unwrap();
        assert_eq!(info.handle, file);
        assert_eq!(info.size, 5);
    }
}
