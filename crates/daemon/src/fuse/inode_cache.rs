//! Path translation and metadata cache for one mount
//!
//! The cache maps cloud node handles to their metadata and their children by
//! name, and hands out inode numbers through the [`InodeTable`]. Three
//! timelines touch it concurrently: kernel requests (lookups and listings),
//! cloud change events, and local mutations made through the client.
//!
//! Consistency rules:
//!
//! - every key has at most one fetch in flight. Concurrent lookups of the
//!   same `(parent, name)`, listings of the same directory, or refreshes of
//!   the same handle share a single `futures::future::Shared` fetch. The
//!   fetch writes its result into the cache before its slot is released.
//! - every node event records its sequence number against the handle. Events
//!   at or below the recorded sequence are ignored, and a fetch that started
//!   before a newer event never overwrites what that event wrote.
//!   Sequences are forgotten once the handle leaves the cache and no fetch
//!   that predates them is still running.
//! - until [`InodeCache::set_current`] is called, a miss always asks the
//!   cloud. Afterwards a miss under a fully listed directory is an answer.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use common::prelude::{Client, ClientError, NodeEvent, NodeEventType, NodeHandle, NodeInfo};

use super::error::InodeError;
use super::inode_store::InodeStore;
use super::inode_table::InodeTable;

/// What `describe` reports about a path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeInfo {
    pub inode: u64,
    pub handle: NodeHandle,
    pub parent: Option<NodeHandle>,
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    pub modified: i64,
    /// Whether the owning mount is read-only
    pub read_only: bool,
}

impl InodeInfo {
    pub fn new(inode: u64, info: NodeInfo, read_only: bool) -> Self {
        Self {
            inode,
            handle: info.handle,
            parent: info.parent,
            name: info.name,
            is_directory: info.is_directory,
            size: info.size,
            modified: info.modified,
            read_only,
        }
    }
}

#[derive(Debug)]
struct CachedNode {
    info: NodeInfo,
    children: BTreeMap<String, NodeHandle>,
    /// `children` holds the full listing
    complete: bool,
}

impl CachedNode {
    fn new(info: NodeInfo) -> Self {
        Self {
            info,
            children: BTreeMap::new(),
            complete: false,
        }
    }
}

enum Resolved {
    Found(NodeInfo),
    Absent,
    Unknown,
}

#[derive(Debug)]
struct CacheState {
    root: NodeHandle,
    nodes: HashMap<NodeHandle, CachedNode>,
    /// Sequence of the last event applied per handle
    versions: HashMap<NodeHandle, u64>,
    /// Highest sequence applied so far
    sequence: u64,
    /// Start sequences of the fetches in flight, with their counts
    fetches: BTreeMap<u64, usize>,
    inodes: InodeTable,
}

impl CacheState {
    fn new(root: NodeHandle) -> Self {
        Self {
            root,
            nodes: HashMap::new(),
            versions: HashMap::new(),
            sequence: 0,
            fetches: BTreeMap::new(),
            inodes: InodeTable::new(root),
        }
    }

    fn begin_fetch(&mut self) -> u64 {
        let start = self.sequence;
        *self.fetches.entry(start).or_default() += 1;
        start
    }

    fn end_fetch(&mut self, start: u64) {
        if let Some(count) = self.fetches.get_mut(&start) {
            *count -= 1;
            if *count == 0 {
                self.fetches.remove(&start);
            }
        }
        self.prune_versions();
    }

    /// Forget event sequences nothing can consult any more
    ///
    /// A version is kept while its handle is cached or bound to an inode, or
    /// while a fetch that started before it is still in flight.
    fn prune_versions(&mut self) {
        let oldest = self.fetches.keys().next().copied();
        let nodes = &self.nodes;
        let inodes = &self.inodes;
        self.versions.retain(|handle, version| {
            nodes.contains_key(handle)
                || inodes.inode(*handle).is_some()
                || oldest.is_some_and(|start| *version > start)
        });
    }

    fn touched_since(&self, handle: NodeHandle, start: u64) -> bool {
        self.versions.get(&handle).is_some_and(|v| *v > start)
    }

    fn resolve_child(&self, parent: NodeHandle, name: &str, current: bool) -> Resolved {
        let Some(node) = self.nodes.get(&parent) else {
            return Resolved::Unknown;
        };

        match node.children.get(name).and_then(|h| self.nodes.get(h)) {
            Some(child) => Resolved::Found(child.info.clone()),
            None if node.complete && current => Resolved::Absent,
            None => Resolved::Unknown,
        }
    }

    /// Insert or update `info`, attaching it under its parent
    ///
    /// Nodes whose parent is not cached are left out, except the root.
    fn upsert(&mut self, info: NodeInfo) {
        let handle = info.handle;
        let parent_cached = info.parent.is_some_and(|p| self.nodes.contains_key(&p));

        if handle != self.root && !parent_cached {
            if self.nodes.contains_key(&handle) {
                // moved out of the cached tree
                self.evict(handle);
            }
            return;
        }

        let previous = self
            .nodes
            .get(&handle)
            .map(|n| (n.info.parent, n.info.name.clone()));
        if let Some((old_parent, old_name)) = previous {
            if old_parent != info.parent || old_name != info.name {
                self.detach(handle, old_parent, &old_name);
            }
        }

        if handle != self.root {
            if let Some(parent) = info.parent {
                let displaced = self
                    .nodes
                    .get_mut(&parent)
                    .and_then(|p| p.children.insert(info.name.clone(), handle))
                    .filter(|h| *h != handle);
                if let Some(displaced) = displaced {
                    self.evict(displaced);
                    // evict detached the name, put ours back
                    if let Some(p) = self.nodes.get_mut(&parent) {
                        p.children.insert(info.name.clone(), handle);
                    }
                }
            }
        }

        match self.nodes.get_mut(&handle) {
            Some(node) => {
                if node.info.is_directory != info.is_directory {
                    node.children.clear();
                    node.complete = false;
                }
                node.info = info;
            }
            None => {
                self.nodes.insert(handle, CachedNode::new(info));
            }
        }
    }

    fn detach(&mut self, handle: NodeHandle, parent: Option<NodeHandle>, name: &str) {
        if let Some(parent) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            if parent.children.get(name) == Some(&handle) {
                parent.children.remove(name);
            }
        }
    }

    /// Drop `handle` and everything cached beneath it
    ///
    /// Returns the evicted handles.
    fn evict(&mut self, handle: NodeHandle) -> Vec<NodeHandle> {
        let mut evicted = Vec::new();
        let Some(node) = self.nodes.remove(&handle) else {
            return evicted;
        };
        self.detach(handle, node.info.parent, &node.info.name);

        let mut stack: Vec<NodeHandle> = node.children.values().copied().collect();
        evicted.push(handle);
        while let Some(next) = stack.pop() {
            if let Some(child) = self.nodes.remove(&next) {
                stack.extend(child.children.values().copied());
                evicted.push(next);
            }
        }
        evicted
    }

    /// Merge a fetched node, unless a newer event already spoke for it
    fn reconcile_fetched(&mut self, info: NodeInfo, start: u64) -> Option<NodeInfo> {
        let handle = info.handle;
        if self.touched_since(handle, start) {
            return self.nodes.get(&handle).map(|n| n.info.clone());
        }
        self.upsert(info.clone());
        Some(info)
    }

    /// The cloud said `parent/name` does not exist
    fn reconcile_missing(&self, parent: NodeHandle, name: &str) -> Option<NodeInfo> {
        // an event may have created it while we were asking
        self.nodes
            .get(&parent)
            .and_then(|p| p.children.get(name))
            .and_then(|h| self.nodes.get(h))
            .map(|n| n.info.clone())
    }

    fn reconcile_listing(
        &mut self,
        parent: NodeHandle,
        fetched: Vec<NodeInfo>,
        start: u64,
    ) -> Vec<NodeInfo> {
        if !self.nodes.contains_key(&parent) {
            return fetched;
        }

        let fetched_handles: HashSet<NodeHandle> = fetched.iter().map(|i| i.handle).collect();
        for info in fetched {
            if !self.touched_since(info.handle, start) {
                self.upsert(info);
            }
        }

        let stale: Vec<NodeHandle> = self
            .nodes
            .get(&parent)
            .map(|p| {
                p.children
                    .values()
                    .filter(|h| !fetched_handles.contains(h) && !self.touched_since(**h, start))
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        for handle in stale {
            self.evict(handle);
        }

        match self.nodes.get_mut(&parent) {
            Some(node) => {
                node.complete = true;
                let handles: Vec<NodeHandle> = node.children.values().copied().collect();
                handles
                    .iter()
                    .filter_map(|h| self.nodes.get(h).map(|n| n.info.clone()))
                    .collect()
            }
            None => Vec::new(),
        }
    }

    /// Apply one change event, returning handles whose content is stale
    fn apply(&mut self, event: &NodeEvent) -> Vec<NodeHandle> {
        let handle = event.handle();
        if self
            .versions
            .get(&handle)
            .is_some_and(|v| *v >= event.sequence)
        {
            return Vec::new();
        }
        self.versions.insert(handle, event.sequence);
        self.sequence = self.sequence.max(event.sequence);

        match event.kind {
            NodeEventType::Removed => {
                let mut evicted = self.evict(handle);
                if evicted.is_empty() {
                    evicted.push(handle);
                }
                for removed in &evicted {
                    self.inodes.remove_handle(*removed);
                }
                evicted
            }
            NodeEventType::Modified => {
                self.upsert(event.info.clone());
                vec![handle]
            }
            NodeEventType::Added | NodeEventType::Moved | NodeEventType::Permissions => {
                self.upsert(event.info.clone());
                Vec::new()
            }
        }
    }
}

/// Registers a fetch with the cache state for as long as it is alive
struct FetchGuard {
    state: Arc<RwLock<CacheState>>,
    start: u64,
}

impl FetchGuard {
    fn begin(state: &Arc<RwLock<CacheState>>) -> Self {
        let start = state.write().begin_fetch();
        Self {
            state: state.clone(),
            start,
        }
    }
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        self.state.write().end_fetch(self.start);
    }
}

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, InodeError>>>;

/// In-flight fetches keyed by what they fetch
struct Coalescer<K, T: Clone> {
    pending: Mutex<HashMap<K, SharedFetch<T>>>,
}

impl<K: Eq + Hash + Clone, T: Clone> Coalescer<K, T> {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Release the slot for `key` if it still holds `fetch`
    fn release(&self, key: &K, fetch: &SharedFetch<T>) {
        let mut pending = self.pending.lock();
        if pending.get(key).is_some_and(|f| f.ptr_eq(fetch)) {
            pending.remove(key);
        }
    }

    fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }
}

pub struct InodeCache {
    root: NodeHandle,
    client: Arc<dyn Client>,
    store: InodeStore,
    state: Arc<RwLock<CacheState>>,
    current: AtomicBool,
    lookups: Coalescer<(NodeHandle, String), Option<NodeInfo>>,
    listings: Coalescer<NodeHandle, Vec<NodeInfo>>,
    refreshes: Coalescer<NodeHandle, Option<NodeInfo>>,
}

impl InodeCache {
    pub fn new(root: NodeHandle, client: Arc<dyn Client>, store: InodeStore) -> Self {
        Self {
            root,
            client,
            store,
            state: Arc::new(RwLock::new(CacheState::new(root))),
            current: AtomicBool::new(false),
            lookups: Coalescer::new(),
            listings: Coalescer::new(),
            refreshes: Coalescer::new(),
        }
    }

    pub fn root(&self) -> NodeHandle {
        self.root
    }

    pub fn store(&self) -> &InodeStore {
        &self.store
    }

    /// Mark the initial listing phase complete
    pub fn set_current(&self) {
        self.current.store(true, Ordering::SeqCst);
    }

    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst)
    }

    /// Join the fetch in flight for `key`, or start one
    ///
    /// `check` runs under the slot lock so a result published by a finishing
    /// fetch is never missed.
    async fn coalesce<K, T>(
        &self,
        coalescer: &Coalescer<K, T>,
        key: K,
        check: impl FnOnce(&CacheState) -> Option<Result<T, InodeError>>,
        start: impl FnOnce() -> BoxFuture<'static, Result<T, InodeError>>,
    ) -> Result<T, InodeError>
    where
        K: Eq + Hash + Clone,
        T: Clone,
    {
        let fetch = {
            let mut pending = coalescer.pending.lock();
            if let Some(hit) = check(&*self.state.read()) {
                return hit;
            }
            pending
                .entry(key.clone())
                .or_insert_with(|| start().shared())
                .clone()
        };

        let result = fetch.clone().await;
        coalescer.release(&key, &fetch);
        result
    }

    /// Metadata of `handle`, fetched if not cached
    pub async fn attributes(&self, handle: NodeHandle) -> Result<NodeInfo, InodeError> {
        let client = self.client.clone();
        let state = self.state.clone();

        self.coalesce(
            &self.refreshes,
            handle,
            |cached| {
                cached
                    .nodes
                    .get(&handle)
                    .map(|n| Ok(Some(n.info.clone())))
            },
            move || {
                async move {
                    let fetch = FetchGuard::begin(&state);
                    let result = client.get(handle).await;
                    let mut state = state.write();
                    match result {
                        Ok(info) => Ok(state.reconcile_fetched(info, fetch.start)),
                        Err(ClientError::NotFound) => {
                            state.evict(handle);
                            Ok(None)
                        }
                        Err(e) => Err(e.into()),
                    }
                }
                .boxed()
            },
        )
        .await?
        .ok_or(InodeError::NotFound)
    }

    /// The child of `parent` called `name`
    pub async fn child(&self, parent: NodeHandle, name: &str) -> Result<NodeInfo, InodeError> {
        let parent_info = self.attributes(parent).await?;
        if !parent_info.is_directory {
            return Err(InodeError::NotDirectory);
        }

        let current = self.is_current();
        let client = self.client.clone();
        let state = self.state.clone();
        let owned_name = name.to_string();

        self.coalesce(
            &self.lookups,
            (parent, name.to_string()),
            |cached| match cached.resolve_child(parent, name, current) {
                Resolved::Found(info) => Some(Ok(Some(info))),
                Resolved::Absent => Some(Ok(None)),
                Resolved::Unknown => None,
            },
            move || {
                async move {
                    let fetch = FetchGuard::begin(&state);
                    let result = client.child(parent, &owned_name).await;
                    let mut state = state.write();
                    match result {
                        Ok(info) => Ok(state.reconcile_fetched(info, fetch.start)),
                        Err(ClientError::NotFound) => {
                            Ok(state.reconcile_missing(parent, &owned_name))
                        }
                        Err(e) => Err(e.into()),
                    }
                }
                .boxed()
            },
        )
        .await?
        .ok_or(InodeError::NotFound)
    }

    /// Every child of `parent`
    pub async fn children(&self, parent: NodeHandle) -> Result<Vec<NodeInfo>, InodeError> {
        let parent_info = self.attributes(parent).await?;
        if !parent_info.is_directory {
            return Err(InodeError::NotDirectory);
        }

        let client = self.client.clone();
        let state = self.state.clone();

        self.coalesce(
            &self.listings,
            parent,
            |cached| {
                let node = cached.nodes.get(&parent)?;
                if !node.complete {
                    return None;
                }
                let listing = node
                    .children
                    .values()
                    .filter_map(|h| cached.nodes.get(h).map(|n| n.info.clone()))
                    .collect();
                Some(Ok(listing))
            },
            move || {
                async move {
                    let fetch = FetchGuard::begin(&state);
                    let result = client.children(parent).await;
                    let mut state = state.write();
                    match result {
                        Ok(children) => {
                            Ok(state.reconcile_listing(parent, children, fetch.start))
                        }
                        Err(e) => {
                            if e == ClientError::NotFound {
                                state.evict(parent);
                            }
                            Err(e.into())
                        }
                    }
                }
                .boxed()
            },
        )
        .await
    }

    /// Walk `components` down from the mount root
    pub async fn resolve(&self, components: &[String]) -> Result<NodeInfo, InodeError> {
        let mut info = self.attributes(self.root).await?;
        for component in components {
            info = self.child(info.handle, component).await?;
        }
        Ok(info)
    }

    /// True if every component of the walk is already cached
    pub fn cached(&self, components: &[String]) -> bool {
        let state = self.state.read();
        let mut handle = self.root;
        if !state.nodes.contains_key(&handle) {
            return false;
        }
        for component in components {
            let next = state
                .nodes
                .get(&handle)
                .and_then(|n| n.children.get(component))
                .copied();
            match next {
                Some(child) if state.nodes.contains_key(&child) => handle = child,
                _ => return false,
            }
        }
        true
    }

    /// The inode bound to `handle`, binding one if needed
    pub async fn inode_for(&self, handle: NodeHandle) -> Result<u64, InodeError> {
        if let Some(inode) = self.state.read().inodes.inode(handle) {
            return Ok(inode);
        }

        let inode = self
            .store
            .bind(handle)
            .await
            .map_err(|e| InodeError::Store(e.to_string()))?;
        self.state.write().inodes.bind(inode, handle);
        Ok(inode)
    }

    pub fn handle_of(&self, inode: u64) -> Option<NodeHandle> {
        self.state.read().inodes.handle(inode)
    }

    /// Record a kernel lookup of `inode`
    pub fn remember(&self, inode: u64) {
        self.state.write().inodes.remember(inode);
    }

    /// Drop kernel lookups of `inode`, releasing the entry after the last one
    pub fn forget(&self, inode: u64, count: u64) {
        let mut state = self.state.write();
        let Some(handle) = state.inodes.forget(inode, count) else {
            return;
        };

        if let Some(node) = state.nodes.remove(&handle) {
            // the parent listing is no longer whole
            if let Some(parent) = node.info.parent.and_then(|p| state.nodes.get_mut(&p)) {
                if parent.children.get(&node.info.name) == Some(&handle) {
                    parent.children.remove(&node.info.name);
                }
                parent.complete = false;
            }
        }
        state.prune_versions();
    }

    /// Apply a batch of change events in sequence order
    ///
    /// Returns the handles whose cached content is stale.
    pub fn apply(&self, events: &[NodeEvent]) -> Vec<NodeHandle> {
        let mut ordered: Vec<&NodeEvent> = events.iter().collect();
        ordered.sort_by_key(|e| e.sequence);

        let mut state = self.state.write();
        let stale = ordered
            .into_iter()
            .flat_map(|event| state.apply(event))
            .collect();
        state.prune_versions();
        stale
    }

    /// Record the result of a mutation made through the client
    pub fn upsert_local(&self, info: NodeInfo) {
        self.state.write().upsert(info);
    }

    /// Record a removal made through the client
    pub fn remove_local(&self, handle: NodeHandle) -> Vec<NodeHandle> {
        let mut state = self.state.write();
        let evicted = state.evict(handle);
        state.inodes.remove_handle(handle);
        for removed in &evicted {
            state.inodes.remove_handle(*removed);
        }
        state.prune_versions();
        evicted
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.state.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of fetches currently in flight
    pub fn in_flight(&self) -> usize {
        self.lookups.in_flight() + self.listings.in_flight() + self.refreshes.in_flight()
    }
}

impl std::fmt::Debug for InodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeCache")
            .field("root", &self.root)
            .field("entries", &self.len())
            .field("current", &self.is_current())
            .finish()
    }
}
