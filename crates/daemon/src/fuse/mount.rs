//! One enabled mount
//!
//! A `LiveMount` is built every time a mount is enabled and retired when it
//! is disabled or aborted. The filesystem adapter keeps only a weak
//! reference plus the generation the mount had when it was attached. Every
//! request enters through [`LiveMount::enter`], which counts it in flight
//! and fails once the generation is retired, so a request racing a teardown
//! gets an error instead of touching released state. Disabling closes the
//! mount to new requests and waits for the in-flight count to drain before
//! the cache is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use common::prelude::{Client, NodeEvent, NodeHandle, NodeInfo, NormalizedPath};

use crate::database::models::{MountFlags, MountInfo};
use crate::database::types::LogLevel;

use super::content_cache::{ContentCache, ContentCacheConfig};
use super::error::InodeError;
use super::inode_cache::{InodeCache, InodeInfo};
use super::inode_store::InodeStore;
use super::platform::MountSession;

/// Check if a filename should be filtered (macOS resource forks, etc.)
pub fn should_filter(name: &str) -> bool {
    name.starts_with("._")
        || name == ".DS_Store"
        || name == ".Spotlight-V100"
        || name == ".Trashes"
        || name == ".fseventsd"
}

fn check_name(name: &str) -> Result<(), InodeError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(InodeError::InvalidName);
    }
    Ok(())
}

/// Largest file a mount will buffer for writing
pub const MAX_FILE_SIZE: u64 = 1 << 32;

/// Size of a file extended to cover `len` bytes at `offset`
fn extent(offset: u64, len: usize) -> Result<usize, InodeError> {
    let end = offset
        .checked_add(len as u64)
        .filter(|end| *end <= MAX_FILE_SIZE)
        .ok_or(InodeError::FileTooLarge)?;
    usize::try_from(end).map_err(|_| InodeError::FileTooLarge)
}

fn slice(data: &[u8], offset: u64, size: u32) -> Vec<u8> {
    let start = (offset as usize).min(data.len());
    let end = start.saturating_add(size as usize).min(data.len());
    data[start..end].to_vec()
}

/// A directory entry as handed to the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u64,
    pub name: String,
    pub is_directory: bool,
}

#[derive(Debug)]
struct OpenFile {
    handle: NodeHandle,
    parent: Option<NodeHandle>,
    name: String,
    /// Whole-file write buffer, loaded on first write
    buffer: Option<Vec<u8>>,
    dirty: bool,
}

pub struct LiveMount {
    info: RwLock<MountInfo>,
    /// Zero once retired
    generation: AtomicU64,
    closing: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
    cache: InodeCache,
    content: ContentCache,
    client: Arc<dyn Client>,
    open_files: Mutex<HashMap<u64, OpenFile>>,
    next_fh: AtomicU64,
    session: Mutex<Option<Box<dyn MountSession>>>,
}

impl LiveMount {
    pub fn new(
        info: MountInfo,
        generation: u64,
        client: Arc<dyn Client>,
        store: InodeStore,
        content: ContentCacheConfig,
    ) -> Self {
        let cache = InodeCache::new(info.handle, client.clone(), store);
        Self {
            info: RwLock::new(info),
            generation: AtomicU64::new(generation),
            closing: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            cache,
            content: ContentCache::new(content),
            client,
            open_files: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            session: Mutex::new(None),
        }
    }

    pub fn info(&self) -> MountInfo {
        self.info.read().clone()
    }

    pub fn name(&self) -> String {
        self.info.read().flags.name.clone()
    }

    pub fn path(&self) -> NormalizedPath {
        self.info.read().path.clone()
    }

    pub fn flags(&self) -> MountFlags {
        self.info.read().flags.clone()
    }

    /// Replace the flags; requests already in flight keep their snapshot
    pub fn set_flags(&self, flags: MountFlags) {
        self.info.write().flags = flags;
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_retired(&self) -> bool {
        self.generation() == 0
    }

    pub fn cache(&self) -> &InodeCache {
        &self.cache
    }

    pub fn content(&self) -> &ContentCache {
        &self.content
    }

    /// Number of requests currently inside the mount
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Enter a request issued against `generation`
    pub fn enter(&self, generation: u64) -> Result<RequestGuard<'_>, InodeError> {
        // counted before the checks so a concurrent drain cannot miss it
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let flags = self.flags();
        let guard = RequestGuard {
            mount: self,
            read_only: flags.read_only,
            verbose: flags.log_level.enables(LogLevel::Debug),
        };

        if self.closing.load(Ordering::SeqCst) || self.generation() != generation {
            return Err(InodeError::Unmounted);
        }
        Ok(guard)
    }

    /// Enter a request against the current generation
    pub fn request(&self) -> Result<RequestGuard<'_>, InodeError> {
        self.enter(self.generation())
    }

    /// Refuse new requests
    pub fn close_requests(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Accept requests again after a drain gave up
    pub fn reopen_requests(&self) {
        if !self.is_retired() {
            self.closing.store(false, Ordering::SeqCst);
        }
    }

    /// Wait until no request is in flight
    ///
    /// Returns false if requests were still running after `timeout`.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }

    pub fn attach(&self, session: Box<dyn MountSession>) {
        *self.session.lock() = Some(session);
    }

    /// Retire this generation and hand back the OS session, if any
    pub fn retire(&self) -> Option<Box<dyn MountSession>> {
        self.closing.store(true, Ordering::SeqCst);
        self.generation.store(0, Ordering::SeqCst);
        self.open_files.lock().clear();
        self.session.lock().take()
    }

    /// Release cached state once retired and drained
    pub async fn release(&self) {
        self.content.invalidate_all();
        self.cache.store().close().await;
    }

    /// The cloud view is complete
    pub fn set_current(&self) {
        self.cache.set_current();
    }

    /// Apply change events to the cache and drop stale content
    pub fn apply(&self, events: &[NodeEvent]) {
        for handle in self.cache.apply(events) {
            self.content.invalidate(handle);
        }
    }

    /// True if every component below the mount root is cached
    pub fn cached(&self, components: &[String]) -> bool {
        self.cache.cached(components)
    }

    /// Resolve a path below the mount root
    pub async fn describe(&self, components: &[String]) -> Result<InodeInfo, InodeError> {
        let request = self.request()?;
        request.describe(components).await
    }

    async fn read_content(&self, handle: NodeHandle) -> Result<Arc<Vec<u8>>, InodeError> {
        if let Some(data) = self.content.get(handle) {
            return Ok(data);
        }
        let data = Arc::new(self.client.read(handle).await?);
        self.content.put(handle, data.clone());
        Ok(data)
    }

    fn drop_local(&self, handle: NodeHandle) {
        self.content.invalidate(handle);
        for removed in self.cache.remove_local(handle) {
            self.content.invalidate(removed);
        }
    }
}

impl std::fmt::Debug for LiveMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveMount")
            .field("info", &*self.info.read())
            .field("generation", &self.generation())
            .field("in_flight", &self.in_flight())
            .field("has_session", &self.session.lock().is_some())
            .finish()
    }
}

/// One request inside a mount
///
/// Holds the in-flight count until dropped and snapshots the flags the
/// request runs under.
pub struct RequestGuard<'a> {
    mount: &'a LiveMount,
    read_only: bool,
    verbose: bool,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        if self.mount.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.mount.drained.notify_waiters();
        }
    }
}

impl RequestGuard<'_> {
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    fn writable(&self) -> Result<(), InodeError> {
        if self.read_only {
            return Err(InodeError::ReadOnly);
        }
        Ok(())
    }

    fn handle(&self, inode: u64) -> Result<NodeHandle, InodeError> {
        self.mount.cache.handle_of(inode).ok_or(InodeError::NotFound)
    }

    fn trace(&self, op: &str, detail: std::fmt::Arguments<'_>) {
        if self.verbose {
            tracing::debug!(mount = %self.mount.name(), "{} {}", op, detail);
        }
    }

    async fn bind(&self, info: &NodeInfo) -> Result<u64, InodeError> {
        let inode = self.mount.cache.inode_for(info.handle).await?;
        self.mount.cache.remember(inode);
        Ok(inode)
    }

    fn open_file(&self, file: OpenFile) -> u64 {
        let fh = self.mount.next_fh.fetch_add(1, Ordering::SeqCst);
        self.mount.open_files.lock().insert(fh, file);
        fh
    }

    pub async fn lookup(&self, parent: u64, name: &str) -> Result<(u64, NodeInfo), InodeError> {
        self.trace("lookup", format_args!("{} in inode {}", name, parent));
        if should_filter(name) {
            return Err(InodeError::NotFound);
        }

        let parent = self.handle(parent)?;
        let info = self.mount.cache.child(parent, name).await?;
        let inode = self.bind(&info).await?;
        Ok((inode, info))
    }

    pub async fn getattr(&self, inode: u64) -> Result<NodeInfo, InodeError> {
        self.trace("getattr", format_args!("inode {}", inode));
        let handle = self.handle(inode)?;
        self.mount.cache.attributes(handle).await
    }

    pub async fn readdir(&self, inode: u64) -> Result<Vec<DirEntry>, InodeError> {
        self.trace("readdir", format_args!("inode {}", inode));
        let handle = self.handle(inode)?;
        let info = self.mount.cache.attributes(handle).await?;
        if !info.is_directory {
            return Err(InodeError::NotDirectory);
        }

        let children = self.mount.cache.children(handle).await?;

        let parent_inode = match info.parent {
            Some(parent) if handle != self.mount.cache.root() => {
                self.mount.cache.inode_for(parent).await?
            }
            _ => inode,
        };

        let mut entries = vec![
            DirEntry {
                inode,
                name: ".".to_string(),
                is_directory: true,
            },
            DirEntry {
                inode: parent_inode,
                name: "..".to_string(),
                is_directory: true,
            },
        ];

        for child in children {
            if should_filter(&child.name) {
                continue;
            }
            entries.push(DirEntry {
                inode: self.mount.cache.inode_for(child.handle).await?,
                name: child.name,
                is_directory: child.is_directory,
            });
        }

        Ok(entries)
    }

    /// Open a file, returning its file handle
    pub async fn open(&self, inode: u64, write: bool, truncate: bool) -> Result<u64, InodeError> {
        self.trace("open", format_args!("inode {} write={}", inode, write));
        let handle = self.handle(inode)?;
        let info = self.mount.cache.attributes(handle).await?;
        if info.is_directory {
            return Err(InodeError::IsDirectory);
        }
        if write || truncate {
            self.writable()?;
        }

        Ok(self.open_file(OpenFile {
            handle,
            parent: info.parent,
            name: info.name,
            buffer: truncate.then(Vec::new),
            dirty: truncate,
        }))
    }

    pub async fn read(
        &self,
        inode: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, InodeError> {
        self.trace("read", format_args!("inode {} at {} len {}", inode, offset, size));
        {
            let files = self.mount.open_files.lock();
            if let Some(buffer) = files.get(&fh).and_then(|f| f.buffer.as_ref()) {
                return Ok(slice(buffer, offset, size));
            }
        }

        let handle = self.handle(inode)?;
        let data = self.mount.read_content(handle).await?;
        Ok(slice(&data, offset, size))
    }

    pub async fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u32, InodeError> {
        self.trace("write", format_args!("fh {} at {} len {}", fh, offset, data.len()));
        self.writable()?;
        let end = extent(offset, data.len())?;

        let unloaded = {
            let files = self.mount.open_files.lock();
            let file = files.get(&fh).ok_or(InodeError::BadHandle(fh))?;
            file.buffer.is_none().then_some(file.handle)
        };

        let current = match unloaded {
            Some(handle) => Some(self.mount.read_content(handle).await?),
            None => None,
        };

        let mut files = self.mount.open_files.lock();
        let file = files.get_mut(&fh).ok_or(InodeError::BadHandle(fh))?;
        let buffer = file
            .buffer
            .get_or_insert_with(|| current.map(|c| c.as_ref().clone()).unwrap_or_default());

        let start = end - data.len();
        if buffer.len() < end {
            buffer.resize(end, 0);
        }
        buffer[start..end].copy_from_slice(data);
        file.dirty = true;

        Ok(data.len() as u32)
    }

    /// Upload the buffer of `fh` if it is dirty
    pub async fn flush(&self, fh: u64) -> Result<(), InodeError> {
        let pending = {
            let files = self.mount.open_files.lock();
            let file = files.get(&fh).ok_or(InodeError::BadHandle(fh))?;
            match (&file.buffer, file.dirty) {
                (Some(buffer), true) => Some((file.handle, file.parent, file.name.clone(), buffer.clone())),
                _ => None,
            }
        };

        let Some((handle, parent, name, data)) = pending else {
            return Ok(());
        };
        self.trace("flush", format_args!("fh {} ({} bytes)", fh, data.len()));
        self.writable()?;

        let parent = parent.ok_or(InodeError::AccessDenied)?;
        let info = self.mount.client.upload(parent, &name, data.clone()).await?;

        if info.handle != handle {
            self.mount.content.invalidate(handle);
        }
        self.mount.content.put(info.handle, Arc::new(data));
        self.mount.cache.upsert_local(info.clone());

        if let Some(file) = self.mount.open_files.lock().get_mut(&fh) {
            file.handle = info.handle;
            file.dirty = false;
        }
        Ok(())
    }

    /// Flush and close `fh`
    pub async fn release(&self, fh: u64) -> Result<(), InodeError> {
        let result = self.flush(fh).await;
        self.mount.open_files.lock().remove(&fh);
        result
    }

    /// Create an empty file and open it
    pub async fn create(
        &self,
        parent: u64,
        name: &str,
    ) -> Result<(u64, NodeInfo, u64), InodeError> {
        self.trace("create", format_args!("{} in inode {}", name, parent));
        self.writable()?;
        check_name(name)?;

        let parent = self.handle(parent)?;
        match self.mount.cache.child(parent, name).await {
            Ok(_) => return Err(InodeError::Exists),
            Err(InodeError::NotFound) => {}
            Err(e) => return Err(e),
        }

        let info = self.mount.client.upload(parent, name, Vec::new()).await?;
        self.mount.cache.upsert_local(info.clone());
        let inode = self.bind(&info).await?;

        let fh = self.open_file(OpenFile {
            handle: info.handle,
            parent: Some(parent),
            name: name.to_string(),
            buffer: Some(Vec::new()),
            dirty: false,
        });
        Ok((inode, info, fh))
    }

    pub async fn mkdir(&self, parent: u64, name: &str) -> Result<(u64, NodeInfo), InodeError> {
        self.trace("mkdir", format_args!("{} in inode {}", name, parent));
        self.writable()?;
        check_name(name)?;

        let parent = self.handle(parent)?;
        let info = self.mount.client.make_directory(parent, name).await?;
        self.mount.cache.upsert_local(info.clone());
        let inode = self.bind(&info).await?;
        Ok((inode, info))
    }

    pub async fn unlink(&self, parent: u64, name: &str) -> Result<(), InodeError> {
        self.trace("unlink", format_args!("{} in inode {}", name, parent));
        self.writable()?;

        let parent = self.handle(parent)?;
        let info = self.mount.cache.child(parent, name).await?;
        if info.is_directory {
            return Err(InodeError::IsDirectory);
        }

        self.mount.client.remove(info.handle).await?;
        self.mount.drop_local(info.handle);
        Ok(())
    }

    pub async fn rmdir(&self, parent: u64, name: &str) -> Result<(), InodeError> {
        self.trace("rmdir", format_args!("{} in inode {}", name, parent));
        self.writable()?;

        let parent = self.handle(parent)?;
        let info = self.mount.cache.child(parent, name).await?;
        if !info.is_directory {
            return Err(InodeError::NotDirectory);
        }
        if !self.mount.cache.children(info.handle).await?.is_empty() {
            return Err(InodeError::NotEmpty);
        }

        self.mount.client.remove(info.handle).await?;
        self.mount.drop_local(info.handle);
        Ok(())
    }

    /// Move `parent/name` to `new_parent/new_name`, replacing what is there
    pub async fn rename(
        &self,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> Result<(), InodeError> {
        self.trace(
            "rename",
            format_args!("{} in inode {} to {} in inode {}", name, parent, new_name, new_parent),
        );
        self.writable()?;
        check_name(new_name)?;

        let from = self.handle(parent)?;
        let to = self.handle(new_parent)?;
        let info = self.mount.cache.child(from, name).await?;

        match self.mount.cache.child(to, new_name).await {
            Ok(existing) if existing.handle == info.handle => return Ok(()),
            Ok(existing) => {
                if existing.is_directory {
                    if !info.is_directory {
                        return Err(InodeError::IsDirectory);
                    }
                    if !self.mount.cache.children(existing.handle).await?.is_empty() {
                        return Err(InodeError::NotEmpty);
                    }
                } else if info.is_directory {
                    return Err(InodeError::NotDirectory);
                }
                self.mount.client.remove(existing.handle).await?;
                self.mount.drop_local(existing.handle);
            }
            Err(InodeError::NotFound) => {}
            Err(e) => return Err(e),
        }

        let moved = self.mount.client.move_node(info.handle, to, new_name).await?;
        self.mount.cache.upsert_local(moved);
        Ok(())
    }

    /// Change the size of a file
    pub async fn truncate(
        &self,
        inode: u64,
        size: u64,
        fh: Option<u64>,
    ) -> Result<NodeInfo, InodeError> {
        self.trace("truncate", format_args!("inode {} to {}", inode, size));
        self.writable()?;
        let len = extent(size, 0)?;

        let handle = self.handle(inode)?;
        let info = self.mount.cache.attributes(handle).await?;
        if info.is_directory {
            return Err(InodeError::IsDirectory);
        }

        if let Some(fh) = fh {
            let mut files = self.mount.open_files.lock();
            if let Some(buffer) = files.get_mut(&fh).and_then(|f| {
                f.dirty = f.buffer.is_some();
                f.buffer.as_mut()
            }) {
                buffer.resize(len, 0);
                return Ok(NodeInfo { size, ..info });
            }
        }

        let mut data = self.mount.read_content(handle).await?.as_ref().clone();
        data.resize(len, 0);

        let parent = info.parent.ok_or(InodeError::AccessDenied)?;
        let updated = self.mount.client.upload(parent, &info.name, data.clone()).await?;
        self.mount.content.put(updated.handle, Arc::new(data));
        self.mount.cache.upsert_local(updated.clone());
        Ok(updated)
    }

    pub fn forget(&self, inode: u64, lookups: u64) {
        self.mount.cache.forget(inode, lookups);
    }

    pub async fn describe(&self, components: &[String]) -> Result<InodeInfo, InodeError> {
        let info = self.mount.cache.resolve(components).await?;
        let inode = self.mount.cache.inode_for(info.handle).await?;
        Ok(InodeInfo::new(inode, info, self.read_only))
    }
}
