//! The mount service's platform layer
//!
//! `MountContext` owns the mount database, the transient (in-memory) mount
//! records, the live mounts and the task executor. Administrative changes
//! are serialized by one async lock; per-mount request traffic never takes
//! it. Every context registers itself in a process-wide list so that
//! [`MountContext::abort`] can tear down mounts without a handle to the
//! service.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;

use common::prelude::{
    Client, ClientError, NodeEvent, NodeHandle, NormalizedPath, Task, TaskExecutor,
};

use crate::database::models::{is_unique_violation, MountFlags, MountInfo, MAX_NAME_LENGTH};
use crate::database::{Database, DatabaseSetupError};
use crate::fuse::{
    ContentCacheConfig, InodeError, InodeInfo, InodeStore, LiveMount, Platform, PlatformError,
    StoreError, BASELINE_VERSION,
};
use crate::service_config::Config;

use super::context::{DisableCallback, ServiceContext};
use super::event::{MountEvent, MountEventSink, MountEventType};
use super::flags::ServiceFlags;
use super::result::MountResult;

static CONTEXTS: Mutex<Vec<Weak<Shared>>> = parking_lot::const_mutex(Vec::new());

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("failed to open mount database: {0}")]
    Database(#[from] DatabaseSetupError),

    #[error("failed to create cache directory: {0}")]
    CacheDir(#[from] std::io::Error),

    #[error("no tokio runtime available")]
    NoRuntime,
}

/// Inode store file of a mount: `<hex handle>-<path digest>.db`
///
/// Neither part can change through `flags`, so a rename keeps the store.
pub fn store_file_name(info: &MountInfo) -> String {
    let digest = blake3::hash(info.path.to_string().as_bytes());
    format!("{}-{}.db", info.handle, &digest.to_hex()[..16])
}

fn unexpected(what: &str, err: impl std::fmt::Display) -> MountResult {
    tracing::error!("{}: {}", what, err);
    MountResult::Unexpected
}

fn target_result(err: PlatformError) -> MountResult {
    match err {
        PlatformError::TargetMissing(_) => MountResult::LocalUnknown,
        PlatformError::TargetNotDirectory(_) => MountResult::LocalFile,
        PlatformError::Unsupported => MountResult::Unsupported,
        other => unexpected("mount target check failed", other),
    }
}

fn check_name(name: &str) -> Result<(), MountResult> {
    if name.is_empty() {
        return Err(MountResult::NoName);
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(MountResult::NameTooLong);
    }
    Ok(())
}

/// Invokes the disable callback exactly once, with `Aborted` if dropped
struct DisableCompletion {
    done: Option<DisableCallback>,
}

impl DisableCompletion {
    fn new(done: DisableCallback) -> Self {
        Self { done: Some(done) }
    }

    fn complete(mut self, result: MountResult) {
        if let Some(done) = self.done.take() {
            done(result);
        }
    }
}

impl Drop for DisableCompletion {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            done(MountResult::Aborted);
        }
    }
}

struct Shared {
    client: Arc<dyn Client>,
    platform: Arc<dyn Platform>,
    database: Database,
    executor: TaskExecutor,
    runtime: Handle,
    sink: Arc<dyn MountEventSink>,
    cache_dir: Option<PathBuf>,
    content_cache: ContentCacheConfig,
    drain_timeout: Mutex<Duration>,
    /// Records of non-persistent mounts
    transient: RwLock<BTreeMap<String, MountInfo>>,
    /// Enabled mounts by name
    mounts: RwLock<HashMap<String, Arc<LiveMount>>>,
    /// Names with a disable in progress
    disabling: Mutex<HashSet<String>>,
    admin: tokio::sync::Mutex<()>,
    current: AtomicBool,
    discard: AtomicBool,
    next_generation: AtomicU64,
}

impl Shared {
    async fn lookup(&self, name: &str) -> Result<Option<MountInfo>, sqlx::Error> {
        let transient = self.transient.read().get(name).cloned();
        if transient.is_some() {
            return Ok(transient);
        }
        MountInfo::get(name, &self.database).await
    }

    async fn by_path(&self, path: &NormalizedPath) -> Result<Option<MountInfo>, sqlx::Error> {
        let transient = self
            .transient
            .read()
            .values()
            .find(|info| &info.path == path)
            .cloned();
        if transient.is_some() {
            return Ok(transient);
        }
        MountInfo::by_path(path, &self.database).await
    }

    async fn all(&self) -> Result<Vec<MountInfo>, sqlx::Error> {
        let mut all = MountInfo::list(&self.database).await?;
        all.extend(self.transient.read().values().cloned());
        all.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(all)
    }

    fn live(&self, name: &str) -> Option<Arc<LiveMount>> {
        self.mounts.read().get(name).cloned()
    }

    /// The live mount whose path is the deepest one containing `path`
    fn live_containing(&self, path: &NormalizedPath) -> Option<(Arc<LiveMount>, Vec<String>)> {
        self.mounts
            .read()
            .values()
            .filter_map(|mount| {
                mount
                    .path()
                    .relative_components(path)
                    .map(|components| (mount.clone(), components))
            })
            .max_by_key(|(mount, _)| mount.path().as_path().components().count())
    }

    fn store_path(&self, info: &MountInfo) -> Option<PathBuf> {
        self.cache_dir
            .as_ref()
            .map(|dir| dir.join(store_file_name(info)))
    }

    async fn open_store(&self, info: &MountInfo) -> Result<InodeStore, StoreError> {
        match self.store_path(info) {
            Some(path) => InodeStore::open(&path, info.handle).await,
            None => InodeStore::in_memory(info.handle).await,
        }
    }

    async fn check_remote(&self, handle: NodeHandle) -> Result<(), MountResult> {
        match self.client.get(handle).await {
            Ok(node) if node.is_directory => Ok(()),
            Ok(_) => Err(MountResult::RemoteFile),
            Err(ClientError::NotFound) => Err(MountResult::RemoteUnknown),
            Err(e) => {
                tracing::warn!("cloud backend failed while checking {}: {}", handle, e);
                Err(MountResult::BackendUnavailable)
            }
        }
    }

    /// Neither the name nor the path of `info` is in use
    async fn check_free(&self, info: &MountInfo) -> Result<(), MountResult> {
        match self.lookup(info.name()).await {
            Ok(Some(_)) => return Err(MountResult::NameTaken),
            Ok(None) => {}
            Err(e) => return Err(unexpected("failed to look up mount", e)),
        }

        match self.by_path(&info.path).await {
            Ok(Some(_)) => Err(MountResult::LocalTaken),
            Ok(None) => Ok(()),
            Err(e) => Err(unexpected("failed to look up mount path", e)),
        }
    }

    /// Local target and cloud root are usable; runs without the admin lock
    async fn check_endpoints(&self, info: &MountInfo) -> Result<(), MountResult> {
        self.platform
            .check_target(info.path.as_path())
            .map_err(target_result)?;
        self.check_remote(info.handle).await
    }

    async fn add(&self, info: MountInfo) -> MountResult {
        let info = MountInfo {
            flags: info.flags.sanitized(),
            ..info
        };

        // first failure wins
        if let Err(result) = check_name(info.name()) {
            return result;
        }
        {
            let _admin = self.admin.lock().await;
            if let Err(result) = self.check_free(&info).await {
                return result;
            }
        }
        if let Err(result) = self.check_endpoints(&info).await {
            return result;
        }

        let _admin = self.admin.lock().await;
        if let Err(result) = self.check_free(&info).await {
            return result;
        }

        if info.flags.persistent {
            if let Err(e) = info.insert(&self.database).await {
                if is_unique_violation(&e, "name") {
                    return MountResult::NameTaken;
                }
                if is_unique_violation(&e, "path") {
                    return MountResult::LocalTaken;
                }
                return unexpected("failed to persist mount", e);
            }
        } else {
            self.transient
                .write()
                .insert(info.name().to_string(), info.clone());
        }

        tracing::info!(
            "added mount {} at {} for {}",
            info.name(),
            info.path,
            info.handle
        );
        MountResult::Success
    }

    async fn remember(&self, info: &MountInfo, enable_at_startup: bool) -> MountResult {
        if !info.flags.persistent || info.flags.enable_at_startup == enable_at_startup {
            return MountResult::Success;
        }

        match MountInfo::set_enable_at_startup(info.name(), enable_at_startup, &self.database).await
        {
            Ok(_) => {
                if let Some(live) = self.live(info.name()) {
                    let mut flags = live.flags();
                    flags.enable_at_startup = enable_at_startup;
                    live.set_flags(flags);
                }
                MountResult::Success
            }
            Err(e) => unexpected("failed to update startup flag", e),
        }
    }

    /// The record `name` would be enabled from, or the call's final result
    ///
    /// Must be called with the admin lock held.
    async fn enable_target(&self, name: &str, remember: bool) -> Result<MountInfo, MountResult> {
        if self.disabling.lock().contains(name) {
            return Err(MountResult::Busy);
        }

        let info = match self.lookup(name).await {
            Ok(Some(info)) => info,
            Ok(None) => return Err(MountResult::Unknown),
            Err(e) => return Err(unexpected("failed to look up mount", e)),
        };

        if let Some(live) = self.live(name) {
            if live.path() != info.path {
                return Err(MountResult::LocalTaken);
            }
            if remember {
                return Err(self.remember(&info, true).await);
            }
            return Err(MountResult::Success);
        }

        let claimed = self
            .mounts
            .read()
            .values()
            .any(|mount| mount.path() == info.path);
        if claimed {
            return Err(MountResult::LocalTaken);
        }
        Ok(info)
    }

    async fn enable(&self, name: &str, remember: bool) -> MountResult {
        let checked = {
            let _admin = self.admin.lock().await;
            match self.enable_target(name, remember).await {
                Ok(info) => info,
                Err(result) => return result,
            }
        };
        if let Err(result) = self.check_endpoints(&checked).await {
            return result;
        }

        let _admin = self.admin.lock().await;
        let info = match self.enable_target(name, remember).await {
            Ok(info) if info.handle == checked.handle && info.path == checked.path => info,
            // the record moved while the cloud was asked
            Ok(_) => return MountResult::Busy,
            Err(result) => return result,
        };

        let store = match self.open_store(&info).await {
            Ok(store) => store,
            Err(e) => return unexpected("failed to open inode store", e),
        };

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let live = Arc::new(LiveMount::new(
            info.clone(),
            generation,
            self.client.clone(),
            store,
            self.content_cache,
        ));
        if self.current.load(Ordering::SeqCst) {
            live.set_current();
        }

        match self.platform.mount(&live, self.runtime.clone()) {
            Ok(session) => live.attach(session),
            Err(e) => {
                live.retire();
                live.release().await;
                return match e {
                    PlatformError::Unsupported => MountResult::Unsupported,
                    other => unexpected("failed to mount", other),
                };
            }
        }

        self.mounts.write().insert(name.to_string(), live);
        tracing::info!(
            "enabled mount {} at {} ({} platform, generation {})",
            name,
            info.path,
            self.platform.name(),
            generation
        );

        if remember {
            return self.remember(&info, true).await;
        }
        MountResult::Success
    }

    /// Retire `live`, detach it from the OS and release its store
    ///
    /// The mount is retired and released even when the OS refuses to detach.
    async fn teardown(&self, live: &LiveMount) -> Result<(), PlatformError> {
        let unmounted = match live.retire() {
            Some(session) => session.unmount(),
            None => Ok(()),
        };
        live.release().await;
        unmounted
    }

    async fn disable(&self, name: &str, remember: bool) -> MountResult {
        let (info, live) = {
            let _admin = self.admin.lock().await;
            if self.disabling.lock().contains(name) {
                return MountResult::Busy;
            }

            let info = match self.lookup(name).await {
                Ok(Some(info)) => info,
                Ok(None) => return MountResult::Unknown,
                Err(e) => return unexpected("failed to look up mount", e),
            };

            let live = self.mounts.write().remove(name);
            match live {
                Some(live) => {
                    self.disabling.lock().insert(name.to_string());
                    (info, live)
                }
                None if remember => return self.remember(&info, false).await,
                None => return MountResult::Success,
            }
        };

        let timeout = *self.drain_timeout.lock();
        live.close_requests();
        if !live.drain(timeout).await {
            tracing::warn!(
                "mount {} still has {} request(s) in flight, not disabling",
                name,
                live.in_flight()
            );
            let _admin = self.admin.lock().await;
            live.reopen_requests();
            self.mounts.write().insert(name.to_string(), live);
            self.disabling.lock().remove(name);
            return MountResult::Busy;
        }

        let unmounted = self.teardown(&live).await;

        let _admin = self.admin.lock().await;
        self.disabling.lock().remove(name);
        if let Err(e) = unmounted {
            return unexpected(&format!("failed to unmount {}", name), e);
        }
        tracing::info!("disabled mount {}", name);

        if remember {
            return self.remember(&info, false).await;
        }
        MountResult::Success
    }

    async fn remove(&self, name: &str) -> MountResult {
        let _admin = self.admin.lock().await;
        if self.mounts.read().contains_key(name) || self.disabling.lock().contains(name) {
            return MountResult::Busy;
        }

        let info = match self.lookup(name).await {
            Ok(Some(info)) => info,
            Ok(None) => return MountResult::Unknown,
            Err(e) => return unexpected("failed to look up mount", e),
        };

        if self.transient.write().remove(name).is_none() {
            match MountInfo::delete(name, &self.database).await {
                Ok(true) => {}
                Ok(false) => return MountResult::Unknown,
                Err(e) => return unexpected("failed to delete mount", e),
            }
        }

        if let Some(path) = self.store_path(&info) {
            for suffix in ["", "-wal", "-shm"] {
                let mut file = path.clone().into_os_string();
                file.push(suffix);
                let file = PathBuf::from(file);
                match tokio::fs::remove_file(&file).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => tracing::warn!(
                        "failed to delete inode store file {}: {}",
                        file.display(),
                        e
                    ),
                }
            }
        }

        tracing::info!("removed mount {}", name);
        MountResult::Success
    }

    async fn set_flags(&self, name: &str, flags: MountFlags) -> MountResult {
        let _admin = self.admin.lock().await;
        if self.disabling.lock().contains(name) {
            return MountResult::Busy;
        }

        let current = match self.lookup(name).await {
            Ok(Some(info)) => info,
            Ok(None) => return MountResult::Unknown,
            Err(e) => return unexpected("failed to look up mount", e),
        };

        let flags = flags.sanitized();
        if let Err(result) = check_name(&flags.name) {
            return result;
        }
        if flags.name != name {
            match self.lookup(&flags.name).await {
                Ok(Some(_)) => return MountResult::NameTaken,
                Ok(None) => {}
                Err(e) => return unexpected("failed to look up mount", e),
            }
        }

        let updated = MountInfo {
            flags,
            ..current.clone()
        };

        let stored = match (current.flags.persistent, updated.flags.persistent) {
            (true, true) => updated.replace(name, &self.database).await.map(|_| ()),
            (true, false) => MountInfo::delete(name, &self.database).await.map(|_| ()),
            (false, true) => updated.insert(&self.database).await,
            (false, false) => Ok(()),
        };
        if let Err(e) = stored {
            if is_unique_violation(&e, "name") {
                return MountResult::NameTaken;
            }
            return unexpected("failed to update mount", e);
        }

        {
            let mut transient = self.transient.write();
            transient.remove(name);
            if !updated.flags.persistent {
                transient.insert(updated.name().to_string(), updated.clone());
            }
        }

        let mut mounts = self.mounts.write();
        if let Some(live) = mounts.remove(name) {
            live.set_flags(updated.flags.clone());
            mounts.insert(updated.name().to_string(), live);
        }

        tracing::info!("updated flags of mount {}", name);
        MountResult::Success
    }

    async fn migrate(&self, path: &NormalizedPath, target: u32, upgrade: bool) -> MountResult {
        let _admin = self.admin.lock().await;
        let info = match self.by_path(path).await {
            Ok(Some(info)) => info,
            Ok(None) => return MountResult::Unknown,
            Err(e) => return unexpected("failed to look up mount path", e),
        };

        let outcome = match self.live(info.name()) {
            Some(live) => {
                let store = live.cache().store();
                if upgrade {
                    store.upgrade(target).await
                } else if target < BASELINE_VERSION {
                    // a live mount cannot run without its bindings
                    return MountResult::Busy;
                } else {
                    store.downgrade(target).await
                }
            }
            None => {
                let Some(file) = self.store_path(&info) else {
                    return MountResult::Unsupported;
                };
                let store = match InodeStore::open_for_migration(&file).await {
                    Ok(store) => store,
                    Err(e) => return unexpected("failed to open inode store", e),
                };
                let outcome = if upgrade {
                    store.upgrade(target).await
                } else {
                    store.downgrade(target).await
                };
                store.close().await;
                outcome
            }
        };

        match outcome {
            Ok(outcome) => {
                if outcome.changed() {
                    tracing::info!(
                        "migrated inode store of {} from version {} to {}",
                        info.name(),
                        outcome.from,
                        outcome.to
                    );
                }
                MountResult::Success
            }
            Err(e) => unexpected("inode store migration failed", e),
        }
    }

    async fn shutdown(&self) {
        let _admin = self.admin.lock().await;
        let timeout = *self.drain_timeout.lock();

        let mounts: Vec<Arc<LiveMount>> = self.mounts.write().drain().map(|(_, m)| m).collect();
        for live in mounts {
            live.close_requests();
            if !live.drain(timeout).await {
                tracing::warn!(
                    "tearing down {} with {} request(s) in flight",
                    live.name(),
                    live.in_flight()
                );
            }
            if let Err(e) = self.teardown(&live).await {
                tracing::error!("failed to unmount {}: {}", live.name(), e);
            }
        }

        self.transient.write().clear();
    }

    /// Tear down matching mounts immediately
    fn abort(&self, predicate: &dyn Fn(&MountInfo) -> bool) -> usize {
        let victims: Vec<Arc<LiveMount>> = {
            let mut mounts = self.mounts.write();
            let names: Vec<String> = mounts
                .iter()
                .filter(|(_, mount)| predicate(&mount.info()))
                .map(|(name, _)| name.clone())
                .collect();
            names.iter().filter_map(|name| mounts.remove(name)).collect()
        };

        for live in &victims {
            let name = live.name();
            tracing::warn!("aborting mount {} with {} request(s) in flight", name, live.in_flight());

            if let Some(session) = live.retire() {
                if let Err(e) = session.unmount() {
                    tracing::warn!("failed to unmount {}: {}", name, e);
                }
            }

            let released = live.clone();
            self.runtime.spawn(async move { released.release().await });
            self.sink
                .emit(MountEvent::new(name, MountEventType::Aborted, MountResult::Aborted));
        }

        victims.len()
    }
}

pub struct MountContext {
    shared: Arc<Shared>,
}

impl MountContext {
    pub async fn new(
        config: &Config,
        client: Arc<dyn Client>,
        platform: Arc<dyn Platform>,
        sink: Arc<dyn MountEventSink>,
    ) -> Result<Self, ContextError> {
        let runtime = Handle::try_current().map_err(|_| ContextError::NoRuntime)?;

        let database = match &config.sqlite_path {
            Some(path) => Database::open(path).await?,
            None => Database::in_memory().await?,
        };

        if let Some(dir) = &config.cache_dir {
            tokio::fs::create_dir_all(dir).await?;
        }

        let shared = Arc::new(Shared {
            client,
            platform,
            database,
            executor: TaskExecutor::new(config.executor),
            runtime,
            sink,
            cache_dir: config.cache_dir.clone(),
            content_cache: config.content_cache,
            drain_timeout: Mutex::new(config.flags.drain_timeout),
            transient: RwLock::new(BTreeMap::new()),
            mounts: RwLock::new(HashMap::new()),
            disabling: Mutex::new(HashSet::new()),
            admin: tokio::sync::Mutex::new(()),
            current: AtomicBool::new(false),
            discard: AtomicBool::new(false),
            next_generation: AtomicU64::new(1),
        });

        let mut contexts = CONTEXTS.lock();
        contexts.retain(|context| context.strong_count() > 0);
        contexts.push(Arc::downgrade(&shared));

        Ok(Self { shared })
    }

    /// Tear down every live mount matching `predicate`, in every context
    ///
    /// Requests in flight on those mounts fail instead of completing.
    pub fn abort(predicate: &dyn Fn(&MountInfo) -> bool) -> usize {
        let contexts: Vec<Arc<Shared>> = CONTEXTS.lock().iter().filter_map(Weak::upgrade).collect();
        contexts
            .iter()
            .map(|shared| shared.abort(predicate))
            .sum()
    }

    pub fn database(&self) -> &Database {
        &self.shared.database
    }

    /// The live mount called `name`
    pub fn mount(&self, name: &str) -> Option<Arc<LiveMount>> {
        self.shared.live(name)
    }

    pub fn store_path(&self, info: &MountInfo) -> Option<PathBuf> {
        self.shared.store_path(info)
    }
}

impl std::fmt::Debug for MountContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountContext")
            .field("platform", &self.shared.platform.name())
            .field("mounts", &self.shared.mounts.read().len())
            .finish()
    }
}

#[async_trait::async_trait]
impl ServiceContext for MountContext {
    async fn add(&self, info: MountInfo) -> MountResult {
        self.shared.add(info).await
    }

    async fn enable(&self, name: &str, remember: bool) -> MountResult {
        self.shared.enable(name, remember).await
    }

    fn disable(&self, name: &str, remember: bool, done: DisableCallback) {
        let shared = self.shared.clone();
        let name = name.to_string();
        let completion = DisableCompletion::new(done);

        // unmounting blocks, so it runs on the executor rather than the caller
        self.shared.executor.execute(move |_| {
            let runtime = shared.runtime.clone();
            let result = runtime.block_on(shared.disable(&name, remember));
            completion.complete(result);
        });
    }

    async fn remove(&self, name: &str) -> MountResult {
        self.shared.remove(name).await
    }

    async fn set_flags(&self, name: &str, flags: MountFlags) -> MountResult {
        self.shared.set_flags(name, flags).await
    }

    async fn get(&self, name: &str) -> Option<MountInfo> {
        match self.shared.lookup(name).await {
            Ok(info) => info,
            Err(e) => {
                tracing::error!("failed to look up mount {}: {}", name, e);
                None
            }
        }
    }

    async fn list(&self, only_enabled: bool) -> Vec<MountInfo> {
        let all = match self.shared.all().await {
            Ok(all) => all,
            Err(e) => {
                tracing::error!("failed to list mounts: {}", e);
                return Vec::new();
            }
        };

        if !only_enabled {
            return all;
        }
        let mounts = self.shared.mounts.read();
        all.into_iter()
            .filter(|info| mounts.contains_key(info.name()))
            .collect()
    }

    fn enabled(&self, name: &str) -> bool {
        self.shared.mounts.read().contains_key(name)
    }

    async fn upgrade(&self, path: &NormalizedPath, target: u32) -> MountResult {
        self.shared.migrate(path, target, true).await
    }

    async fn downgrade(&self, path: &NormalizedPath, target: u32) -> MountResult {
        self.shared.migrate(path, target, false).await
    }

    async fn describe(&self, path: &NormalizedPath) -> Result<InodeInfo, InodeError> {
        let (mount, components) = self
            .shared
            .live_containing(path)
            .ok_or(InodeError::NotFound)?;
        mount.describe(&components).await
    }

    fn cached(&self, path: &NormalizedPath) -> bool {
        self.shared
            .live_containing(path)
            .is_some_and(|(mount, components)| mount.cached(&components))
    }

    fn current(&self) {
        self.shared.current.store(true, Ordering::SeqCst);
        for mount in self.shared.mounts.read().values() {
            mount.set_current();
        }
    }

    fn discard(&self, discard: bool) {
        self.shared.discard.store(discard, Ordering::SeqCst);
    }

    fn updated(&self, events: Vec<NodeEvent>) {
        if self.shared.discard.load(Ordering::SeqCst) {
            tracing::debug!("discarding {} node event(s)", events.len());
            return;
        }

        let mounts: Vec<Arc<LiveMount>> = self.shared.mounts.read().values().cloned().collect();
        for mount in mounts {
            mount.apply(&events);
        }
    }

    fn execute(&self, body: Box<dyn FnOnce(&Task) + Send + 'static>) -> Task {
        self.shared.executor.execute(body)
    }

    fn syncable(&self, path: &NormalizedPath) -> bool {
        !self
            .shared
            .mounts
            .read()
            .values()
            .any(|mount| {
                let root = mount.path();
                root.contains(path) || path.contains(&root)
            })
    }

    fn apply_flags(&self, flags: &ServiceFlags) {
        *self.shared.drain_timeout.lock() = flags.drain_timeout;
    }

    async fn startup(&self) -> Vec<(String, MountResult)> {
        let startup = match MountInfo::startup_list(&self.shared.database).await {
            Ok(startup) => startup,
            Err(e) => {
                tracing::error!("failed to list startup mounts: {}", e);
                return Vec::new();
            }
        };

        tracing::info!("enabling {} startup mount(s)", startup.len());

        let mut results = Vec::with_capacity(startup.len());
        for info in startup {
            let result = self.shared.enable(info.name(), false).await;
            if !result.is_success() {
                tracing::error!(
                    "failed to enable {} at {}: {}",
                    info.name(),
                    info.path,
                    result.description()
                );
            }
            results.push((info.name().to_string(), result));
        }
        results
    }

    async fn shutdown(&self) {
        self.shared.shutdown().await;

        // joining workers blocks; keep it off the async threads
        let shared = self.shared.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || shared.executor.shutdown()).await {
            tracing::error!("task executor shutdown failed: {}", e);
        }

        let this = Arc::as_ptr(&self.shared);
        CONTEXTS
            .lock()
            .retain(|context| context.strong_count() > 0 && !std::ptr::eq(context.as_ptr(), this));
    }
}
