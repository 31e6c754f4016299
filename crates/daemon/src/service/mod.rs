//! Public facade of the mount service
//!
//! [`Service`] is what the rest of the client talks to. It owns an optional
//! [`ServiceContext`]; while no context exists every call degrades to a
//! well-defined default instead of failing loudly. Each state-changing call
//! reports its outcome through the [`MountEventSink`] exactly once.

pub mod context;
pub mod event;
pub mod flags;
pub mod mount_context;
pub mod result;

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use common::prelude::{Client, NodeEventQueue, NormalizedPath, Task};

use crate::database::models::{MountFlags, MountInfo};
use crate::database::types::LogLevel;
use crate::fuse::{default_platform, InodeError, InodeInfo, Platform};
use crate::service_config::Config;

pub use context::{DisableCallback, ServiceContext};
pub use event::{LogSink, MountEvent, MountEventSink, MountEventType};
pub use flags::{LogLevelControl, ServiceFlags};
pub use mount_context::{ContextError, MountContext};
pub use result::MountResult;

pub struct Service {
    client: Arc<dyn Client>,
    sink: Arc<dyn MountEventSink>,
    context: RwLock<Option<Arc<dyn ServiceContext>>>,
    /// Guards only the service-wide settings, never mount state
    flags: Mutex<ServiceFlags>,
    log_control: Option<Arc<dyn LogLevelControl>>,
}

impl Service {
    pub fn new(client: Arc<dyn Client>, sink: Arc<dyn MountEventSink>) -> Self {
        Self {
            client,
            sink,
            context: RwLock::new(None),
            flags: Mutex::new(ServiceFlags::default()),
            log_control: None,
        }
    }

    /// Route `log_level` changes to the process logger
    pub fn with_log_control(mut self, control: Arc<dyn LogLevelControl>) -> Self {
        self.log_control = Some(control);
        self
    }

    /// Force-unmount every live mount matching `predicate`, in every service
    ///
    /// Emits one `Aborted` event per torn-down mount and returns how many
    /// were torn down.
    pub fn abort<P>(predicate: P) -> usize
    where
        P: Fn(&MountInfo) -> bool,
    {
        MountContext::abort(&predicate)
    }

    fn context(&self) -> Option<Arc<dyn ServiceContext>> {
        self.context.read().clone()
    }

    fn emit(&self, name: &str, kind: MountEventType, result: MountResult) -> MountResult {
        self.sink.emit(MountEvent::new(name, kind, result));
        result
    }

    pub fn is_initialized(&self) -> bool {
        self.context.read().is_some()
    }

    /// Construct the context on the platform's native mount backend
    pub async fn initialize(&self, config: &Config) -> MountResult {
        match default_platform() {
            Ok(platform) => self.initialize_with(config, platform).await,
            Err(e) => {
                tracing::error!("mounts are not available: {}", e);
                MountResult::Unexpected
            }
        }
    }

    pub async fn initialize_with(&self, config: &Config, platform: Arc<dyn Platform>) -> MountResult {
        if self.is_initialized() {
            tracing::warn!("mount service is already initialized");
            return MountResult::Unexpected;
        }

        let context = match MountContext::new(config, self.client.clone(), platform, self.sink.clone())
            .await
        {
            Ok(context) => Arc::new(context),
            Err(e) => {
                tracing::error!("failed to initialize mount service: {}", e);
                return MountResult::Unexpected;
            }
        };

        let raced = {
            let mut slot = self.context.write();
            if slot.is_none() {
                *slot = Some(context.clone());
                false
            } else {
                true
            }
        };
        if raced {
            context.shutdown().await;
            return MountResult::Unexpected;
        }

        self.set_service_flags(config.flags.clone());

        if config.enable_startup_mounts {
            for (name, result) in context.startup().await {
                self.emit(&name, MountEventType::Enabled, result);
            }
        }

        tracing::info!("mount service initialized");
        MountResult::Success
    }

    /// Tear down every mount and drop the context
    pub async fn deinitialize(&self) {
        let context = self.context.write().take();
        if let Some(context) = context {
            context.shutdown().await;
            tracing::info!("mount service deinitialized");
        }
    }

    pub async fn add(&self, info: MountInfo) -> MountResult {
        let name = info.name().to_string();
        let result = match self.context() {
            Some(context) => context.add(info).await,
            None => MountResult::Unexpected,
        };
        self.emit(&name, MountEventType::Added, result)
    }

    pub async fn enable(&self, name: &str, remember: bool) -> MountResult {
        let result = match self.context() {
            Some(context) => context.enable(name, remember).await,
            None => MountResult::Unknown,
        };
        self.emit(name, MountEventType::Enabled, result)
    }

    /// Disable `name`, invoking `callback` exactly once with the outcome
    ///
    /// Returns immediately; the mount is drained and unmounted on the task
    /// executor. The `Disabled` event is emitted before `callback` runs.
    pub fn disable<F>(&self, callback: F, name: &str, remember: bool)
    where
        F: FnOnce(MountResult) + Send + 'static,
    {
        let sink = self.sink.clone();
        let event_name = name.to_string();
        let done: DisableCallback = Box::new(move |result| {
            sink.emit(MountEvent::new(event_name, MountEventType::Disabled, result));
            callback(result);
        });

        match self.context() {
            Some(context) => context.disable(name, remember, done),
            None => done(MountResult::Unknown),
        }
    }

    pub async fn remove(&self, name: &str) -> MountResult {
        let result = match self.context() {
            Some(context) => context.remove(name).await,
            None => MountResult::Unknown,
        };
        self.emit(name, MountEventType::Removed, result)
    }

    /// Replace the flags of `name`, live if the mount is enabled
    pub async fn flags(&self, name: &str, flags: MountFlags) -> MountResult {
        let result = match self.context() {
            Some(context) => context.set_flags(name, flags).await,
            None => MountResult::Unknown,
        };
        self.emit(name, MountEventType::Changed, result)
    }

    pub async fn flags_of(&self, name: &str) -> Option<MountFlags> {
        self.get(name).await.map(|info| info.flags)
    }

    pub async fn get(&self, name: &str) -> Option<MountInfo> {
        match self.context() {
            Some(context) => context.get(name).await,
            None => None,
        }
    }

    pub async fn list(&self, only_enabled: bool) -> Vec<MountInfo> {
        match self.context() {
            Some(context) => context.list(only_enabled).await,
            None => Vec::new(),
        }
    }

    pub async fn path(&self, name: &str) -> Option<NormalizedPath> {
        self.get(name).await.map(|info| info.path)
    }

    pub fn enabled(&self, name: &str) -> bool {
        self.context()
            .is_some_and(|context| context.enabled(name))
    }

    pub async fn upgrade(&self, path: impl AsRef<Path>, target: u32) -> MountResult {
        let Some(context) = self.context() else {
            return MountResult::Unsupported;
        };
        match NormalizedPath::new(path) {
            Ok(path) => context.upgrade(&path, target).await,
            Err(_) => MountResult::Unknown,
        }
    }

    pub async fn downgrade(&self, path: impl AsRef<Path>, target: u32) -> MountResult {
        let Some(context) = self.context() else {
            return MountResult::Unsupported;
        };
        match NormalizedPath::new(path) {
            Ok(path) => context.downgrade(&path, target).await,
            Err(_) => MountResult::Unknown,
        }
    }

    /// Resolve a local path under a live mount to its cloud node
    pub async fn describe(&self, path: impl AsRef<Path>) -> Result<InodeInfo, InodeError> {
        let context = self.context().ok_or(InodeError::NotFound)?;
        let path = NormalizedPath::new(path).map_err(|_| InodeError::NotFound)?;
        context.describe(&path).await
    }

    pub fn cached(&self, path: impl AsRef<Path>) -> bool {
        let Some(context) = self.context() else {
            return false;
        };
        NormalizedPath::new(path).is_ok_and(|path| context.cached(&path))
    }

    /// The cloud view is caught up; cache misses may now be trusted
    pub fn current(&self) {
        if let Some(context) = self.context() {
            context.current();
        }
    }

    pub fn discard(&self, discard: bool) {
        if let Some(context) = self.context() {
            context.discard(discard);
        }
    }

    /// Deliver a batch of cloud changes to every live mount
    pub fn updated(&self, mut events: impl NodeEventQueue) {
        let events = events.drain_ordered();
        if let Some(context) = self.context() {
            context.updated(events);
        }
    }

    /// Run `body` on the task executor
    ///
    /// Without a context the returned task is already cancelled and `body`
    /// never runs.
    pub fn execute<F>(&self, body: F) -> Task
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        match self.context() {
            Some(context) => context.execute(Box::new(body)),
            None => Task::cancelled(body),
        }
    }

    /// False for paths inside, or containing, an enabled mount
    pub fn syncable(&self, path: impl AsRef<Path>) -> bool {
        let Some(context) = self.context() else {
            return true;
        };
        match NormalizedPath::new(path) {
            Ok(path) => context.syncable(&path),
            Err(_) => true,
        }
    }

    pub fn log_level(&self) -> LogLevel {
        self.flags.lock().log_level
    }

    /// Changes are applied while the settings lock is held, so the logger
    /// and the context always end up with the last writer's value
    pub fn set_log_level(&self, level: LogLevel) {
        let mut flags = self.flags.lock();
        flags.log_level = level;
        if let Some(control) = &self.log_control {
            control.set_level(level);
        }
    }

    pub fn service_flags(&self) -> ServiceFlags {
        self.flags.lock().clone()
    }

    pub fn set_service_flags(&self, flags: ServiceFlags) {
        let mut current = self.flags.lock();
        if let Some(control) = &self.log_control {
            control.set_level(flags.log_level);
        }
        if let Some(context) = self.context() {
            context.apply_flags(&flags);
        }
        *current = flags;
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("initialized", &self.is_initialized())
            .field("flags", &*self.flags.lock())
            .finish()
    }
}
