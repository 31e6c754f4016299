use common::prelude::{NodeEvent, NormalizedPath, Task};

use crate::database::models::{MountFlags, MountInfo};
use crate::fuse::{InodeError, InodeInfo};

use super::flags::ServiceFlags;
use super::result::MountResult;

/// Called exactly once with the outcome of a `disable`
pub type DisableCallback = Box<dyn FnOnce(MountResult) + Send + 'static>;

/// Platform layer behind the [`Service`](super::Service) facade
///
/// Owns the live mounts, the mount database and the task executor. Every
/// administrative method reports its outcome as a [`MountResult`]; none of
/// them emits events, that is the facade's job.
#[async_trait::async_trait]
pub trait ServiceContext: Send + Sync + 'static {
    async fn add(&self, info: MountInfo) -> MountResult;

    async fn enable(&self, name: &str, remember: bool) -> MountResult;

    /// Start disabling `name`; `done` runs once the mount is torn down
    fn disable(&self, name: &str, remember: bool, done: DisableCallback);

    async fn remove(&self, name: &str) -> MountResult;

    async fn set_flags(&self, name: &str, flags: MountFlags) -> MountResult;

    async fn get(&self, name: &str) -> Option<MountInfo>;

    /// Known mounts sorted by name
    async fn list(&self, only_enabled: bool) -> Vec<MountInfo>;

    fn enabled(&self, name: &str) -> bool;

    async fn upgrade(&self, path: &NormalizedPath, target: u32) -> MountResult;

    async fn downgrade(&self, path: &NormalizedPath, target: u32) -> MountResult;

    async fn describe(&self, path: &NormalizedPath) -> Result<InodeInfo, InodeError>;

    fn cached(&self, path: &NormalizedPath) -> bool;

    fn current(&self);

    fn discard(&self, discard: bool);

    fn updated(&self, events: Vec<NodeEvent>);

    fn execute(&self, body: Box<dyn FnOnce(&Task) + Send + 'static>) -> Task;

    fn syncable(&self, path: &NormalizedPath) -> bool;

    fn apply_flags(&self, flags: &ServiceFlags);

    /// Enable every mount flagged for startup
    async fn startup(&self) -> Vec<(String, MountResult)>;

    /// Tear down every live mount and stop the executor
    async fn shutdown(&self);
}
