/**
 * The boundary to the cloud backend.
 *  Node handles, node metadata and the async
 *  client trait the mount service consumes.
 */
pub mod client;
/**
 * Cloud change notifications and the queue
 *  they are delivered through.
 */
pub mod node_event;
/**
 * Absolute, lexically normalized local paths.
 */
pub mod path;
/**
 * Cancellable units of work and the worker
 *  pool that runs them.
 */
pub mod task;
/**
 * In-memory collaborators for tests.
 */
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
/**
 * Helper for setting build version information
 *  at compile time.
 */
pub mod version;

pub mod prelude {
    pub use crate::client::{Client, ClientError, NodeHandle, NodeInfo};
    pub use crate::node_event::{NodeEvent, NodeEventQueue, NodeEventType};
    pub use crate::path::{NormalizedPath, PathError};
    pub use crate::task::{Task, TaskExecutor, TaskExecutorConfig, TaskState};
    pub use crate::version::build_info;
}
