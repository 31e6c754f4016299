//! Per-mount filesystem state
//!
//! Everything one enabled mount owns: the inode bindings, the metadata
//! cache that translates paths to cloud handles, the content cache and the
//! OS attachment.

pub mod content_cache;
pub mod error;
#[cfg(feature = "fuse")]
pub mod filesystem;
pub mod inode_cache;
pub mod inode_store;
pub mod inode_table;
pub mod mount;
pub mod platform;

pub use content_cache::{CacheStats, ContentCache, ContentCacheConfig};
pub use error::InodeError;
pub use inode_cache::{InodeCache, InodeInfo};
pub use inode_store::{InodeStore, StoreError, BASELINE_VERSION, INODE_MIGRATOR};
pub use inode_table::InodeTable;
pub use mount::{DirEntry, LiveMount, RequestGuard, MAX_FILE_SIZE};
#[cfg(feature = "fuse")]
pub use platform::FusePlatform;
pub use platform::{default_platform, DetachedPlatform, MountSession, Platform, PlatformError};
