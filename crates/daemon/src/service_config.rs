use std::path::PathBuf;

use common::prelude::TaskExecutorConfig;

use crate::fuse::ContentCacheConfig;
use crate::service::ServiceFlags;

#[derive(Debug, Clone)]
pub struct Config {
    // data store configuration
    /// a path to the mount database, if not set then an
    ///  in-memory database will be used
    pub sqlite_path: Option<PathBuf>,
    /// directory holding each mount's inode store, if not set
    ///  then every store lives in memory and cannot be migrated
    ///  while its mount is disabled
    pub cache_dir: Option<PathBuf>,

    // runtime configuration
    pub executor: TaskExecutorConfig,
    pub content_cache: ContentCacheConfig,
    pub flags: ServiceFlags,
    /// Enable mounts flagged `enable_at_startup` on initialize
    pub enable_startup_mounts: bool,

    // logging
    /// Directory for log files (optional, logs to stdout only if not set)
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sqlite_path: None,
            cache_dir: None,
            executor: TaskExecutorConfig::default(),
            content_cache: ContentCacheConfig::default(),
            flags: ServiceFlags::default(),
            enable_startup_mounts: true,
            log_dir: None,
        }
    }
}
