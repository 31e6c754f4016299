//! Size-bounded cache with TTL for file contents
//!
//! Content is demand-fetched through the client and kept here keyed by node
//! handle. Entries are weighed by their byte length. Change events
//! invalidate the affected handles.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use serde::{Deserialize, Serialize};

use common::prelude::NodeHandle;

/// Configuration for the content cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentCacheConfig {
    /// Maximum cache size in megabytes
    pub max_size_mb: u32,
    /// TTL for cached content in seconds
    pub ttl_secs: u32,
}

impl Default for ContentCacheConfig {
    fn default() -> Self {
        Self {
            max_size_mb: 100,
            ttl_secs: 300,
        }
    }
}

#[derive(Clone)]
pub struct ContentCache {
    content: Cache<NodeHandle, Arc<Vec<u8>>>,
    config: ContentCacheConfig,
}

impl ContentCache {
    pub fn new(config: ContentCacheConfig) -> Self {
        let max_bytes = (config.max_size_mb as u64) * 1024 * 1024;

        Self {
            content: Cache::builder()
                .time_to_live(Duration::from_secs(config.ttl_secs as u64))
                .weigher(|_handle: &NodeHandle, data: &Arc<Vec<u8>>| {
                    data.len().try_into().unwrap_or(u32::MAX)
                })
                .max_capacity(max_bytes)
                .build(),
            config,
        }
    }

    pub fn get(&self, handle: NodeHandle) -> Option<Arc<Vec<u8>>> {
        self.content.get(&handle)
    }

    pub fn put(&self, handle: NodeHandle, data: Arc<Vec<u8>>) {
        self.content.insert(handle, data);
    }

    pub fn invalidate(&self, handle: NodeHandle) {
        self.content.invalidate(&handle);
    }

    pub fn invalidate_all(&self) {
        self.content.invalidate_all();
    }

    /// Get current cache statistics
    pub fn stats(&self) -> CacheStats {
        self.content.run_pending_tasks();
        CacheStats {
            entry_count: self.content.entry_count(),
            weighted_size: self.content.weighted_size(),
            max_size_mb: self.config.max_size_mb,
        }
    }
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCache")
            .field("config", &self.config)
            .finish()
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub entry_count: u64,
    /// Bytes currently held
    pub weighted_size: u64,
    pub max_size_mb: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_invalidate() {
        let cache = ContentCache::new(ContentCacheConfig::default());
        let handle = NodeHandle::new(9);

        cache.put(handle, Arc::new(b"hello".to_vec()));
        assert_eq!(cache.get(handle).unwrap().as_slice(), b"hello");

        cache.invalidate(handle);
        assert!(cache.get(handle).is_none());
    }

    #[test]
    fn test_stats_weigh_bytes() {
        let cache = ContentCache::new(ContentCacheConfig::default());
        cache.put(NodeHandle::new(1), Arc::new(vec![0; 1000]));
        cache.put(NodeHandle::new(2), Arc::new(vec![0; 24]));

        let stats = cache.stats();
        assert_eq!(stats.entry_count, 2);
        assert_eq!(stats.weighted_size, 1024);
    }
}
