//! Best-effort read acceleration over depot files.
//!
//! Entries are keyed `"{depot_index}:{key}"` and hold packed documents. Every
//! backend failure degrades to a miss. An entry is only ever written after
//! the matching file write succeeded, so the cache never runs ahead of disk.

use std::sync::Arc;

use starry_types::Value;
use tracing::{debug, warn};

use crate::codec;
use crate::traits::CacheBackend;

/// Depot-facing view of a shared [`CacheBackend`].
#[derive(Clone)]
pub struct CacheAdapter {
    backend: Arc<dyn CacheBackend>,
}

/// Cache key of `key` inside the depot registered as `index`.
pub fn cache_key(index: usize, key: &str) -> String {
    format!("{index}:{key}")
}

impl CacheAdapter {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Cached document of `key`, if present and intact.
    ///
    /// An entry that fails to decode is evicted and reported as a miss.
    pub fn get(&self, index: usize, key: &str) -> Option<Value> {
        let cache_key = cache_key(index, key);
        let data = match self.backend.get(&cache_key) {
            Ok(Some(data)) => data,
            Ok(None) => return None,
            Err(e) => {
                debug!(key = %cache_key, error = %e, "cache get failed");
                return None;
            }
        };

        match codec::unpack(&data) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %cache_key, error = %e, "evicting poisoned cache entry");
                let _ = self.backend.delete(&cache_key);
                None
            }
        }
    }

    /// Store packed bytes for `key`. On failure the entry is deleted so a
    /// stale value is never served.
    pub fn set(&self, index: usize, key: &str, data: &[u8]) -> bool {
        let cache_key = cache_key(index, key);
        match self.backend.set(&cache_key, data) {
            Ok(()) => true,
            Err(e) => {
                debug!(key = %cache_key, error = %e, "cache set failed");
                let _ = self.backend.delete(&cache_key);
                false
            }
        }
    }

    /// Evict `key`. Returns `false` only if the backend failed.
    pub fn delete(&self, index: usize, key: &str) -> bool {
        let cache_key = cache_key(index, key);
        match self.backend.delete(&cache_key) {
            Ok(_) => true,
            Err(e) => {
                debug!(key = %cache_key, error = %e, "cache delete failed");
                false
            }
        }
    }

    /// Drop every entry of every depot.
    pub fn flush_all(&self) -> bool {
        match self.backend.flush_all() {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "cache flush failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for CacheAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheAdapter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CacheError, CacheResult};
    use crate::memory::MemoryCache;

    /// Backend that fails every call.
    struct Broken;

    impl CacheBackend for Broken {
        fn get(&self, _key: &str) -> CacheResult<Option<Vec<u8>>> {
            Err(CacheError::Protocol("down".into()))
        }
        fn set(&self, _key: &str, _value: &[u8]) -> CacheResult<()> {
            Err(CacheError::Protocol("down".into()))
        }
        fn delete(&self, _key: &str) -> CacheResult<bool> {
            Err(CacheError::Protocol("down".into()))
        }
        fn flush_all(&self) -> CacheResult<()> {
            Err(CacheError::Protocol("down".into()))
        }
    }

    #[test]
    fn keys_are_scoped_by_depot_index() {
        assert_eq!(cache_key(3, "alice"), "3:alice");
    }

    #[test]
    fn set_then_get_decodes() {
        let backend = Arc::new(MemoryCache::unbounded());
        let cache = CacheAdapter::new(backend.clone());
        let value = Value::from(vec![1, 2, 3]);

        assert!(cache.set(0, "k", &codec::pack(&value).unwrap()));
        assert_eq!(cache.get(0, "k"), Some(value));
        assert_eq!(cache.get(1, "k"), None);
    }

    #[test]
    fn poisoned_entry_is_evicted() {
        let backend = Arc::new(MemoryCache::unbounded());
        let cache = CacheAdapter::new(backend.clone());
        backend.set("0:k", b"garbage").unwrap();

        assert_eq!(cache.get(0, "k"), None);
        assert!(backend.get("0:k").unwrap().is_none());
    }

    #[test]
    fn failed_set_leaves_no_entry() {
        let backend = Arc::new(MemoryCache::new(4));
        let cache = CacheAdapter::new(backend.clone());
        backend.set("0:k", b"old").unwrap();

        assert!(!cache.set(0, "k", b"much too large"));
        assert!(backend.get("0:k").unwrap().is_none());
    }

    #[test]
    fn broken_backend_degrades_to_miss() {
        let cache = CacheAdapter::new(Arc::new(Broken));
        assert_eq!(cache.get(0, "k"), None);
        assert!(!cache.set(0, "k", b"x"));
        assert!(!cache.delete(0, "k"));
        assert!(!cache.flush_all());
    }
}
