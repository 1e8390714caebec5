use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use crate::error::{CacheError, CacheResult};
use crate::traits::CacheBackend;

struct Entry {
    generation: u64,
    data: Vec<u8>,
}

struct Inner {
    entries: HashMap<String, Entry>,
    /// Insertion order, oldest first. A slot whose generation no longer
    /// matches its entry is stale and skipped during eviction.
    order: VecDeque<(u64, String)>,
    bytes: usize,
    next_generation: u64,
}

/// In-process cache bounded by total value size.
///
/// When a new entry would exceed the capacity, the oldest entries are evicted
/// first. Intended for servers that do not run an external cache and for
/// tests.
pub struct MemoryCache {
    inner: RwLock<Inner>,
    capacity: usize,
}

impl MemoryCache {
    /// Create a cache holding at most `capacity` bytes of values.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                bytes: 0,
                next_generation: 0,
            }),
            capacity,
        }
    }

    /// Create a cache without a size bound.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// Number of entries currently cached.
    pub fn len(&self) -> usize {
        self.inner.read().expect("cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes of cached values.
    pub fn total_bytes(&self) -> usize {
        self.inner.read().expect("cache lock poisoned").bytes
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Inner {
    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(old) => {
                self.bytes -= old.data.len();
                self.compact();
                true
            }
            None => false,
        }
    }

    fn evict_until_fits(&mut self, incoming: usize, capacity: usize) {
        while self.bytes + incoming > capacity {
            let Some((generation, oldest)) = self.order.pop_front() else {
                break;
            };
            if self.entries.get(&oldest).is_some_and(|e| e.generation == generation) {
                self.remove(&oldest);
            }
        }
    }

    /// Drop stale order slots once they outnumber live entries.
    fn compact(&mut self) {
        if self.order.len() > 2 * self.entries.len() + 16 {
            let entries = &self.entries;
            self.order
                .retain(|(generation, key)| entries.get(key).is_some_and(|e| e.generation == *generation));
        }
    }

    fn insert(&mut self, key: &str, data: &[u8]) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.bytes += data.len();
        self.entries.insert(
            key.to_string(),
            Entry {
                generation,
                data: data.to_vec(),
            },
        );
        self.order.push_back((generation, key.to_string()));
    }
}

impl CacheBackend for MemoryCache {
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let inner = self.inner.read().expect("cache lock poisoned");
        Ok(inner.entries.get(key).map(|e| e.data.clone()))
    }

    fn set(&self, key: &str, value: &[u8]) -> CacheResult<()> {
        if value.len() > self.capacity {
            return Err(CacheError::TooLarge {
                size: value.len(),
                capacity: self.capacity,
            });
        }

        let mut inner = self.inner.write().expect("cache lock poisoned");
        inner.remove(key);
        inner.evict_until_fits(value.len(), self.capacity);
        inner.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut inner = self.inner.write().expect("cache lock poisoned");
        Ok(inner.remove(key))
    }

    fn flush_all(&self) -> CacheResult<()> {
        let mut inner = self.inner.write().expect("cache lock poisoned");
        inner.entries.clear();
        inner.order.clear();
        inner.bytes = 0;
        Ok(())
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &self.len())
            .field("bytes", &self.total_bytes())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete() {
        let cache = MemoryCache::unbounded();
        assert!(cache.get("0:a").unwrap().is_none());

        cache.set("0:a", b"one").unwrap();
        assert_eq!(cache.get("0:a").unwrap().as_deref(), Some(&b"one"[..]));

        assert!(cache.delete("0:a").unwrap());
        assert!(!cache.delete("0:a").unwrap());
        assert!(cache.is_empty());
    }

    #[test]
    fn overwrite_tracks_bytes() {
        let cache = MemoryCache::unbounded();
        cache.set("k", b"12345").unwrap();
        cache.set("k", b"12").unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 2);
    }

    #[test]
    fn evicts_oldest_first() {
        let cache = MemoryCache::new(10);
        cache.set("a", b"aaaa").unwrap();
        cache.set("b", b"bbbb").unwrap();
        cache.set("c", b"cccc").unwrap();

        assert!(cache.get("a").unwrap().is_none());
        assert!(cache.get("b").unwrap().is_some());
        assert!(cache.get("c").unwrap().is_some());
        assert!(cache.total_bytes() <= cache.capacity());
    }

    #[test]
    fn rewritten_entry_moves_to_back() {
        let cache = MemoryCache::new(8);
        cache.set("a", b"aaaa").unwrap();
        cache.set("b", b"bbbb").unwrap();
        cache.set("a", b"AAAA").unwrap();
        cache.set("c", b"cccc").unwrap();

        assert!(cache.get("b").unwrap().is_none());
        assert_eq!(cache.get("a").unwrap().as_deref(), Some(&b"AAAA"[..]));
    }

    #[test]
    fn rewrites_do_not_grow_the_order_queue() {
        let cache = MemoryCache::unbounded();
        for i in 0..1000u32 {
            cache.set("hot", &i.to_le_bytes()).unwrap();
        }
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 4);
        let inner = cache.inner.read().unwrap();
        assert!(inner.order.len() <= 2 * inner.entries.len() + 16);
    }

    #[test]
    fn oversized_value_is_rejected() {
        let cache = MemoryCache::new(3);
        let err = cache.set("k", b"four").unwrap_err();
        assert!(matches!(err, CacheError::TooLarge { size: 4, capacity: 3 }));
        assert!(cache.is_empty());
    }

    #[test]
    fn flush_all_empties() {
        let cache = MemoryCache::unbounded();
        cache.set("a", b"1").unwrap();
        cache.set("b", b"2").unwrap();
        cache.flush_all().unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn debug_format() {
        let cache = MemoryCache::new(64);
        let debug = format!("{cache:?}");
        assert!(debug.contains("MemoryCache"));
        assert!(debug.contains("capacity"));
    }
}
