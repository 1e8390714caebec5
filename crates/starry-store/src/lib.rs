//! File-backed document storage for StarryDB.
//!
//! A [`Depot`] is one directory holding one packed document per key. This
//! crate provides everything a depot is built from:
//!
//! - [`mutator`] -- path-addressed get/update/insert/delete on decoded values
//! - [`codec`] -- whole-document encoding with a CRC32 trailer
//! - [`file`] -- document file I/O, tmp-and-rename copies, the backup mirror
//! - [`cache`] -- best-effort read acceleration over a [`CacheBackend`]
//! - [`scheduler`] -- reader/writer admission keyed by member sets
//!
//! # Cache Backends
//!
//! - [`MemoryCache`] -- in-process, bounded by total value size
//! - [`MemcachedCache`] -- memcached text protocol over a Unix socket
//!
//! # Durability Rules
//!
//! 1. The primary file is the source of truth; the cache never runs ahead of it.
//! 2. An unchanged update touches nothing.
//! 3. A primary that fails to decode is restored from `.backup/` when possible.
//! 4. Two processes must never share one depot directory.

pub mod cache;
pub mod codec;
pub mod depot;
pub mod error;
pub mod file;
pub mod memcached;
pub mod memory;
pub mod mutator;
pub mod scheduler;
pub mod traits;

pub use cache::CacheAdapter;
pub use depot::{Change, Depot, DepotOptions};
pub use error::{CacheError, CacheResult, PathError, PathResult, StoreError, StoreResult};
pub use memcached::MemcachedCache;
pub use memory::MemoryCache;
pub use scheduler::{Members, Scheduler, DEFAULT_RW_RATIO};
pub use traits::CacheBackend;
