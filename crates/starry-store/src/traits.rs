use crate::error::CacheResult;

/// A string-keyed byte cache shared by every depot of a server.
///
/// Implementations must be safe to call from many connection threads at once.
/// Callers treat every error as a miss; a backend never needs to retry.
pub trait CacheBackend: Send + Sync {
    /// Fetch the bytes stored under `key`.
    ///
    /// Returns `Ok(None)` on a miss.
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store `value` under `key` with no expiry, replacing any previous entry.
    fn set(&self, key: &str, value: &[u8]) -> CacheResult<()>;

    /// Remove the entry under `key`. Returns `true` if it existed.
    fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Drop every entry.
    fn flush_all(&self) -> CacheResult<()>;
}
