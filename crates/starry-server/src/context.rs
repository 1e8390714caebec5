use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use starry_store::{CacheAdapter, Depot, DepotOptions, StoreResult};
use tracing::info;

use crate::config::DepotConfig;

struct Registry {
    depots: HashMap<PathBuf, Arc<Depot>>,
    /// Index handed to the next new depot; scopes its cache keys.
    cursor: usize,
}

/// Process-wide registry of open depots, one per absolute directory path.
///
/// Shared by every connection handler. Depots are created on first
/// reference and live until [`ServerContext::close_all`].
pub struct ServerContext {
    registry: Mutex<Registry>,
    cache: Option<CacheAdapter>,
    rw_ratio: usize,
}

impl ServerContext {
    pub fn new(cache: Option<CacheAdapter>, rw_ratio: usize) -> Self {
        Self {
            registry: Mutex::new(Registry {
                depots: HashMap::new(),
                cursor: 0,
            }),
            cache,
            rw_ratio,
        }
    }

    pub fn cache(&self) -> Option<&CacheAdapter> {
        self.cache.as_ref()
    }

    /// Return the depot for `path`, opening it on first use.
    pub fn open_depot(&self, path: impl AsRef<Path>) -> StoreResult<Arc<Depot>> {
        let path = registry_key(path.as_ref())?;

        let mut registry = self.registry.lock().expect("registry lock poisoned");
        if let Some(depot) = registry.depots.get(&path) {
            return Ok(Arc::clone(depot));
        }

        let depot = Arc::new(Depot::open(
            &path,
            DepotOptions {
                rw_ratio: self.rw_ratio,
                index: registry.cursor,
                cache: self.cache.clone(),
            },
        )?);
        registry.cursor += 1;
        registry.depots.insert(path.clone(), Arc::clone(&depot));
        info!(path = %path.display(), index = depot.index(), "registered depot");
        Ok(depot)
    }

    /// Open a configured depot and apply its toggles.
    pub fn register(&self, config: &DepotConfig) -> StoreResult<Arc<Depot>> {
        let depot = self.open_depot(&config.path)?;
        if config.backup {
            depot.enable_backup()?;
        }
        if config.cache {
            depot.enable_cache()?;
        }
        if config.fsync {
            depot.enable_fsync()?;
        }
        Ok(depot)
    }

    /// The depot already registered for `path`, if any.
    pub fn depot(&self, path: impl AsRef<Path>) -> Option<Arc<Depot>> {
        let path = registry_key(path.as_ref()).ok()?;
        let registry = self.registry.lock().expect("registry lock poisoned");
        registry.depots.get(&path).cloned()
    }

    pub fn len(&self) -> usize {
        self.registry.lock().expect("registry lock poisoned").depots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every depot. Connections holding one keep it alive until they
    /// close.
    pub fn close_all(&self) {
        self.registry
            .lock()
            .expect("registry lock poisoned")
            .depots
            .clear();
    }
}

/// Resolve `path` so aliases (`..`, symlinks) of one directory share a key.
///
/// A path that cannot be resolved is only made absolute, leaving it to
/// [`Depot::open`] to report the missing directory.
fn registry_key(path: &Path) -> std::io::Result<PathBuf> {
    match std::fs::canonicalize(path) {
        Ok(path) => Ok(path),
        Err(_) => std::path::absolute(path),
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("depots", &self.len())
            .field("cached", &self.cache.is_some())
            .field("rw_ratio", &self.rw_ratio)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starry_store::MemoryCache;

    #[test]
    fn same_path_yields_same_depot() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ServerContext::new(None, 5);
        let a = ctx.open_depot(dir.path()).unwrap();
        let b = ctx.open_depot(dir.path().join(".")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn aliased_paths_share_one_depot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("link")).unwrap();
        let ctx = ServerContext::new(None, 5);

        let a = ctx.open_depot(dir.path()).unwrap();
        let b = ctx.open_depot(dir.path().join("sub/..")).unwrap();
        let c = ctx.open_depot(dir.path().join("link")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(ctx.len(), 1);
        assert!(ctx.depot(dir.path().join("sub/..")).is_some());
    }

    #[test]
    fn indexes_are_assigned_in_order() {
        let d1 = tempfile::tempdir().unwrap();
        let d2 = tempfile::tempdir().unwrap();
        let ctx = ServerContext::new(None, 5);
        assert_eq!(ctx.open_depot(d1.path()).unwrap().index(), 0);
        assert_eq!(ctx.open_depot(d2.path()).unwrap().index(), 1);
        assert_eq!(ctx.open_depot(d1.path()).unwrap().index(), 0);
    }

    #[test]
    fn missing_directory_is_not_registered() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ServerContext::new(None, 5);
        let err = ctx.open_depot(dir.path().join("missing")).unwrap_err();
        assert!(err.to_string().ends_with("doesn't exist."));
        assert!(ctx.is_empty());
        // The failed attempt does not consume an index.
        assert_eq!(ctx.open_depot(dir.path()).unwrap().index(), 0);
    }

    #[test]
    fn register_applies_toggles() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheAdapter::new(Arc::new(MemoryCache::unbounded()));
        let ctx = ServerContext::new(Some(cache), 5);
        let depot = ctx
            .register(&DepotConfig {
                path: dir.path().to_path_buf(),
                backup: true,
                cache: true,
                fsync: false,
            })
            .unwrap();
        assert!(depot.backup_enabled());
        assert!(depot.cache_enabled());
        assert!(!depot.fsync_enabled());
        assert!(dir.path().join(".backup").is_dir());
        assert!(ctx.depot(dir.path()).is_some());

        ctx.close_all();
        assert!(ctx.depot(dir.path()).is_none());
    }
}
