//! The depot: one directory of documents behind a fairness scheduler.
//!
//! Every public operation validates its keys, waits for admission on the
//! [`Scheduler`], then composes the mutator, the file layer, and the cache.
//! Writes always reach the primary file first; the cache and the backup
//! mirror are updated only after that write succeeded.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use starry_types::{validate_key, Route, Value};
use tracing::{debug, info, warn};

use crate::cache::CacheAdapter;
use crate::codec::{self, file_name};
use crate::error::{StoreError, StoreResult};
use crate::file::{self, copy_file, read_file, remove_quietly, tmp_sibling, write_file, FileStore};
use crate::mutator;
use crate::scheduler::{Members, Scheduler, DEFAULT_RW_RATIO};

/// Outcome of an update or insert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Change {
    /// The document was rewritten.
    Written,
    /// The addressed value already held the new value; nothing was touched.
    Unchanged,
}

/// Construction parameters for a [`Depot`].
#[derive(Clone, Debug)]
pub struct DepotOptions {
    pub rw_ratio: usize,
    /// Position of the depot in its server's registry. Scopes cache keys.
    pub index: usize,
    /// Shared cache, consulted only while caching is enabled.
    pub cache: Option<CacheAdapter>,
}

impl Default for DepotOptions {
    fn default() -> Self {
        Self {
            rw_ratio: DEFAULT_RW_RATIO,
            index: 0,
            cache: None,
        }
    }
}

#[derive(Clone, Copy)]
enum Mutation {
    Update,
    Insert,
}

/// A directory-backed collection of documents.
#[derive(Debug)]
pub struct Depot {
    files: FileStore,
    index: usize,
    shared_cache: Option<CacheAdapter>,
    cache_enabled: AtomicBool,
    backup_enabled: AtomicBool,
    fsync: AtomicBool,
    scheduler: Scheduler,
}

impl Depot {
    /// Bind a depot to an existing directory. Backup, cache, and fsync start
    /// disabled.
    pub fn open(path: impl AsRef<Path>, options: DepotOptions) -> StoreResult<Self> {
        let files = FileStore::open(path.as_ref())?;
        debug!(path = %files.root().display(), index = options.index, "opened depot");
        Ok(Self {
            files,
            index: options.index,
            shared_cache: options.cache,
            cache_enabled: AtomicBool::new(false),
            backup_enabled: AtomicBool::new(false),
            fsync: AtomicBool::new(false),
            scheduler: Scheduler::new(options.rw_ratio),
        })
    }

    pub fn path(&self) -> &Path {
        self.files.root()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn backup_enabled(&self) -> bool {
        self.backup_enabled.load(Ordering::SeqCst)
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled.load(Ordering::SeqCst)
    }

    pub fn fsync_enabled(&self) -> bool {
        self.fsync.load(Ordering::SeqCst)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    // ------------------------------------------------------------------
    // Toggles
    // ------------------------------------------------------------------

    /// Turn on the backup mirror. A freshly created `.backup/` is populated
    /// from every current document before the flag flips.
    pub fn enable_backup(&self) -> StoreResult<()> {
        if self.files.create_backup_dir()? {
            self.backup()?;
        }
        self.backup_enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn disable_backup(&self) -> StoreResult<()> {
        self.backup_enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn enable_cache(&self) -> StoreResult<()> {
        if self.shared_cache.is_none() {
            debug!(path = %self.path().display(), "no cache configured; enable is a no-op");
        }
        self.cache_enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop using the cache and evict every document of this depot from it.
    ///
    /// Both happen under one whole-depot admission, so no writer can
    /// repopulate an entry between the eviction and the flag flip.
    pub fn disable_cache(&self) -> StoreResult<()> {
        let _slot = self.scheduler.read(Members::All);
        self.cache_enabled.store(false, Ordering::SeqCst);
        if let Some(cache) = &self.shared_cache {
            for key in self.files.keys()? {
                cache.delete(self.index, &key);
            }
        }
        Ok(())
    }

    pub fn enable_fsync(&self) -> StoreResult<()> {
        self.fsync.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn disable_fsync(&self) -> StoreResult<()> {
        self.fsync.store(false, Ordering::SeqCst);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Single-key operations
    // ------------------------------------------------------------------

    /// Read a document, or the part of it addressed by `route`.
    pub fn get(&self, route: &Route) -> StoreResult<Value> {
        validate_key(&route.key)?;
        let _slot = self.scheduler.read(Members::key(&route.key));
        self.read_route(route)
    }

    /// Whether `route` resolves. Never reports a missing key as an error.
    pub fn exist(&self, route: &Route) -> StoreResult<bool> {
        validate_key(&route.key)?;
        let _slot = self.scheduler.read(Members::key(&route.key));
        Ok(self.read_route(route).is_ok())
    }

    /// Overwrite a document, or an existing slot inside one.
    pub fn update(&self, route: &Route, value: Value) -> StoreResult<Change> {
        validate_key(&route.key)?;
        let _slot = self.scheduler.write(Members::key(&route.key));
        self.write_route(route, value, Mutation::Update)
    }

    /// Create or overwrite a document, or insert into one.
    pub fn insert(&self, route: &Route, value: Value) -> StoreResult<Change> {
        validate_key(&route.key)?;
        let _slot = self.scheduler.write(Members::key(&route.key));
        self.write_route(route, value, Mutation::Insert)
    }

    /// Delete a document, or a slot inside one.
    pub fn delete(&self, route: &Route) -> StoreResult<()> {
        validate_key(&route.key)?;
        let _slot = self.scheduler.write(Members::key(&route.key));
        self.delete_route(route)
    }

    /// Copy the document `old_key` to `new_key`, overwriting it.
    pub fn copy(&self, old_key: &str, new_key: &str) -> StoreResult<()> {
        validate_key(old_key)?;
        validate_key(new_key)?;
        let _slot = self.scheduler.write(Members::keys([old_key, new_key]));
        let value = self.read_route(&Route::new(old_key))?;
        self.write_route(&Route::new(new_key), value, Mutation::Insert)?;
        Ok(())
    }

    /// Move `old_key` to `new_key`. If the old document cannot be removed,
    /// the new one is deleted again.
    pub fn rename(&self, old_key: &str, new_key: &str) -> StoreResult<()> {
        validate_key(old_key)?;
        validate_key(new_key)?;
        let _slot = self.scheduler.write(Members::keys([old_key, new_key]));
        let value = self.read_route(&Route::new(old_key))?;
        if old_key == new_key {
            return Ok(());
        }
        self.write_route(&Route::new(new_key), value, Mutation::Insert)?;

        if let Err(e) = self.delete_route(&Route::new(old_key)) {
            warn!(%old_key, %new_key, error = %e, "rename could not remove source; rolling back");
            if let Err(rollback) = self.delete_route(&Route::new(new_key)) {
                warn!(%new_key, error = %rollback, "rename rollback failed");
            }
            return Err(e);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Multi-key operations. Each stops at the first failing key.
    // ------------------------------------------------------------------

    pub fn get_multi(&self, keys: &[String]) -> StoreResult<BTreeMap<String, Value>> {
        for key in keys {
            validate_key(key)?;
        }
        let _slot = self.scheduler.read(Members::keys(keys.iter().cloned()));
        keys.iter()
            .map(|key| -> StoreResult<(String, Value)> { Ok((key.clone(), self.load_value(key)?)) })
            .collect()
    }

    pub fn update_multi(&self, values: BTreeMap<String, Value>) -> StoreResult<()> {
        self.write_multi(values, Mutation::Update)
    }

    pub fn insert_multi(&self, values: BTreeMap<String, Value>) -> StoreResult<()> {
        self.write_multi(values, Mutation::Insert)
    }

    fn write_multi(&self, values: BTreeMap<String, Value>, mutation: Mutation) -> StoreResult<()> {
        for key in values.keys() {
            validate_key(key)?;
        }
        let _slot = self.scheduler.write(Members::keys(values.keys().cloned()));
        for (key, value) in values {
            self.write_route(&Route::new(key), value, mutation)?;
        }
        Ok(())
    }

    pub fn delete_multi(&self, keys: &[String]) -> StoreResult<()> {
        for key in keys {
            validate_key(key)?;
        }
        let _slot = self.scheduler.write(Members::keys(keys.iter().cloned()));
        for key in keys {
            self.delete_route(&Route::new(key.as_str()))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Whole-depot operations
    // ------------------------------------------------------------------

    /// Keys of every stored document, sorted.
    pub fn list(&self) -> StoreResult<Vec<String>> {
        let _slot = self.scheduler.read(Members::All);
        self.files.keys()
    }

    pub fn get_all(&self) -> StoreResult<BTreeMap<String, Value>> {
        let _slot = self.scheduler.read(Members::All);
        self.files
            .keys()?
            .into_iter()
            .map(|key| -> StoreResult<(String, Value)> {
                let value = self.load_value(&key)?;
                Ok((key, value))
            })
            .collect()
    }

    /// Make the depot hold exactly `values`: update every given key, then
    /// delete every other document.
    pub fn update_all(&self, values: BTreeMap<String, Value>) -> StoreResult<()> {
        for key in values.keys() {
            validate_key(key)?;
        }
        let _slot = self.scheduler.write(Members::All);
        let keep: BTreeSet<String> = values.keys().cloned().collect();
        for (key, value) in values {
            self.write_route(&Route::new(key), value, Mutation::Update)?;
        }
        for key in self.files.keys()? {
            if !keep.contains(&key) {
                if let Err(e) = self.delete_route(&Route::new(key.as_str())) {
                    warn!(key = %key, error = %e, "could not remove document absent from update");
                }
            }
        }
        Ok(())
    }

    /// Verify every primary and mirror it into `.backup/`.
    pub fn backup(&self) -> StoreResult<()> {
        let _slot = self.scheduler.write(Members::All);
        self.files.create_backup_dir()?;
        for key in self.files.keys()? {
            self.backup_key(&key, true, None)?;
        }
        Ok(())
    }

    /// Restore every corrupt primary, and every missing primary that still
    /// has a backup, from `.backup/`.
    ///
    /// Keys that cannot be restored are logged, not reported.
    pub fn recover(&self) -> StoreResult<()> {
        let _slot = self.scheduler.write(Members::All);
        for key in self.files.keys()? {
            if self.load_value(&key).is_err() {
                self.recover_logged(&key);
            }
        }
        for key in self.files.backup_keys()? {
            if !self.files.primary(&key).exists() && self.load_value(&key).is_err() {
                self.recover_logged(&key);
            }
        }
        Ok(())
    }

    /// Copy every verified document into the directory `path`, replacing its
    /// previous documents.
    pub fn clone_to(&self, path: impl AsRef<Path>) -> StoreResult<()> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(StoreError::Domain(format!(
                "path {} doesn't exist.",
                path.display()
            )));
        }
        if same_dir(path, self.path()) {
            return Err(StoreError::Domain(format!(
                "Can not clone {} into itself.",
                path.display()
            )));
        }

        let _slot = self.scheduler.write(Members::All);
        file::remove_documents(path)?;
        for key in self.files.keys()? {
            self.backup_key(&key, true, Some(path))?;
        }
        info!(from = %self.path().display(), to = %path.display(), "cloned depot");
        Ok(())
    }

    /// Replace this depot's documents with those of the directory `path`.
    ///
    /// Local documents with no counterpart in `path` are deleted.
    pub fn upgrade_from(&self, path: impl AsRef<Path>) -> StoreResult<()> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(StoreError::NotFound(path.display().to_string()));
        }

        let _slot = self.scheduler.write(Members::All);
        let incoming = file::list_keys(path)?;
        for key in &incoming {
            self.load_from(key, path)?;
        }
        for key in self.files.keys()? {
            if !path.join(file_name(&key)).exists() {
                if let Err(e) = self.delete_route(&Route::new(key.as_str())) {
                    warn!(key = %key, error = %e, "could not remove document absent from upgrade");
                }
            }
        }
        info!(from = %path.display(), to = %self.path().display(), "upgraded depot");
        Ok(())
    }

    /// Delete every document, the backup mirror, and their cache entries.
    pub fn clear(&self) -> StoreResult<()> {
        let _slot = self.scheduler.write(Members::All);
        for key in self.files.keys()? {
            self.cache_delete(&key);
        }
        file::remove_documents(self.path())?;
        self.files.remove_backup_dir()?;
        self.scheduler.reset();
        info!(path = %self.path().display(), "cleared depot");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals. Callers hold the appropriate admission.
    // ------------------------------------------------------------------

    fn cache(&self) -> Option<&CacheAdapter> {
        if self.cache_enabled() {
            self.shared_cache.as_ref()
        } else {
            None
        }
    }

    fn cache_set(&self, key: &str, data: &[u8]) {
        if let Some(cache) = self.cache() {
            cache.set(self.index, key, data);
        }
    }

    fn cache_delete(&self, key: &str) {
        if let Some(cache) = self.cache() {
            cache.delete(self.index, key);
        }
    }

    fn read_route(&self, route: &Route) -> StoreResult<Value> {
        let value = self.load_value(&route.key)?;
        if route.is_whole() && route.filters.is_empty() {
            return Ok(value);
        }
        mutator::get_part(value, &route.branch, &route.filters).map_err(|_| {
            StoreError::Addressing(format!(
                "Can not find {} in {}.",
                route.branch_display(),
                route.key
            ))
        })
    }

    /// Current document of `key`: cache first, then the primary file.
    ///
    /// A corrupt primary, or a missing one that still has a backup, is
    /// restored from `.backup/`.
    fn load_value(&self, key: &str) -> StoreResult<Value> {
        if let Some(value) = self.cache().and_then(|c| c.get(self.index, key)) {
            return Ok(value);
        }

        let primary = self.files.primary(key);
        if !primary.exists() {
            if self.files.backup(key).exists() {
                warn!(key = %key, "primary missing; restoring from backup");
                return self.recover_key(key);
            }
            return Err(StoreError::NotFound(key.to_string()));
        }

        let data = read_file(&primary)?;
        match codec::unpack(&data) {
            Ok(value) => {
                self.cache_set(key, &data);
                Ok(value)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "corrupt primary; restoring from backup");
                self.recover_key(key)
            }
        }
    }

    /// Decode the primary of `key` straight from disk for mutation.
    ///
    /// A corrupt primary is restored, but the decode error is still returned.
    fn load_key(&self, key: &str) -> StoreResult<Value> {
        let data = read_file(&self.files.primary(key))?;
        codec::unpack(&data).inspect_err(|e| {
            warn!(key = %key, error = %e, "corrupt primary during write");
            self.recover_logged(key);
        })
    }

    /// Stored document of `key` if it can be read, for change detection.
    fn current_value(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.cache().and_then(|c| c.get(self.index, key)) {
            return Some(value);
        }
        let data = read_file(&self.files.primary(key)).ok()?;
        codec::unpack(&data).ok()
    }

    fn write_route(&self, route: &Route, part: Value, mutation: Mutation) -> StoreResult<Change> {
        let key = route.key.as_str();

        let value = if route.is_whole() {
            if let Mutation::Update = mutation {
                if self.current_value(key).as_ref() == Some(&part) {
                    return Ok(Change::Unchanged);
                }
            }
            part
        } else {
            if !self.files.primary(key).exists() {
                return Err(StoreError::NotFound(key.to_string()));
            }
            self.ensure_backup(key)?;

            let mut value = self.load_key(key)?;
            let (changed, verb) = match mutation {
                Mutation::Update => (mutator::update_part(&mut value, &route.branch, part), "Update"),
                Mutation::Insert => (mutator::insert_part(&mut value, &route.branch, part), "Insert"),
            };
            let changed =
                changed.map_err(|e| StoreError::Addressing(format!("{verb} {key} failed: {e}")))?;
            if !changed {
                return Ok(Change::Unchanged);
            }
            value
        };

        self.persist(key, &value)?;
        Ok(Change::Written)
    }

    fn delete_route(&self, route: &Route) -> StoreResult<()> {
        let key = route.key.as_str();
        let primary = self.files.primary(key);

        if !primary.exists() {
            self.cache_delete(key);
            remove_quietly(&tmp_sibling(&primary));
            if route.is_whole() {
                self.files.discard_backup(key);
                return Ok(());
            }
            self.recover_logged(key);
            return Err(StoreError::NotFound(key.to_string()));
        }

        if route.is_whole() {
            self.cache_delete(key);
            remove_quietly(&tmp_sibling(&primary));
            if let Err(e) = fs::remove_file(&primary) {
                self.recover_logged(key);
                return Err(e.into());
            }
            self.files.discard_backup(key);
            debug!(key = %key, "deleted document");
            return Ok(());
        }

        self.ensure_backup(key)?;
        let mut value = self.load_key(key)?;
        mutator::delete_part(&mut value, &route.branch)
            .map_err(|e| StoreError::Addressing(format!("Delete {key} failed: {e}")))?;
        self.persist(key, &value)
    }

    /// Write a whole document, then refresh the cache and the backup.
    fn persist(&self, key: &str, value: &Value) -> StoreResult<()> {
        let data = codec::pack(value)?;
        let primary = self.files.primary(key);
        let existed = primary.exists();

        if let Err(e) = write_file(&primary, &data, self.fsync_enabled()) {
            if existed {
                self.recover_logged(key);
            } else {
                self.files.discard_primary(key);
            }
            return Err(e);
        }

        self.cache_set(key, &data);
        if self.backup_enabled() {
            self.backup_key(key, false, None)?;
        }
        debug!(key = %key, kind = value.kind(), len = data.len(), "persisted document");
        Ok(())
    }

    /// Create the backup of `key` from its primary if the mirror lacks it.
    fn ensure_backup(&self, key: &str) -> StoreResult<()> {
        if self.backup_enabled()
            && self.files.primary(key).exists()
            && !self.files.backup(key).exists()
        {
            self.backup_key(key, true, None)?;
        }
        Ok(())
    }

    /// Copy the primary of `key` into `dest`, or into `.backup/`.
    ///
    /// With `verify`, a primary that does not decode is restored instead of
    /// being copied.
    fn backup_key(&self, key: &str, verify: bool, dest: Option<&Path>) -> StoreResult<()> {
        let primary = self.files.primary(key);
        if !primary.exists() {
            return Err(StoreError::NotFound(key.to_string()));
        }

        if verify {
            let data = read_file(&primary)?;
            if let Err(e) = codec::unpack(&data) {
                self.recover_logged(key);
                return Err(e);
            }
        }

        let target: PathBuf = match dest {
            Some(dir) => dir.join(file_name(key)),
            None => {
                self.files.create_backup_dir()?;
                self.files.backup(key)
            }
        };
        copy_file(&primary, &target, self.fsync_enabled())
    }

    /// Restore the primary of `key` from its backup and return the document.
    ///
    /// A backup that does not decode is deleted together with the primary;
    /// the key is then lost.
    fn recover_key(&self, key: &str) -> StoreResult<Value> {
        self.cache_delete(key);

        let backup = self.files.backup(key);
        if !backup.exists() {
            return Err(StoreError::NotFound(backup.display().to_string()));
        }

        let data = read_file(&backup)?;
        let value = match codec::unpack(&data) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "backup is corrupt; dropping document");
                self.files.discard_primary(key);
                self.files.discard_backup(key);
                return Err(StoreError::Recovery {
                    key: key.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        copy_file(&backup, &self.files.primary(key), self.fsync_enabled())?;
        self.cache_set(key, &data);
        warn!(key = %key, "restored document from backup");
        Ok(value)
    }

    fn recover_logged(&self, key: &str) {
        if let Err(e) = self.recover_key(key) {
            warn!(key = %key, error = %e, "recovery failed");
        }
    }

    /// Copy the document `key` from `dir` over the local one.
    fn load_from(&self, key: &str, dir: &Path) -> StoreResult<()> {
        let source = dir.join(file_name(key));
        if !source.exists() {
            return Err(StoreError::NotFound(source.display().to_string()));
        }
        let data = read_file(&source)?;
        codec::unpack(&data)?;

        self.ensure_backup(key)?;

        let primary = self.files.primary(key);
        if let Err(e) = copy_file(&source, &primary, self.fsync_enabled()) {
            let backup = self.files.backup(key);
            if backup.exists() {
                self.recover_logged(key);
            } else {
                self.files.discard_primary(key);
                remove_quietly(&tmp_sibling(&backup));
            }
            return Err(e);
        }

        self.cache_set(key, &data);
        if self.backup_enabled() {
            self.backup_key(key, false, None)?;
        }
        Ok(())
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
