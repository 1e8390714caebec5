//! Byte-level document file I/O.
//!
//! A depot directory holds one `{key}.blob` file per document and, when
//! backups are enabled, a mirror of each under `.backup/`. Copies over an
//! existing destination go through a `.blob.tmp` sibling and a rename, so the
//! destination is never left half-written by a copy.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::codec::{file_name, EXTENSION, TMP_EXTENSION};
use crate::error::{StoreError, StoreResult};

/// Name of the backup subdirectory inside a depot.
pub const BACKUP_DIR: &str = ".backup";

/// Read a whole file.
pub fn read_file(path: &Path) -> StoreResult<Vec<u8>> {
    Ok(fs::read(path)?)
}

/// Replace the contents of `path` with `data`.
///
/// With `fsync`, data and metadata are flushed before returning. A file whose
/// size differs from `data.len()` afterwards is reported as
/// [`StoreError::NoSpace`].
pub fn write_file(path: &Path, data: &[u8], fsync: bool) -> StoreResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(data)?;
    file.set_len(data.len() as u64)?;

    if fsync {
        file.sync_data()?;
        file.sync_all()?;
    }
    drop(file);

    if fs::metadata(path)?.len() != data.len() as u64 {
        return Err(StoreError::NoSpace);
    }

    debug!(path = %path.display(), len = data.len(), "wrote file");
    Ok(())
}

/// Copy `src` to `dst` without ever exposing a partially written `dst`.
pub fn copy_file(src: &Path, dst: &Path, fsync: bool) -> StoreResult<()> {
    let data = read_file(src)?;

    if dst.exists() {
        let tmp = tmp_sibling(dst);
        if let Err(e) = write_file(&tmp, &data, fsync) {
            remove_quietly(&tmp);
            return Err(e);
        }
        if let Err(e) = fs::rename(&tmp, dst) {
            warn!(dst = %dst.display(), error = %e, "rename over destination failed; writing in place");
            remove_quietly(&tmp);
            write_file(dst, &data, fsync)?;
        }
    } else {
        if let Err(e) = write_file(dst, &data, fsync) {
            remove_quietly(dst);
            return Err(e);
        }
        copy_ownership(src, dst);
    }

    Ok(())
}

/// Best-effort copy of permission bits and owner from `src` to `dst`.
fn copy_ownership(src: &Path, dst: &Path) {
    let Ok(meta) = fs::metadata(src) else {
        return;
    };
    if let Err(e) = fs::set_permissions(dst, meta.permissions()) {
        debug!(dst = %dst.display(), error = %e, "could not copy permissions");
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let Err(e) = std::os::unix::fs::chown(dst, Some(meta.uid()), Some(meta.gid())) {
            debug!(dst = %dst.display(), error = %e, "could not copy ownership");
        }
    }
}

/// The `.blob.tmp` sibling of a document file.
pub fn tmp_sibling(path: &Path) -> PathBuf {
    path.with_extension(TMP_EXTENSION)
}

/// Remove a file, ignoring a missing one. Other failures are only logged.
pub fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => debug!(path = %path.display(), error = %e, "could not remove file"),
    }
}

/// Keys of every document file directly inside `dir`, sorted.
pub fn list_keys(dir: &Path) -> StoreResult<Vec<String>> {
    let suffix = format!(".{EXTENSION}");
    let mut keys = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(key) = name.strip_suffix(&suffix) {
            if !key.is_empty() {
                keys.push(key.to_string());
            }
        }
    }
    keys.sort();
    Ok(keys)
}

/// Remove every `.blob` and `.blob.tmp` file directly inside `dir`.
pub fn remove_documents(dir: &Path) -> StoreResult<()> {
    let blob = format!(".{EXTENSION}");
    let tmp = format!(".{TMP_EXTENSION}");
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_document = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(&blob) || n.ends_with(&tmp));
        if is_document && path.is_file() {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// File layout of one depot directory.
#[derive(Clone, Debug)]
pub struct FileStore {
    root: PathBuf,
    backup_dir: PathBuf,
}

impl FileStore {
    /// Bind to an existing directory.
    pub fn open(root: &Path) -> StoreResult<Self> {
        if !root.is_dir() {
            return Err(StoreError::Domain(format!(
                "path {} doesn't exist.",
                root.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
            backup_dir: root.join(BACKUP_DIR),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Primary file of `key`.
    pub fn primary(&self, key: &str) -> PathBuf {
        self.root.join(file_name(key))
    }

    /// Backup mirror of `key`.
    pub fn backup(&self, key: &str) -> PathBuf {
        self.backup_dir.join(file_name(key))
    }

    pub fn has_backup_dir(&self) -> bool {
        self.backup_dir.is_dir()
    }

    /// Create `.backup/`. Returns `true` if it did not exist before.
    pub fn create_backup_dir(&self) -> StoreResult<bool> {
        if self.has_backup_dir() {
            return Ok(false);
        }
        fs::create_dir_all(&self.backup_dir)?;
        Ok(true)
    }

    /// Delete `.backup/` and everything in it.
    pub fn remove_backup_dir(&self) -> StoreResult<()> {
        match fs::remove_dir_all(&self.backup_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Keys with a primary file.
    pub fn keys(&self) -> StoreResult<Vec<String>> {
        list_keys(&self.root)
    }

    /// Keys with a backup file.
    pub fn backup_keys(&self) -> StoreResult<Vec<String>> {
        if !self.has_backup_dir() {
            return Ok(Vec::new());
        }
        list_keys(&self.backup_dir)
    }

    /// Remove the primary of `key` along with its tmp sibling.
    pub fn discard_primary(&self, key: &str) {
        let primary = self.primary(key);
        remove_quietly(&tmp_sibling(&primary));
        remove_quietly(&primary);
    }

    /// Remove the backup of `key` along with its tmp sibling.
    pub fn discard_backup(&self, key: &str) {
        let backup = self.backup(key);
        remove_quietly(&tmp_sibling(&backup));
        remove_quietly(&backup);
    }
}
