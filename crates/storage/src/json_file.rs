//! Lock-guarded JSON state files.
//!
//! Several independently started processes may share the same data directory,
//! so every read-modify-write runs under an exclusive advisory lock on a
//! sibling `.lock` file, and the data file is replaced by writing a temp file,
//! syncing it and renaming it over the original.

use remixctl_core::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct LockedJsonFile<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> LockedJsonFile<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current value. Missing or empty files read as `T::default()`.
    pub fn read(&self) -> Result<T> {
        let _lock = FileLock::acquire(&self.path)?;
        self.load_unlocked()
    }

    /// Run `f` against the stored value as one critical section.
    ///
    /// The file is rewritten only when `f` actually changed the value, so a
    /// pure read through `update` never touches the disk.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let _lock = FileLock::acquire(&self.path)?;
        let mut value = self.load_unlocked()?;
        let before = serde_json::to_value(&value)?;

        let out = f(&mut value);

        if serde_json::to_value(&value)? != before {
            self.store_unlocked(&value)?;
        }
        Ok(out)
    }

    /// Replace the stored value unconditionally.
    pub fn write(&self, value: &T) -> Result<()> {
        let _lock = FileLock::acquire(&self.path)?;
        self.store_unlocked(value)
    }

    /// Delete the data file. Returns whether anything was removed.
    pub fn remove(&self) -> Result<bool> {
        let _lock = FileLock::acquire(&self.path)?;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn load_unlocked(&self) -> Result<T> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(T::default());
        }
        serde_json::from_str(&content).map_err(|e| {
            Error::Storage(format!(
                "unreadable state file {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn store_unlocked(&self, value: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(value)?;
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(content.as_bytes())?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            Error::Storage(format!(
                "atomic rename to {} failed: {}",
                self.path.display(),
                e
            ))
        })?;
        debug!(path = %self.path.display(), "State file written");
        Ok(())
    }
}

/// Exclusive advisory lock held for the lifetime of the guard.
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path) -> Result<Self> {
        let lock_path = path.with_extension("lock");
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        fs2::FileExt::lock_exclusive(&file).map_err(|e| {
            Error::Lock(format!("failed to lock {}: {}", lock_path.display(), e))
        })?;

        Ok(FileLock { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
