//! Crash-safe catalog persistence.
//!
//! Writes go to a temp file in the catalog's directory which is flushed,
//! fsynced and renamed over the target, so readers see either the old or the
//! new catalog and never a torn one. Mutations hold an exclusive `flock` on a
//! sidecar `<catalog>.lock` for the whole read-modify-write cycle.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use chrono::Utc;
use fs4::FileExt;
use log::{debug, warn};
use tempfile::NamedTempFile;

use crate::catalog::Catalog;
use crate::error::{CatalogError, Result};

/// What to do when the catalog file exists but cannot be parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPolicy {
    /// Refuse: the caller must not act on a catalog it cannot read
    Strict,
    /// Set the unreadable file aside and continue from an empty catalog
    Lenient,
}

/// Held exclusive lock; released when dropped
#[derive(Debug)]
pub struct CatalogLock {
    _file: File,
    path: PathBuf,
}

impl Drop for CatalogLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the flock
        debug!("Released catalog lock {}", self.path.display());
    }
}

#[derive(Debug, Clone)]
pub struct CatalogStore {
    path: PathBuf,
    lock_timeout: Duration,
    lock_poll: Duration,
}

impl CatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: Duration::from_secs(10),
            lock_poll: Duration::from_millis(100),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_lock_poll(mut self, poll: Duration) -> Self {
        self.lock_poll = poll.max(Duration::from_millis(1));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sidecar lock file: the catalog path with `.lock` appended
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        }
    }

    /// Read the catalog. A missing file is an empty catalog under every policy.
    pub fn load(&self, policy: LoadPolicy) -> Result<Catalog> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Catalog {} does not exist yet, starting empty", self.path.display());
                return Ok(Catalog::default());
            }
            Err(e) => return Err(CatalogError::io(format!("Failed to read catalog {}", self.path.display()), e)),
        };

        match serde_json::from_slice::<Catalog>(&raw) {
            Ok(catalog) => Ok(catalog),
            Err(source) => match policy {
                LoadPolicy::Strict => Err(CatalogError::Corrupt { path: self.path.clone(), source }),
                LoadPolicy::Lenient => {
                    warn!("Catalog {} is corrupt ({}), continuing from an empty catalog", self.path.display(), source);
                    self.set_aside(&raw);
                    Ok(Catalog::default())
                }
            },
        }
    }

    /// Keep a copy of unreadable catalog bytes for manual recovery
    fn set_aside(&self, raw: &[u8]) {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ")));
        let backup = PathBuf::from(name);
        match fs::write(&backup, raw) {
            Ok(()) => warn!("Saved corrupt catalog bytes to {}", backup.display()),
            Err(e) => warn!("Failed to save corrupt catalog bytes to {}: {}", backup.display(), e),
        }
    }

    /// Atomically replace the catalog file with `catalog`.
    ///
    /// History ring buffers are trimmed to their caps as part of every write.
    pub fn write(&self, catalog: &mut Catalog) -> Result<()> {
        catalog.enforce_history_bounds();
        let bytes = serde_json::to_vec_pretty(catalog)?;

        let dir = self.parent_dir();
        fs::create_dir_all(dir).map_err(|e| CatalogError::io(format!("Failed to create {}", dir.display()), e))?;

        let mut tmp = NamedTempFile::new_in(dir)
            .map_err(|e| CatalogError::io(format!("Failed to create temp file in {}", dir.display()), e))?;
        let written = (|| -> std::io::Result<()> {
            tmp.write_all(&bytes)?;
            tmp.write_all(b"\n")?;
            tmp.flush()?;
            tmp.as_file().sync_all()
        })();
        written.map_err(|e| CatalogError::io(format!("Failed to write temp catalog {}", tmp.path().display()), e))?;
        tmp.persist(&self.path)
            .map_err(|e| CatalogError::io(format!("Failed to rename temp catalog over {}", self.path.display()), e.error))?;

        sync_dir(dir);
        debug!("Wrote catalog {} ({} items)", self.path.display(), catalog.items.len());
        Ok(())
    }

    fn open_lock_file(&self) -> Result<(File, PathBuf)> {
        let path = self.lock_path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| CatalogError::io(format!("Failed to create lock directory {}", parent.display()), e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| CatalogError::io(format!("Failed to open lock file {}", path.display()), e))?;
        Ok((file, path))
    }

    /// One non-blocking attempt. `Ok(Err(file))` hands the file back while
    /// another holder has the lock.
    fn try_acquire(file: File, path: PathBuf, started: Instant) -> Result<std::result::Result<CatalogLock, (File, PathBuf)>> {
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("Acquired catalog lock {} after {:?}", path.display(), started.elapsed());
                Ok(Ok(CatalogLock { _file: file, path }))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Err((file, path))),
            Err(e) => Err(CatalogError::io(format!("Failed to lock {}", path.display()), e)),
        }
    }

    /// Acquire the exclusive advisory lock, polling until the timeout.
    ///
    /// Blocks the calling thread between attempts; async code uses
    /// [`CatalogStore::lock_async`].
    pub fn lock(&self) -> Result<CatalogLock> {
        let (mut file, mut path) = self.open_lock_file()?;
        let started = Instant::now();
        loop {
            match Self::try_acquire(file, path, started)? {
                Ok(lock) => return Ok(lock),
                Err(held) => (file, path) = held,
            }
            if started.elapsed() >= self.lock_timeout {
                return Err(CatalogError::LockTimeout { path, waited: started.elapsed() });
            }
            std::thread::sleep(self.lock_poll);
        }
    }

    /// [`CatalogStore::lock`] for async callers: waits on the tokio timer
    pub async fn lock_async(&self) -> Result<CatalogLock> {
        let (mut file, mut path) = self.open_lock_file()?;
        let started = Instant::now();
        loop {
            match Self::try_acquire(file, path, started)? {
                Ok(lock) => return Ok(lock),
                Err(held) => (file, path) = held,
            }
            if started.elapsed() >= self.lock_timeout {
                return Err(CatalogError::LockTimeout { path, waited: started.elapsed() });
            }
            tokio::time::sleep(self.lock_poll).await;
        }
    }

    /// Locked read-modify-write. `f` sees the current catalog; the result is
    /// written only when `f` succeeds.
    pub fn update<T>(&self, policy: LoadPolicy, f: impl FnOnce(&mut Catalog) -> Result<T>) -> Result<T> {
        let _lock = self.lock()?;
        self.modify(policy, f)
    }

    /// [`CatalogStore::update`] taking the lock with [`CatalogStore::lock_async`]
    pub async fn update_async<T>(&self, policy: LoadPolicy, f: impl FnOnce(&mut Catalog) -> Result<T>) -> Result<T> {
        let _lock = self.lock_async().await?;
        self.modify(policy, f)
    }

    /// Read-modify-write for a caller that already holds the lock
    pub fn modify<T>(&self, policy: LoadPolicy, f: impl FnOnce(&mut Catalog) -> Result<T>) -> Result<T> {
        let mut catalog = self.load(policy)?;
        let out = f(&mut catalog)?;
        self.write(&mut catalog)?;
        Ok(out)
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!("Directory fsync failed for {}: {}", dir.display(), e);
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
