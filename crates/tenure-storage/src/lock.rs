//! Advisory unit locks derived from the storage medium
//!
//! A lock is an OS advisory lock (`fs2`) on a sibling lockfile named
//! `<location>.lock`. The holder identity is written into the lockfile as
//! JSON for diagnostics only; whether a location is held is always decided by
//! the OS lock, so a crashed holder's lock disappears when its handle closes.

use crate::error::{IoOperation, LockOperation, StorageError, StorageResult};
use crate::types::Actor;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Identity of whoever holds a lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    /// Acting person or process
    pub actor: Actor,
    /// OS process id of the holder, 0 when unknown
    pub pid: u32,
    /// When the lock was taken, if recorded
    pub acquired_at: Option<DateTime<Utc>>,
}

impl LockHolder {
    /// Holder record for the current process
    pub fn current(actor: &Actor) -> Self {
        Self {
            actor: actor.clone(),
            pid: std::process::id(),
            acquired_at: Some(Utc::now()),
        }
    }

    /// Placeholder when a lock is held but its holder record is unreadable
    pub fn unknown() -> Self {
        Self {
            actor: Actor::new("unknown"),
            pid: 0,
            acquired_at: None,
        }
    }
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.acquired_at {
            Some(at) => write!(f, "{} (pid {}, since {})", self.actor, self.pid, at.to_rfc3339()),
            None => write!(f, "{} (pid {})", self.actor, self.pid),
        }
    }
}

/// Result of probing a location
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    /// Nobody holds the location
    Free,
    /// Somebody holds the location
    HeldBy(LockHolder),
}

/// Result of trying to take a lock
#[derive(Debug)]
pub enum LockOutcome {
    /// The caller now holds the lock
    Acquired(UnitLock),
    /// Someone else holds it; retry later
    HeldBy(LockHolder),
}

impl LockOutcome {
    /// Whether the lock was acquired
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired(_))
    }
}

/// Backend-specific release hook behind a [`UnitLock`]
pub trait LockHandle: Send {
    /// Release the underlying claim
    fn release(&mut self) -> StorageResult<()>;
}

/// Exclusive claim on a location, released on drop
pub struct UnitLock {
    location: PathBuf,
    holder: LockHolder,
    handle: Option<Box<dyn LockHandle>>,
}

impl UnitLock {
    /// Wrap a backend handle
    pub fn new(location: PathBuf, holder: LockHolder, handle: Box<dyn LockHandle>) -> Self {
        Self {
            location,
            holder,
            handle: Some(handle),
        }
    }

    /// Location this lock protects
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Holder recorded for this lock
    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }

    /// Release explicitly, surfacing any error
    pub fn release(mut self) -> StorageResult<()> {
        match self.handle.take() {
            Some(mut handle) => handle.release(),
            None => Ok(()),
        }
    }
}

impl Drop for UnitLock {
    fn drop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = handle.release() {
                warn!("Failed to release lock on {}: {}", self.location.display(), e);
            }
        }
    }
}

impl fmt::Debug for UnitLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitLock")
            .field("location", &self.location)
            .field("holder", &self.holder)
            .field("released", &self.handle.is_none())
            .finish()
    }
}

/// Exclusive advisory locking of unit and dataset locations
pub trait LockManager: Send + Sync {
    /// Take the lock without waiting
    fn try_acquire(&self, location: &Path, actor: &Actor) -> StorageResult<LockOutcome>;

    /// Inspect a location without taking it
    fn probe(&self, location: &Path) -> StorageResult<LockState>;

    /// Give a lock back
    fn release(&self, lock: UnitLock) -> StorageResult<()> {
        lock.release()
    }

    /// Poll [`LockManager::try_acquire`] until the lock is taken or `timeout` passes
    fn acquire_blocking(
        &self,
        location: &Path,
        actor: &Actor,
        timeout: Duration,
        poll_interval: Duration,
    ) -> StorageResult<UnitLock> {
        let deadline = Instant::now() + timeout;
        let poll_interval = poll_interval.max(Duration::from_millis(1));

        loop {
            match self.try_acquire(location, actor)? {
                LockOutcome::Acquired(lock) => return Ok(lock),
                LockOutcome::HeldBy(holder) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(StorageError::lock_timeout(
                            location.to_path_buf(),
                            holder,
                            timeout,
                        ));
                    }
                    thread::sleep(poll_interval.min(deadline - now));
                }
            }
        }
    }
}

/// Lockfile guarding a location: a sibling named `<location>.lock`
pub fn lock_path_for(location: &Path) -> PathBuf {
    let mut name = location
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("location"));
    name.push(".lock");
    location.with_file_name(name)
}

type Registry = Arc<Mutex<HashMap<PathBuf, LockHolder>>>;

/// Lock manager backed by OS file locks
#[derive(Clone, Default)]
pub struct FileLockManager {
    /// Locations held by guards issued from this manager
    held: Registry,
}

impl FileLockManager {
    /// Create a new file lock manager
    pub fn new() -> Self {
        Self::default()
    }

    fn read_holder(lock_path: &Path) -> LockHolder {
        fs::read_to_string(lock_path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_else(LockHolder::unknown)
    }

    fn write_holder(file: &mut File, lock_path: &Path, holder: &LockHolder) -> StorageResult<()> {
        let content = serde_json::to_string(holder).map_err(|e| StorageError::HolderRecord {
            lock_file: lock_path.to_path_buf(),
            message: e.to_string(),
        })?;

        file.set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| file.write_all(content.as_bytes()))
            .and_then(|_| file.sync_data())
            .map_err(|e| StorageError::io_error(lock_path.to_path_buf(), IoOperation::Write, e))
    }

    fn is_contended(err: &std::io::Error) -> bool {
        err.kind() == fs2::lock_contended_error().kind()
    }
}

impl LockManager for FileLockManager {
    fn try_acquire(&self, location: &Path, actor: &Actor) -> StorageResult<LockOutcome> {
        if let Some(holder) = self.held.lock().get(location) {
            debug!("{} already held in-process by {}", location.display(), holder);
            return Ok(LockOutcome::HeldBy(holder.clone()));
        }

        let lock_path = lock_path_for(location);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StorageError::directory_creation_failed(parent.to_path_buf(), e))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| StorageError::io_error(lock_path.clone(), IoOperation::Write, e))?;

        if let Err(e) = file.try_lock_exclusive() {
            if Self::is_contended(&e) {
                let holder = Self::read_holder(&lock_path);
                debug!("{} is held by {}", location.display(), holder);
                return Ok(LockOutcome::HeldBy(holder));
            }
            return Err(StorageError::lock_failed(lock_path, LockOperation::Acquire, e));
        }

        let holder = LockHolder::current(actor);
        self.held.lock().insert(location.to_path_buf(), holder.clone());

        if let Err(e) = Self::write_holder(&mut file, &lock_path, &holder) {
            self.held.lock().remove(location);
            let _ = FileExt::unlock(&file);
            return Err(e);
        }

        debug!("Acquired lock on {} for {}", location.display(), actor);

        let handle = FileLockHandle {
            file: Some(file),
            lock_path,
            location: location.to_path_buf(),
            held: Arc::clone(&self.held),
        };

        Ok(LockOutcome::Acquired(UnitLock::new(
            location.to_path_buf(),
            holder,
            Box::new(handle),
        )))
    }

    fn probe(&self, location: &Path) -> StorageResult<LockState> {
        if let Some(holder) = self.held.lock().get(location) {
            return Ok(LockState::HeldBy(holder.clone()));
        }

        let lock_path = lock_path_for(location);
        let file = match OpenOptions::new().read(true).write(true).open(&lock_path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LockState::Free),
            Err(e) => return Err(StorageError::io_error(lock_path, IoOperation::Read, e)),
        };

        match file.try_lock_exclusive() {
            Ok(()) => {
                FileExt::unlock(&file)
                    .map_err(|e| {
                        StorageError::lock_failed(lock_path.clone(), LockOperation::Inspect, e)
                    })?;
                Ok(LockState::Free)
            }
            Err(e) if Self::is_contended(&e) => {
                Ok(LockState::HeldBy(Self::read_holder(&lock_path)))
            }
            Err(e) => Err(StorageError::lock_failed(lock_path, LockOperation::Inspect, e)),
        }
    }
}

struct FileLockHandle {
    file: Option<File>,
    lock_path: PathBuf,
    location: PathBuf,
    held: Registry,
}

impl LockHandle for FileLockHandle {
    fn release(&mut self) -> StorageResult<()> {
        self.held.lock().remove(&self.location);

        if let Some(file) = self.file.take() {
            FileExt::unlock(&file)
                .map_err(|e| {
                    StorageError::lock_failed(self.lock_path.clone(), LockOperation::Release, e)
                })?;
            debug!("Released lock on {}", self.location.display());
        }

        Ok(())
    }
}
