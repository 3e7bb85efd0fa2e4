//! Mutual-Exclusion Lock
//!
//! A named cross-process lock built on an exclusive `flock`. The lock file is
//! created on first use and never removed, so every process rendezvous on the
//! same inode. The kernel drops the lock when its holder exits or crashes.
//!
//! There is exactly one gate: a bounded polling acquisition of the `flock`.
//! Nothing ever inspects whether the lock file exists.
//!
//! The first eight bytes of a lock file hold a generation counter. Only the
//! lock holder advances it; anyone may read it.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt as PositionalExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{KvError, Result};

const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// Which resource a lock guards; decides how I/O failures are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guarded {
    /// The storage log
    Log,
    /// The shared cache segment
    Cache,
}

// == Process Lock ==
/// A handle on a named lock file.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    file: File,
    guarded: Guarded,
}

impl ProcessLock {
    // == Constructor ==
    /// Opens (creating if needed) the lock file at `path`.
    pub fn open(path: impl AsRef<Path>, guarded: Guarded) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| io_error(&path, guarded, e))?;
        Ok(Self::from_file(path, file, guarded))
    }

    /// Uses an already open file as the lock object.
    pub fn from_file(path: PathBuf, file: File, guarded: Guarded) -> Self {
        Self {
            path,
            file,
            guarded,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    // == Acquire ==
    /// Blocks until the lock is held or `timeout` elapses.
    ///
    /// The returned guard releases the lock when dropped.
    pub fn acquire(&self, timeout: Duration) -> Result<LockGuard<'_>> {
        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if let Some(guard) = self.try_acquire()? {
                debug!(
                    "Acquired {:?} lock {} after {:?}",
                    self.guarded,
                    self.path.display(),
                    started.elapsed()
                );
                return Ok(guard);
            }

            let waited = started.elapsed();
            if waited >= timeout {
                warn!(
                    "Gave up on {:?} lock {} after {:?}",
                    self.guarded,
                    self.path.display(),
                    waited
                );
                return Err(KvError::LockTimeout {
                    path: self.path.clone(),
                    waited,
                });
            }

            thread::sleep(backoff.min(timeout - waited));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    // == Try Acquire ==
    /// Takes the lock only if it is free right now.
    pub fn try_acquire(&self) -> Result<Option<LockGuard<'_>>> {
        match self.file.try_lock_exclusive() {
            Ok(()) => Ok(Some(LockGuard {
                lock: self,
                acquired_at: Instant::now(),
            })),
            Err(e) if is_contended(&e) => Ok(None),
            Err(e) => Err(io_error(&self.path, self.guarded, e)),
        }
    }

    // == Generation ==
    /// Reads the generation counter. A fresh lock file is at generation 0.
    pub fn generation(&self) -> Result<u64> {
        let mut bytes = [0u8; 8];
        let n = self
            .file
            .read_at(&mut bytes, 0)
            .map_err(|e| io_error(&self.path, self.guarded, e))?;
        if n < bytes.len() {
            return Ok(0);
        }
        Ok(u64::from_le_bytes(bytes))
    }
}

// == Lock Guard ==
/// Proof that the lock is held. Dropping it returns the permit.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a ProcessLock,
    acquired_at: Instant,
}

impl LockGuard<'_> {
    /// Advances the lock file's generation counter and returns the new value.
    pub fn bump_generation(&self) -> Result<u64> {
        let lock = self.lock;
        let next = lock.generation()? + 1;
        lock.file
            .write_all_at(&next.to_le_bytes(), 0)
            .map_err(|e| io_error(&lock.path, lock.guarded, e))?;
        Ok(next)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.lock.file) {
            // Closing the descriptor at exit still releases it
            warn!("Failed to unlock {}: {}", self.lock.path.display(), e);
        } else {
            debug!(
                "Released {:?} lock {} after {:?}",
                self.lock.guarded,
                self.lock.path.display(),
                self.acquired_at.elapsed()
            );
        }
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn io_error(path: &Path, guarded: Guarded, e: io::Error) -> KvError {
    match guarded {
        Guarded::Log => KvError::storage(path, e),
        Guarded::Cache => KvError::cache(path, e),
    }
}
