//! Shared Cache Module
//!
//! Attaches to the cache segment: a file at a well-known path, mapped
//! `MAP_SHARED` into every process, guarded by an exclusive `flock` on the
//! same file. Attaching never destroys anything; [`SharedCache::reset`] is
//! the only way to discard entries wholesale.

use std::fs::OpenOptions;
use std::path::Path;
use std::time::Duration;

use memmap2::MmapMut;
use tracing::{debug, info, warn};

use crate::cache::segment::{segment_size, Segment, HEADER_SIZE};
use crate::cache::CacheStats;
use crate::error::{KvError, Result};
use crate::lock::{Guarded, ProcessLock};
use crate::record::Record;

// == Shared Cache ==
/// Handle on the attached segment and its exclusion primitive.
#[derive(Debug)]
pub struct SharedCache {
    lock: ProcessLock,
    map: MmapMut,
    capacity: usize,
    timeout: Duration,
    /// Newest invalidation generation this handle has been told about
    generation: u64,
}

impl SharedCache {
    // == Attach ==
    /// Opens or creates the segment at `path`.
    ///
    /// A fresh segment is formatted for `capacity` entries. An existing one
    /// keeps the capacity it was created with, so all processes agree on
    /// the layout.
    pub fn attach(path: impl AsRef<Path>, capacity: usize, timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| KvError::cache(path, e))?;
        let lock = ProcessLock::from_file(path.to_path_buf(), file, Guarded::Cache);

        let (map, capacity) = {
            let _guard = lock.acquire(timeout)?;
            prepare(&lock, capacity)?
        };
        debug!(
            "Attached cache segment {} with capacity {}",
            path.display(),
            capacity
        );

        Ok(Self {
            lock,
            map,
            capacity,
            timeout,
            generation: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn path(&self) -> &Path {
        self.lock.path()
    }

    // == Invalidation ==
    /// Records the current invalidation generation of the log.
    ///
    /// The next locked access clears the segment if its entries were cached
    /// under an older generation. Generations only move forward; an older
    /// value read by a slow process is ignored.
    pub fn observe_generation(&mut self, generation: u64) {
        self.generation = self.generation.max(generation);
    }

    // == Lookup ==
    /// Returns a copy of the cached record and marks it most recent.
    pub fn lookup(&mut self, key: &str) -> Result<Option<Record>> {
        let found = self.with_segment(|segment| segment.lookup(key))?;
        debug!(
            "Cache {} for '{}'",
            if found.is_some() { "hit" } else { "miss" },
            key
        );
        Ok(found)
    }

    // == Touch Or Insert ==
    /// Mirrors `record` into the cache as the most recent entry.
    pub fn touch_or_insert(&mut self, record: &Record) -> Result<()> {
        let evicted = self.with_segment(|segment| segment.touch_or_insert(record))?;
        if let Some(key) = evicted {
            debug!("Cache evicted '{}' to make room for '{}'", key, record.key);
        }
        Ok(())
    }

    // == Remove ==
    /// Drops the cached entry for `key`. Returns whether one existed.
    pub fn remove(&mut self, key: &str) -> Result<bool> {
        self.with_segment(|segment| segment.remove(key))
    }

    // == Stats ==
    pub fn stats(&mut self) -> Result<CacheStats> {
        self.with_segment(|segment| segment.stats())
    }

    /// Keys from most to least recently used.
    pub fn keys_by_recency(&mut self) -> Result<Vec<String>> {
        self.with_segment(|segment| segment.keys_by_recency())
    }

    // == Reset ==
    /// Discards every entry and counter in place.
    ///
    /// Other attached processes keep a valid mapping; they simply see an
    /// empty cache afterwards.
    pub fn reset(&mut self) -> Result<()> {
        self.with_segment(|segment| segment.clear())?;
        info!("Cache segment {} reset", self.lock.path().display());
        Ok(())
    }

    /// Runs `f` on the segment while holding its lock.
    ///
    /// The dirty flag brackets `f`; a segment left dirty by a crashed
    /// process is wiped before use, as is one behind the observed
    /// invalidation generation.
    fn with_segment<T>(&mut self, f: impl FnOnce(&mut Segment<'_>) -> T) -> Result<T> {
        let _guard = self.lock.acquire(self.timeout)?;

        let valid = Segment::stored_capacity(&self.map) == Some(self.capacity);
        let segment = if valid {
            Segment::open(&mut self.map[..])
        } else {
            warn!(
                "Cache segment {} header is invalid, reformatting",
                self.lock.path().display()
            );
            Segment::format(&mut self.map[..], self.capacity)
        };
        let mut segment =
            segment.ok_or_else(|| KvError::cache(self.lock.path(), "segment is too small"))?;

        if segment.is_dirty() {
            warn!("Cache segment was left mid-update, clearing it");
            segment.clear();
        }
        if segment.generation() < self.generation {
            info!(
                "Cache segment is at generation {}, log is at {}, clearing it",
                segment.generation(),
                self.generation
            );
            segment.clear();
            segment.set_generation(self.generation);
        }
        segment.set_dirty(true);
        let out = f(&mut segment);
        segment.set_dirty(false);
        Ok(out)
    }
}

/// Sizes, maps and if needed formats the segment. Caller holds the lock.
fn prepare(lock: &ProcessLock, wanted: usize) -> Result<(MmapMut, usize)> {
    let path = lock.path();
    let file = lock.file();
    let len = file.metadata().map_err(|e| KvError::cache(path, e))?.len();

    let existing = if len >= HEADER_SIZE as u64 {
        let map = map_file(lock)?;
        Segment::stored_capacity(&map)
    } else {
        None
    };

    let capacity = match existing {
        Some(stored) => {
            if stored != wanted {
                warn!(
                    "Cache segment {} has capacity {}, ignoring configured {}",
                    path.display(),
                    stored,
                    wanted
                );
            }
            stored
        }
        None => {
            let needed = segment_size(wanted) as u64;
            // Only ever grow: other processes may still map the old length
            if len < needed {
                file.set_len(needed).map_err(|e| KvError::cache(path, e))?;
            }
            wanted
        }
    };

    let mut map = map_file(lock)?;
    if existing.is_none() {
        Segment::format(&mut map[..], capacity)
            .ok_or_else(|| KvError::cache(path, "cannot format segment"))?;
        info!(
            "Initialized cache segment {} for {} entries",
            path.display(),
            capacity
        );
    }
    Ok((map, capacity))
}

fn map_file(lock: &ProcessLock) -> Result<MmapMut> {
    // SAFETY: the segment file is never truncated, and its contents are only
    // read or written while holding the segment's flock.
    unsafe { MmapMut::map_mut(lock.file()) }.map_err(|e| KvError::cache(lock.path(), e))
}
