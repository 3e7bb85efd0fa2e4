//! Operation Orchestrator
//!
//! Composes the log lock, the storage log and the shared cache into the four
//! store operations. Each call runs `Idle -> LockWait -> CriticalSection ->
//! Done`; the critical section touches the log first and the cache second.
//!
//! Lock order is always log lock then cache lock. The cache lock is only
//! held inside a single cache call, never while waiting for the log lock.
//!
//! If the cache cannot be updated after a log write has committed, the log
//! lock file's generation is advanced. Every cache user compares it with the
//! segment's own generation and clears a segment that is behind, so no
//! stale entry outlives the failure.

use std::fs;

use chrono::NaiveDateTime;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheStats, SharedCache};
use crate::config::Config;
use crate::error::{KvError, Result};
use crate::lock::{Guarded, LockGuard, ProcessLock};
use crate::record::{self, validate_key, validate_value, Record};
use crate::storage::StorageLog;

// == Read Results ==
/// Where a read was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Cache,
    Log,
}

/// A read result tagged with its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Found<T> {
    pub value: T,
    pub source: Source,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamps {
    pub first_set: NaiveDateTime,
    pub last_set: NaiveDateTime,
}

// == Store ==
/// An open store: the log, its lock and the attached cache segment.
#[derive(Debug)]
pub struct Store {
    config: Config,
    log: StorageLog,
    lock: ProcessLock,
    cache: SharedCache,
}

impl Store {
    // == Open ==
    /// Opens the store described by `config`, creating the data directory,
    /// the lock file and the cache segment as needed.
    pub fn open(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)
            .map_err(|e| KvError::storage(&config.data_dir, e))?;
        let log = StorageLog::new(config.log_path());
        let lock = ProcessLock::open(config.lock_path(), Guarded::Log)?;
        let cache = SharedCache::attach(
            config.cache_path(),
            config.cache_capacity,
            config.lock_timeout,
        )?;
        debug!(
            "Opened store {} with cache segment {}",
            log.path().display(),
            cache.path().display()
        );

        Ok(Self {
            config,
            log,
            lock,
            cache,
        })
    }

    // == Set ==
    /// Writes `value` under `key`. Every set reaches the log.
    pub fn set(&mut self, key: &str, value: &str) -> Result<Record> {
        validate_key(key)?;
        validate_value(value)?;

        let guard = self.lock.acquire(self.config.lock_timeout)?;
        observe_generation(&self.lock, &mut self.cache)?;
        let record = self.log.upsert(key, value, record::now())?;
        if let Err(e) = self.cache.touch_or_insert(&record) {
            invalidate_cache(&guard, &mut self.cache);
            return Err(e);
        }

        info!("Set '{}' (first set {})", key, record.first_set);
        Ok(record)
    }

    // == Get ==
    pub fn get(&mut self, key: &str) -> Result<Found<String>> {
        let Found { value, source } = self.read(key)?;
        Ok(Found {
            value: value.value,
            source,
        })
    }

    // == Timestamps ==
    pub fn timestamps(&mut self, key: &str) -> Result<Found<Timestamps>> {
        let Found { value, source } = self.read(key)?;
        Ok(Found {
            value: Timestamps {
                first_set: value.first_set,
                last_set: value.last_set,
            },
            source,
        })
    }

    // == Delete ==
    /// Removes `key` from the log, then from the cache.
    ///
    /// The cache entry is only dropped once the rewritten log is in place.
    /// If it cannot be dropped the whole cache is invalidated instead.
    /// Returns whether the log held the key.
    pub fn delete(&mut self, key: &str) -> Result<bool> {
        validate_key(key)?;

        let guard = self.lock.acquire(self.config.lock_timeout)?;
        observe_generation(&self.lock, &mut self.cache)?;
        let removed = self.log.delete(key)?;
        if let Err(e) = self.cache.remove(key) {
            invalidate_cache(&guard, &mut self.cache);
            return Err(e);
        }

        if removed {
            info!("Deleted '{}'", key);
        } else {
            debug!("Delete of missing key '{}'", key);
        }
        Ok(removed)
    }

    // == Admin ==
    pub fn cache_stats(&mut self) -> Result<CacheStats> {
        observe_generation(&self.lock, &mut self.cache)?;
        self.cache.stats()
    }

    /// Empties the shared cache. The log is untouched.
    pub fn reset_cache(&mut self) -> Result<()> {
        observe_generation(&self.lock, &mut self.cache)?;
        self.cache.reset()
    }

    /// Every record in the log, read under the log lock.
    pub fn dump(&self) -> Result<Vec<Record>> {
        let _guard = self.lock.acquire(self.config.lock_timeout)?;
        self.log.records()
    }

    // == Read Path ==
    /// Cache first without the log lock; on a miss, scan the log under the
    /// lock and populate the cache before releasing it.
    fn read(&mut self, key: &str) -> Result<Found<Record>> {
        validate_key(key)?;

        observe_generation(&self.lock, &mut self.cache)?;
        if let Some(record) = self.cache.lookup(key)? {
            return Ok(Found {
                value: record,
                source: Source::Cache,
            });
        }

        let _guard = self.lock.acquire(self.config.lock_timeout)?;
        observe_generation(&self.lock, &mut self.cache)?;
        match self.log.scan_for(key)? {
            Some(record) => {
                self.cache.touch_or_insert(&record)?;
                Ok(Found {
                    value: record,
                    source: Source::Log,
                })
            }
            None => Err(KvError::KeyNotFound(key.to_string())),
        }
    }
}

// == Cache Invalidation ==
fn observe_generation(lock: &ProcessLock, cache: &mut SharedCache) -> Result<()> {
    cache.observe_generation(lock.generation()?);
    Ok(())
}

/// Called with the log lock held after a committed log write whose cache
/// update failed.
fn invalidate_cache(guard: &LockGuard<'_>, cache: &mut SharedCache) {
    match guard.bump_generation() {
        Ok(generation) => {
            warn!("Cache update failed, invalidated cache at generation {}", generation);
            cache.observe_generation(generation);
        }
        Err(e) => error!("Cache update failed and cannot invalidate cache: {}", e),
    }
}
