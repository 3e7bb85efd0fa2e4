//! Configuration Module
//!
//! Handles loading store configuration from environment variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

// == Well-known names ==
/// Storage log file name inside the data directory
pub const LOG_FILE_NAME: &str = "kvdb.dat";

/// Lock file name inside the data directory
pub const LOCK_FILE_NAME: &str = "kvdb.lock";

/// Shared cache segment name prefix inside the cache directory. The full
/// name carries a hash of the data directory, so every log gets its own
/// segment even when they share a cache directory.
pub const CACHE_FILE_PREFIX: &str = "kvdb_cache";

/// Store configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the storage log and its lock file
    pub data_dir: PathBuf,
    /// Directory holding the shared cache segment
    pub cache_dir: PathBuf,
    /// Maximum number of entries in the shared cache
    pub cache_capacity: usize,
    /// Upper bound on any lock acquisition
    pub lock_timeout: Duration,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `KVDB_DATA_DIR` - Log directory (default: current directory)
    /// - `KVDB_CACHE_DIR` - Segment directory (default: `/dev/shm` or temp dir)
    /// - `KVDB_CACHE_CAPACITY` - Cache entries (default: 1000)
    /// - `KVDB_LOCK_TIMEOUT_MS` - Lock wait bound in milliseconds (default: 5000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: env::var_os("KVDB_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            cache_dir: env::var_os("KVDB_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            cache_capacity: env::var("KVDB_CACHE_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&c| c > 0)
                .unwrap_or(defaults.cache_capacity),
            lock_timeout: env::var("KVDB_LOCK_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
        }
    }

    /// Uses one directory for both the log and the cache segment.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        Self {
            data_dir: dir.clone(),
            cache_dir: dir,
            ..Self::default()
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(LOG_FILE_NAME)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join(LOCK_FILE_NAME)
    }

    /// Segment path for this data directory: `kvdb_cache-<crc32>.shm`.
    ///
    /// The hash is taken over the canonical data directory, so `.` and its
    /// absolute spelling name the same segment once the directory exists.
    pub fn cache_path(&self) -> PathBuf {
        let data_dir = fs::canonicalize(&self.data_dir).unwrap_or_else(|_| {
            env::current_dir()
                .map(|cwd| cwd.join(&self.data_dir))
                .unwrap_or_else(|_| self.data_dir.clone())
        });
        let id = crc32fast::hash(data_dir.to_string_lossy().as_bytes());
        self.cache_dir
            .join(format!("{}-{:08x}.shm", CACHE_FILE_PREFIX, id))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            cache_dir: default_cache_dir(),
            cache_capacity: crate::cache::DEFAULT_CAPACITY,
            lock_timeout: Duration::from_millis(5000),
        }
    }
}

/// Prefers tmpfs so the segment never touches disk.
fn default_cache_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        env::temp_dir()
    }
}
