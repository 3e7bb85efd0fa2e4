//! kvdb - A multi-process key-value store
//!
//! Every operation runs in its own short-lived process. The storage log on
//! disk is the source of truth; a bounded LRU cache in shared memory speeds
//! up reads; a named cross-process lock keeps the two coherent.

pub mod cache;
pub mod config;
pub mod error;
pub mod lock;
pub mod record;
pub mod storage;
pub mod store;

pub use config::Config;
pub use error::{KvError, Result};
pub use record::Record;
pub use store::{Found, Source, Store, Timestamps};
