//! Cache strategy engine for offline reads.
//!
//! This module provides:
//! - Named, versioned partitions with independent eviction limits
//! - An ordered route table mapping requests to one of five strategies
//! - Strategy execution against SQLite-backed storage and the network
//! - Freshness computed identically on read and during the eviction sweep
//! - Quota handling that only ever purges partitions flagged as purgeable

mod freshness;
mod key;
mod layer;
mod partition;
mod routes;
mod storage;
mod traits;

pub use freshness::{declared_lifetime, is_fresh, lifetime, DEFAULT_LIFETIME_SECS};
pub use key::cache_key;
pub use layer::{EngineError, PrecacheReport, StorageAlert, StrategyEngine, SweepReport};
pub use partition::{
  parse_partition_name, partition_name, Category, Partition, PartitionLimits, PartitionSet,
};
pub use routes::{Route, RouteMatch, RouteTable};
pub use storage::{CacheStorage, EntryMeta, NoopStorage, QuotaEstimate, SqliteStorage, StorageError};
pub use traits::{CacheEntry, CacheResult, CacheSource, Strategy};
