//! Cache Module
//!
//! Remote cache store with dependency verification, and its sharded variant.

mod dependencies;
mod entry;
mod router;
mod stats;
mod store;


// Re-export public types
pub use dependencies::Dependencies;
pub use entry::{
    current_timestamp_micros, current_timestamp_ms, current_timestamp_secs, Callback, EntryMeta,
    StoredEntry, META_SEPARATOR,
};
pub use router::StorageRouter;
pub use stats::CacheStats;
pub use store::{CacheStore, ValidityCallback, DEFAULT_NAMESPACE};
