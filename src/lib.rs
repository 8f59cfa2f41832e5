//! Redis Cache - A client-side caching layer over Redis
//!
//! Provides lease locks, tag and priority invalidation journals, key-based
//! sharding and a verifying cache store built on top of them.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod journal;
pub mod lock;
pub mod shard;

pub use cache::{CacheStore, Dependencies, StorageRouter};
pub use client::{KvClient, MemoryClient, RedisClient};
pub use config::{CacheConfig, JournalKind};
pub use error::{CacheError, Result};
pub use journal::{CleanConditions, Journal, JournalEntry, LuaJournal, TransactionalJournal};
pub use lock::{LeaseLock, LockOptions};
pub use shard::{Shard, ShardAddr, ShardRouter};
