//! Configuration Module
//!
//! Handles loading the cache configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::DEFAULT_NAMESPACE as DEFAULT_STORAGE_NAMESPACE;
use crate::error::ConfigError;
use crate::journal::DEFAULT_NAMESPACE as DEFAULT_JOURNAL_NAMESPACE;
use crate::lock::LockOptions;
use crate::shard::ShardAddr;

// == Journal Kind ==
/// Which journal implementation backs tags and priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalKind {
    /// Server-side scripts, needs Redis 2.6.0+
    Lua,
    /// MULTI/EXEC blocks
    Transactional,
    /// No journal; tags and priorities are rejected
    None,
}

impl FromStr for JournalKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lua" => Ok(JournalKind::Lua),
            "transactional" => Ok(JournalKind::Transactional),
            "none" => Ok(JournalKind::None),
            _ => Err(ConfigError::InvalidJournal(s.to_string())),
        }
    }
}

/// Cache configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Data-holding shards
    pub shards: Vec<ShardAddr>,
    /// Invalidation-only shards
    pub remote_shards: Vec<ShardAddr>,
    pub database: i64,
    pub password: Option<String>,
    /// Connect and command timeout
    pub timeout: Duration,
    pub lock_duration: Duration,
    pub acquire_timeout: Option<Duration>,
    pub lock_attempts: u32,
    /// Whether `lock`/`unlock` take leases
    pub locking: bool,
    pub journal: JournalKind,
    pub storage_namespace: String,
    pub journal_namespace: String,
}

impl CacheConfig {
    /// Creates a new CacheConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `REDIS_SHARDS` - Comma separated `host:port` list (default: 127.0.0.1:6379)
    /// - `REDIS_REMOTE_SHARDS` - Invalidation-only shards (default: none)
    /// - `REDIS_DATABASE` - Database index (default: 0)
    /// - `REDIS_PASSWORD` - Password (default: none)
    /// - `REDIS_TIMEOUT` - Timeout in seconds (default: 10)
    /// - `LOCK_DURATION` - Lease length in seconds (default: 15)
    /// - `LOCK_ACQUIRE_TIMEOUT` - Max wait in seconds (default: unlimited)
    /// - `LOCK_ATTEMPTS` - Takeover attempts (default: 10)
    /// - `CACHE_LOCKING` - `true`/`false` (default: true)
    /// - `CACHE_JOURNAL` - `lua`, `transactional` or `none` (default: lua)
    ///
    /// Unparseable numbers fall back to their defaults; unparseable shard
    /// addresses and journal kinds are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parsed = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());

        let shards = match lookup("REDIS_SHARDS") {
            Some(list) => parse_shards(&list)?,
            None => defaults.shards,
        };
        let remote_shards = match lookup("REDIS_REMOTE_SHARDS") {
            Some(list) => parse_shards(&list)?,
            None => defaults.remote_shards,
        };
        let journal = match lookup("CACHE_JOURNAL") {
            Some(kind) => kind.parse()?,
            None => defaults.journal,
        };

        Ok(Self {
            shards,
            remote_shards,
            database: lookup("REDIS_DATABASE")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.database),
            password: lookup("REDIS_PASSWORD").filter(|v| !v.is_empty()),
            timeout: parsed("REDIS_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            lock_duration: parsed("LOCK_DURATION")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_duration),
            acquire_timeout: parsed("LOCK_ACQUIRE_TIMEOUT").map(Duration::from_secs),
            lock_attempts: lookup("LOCK_ATTEMPTS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.lock_attempts),
            locking: lookup("CACHE_LOCKING")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.locking),
            journal,
            storage_namespace: defaults.storage_namespace,
            journal_namespace: defaults.journal_namespace,
        })
    }

    /// Lease options derived from the lock settings.
    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            duration: self.lock_duration,
            acquire_timeout: self.acquire_timeout,
            attempts: self.lock_attempts,
            ..LockOptions::default()
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        let lock = LockOptions::default();
        Self {
            shards: vec![ShardAddr::default()],
            remote_shards: Vec::new(),
            database: 0,
            password: None,
            timeout: Duration::from_secs(10),
            lock_duration: lock.duration,
            acquire_timeout: lock.acquire_timeout,
            lock_attempts: lock.attempts,
            locking: true,
            journal: JournalKind::Lua,
            storage_namespace: DEFAULT_STORAGE_NAMESPACE.to_string(),
            journal_namespace: DEFAULT_JOURNAL_NAMESPACE.to_string(),
        }
    }
}

fn parse_shards(list: &str) -> Result<Vec<ShardAddr>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}
