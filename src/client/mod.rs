//! Client Module
//!
//! Typed command interface to the remote key-value store.
//!
//! Only the commands the lock, journal and store actually issue are exposed.
//! Every method is a blocking round-trip.

mod command;
mod memory;
mod remote;

use std::time::Duration;

use crate::error::TransportError;

pub use command::{score_arg, Command};
pub use memory::MemoryClient;
pub use remote::{ConnectOptions, RedisClient};

// == Transport Result ==
/// Result of a single transport call.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

// == KV Client ==
/// Commands required from a Redis-compatible store.
pub trait KvClient: Send + Sync {
    /// SETNX: stores `value` only if `key` does not exist.
    fn set_nx(&self, key: &str, value: &[u8]) -> TransportResult<bool>;

    /// GET
    fn get(&self, key: &str) -> TransportResult<Option<Vec<u8>>>;

    /// MGET: one slot per requested key, in order.
    fn mget(&self, keys: &[String]) -> TransportResult<Vec<Option<Vec<u8>>>>;

    /// GETSET: replaces the value and returns the previous one.
    fn get_set(&self, key: &str, value: &[u8]) -> TransportResult<Option<Vec<u8>>>;

    /// SET, or SET with EX when `ttl` is given.
    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> TransportResult<()>;

    /// EXPIRE; returns false when the key does not exist.
    fn expire(&self, key: &str, ttl: Duration) -> TransportResult<bool>;

    /// EXPIREAT with a unix timestamp in seconds.
    fn expire_at(&self, key: &str, unix_secs: i64) -> TransportResult<bool>;

    /// DEL; returns the number of removed keys.
    fn del(&self, keys: &[String]) -> TransportResult<u64>;

    /// SADD
    fn sadd(&self, key: &str, members: &[String]) -> TransportResult<u64>;

    /// SREM
    fn srem(&self, key: &str, members: &[String]) -> TransportResult<u64>;

    /// SMEMBERS
    fn smembers(&self, key: &str) -> TransportResult<Vec<String>>;

    /// SUNION
    fn sunion(&self, keys: &[String]) -> TransportResult<Vec<String>>;

    /// ZADD with a single member.
    fn zadd(&self, key: &str, score: f64, member: &str) -> TransportResult<u64>;

    /// ZREM
    fn zrem(&self, key: &str, members: &[String]) -> TransportResult<u64>;

    /// ZRANGEBYSCORE, inclusive bounds.
    fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> TransportResult<Vec<String>>;

    /// ZREMRANGEBYSCORE, inclusive bounds.
    fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> TransportResult<u64>;

    /// KEYS; only used for full-namespace wipes.
    fn keys(&self, pattern: &str) -> TransportResult<Vec<String>>;

    /// Runs the batch inside MULTI/EXEC.
    fn transaction(&self, commands: &[Command]) -> TransportResult<()>;

    /// EVALSHA, loading the script first when the server does not know it.
    fn eval_script(
        &self,
        script: &LuaScript,
        keys: &[String],
        args: &[String],
    ) -> TransportResult<ScriptReply>;
}

// == Lua Script ==
/// Server-side script identified by a stable name.
///
/// Clients cache the compiled form by `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LuaScript {
    pub name: &'static str,
    pub source: String,
}

impl LuaScript {
    /// Creates a script, trimming surrounding whitespace so the digest is stable.
    pub fn new(name: &'static str, source: impl AsRef<str>) -> Self {
        Self {
            name,
            source: source.as_ref().trim().to_string(),
        }
    }
}

// == Script Reply ==
/// Decoded reply of a script execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptReply {
    Nil,
    Integer(i64),
    Status(String),
    List(Vec<String>),
}

impl std::fmt::Display for ScriptReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptReply::Nil => write!(f, "nil"),
            ScriptReply::Integer(n) => write!(f, "(integer) {}", n),
            ScriptReply::Status(s) => write!(f, "{}", s),
            ScriptReply::List(items) => write!(f, "list of {} items", items.len()),
        }
    }
}
