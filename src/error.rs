//! Error types for the cache layer
//!
//! Provides the error taxonomy shared by the transport, lock, journal and store.

use std::time::Duration;

use thiserror::Error;

// == Transport Error ==
/// Failures reported by a [`KvClient`](crate::client::KvClient).
///
/// Never retried internally; callers decide whether a retry makes sense.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection could not be established
    #[error("Cannot connect to {shard}: {message}")]
    Connect { shard: String, message: String },

    /// Command did not complete within the configured timeout
    #[error("Command {command} timed out")]
    Timeout { command: &'static str },

    /// Connection broke while the command was in flight
    #[error("I/O failure during {command}: {message}")]
    Io {
        command: &'static str,
        message: String,
    },

    /// Server rejected the command; carries the raw server error text
    #[error("Command {command} failed: {message}")]
    Command {
        command: &'static str,
        message: String,
    },

    /// EXEC returned nil
    #[error("Transaction was aborted")]
    TransactionAborted,

    /// Backend does not implement the command
    #[error("Command {command} is not supported by this client")]
    Unsupported { command: &'static str },
}

// == Lock Error ==
/// Lease lock failures. Always surfaced to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Attempt budget exhausted
    #[error("Lock {resource} couldn't be acquired after {attempts} attempts, concurrency is too high")]
    HighConcurrency { resource: String, attempts: u32 },

    /// Configured acquire timeout elapsed
    #[error("Lock {resource} couldn't be acquired within {waited:?}, giving up")]
    AcquireTimeout { resource: String, waited: Duration },

    /// Renew attempted after the local deadline already passed
    #[error("Lock {resource} was held longer than its lease, increase the duration or renew it regularly")]
    DurabilityTimedOut { resource: String },

    /// Stored deadline differs from the one this process wrote
    #[error("Lock {resource} deadline was changed by another holder")]
    InvalidDuration { resource: String },
}

// == Journal Error ==
/// Journal script or transaction failures.
#[derive(Error, Debug)]
pub enum JournalError {
    /// Server-side script failed
    #[error("Journal script {script} failed: {message}")]
    Script {
        script: &'static str,
        message: String,
    },

    /// MULTI/EXEC block failed
    #[error("Journal transaction failed: {message}")]
    Transaction { message: String },

    /// Script returned something other than the documented reply
    #[error("Journal script {script} returned unexpected reply: {reply}")]
    UnexpectedReply { script: &'static str, reply: String },
}

// == Config Error ==
/// Invalid or incomplete configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Tags or priority requested on a store without a journal
    #[error("Cache journal has not been provided, tags and priority are unavailable")]
    MissingJournal,

    /// Router constructed with no local shard
    #[error("At least one local shard is required")]
    NoShards,

    /// Shard address could not be parsed
    #[error("Invalid shard address: {0}")]
    InvalidShard(String),

    /// Journal kind is not one of lua, transactional, none
    #[error("Unknown journal kind: {0}")]
    InvalidJournal(String),

    /// Server too old for the requested feature
    #[error("Redis {version} is not supported, at least {required} is required")]
    UnsupportedServer { version: String, required: String },
}

// == Cache Error Enum ==
/// Unified error type for the cache layer.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Payload could not be (de)serialized
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

// == Result Type Alias ==
/// Convenience Result type for the cache layer.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_error_converts_into_cache_error() {
        let err: CacheError = LockError::InvalidDuration {
            resource: "k".to_string(),
        }
        .into();
        assert!(matches!(
            err,
            CacheError::Lock(LockError::InvalidDuration { .. })
        ));
        assert!(err.to_string().contains("another holder"));
    }

    #[test]
    fn test_transport_error_keeps_server_text() {
        let err = TransportError::Command {
            command: "EVALSHA",
            message: "ERR user_script:1: boom".to_string(),
        };
        assert!(err.to_string().contains("user_script:1: boom"));
    }
}
