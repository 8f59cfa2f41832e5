//! Batched commands for MULTI/EXEC blocks.

/// A write command queued inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Del(Vec<String>),
    SAdd { key: String, members: Vec<String> },
    SRem { key: String, members: Vec<String> },
    ZAdd { key: String, score: f64, member: String },
    ZRem { key: String, members: Vec<String> },
    ZRemRangeByScore { key: String, min: f64, max: f64 },
}

impl Command {
    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Del(_) => "DEL",
            Command::SAdd { .. } => "SADD",
            Command::SRem { .. } => "SREM",
            Command::ZAdd { .. } => "ZADD",
            Command::ZRem { .. } => "ZREM",
            Command::ZRemRangeByScore { .. } => "ZREMRANGEBYSCORE",
        }
    }

    /// True when executing the command cannot change anything.
    pub fn is_noop(&self) -> bool {
        match self {
            Command::Del(keys) => keys.is_empty(),
            Command::SAdd { members, .. }
            | Command::SRem { members, .. }
            | Command::ZRem { members, .. } => members.is_empty(),
            Command::ZAdd { .. } | Command::ZRemRangeByScore { .. } => false,
        }
    }
}

/// Formats a sorted-set bound, mapping infinities to `-inf`/`+inf`.
pub fn score_arg(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}
