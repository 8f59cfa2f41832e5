//! Shard Module
//!
//! Deterministic key-to-shard routing over a static set of backends.
//!
//! Local shards hold data and are chosen per key. Remote shards only receive
//! global invalidations. The shard set is fixed at construction; adding or
//! removing a shard remaps keys and is not supported.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use md5::{Digest, Md5};

use crate::client::KvClient;
use crate::error::ConfigError;

// == Shard Address ==
/// `host:port` of one backend instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardAddr {
    pub host: String,
    pub port: u16,
}

impl ShardAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for ShardAddr {
    fn default() -> Self {
        Self::new("127.0.0.1", 6379)
    }
}

impl fmt::Display for ShardAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ShardAddr {
    type Err = ConfigError;

    /// Parses `host:port`; a bare host uses port 6379.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| ConfigError::InvalidShard(s.to_string()))?;
                (host, port)
            }
            None => (s, 6379),
        };
        if host.is_empty() {
            return Err(ConfigError::InvalidShard(s.to_string()));
        }
        Ok(Self::new(host, port))
    }
}

// == Shard ==
/// A backend instance and the client connected to it.
#[derive(Clone)]
pub struct Shard {
    pub addr: ShardAddr,
    pub client: Arc<dyn KvClient>,
}

impl Shard {
    pub fn new(addr: ShardAddr, client: Arc<dyn KvClient>) -> Self {
        Self { addr, client }
    }
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard").field("addr", &self.addr).finish()
    }
}

// == Shard Router ==
/// Maps keys onto local shards and enumerates every shard for global operations.
#[derive(Debug, Clone)]
pub struct ShardRouter {
    local: Vec<Shard>,
    remote: Vec<Shard>,
}

impl ShardRouter {
    /// Fails with [`ConfigError::NoShards`] when `local` is empty.
    pub fn new(local: Vec<Shard>, remote: Vec<Shard>) -> Result<Self, ConfigError> {
        if local.is_empty() {
            return Err(ConfigError::NoShards);
        }
        Ok(Self { local, remote })
    }

    /// Index into [`local`](Self::local) of the shard owning `key`.
    ///
    /// Sums the decimal digits of the hex MD5 digest of `key` (hex letters
    /// count as zero) modulo the number of local shards.
    pub fn choose_index(&self, key: &str) -> usize {
        let digest = hex::encode(Md5::digest(key.as_bytes()));
        let sum: u32 = digest.chars().filter_map(|c| c.to_digit(10)).sum();
        sum as usize % self.local.len()
    }

    /// Client of the local shard owning `key`.
    pub fn choose(&self, key: &str) -> &Arc<dyn KvClient> {
        &self.local[self.choose_index(key)].client
    }

    /// Local shard at `index`.
    pub fn get(&self, index: usize) -> Option<&Shard> {
        self.local.get(index)
    }

    /// Data-holding shards.
    pub fn local(&self) -> &[Shard] {
        &self.local
    }

    /// Invalidation-only shards.
    pub fn remote(&self) -> &[Shard] {
        &self.remote
    }

    /// Local shards followed by remote shards.
    pub fn all(&self) -> impl Iterator<Item = &Shard> {
        self.local.iter().chain(self.remote.iter())
    }
}
