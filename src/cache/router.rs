//! Storage Router
//!
//! Sharded cache: one [`CacheStore`] per shard, each with its own journal on
//! the same backend. Keys are routed to the owning local shard; cleans reach
//! every shard, remote ones included.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::cache::{CacheStats, CacheStore, Dependencies, ValidityCallback};
use crate::client::{ConnectOptions, RedisClient};
use crate::config::{CacheConfig, JournalKind};
use crate::error::Result;
use crate::journal::{CleanConditions, LUA_REQUIRED_VERSION};
use crate::shard::{Shard, ShardAddr, ShardRouter};

// == Storage Router ==
/// Routing decorator over one [`CacheStore`] per shard.
pub struct StorageRouter {
    router: ShardRouter,
    local: Vec<CacheStore>,
    remote: Vec<CacheStore>,
}

impl StorageRouter {
    /// Builds one store per shard of `router` with `build`.
    ///
    /// # Arguments
    /// * `router` - Shard set; local shards own keys, remote shards only clean
    /// * `build` - Store factory invoked once per shard
    pub fn new<F>(router: ShardRouter, build: F) -> Self
    where
        F: Fn(&Shard) -> CacheStore,
    {
        let local = router.local().iter().map(&build).collect();
        let remote = router.remote().iter().map(&build).collect();
        Self {
            router,
            local,
            remote,
        }
    }

    /// Connects a [`RedisClient`] per configured shard and builds their stores.
    ///
    /// With the Lua journal every shard must run Redis 2.6.0 or later.
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        let options = ConnectOptions {
            database: config.database,
            timeout: config.timeout,
            password: config.password.clone(),
        };
        let connect = |addr: &ShardAddr| -> Result<Shard> {
            let client = Arc::new(RedisClient::new(addr.clone(), options.clone()));
            if config.journal == JournalKind::Lua {
                client.assert_version(LUA_REQUIRED_VERSION)?;
            }
            Ok(Shard::new(addr.clone(), client))
        };

        let local = config.shards.iter().map(&connect).collect::<Result<Vec<_>>>()?;
        let remote = config
            .remote_shards
            .iter()
            .map(&connect)
            .collect::<Result<Vec<_>>>()?;
        let router = ShardRouter::new(local, remote)?;
        info!(
            local = router.local().len(),
            remote = router.remote().len(),
            journal = ?config.journal,
            "Storage router ready"
        );

        Ok(Self::new(router, |shard| {
            CacheStore::from_config(shard.client.clone(), config)
        }))
    }

    pub fn shards(&self) -> &ShardRouter {
        &self.router
    }

    /// Store of the local shard owning `key`.
    pub fn store(&self, key: &str) -> &CacheStore {
        &self.local[self.router.choose_index(key)]
    }

    fn store_mut(&mut self, key: &str) -> &mut CacheStore {
        let index = self.router.choose_index(key);
        &mut self.local[index]
    }

    pub fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.store(key).read(key)
    }

    pub fn read_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.store(key).read_value(key)
    }

    /// One MGET per shard involved.
    pub fn multi_read<S: AsRef<str>>(
        &self,
        keys: &[S],
    ) -> Result<HashMap<String, Option<Vec<u8>>>> {
        let mut by_shard: HashMap<usize, Vec<&str>> = HashMap::new();
        for key in keys {
            let key = key.as_ref();
            by_shard
                .entry(self.router.choose_index(key))
                .or_default()
                .push(key);
        }

        let mut values = HashMap::with_capacity(keys.len());
        for (index, shard_keys) in by_shard {
            values.extend(self.local[index].multi_read(&shard_keys)?);
        }
        Ok(values)
    }

    pub fn write(&mut self, key: &str, data: &[u8], dependencies: &Dependencies) -> Result<()> {
        self.store_mut(key).write(key, data, dependencies)
    }

    pub fn write_value<T: Serialize>(
        &mut self,
        key: &str,
        value: &T,
        dependencies: &Dependencies,
    ) -> Result<()> {
        self.store_mut(key).write_value(key, value, dependencies)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.store(key).remove(key)
    }

    /// Cleans every shard, local and remote.
    pub fn clean(&self, conditions: &CleanConditions) -> Result<()> {
        for store in self.local.iter().chain(self.remote.iter()) {
            store.clean(conditions)?;
        }
        Ok(())
    }

    pub fn lock(&mut self, key: &str) -> Result<bool> {
        self.store_mut(key).lock(key)
    }

    pub fn unlock(&mut self, key: &str) -> Result<bool> {
        self.store_mut(key).unlock(key)
    }

    pub fn disable_locking(&mut self) {
        for store in &mut self.local {
            store.disable_locking();
        }
    }

    /// Registers `callback` on every local store.
    pub fn register_callback<F>(&mut self, name: impl Into<String>, callback: F)
    where
        F: Fn(&[String]) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        let callback: ValidityCallback = Arc::new(callback);
        for store in &mut self.local {
            store.register_shared_callback(name.clone(), callback.clone());
        }
    }

    /// Counters summed over local shards.
    pub fn stats(&self) -> CacheStats {
        let mut total = CacheStats::new();
        for store in &self.local {
            total.merge(&store.stats());
        }
        total
    }
}

impl std::fmt::Debug for StorageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageRouter")
            .field("router", &self.router)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish()
    }
}
