//! Cache Store Module
//!
//! Entries persisted in a remote store with dependency verification on read.
//!
//! Every read verifies the entry's dependencies: sliding expiration is
//! refreshed, absolute expiration and validity callbacks are checked, and each
//! dependent item must still carry the write time captured when the entry was
//! written. Entries failing verification are evicted and read as absent.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{current_timestamp_secs, CacheStats, Dependencies, EntryMeta, StoredEntry};
use crate::client::KvClient;
use crate::config::{CacheConfig, JournalKind};
use crate::error::{ConfigError, Result};
use crate::journal::{
    CleanConditions, CleanOutcome, Journal, JournalEntry, LuaJournal, TransactionalJournal,
    NAMESPACE_SEPARATOR,
};
use crate::lock::{LeaseLock, LockOptions};

/// Default storage namespace.
pub const DEFAULT_NAMESPACE: &str = "Cache.Storage";

/// Keys deleted per DEL during cleans.
const CLEAN_BATCH: usize = 8000;

/// Validity check registered under a name; receives the persisted arguments.
pub type ValidityCallback = Arc<dyn Fn(&[String]) -> bool + Send + Sync>;

// == Cache Store ==
/// Dependency-aware cache over a [`KvClient`].
///
/// Entries live under `<namespace>:<key>`; tags and priorities go to the
/// optional journal and each key can be guarded by a lease.
pub struct CacheStore {
    client: Arc<dyn KvClient>,
    journal: Option<Arc<dyn Journal>>,
    lock: LeaseLock,
    locking: bool,
    namespace: String,
    callbacks: HashMap<String, ValidityCallback>,
    stats: Mutex<CacheStats>,
}

impl CacheStore {
    // == Constructor ==
    /// Creates a store over `client`.
    ///
    /// # Arguments
    /// * `client` - Backend holding entries and lock keys
    /// * `journal` - Tag and priority index; writes with tags or priority fail without one
    pub fn new(client: Arc<dyn KvClient>, journal: Option<Arc<dyn Journal>>) -> Self {
        Self {
            lock: LeaseLock::new(client.clone(), LockOptions::default()),
            client,
            journal,
            locking: true,
            namespace: DEFAULT_NAMESPACE.to_string(),
            callbacks: HashMap::new(),
            stats: Mutex::new(CacheStats::new()),
        }
    }

    /// Creates a store with the journal, namespaces and locking of `config`.
    pub fn from_config(client: Arc<dyn KvClient>, config: &CacheConfig) -> Self {
        let namespace = config.journal_namespace.clone();
        let journal: Option<Arc<dyn Journal>> = match config.journal {
            JournalKind::Lua => Some(Arc::new(LuaJournal::with_namespace(
                client.clone(),
                namespace,
            ))),
            JournalKind::Transactional => Some(Arc::new(TransactionalJournal::with_namespace(
                client.clone(),
                namespace,
            ))),
            JournalKind::None => None,
        };
        let mut store = Self::new(client, journal)
            .with_namespace(config.storage_namespace.clone())
            .with_lock_options(config.lock_options());
        if !config.locking {
            store.disable_locking();
        }
        store
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_lock_options(mut self, options: LockOptions) -> Self {
        self.lock = LeaseLock::new(self.client.clone(), options);
        self
    }

    /// Turns [`lock`](Self::lock) and [`unlock`](Self::unlock) into no-ops.
    pub fn disable_locking(&mut self) {
        self.locking = false;
    }

    /// Registers a validity callback referenced by [`Dependencies::callback`].
    pub fn register_callback<F>(&mut self, name: impl Into<String>, callback: F)
    where
        F: Fn(&[String]) -> bool + Send + Sync + 'static,
    {
        self.callbacks.insert(name.into(), Arc::new(callback));
    }

    pub(crate) fn register_shared_callback(&mut self, name: String, callback: ValidityCallback) {
        self.callbacks.insert(name, callback);
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Key under which `key` is stored; the namespace separator becomes `:`.
    pub fn storage_key(&self, key: &str) -> String {
        format!(
            "{}:{}",
            self.namespace,
            key.replace(NAMESPACE_SEPARATOR, ":")
        )
    }

    // == Read ==
    /// Reads and verifies an entry, returning its payload.
    pub fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.read_entry(key)?.map(|entry| entry.payload))
    }

    /// Reads an entry and deserializes its payload.
    ///
    /// Payloads written with [`write`](Self::write) are read as a JSON string.
    pub fn read_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(entry) = self.read_entry(key)? else {
            return Ok(None);
        };
        let value = if entry.meta.serialized {
            serde_json::from_slice(&entry.payload)?
        } else {
            let text = String::from_utf8_lossy(&entry.payload).into_owned();
            serde_json::from_value(serde_json::Value::String(text))?
        };
        Ok(Some(value))
    }

    // == Multi Read ==
    /// Reads several entries with one MGET; absent or invalid entries map to `None`.
    pub fn multi_read<S: AsRef<str>>(
        &self,
        keys: &[S],
    ) -> Result<HashMap<String, Option<Vec<u8>>>> {
        let storage_keys: Vec<String> = keys.iter().map(|k| self.storage_key(k.as_ref())).collect();
        let raws = self.client.mget(&storage_keys)?;

        let mut values = HashMap::with_capacity(keys.len());
        for (key, raw) in keys.iter().map(AsRef::as_ref).zip(raws) {
            let entry = self.accept(key, raw)?;
            self.record_read(entry.is_some());
            values.insert(key.to_string(), entry.map(|entry| entry.payload));
        }
        Ok(values)
    }

    // == Write ==
    /// Stores raw bytes and releases any lease taken on `key`.
    pub fn write(&mut self, key: &str, data: &[u8], dependencies: &Dependencies) -> Result<()> {
        self.store(key, data.to_vec(), false, dependencies)
    }

    /// Stores `value` as JSON and releases any lease taken on `key`.
    pub fn write_value<T: Serialize>(
        &mut self,
        key: &str,
        value: &T,
        dependencies: &Dependencies,
    ) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.store(key, payload, true, dependencies)
    }

    // == Remove ==
    /// Deletes the entry and its journal bookkeeping.
    pub fn remove(&self, key: &str) -> Result<()> {
        let storage_key = self.storage_key(key);
        self.client.del(std::slice::from_ref(&storage_key))?;
        if let Some(journal) = &self.journal {
            journal.write(&storage_key, &JournalEntry::default())?;
        }
        Ok(())
    }

    // == Clean ==
    /// Removes entries matching `conditions`.
    ///
    /// "All" wipes the storage namespace directly, then the journal.
    /// Tag and priority conditions require a journal.
    pub fn clean(&self, conditions: &CleanConditions) -> Result<()> {
        if conditions.all {
            let keys = self.client.keys(&format!("{}:*", self.namespace))?;
            for batch in keys.chunks(CLEAN_BATCH) {
                self.client.del(batch)?;
            }
            if let Some(journal) = &self.journal {
                journal.clean(conditions)?;
            }
            info!(namespace = %self.namespace, removed = keys.len(), "Storage wiped");
            return Ok(());
        }
        if conditions.is_empty() {
            return Ok(());
        }

        let journal = self.journal.as_ref().ok_or(ConfigError::MissingJournal)?;
        match journal.clean(conditions)? {
            CleanOutcome::All => {}
            CleanOutcome::Keys(keys) => {
                for batch in keys.chunks(CLEAN_BATCH) {
                    self.client.del(batch)?;
                }
                debug!(removed = keys.len(), "Entries cleaned");
            }
        }
        Ok(())
    }

    // == Locking ==
    /// Takes the lease on `key`.
    ///
    /// Released by the next [`write`](Self::write) or [`unlock`](Self::unlock).
    pub fn lock(&mut self, key: &str) -> Result<bool> {
        if !self.locking {
            return Ok(false);
        }
        let resource = self.storage_key(key);
        self.lock.acquire(&resource)
    }

    pub fn unlock(&mut self, key: &str) -> Result<bool> {
        if !self.locking {
            return Ok(false);
        }
        let resource = self.storage_key(key);
        self.lock.release(&resource)
    }

    // == Stats ==
    /// Returns current cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }

    fn store(
        &mut self,
        key: &str,
        payload: Vec<u8>,
        serialized: bool,
        dependencies: &Dependencies,
    ) -> Result<()> {
        let mut meta = EntryMeta::now();
        meta.serialized = serialized;
        let ttl = dependencies.expiration.map(whole_seconds);
        if let Some(ttl) = ttl {
            if dependencies.sliding {
                meta.delta = Some(ttl.as_secs());
            } else {
                meta.expire = Some(current_timestamp_secs() + ttl.as_secs() as i64);
            }
        }
        for item in &dependencies.items {
            let time = self.read_meta(item)?.map(|meta| meta.time);
            meta.di.insert(item.clone(), time);
        }
        meta.callbacks = dependencies.callbacks.clone();

        if dependencies.needs_journal() && self.journal.is_none() {
            return Err(ConfigError::MissingJournal.into());
        }

        let storage_key = self.storage_key(key);
        let raw = StoredEntry::new(meta, payload).encode()?;
        if let Err(err) = self.persist(key, &storage_key, &raw, ttl, dependencies) {
            if let Err(cleanup) = self.remove(key) {
                warn!(key, error = %cleanup, "Failed to remove partially written entry");
            }
            if let Err(release) = self.unlock(key) {
                warn!(key, error = %release, "Failed to release lease after failed write");
            }
            return Err(err);
        }

        self.stats.lock().record_write();
        debug!(key, bytes = raw.len(), "Entry written");
        Ok(())
    }

    /// Journal bookkeeping, payload and lease release; any failure leaves a
    /// partial write for the caller to remove.
    fn persist(
        &mut self,
        key: &str,
        storage_key: &str,
        raw: &[u8],
        ttl: Option<Duration>,
        dependencies: &Dependencies,
    ) -> Result<()> {
        if dependencies.needs_journal() {
            let journal = self.journal.as_ref().ok_or(ConfigError::MissingJournal)?;
            journal.write(storage_key, &dependencies.journal_entry())?;
        }
        self.client.set(storage_key, raw, ttl)?;
        self.unlock(key)?;
        Ok(())
    }

    fn read_entry(&self, key: &str) -> Result<Option<StoredEntry>> {
        let raw = self.client.get(&self.storage_key(key))?;
        let entry = self.accept(key, raw)?;
        self.record_read(entry.is_some());
        Ok(entry)
    }

    /// Metadata of `key` without verifying it.
    fn read_meta(&self, key: &str) -> Result<Option<EntryMeta>> {
        let raw = self.client.get(&self.storage_key(key))?;
        Ok(self.decode(key, raw)?.map(|entry| entry.meta))
    }

    fn accept(&self, key: &str, raw: Option<Vec<u8>>) -> Result<Option<StoredEntry>> {
        let Some(entry) = self.decode(key, raw)? else {
            return Ok(None);
        };
        let mut visited = HashSet::new();
        if self.verify(key, &entry.meta, &mut visited)? {
            Ok(Some(entry))
        } else {
            Ok(None)
        }
    }

    fn decode(&self, key: &str, raw: Option<Vec<u8>>) -> Result<Option<StoredEntry>> {
        let Some(raw) = raw else {
            return Ok(None);
        };
        match StoredEntry::decode(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) => {
                warn!(key, error = %err, "Undecodable entry, evicting");
                self.evict(key)?;
                Ok(None)
            }
        }
    }

    /// Checks `meta` of `key`, evicting the entry when it is no longer valid.
    fn verify(&self, key: &str, meta: &EntryMeta, visited: &mut HashSet<String>) -> Result<bool> {
        visited.insert(key.to_string());
        let valid = self.check(key, meta, visited)?;
        if !valid {
            self.evict(key)?;
        }
        Ok(valid)
    }

    fn check(&self, key: &str, meta: &EntryMeta, visited: &mut HashSet<String>) -> Result<bool> {
        if let Some(delta) = meta.delta {
            self.client
                .expire(&self.storage_key(key), Duration::from_secs(delta))?;
        } else if meta.is_expired() {
            return Ok(false);
        }

        for callback in &meta.callbacks {
            let valid = match self.callbacks.get(&callback.name) {
                Some(check) => check(&callback.args),
                None => {
                    warn!(key, callback = %callback.name, "Unknown validity callback");
                    false
                }
            };
            if !valid {
                return Ok(false);
            }
        }

        for (item, captured) in &meta.di {
            let current = self.read_meta(item)?;
            if current.as_ref().map(|meta| meta.time) != *captured {
                return Ok(false);
            }
            if let Some(item_meta) = current {
                // dependency cycles are checked once
                if !visited.contains(item) && !self.verify(item, &item_meta, visited)? {
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    fn evict(&self, key: &str) -> Result<()> {
        self.remove(key)?;
        self.stats.lock().record_eviction();
        debug!(key, "Invalid entry evicted");
        Ok(())
    }

    fn record_read(&self, hit: bool) {
        let mut stats = self.stats.lock();
        if hit {
            stats.record_hit();
        } else {
            stats.record_miss();
        }
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("namespace", &self.namespace)
            .field("journal", &self.journal.is_some())
            .field("locking", &self.locking)
            .field("lock", &self.lock)
            .finish()
    }
}

/// Redis expirations have whole-second granularity; round up, at least one second.
fn whole_seconds(ttl: Duration) -> Duration {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    Duration::from_secs(secs.max(1))
}
