//! Transactional Journal
//!
//! Journal maintained with plain reads followed by MULTI/EXEC blocks.
//! The read of a key's current tags and the transaction that drops them are
//! separate round-trips, so concurrent writers of the same key may interleave.

use std::sync::Arc;

use tracing::{debug, info};

use super::{
    dedup, escape_key, journal_key, priority_key, unescape_key, CleanConditions, CleanOutcome,
    Journal, JournalEntry, DEFAULT_NAMESPACE, KEYS_SUFFIX, TAGS_SUFFIX,
};
use crate::client::{Command, KvClient};
use crate::error::{JournalError, Result};

/// Keys processed per round of bookkeeping removal.
pub const BATCH_SIZE: usize = 8000;

// == Transactional Journal ==
/// Journal built from MULTI/EXEC batches.
///
/// Each batch is atomic on its own; a write or clean spans several batches.
pub struct TransactionalJournal {
    client: Arc<dyn KvClient>,
    namespace: String,
}

impl TransactionalJournal {
    /// Creates a journal under the default `Cache.Journal` namespace.
    pub fn new(client: Arc<dyn KvClient>) -> Self {
        Self::with_namespace(client, DEFAULT_NAMESPACE)
    }

    /// Creates a journal whose keys all start with `namespace:`.
    ///
    /// # Arguments
    /// * `client` - Backend holding the journal sets
    /// * `namespace` - Key prefix shared with other journals reading the same index
    pub fn with_namespace(client: Arc<dyn KvClient>, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn run(&self, commands: Vec<Command>) -> Result<()> {
        let commands: Vec<Command> = commands.into_iter().filter(|c| !c.is_noop()).collect();
        if commands.is_empty() {
            return Ok(());
        }
        self.client
            .transaction(&commands)
            .map_err(|err| JournalError::Transaction {
                message: err.to_string(),
            })?;
        Ok(())
    }

    /// Drops tag memberships, tag sets and priorities of already escaped keys.
    fn unindex(&self, escaped_keys: &[String]) -> Result<()> {
        let tag_sets: Vec<String> = escaped_keys
            .iter()
            .map(|key| journal_key(&self.namespace, key, TAGS_SUFFIX))
            .collect();
        let affected_tags = self.client.sunion(&tag_sets)?;

        let mut commands: Vec<Command> = affected_tags
            .iter()
            .filter(|tag| !tag.is_empty())
            .map(|tag| Command::SRem {
                key: journal_key(&self.namespace, tag, KEYS_SUFFIX),
                members: escaped_keys.to_vec(),
            })
            .collect();
        commands.push(Command::Del(tag_sets));
        commands.push(Command::ZRem {
            key: priority_key(&self.namespace),
            members: escaped_keys.to_vec(),
        });
        self.run(commands)
    }

    fn wipe(&self) -> Result<CleanOutcome> {
        let keys = self.client.keys(&format!("{}:*", self.namespace))?;
        for batch in keys.chunks(BATCH_SIZE) {
            self.client.del(batch)?;
        }
        info!(namespace = %self.namespace, removed = keys.len(), "Journal wiped");
        Ok(CleanOutcome::All)
    }
}

impl Journal for TransactionalJournal {
    fn write(&self, key: &str, entry: &JournalEntry) -> Result<()> {
        let escaped = escape_key(key);
        self.unindex(std::slice::from_ref(&escaped))?;

        let tags: Vec<String> = entry.unique_tags().iter().map(|tag| escape_key(tag)).collect();
        let mut commands: Vec<Command> = tags
            .iter()
            .map(|tag| Command::SAdd {
                key: journal_key(&self.namespace, tag, KEYS_SUFFIX),
                members: vec![escaped.clone()],
            })
            .collect();
        commands.push(Command::SAdd {
            key: journal_key(&self.namespace, &escaped, TAGS_SUFFIX),
            members: tags,
        });
        if let Some(priority) = entry.priority {
            commands.push(Command::ZAdd {
                key: priority_key(&self.namespace),
                score: priority as f64,
                member: escaped,
            });
        }

        self.run(commands)?;
        debug!(key, tags = entry.tags.len(), priority = ?entry.priority, "Journal entry written");
        Ok(())
    }

    fn clean(&self, conditions: &CleanConditions) -> Result<CleanOutcome> {
        if conditions.all {
            return self.wipe();
        }

        let mut entries = Vec::new();

        if !conditions.tags.is_empty() {
            let mut member_sets = Vec::with_capacity(conditions.tags.len());
            for tag in &conditions.tags {
                let member_set = journal_key(&self.namespace, &escape_key(tag), KEYS_SUFFIX);
                entries.extend(self.client.smembers(&member_set)?);
                member_sets.push(member_set);
            }
            self.client.del(&member_sets)?;
        }

        if let Some(threshold) = conditions.priority {
            let priorities = priority_key(&self.namespace);
            let max = threshold as f64;
            entries.extend(
                self.client
                    .zrange_by_score(&priorities, f64::NEG_INFINITY, max)?,
            );
            self.client
                .zrem_range_by_score(&priorities, f64::NEG_INFINITY, max)?;
        }

        let entries = dedup(entries);
        for batch in entries.chunks(BATCH_SIZE) {
            self.unindex(batch)?;
        }

        debug!(removed = entries.len(), "Journal cleaned");
        Ok(CleanOutcome::Keys(
            entries.iter().map(|key| unescape_key(key)).collect(),
        ))
    }
}
