//! Write Dependencies
//!
//! Expiration, dependent items, tags, priority and validity callbacks attached
//! to a cache write.

use std::time::Duration;

use crate::cache::Callback;
use crate::journal::JournalEntry;

// == Dependencies ==
/// Builder of the dependencies of one write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dependencies {
    /// Physical TTL of the entry
    pub expiration: Option<Duration>,
    /// Refresh `expiration` on every successful read
    pub sliding: bool,
    /// Entries whose overwrite invalidates this one
    pub items: Vec<String>,
    pub tags: Vec<String>,
    pub priority: Option<i64>,
    pub callbacks: Vec<Callback>,
}

impl Dependencies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absolute expiration `ttl` from now.
    pub fn expire(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self.sliding = false;
        self
    }

    /// Sliding expiration, refreshed to `ttl` on each read.
    pub fn sliding(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self.sliding = true;
        self
    }

    pub fn items<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.items.extend(items.into_iter().map(Into::into));
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Adds a callback registered on the store under `name`.
    pub fn callback<I, S>(mut self, name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.callbacks.push(Callback::new(name, args));
        self
    }

    /// Whether the journal has to be involved.
    pub fn needs_journal(&self) -> bool {
        !self.tags.is_empty() || self.priority.is_some()
    }

    pub(crate) fn journal_entry(&self) -> JournalEntry {
        JournalEntry::new(self.tags.clone(), self.priority)
    }
}
