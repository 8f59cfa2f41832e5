//! Journal Module
//!
//! Secondary indices over cache keys for bulk invalidation.
//!
//! # Layout
//! Under the journal namespace `ns`, with `k` and `t` escaped by [`escape_key`]:
//! - `ns:t:keys` set of keys carrying tag `t`
//! - `ns:k:tags` set of tags carried by key `k`
//! - `ns:priority` sorted set of key -> priority
//!
//! Both implementations share this layout and are interchangeable on the same data.

mod lua;
mod router;
mod transactional;

use std::collections::HashSet;

use serde::Serialize;

use crate::error::Result;

pub use lua::{LuaJournal, REQUIRED_VERSION as LUA_REQUIRED_VERSION};
pub use router::JournalRouter;
pub use transactional::TransactionalJournal;

// == Layout Constants ==
/// Default journal namespace.
pub const DEFAULT_NAMESPACE: &str = "Cache.Journal";

/// Suffix of a tag's member set.
pub const KEYS_SUFFIX: &str = "keys";

/// Suffix of a key's tag set.
pub const TAGS_SUFFIX: &str = "tags";

/// Name of the priority sorted set.
pub const PRIORITY_KEY: &str = "priority";

/// Namespace separator allowed inside caller keys.
pub const NAMESPACE_SEPARATOR: char = '\0';

// == Journal Entry ==
/// Tags and priority recorded for one key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JournalEntry {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

impl JournalEntry {
    pub fn new(tags: Vec<String>, priority: Option<i64>) -> Self {
        Self { tags, priority }
    }

    /// Tags without duplicates, first occurrence order kept.
    pub fn unique_tags(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.tags
            .iter()
            .filter(|tag| seen.insert(tag.as_str()))
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.priority.is_none()
    }
}

// == Clean Conditions ==
/// Which entries a clean removes. Conditions are combined as a union.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanConditions {
    /// Wipe everything; other conditions are ignored
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub all: bool,
    /// Entries carrying any of these tags
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Entries with priority at or below this threshold
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

impl CleanConditions {
    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    pub fn tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn priority(threshold: i64) -> Self {
        Self {
            priority: Some(threshold),
            ..Self::default()
        }
    }

    /// Adds a priority threshold to the conditions.
    pub fn with_priority(mut self, threshold: i64) -> Self {
        self.priority = Some(threshold);
        self
    }

    pub fn is_empty(&self) -> bool {
        !self.all && self.tags.is_empty() && self.priority.is_none()
    }
}

// == Clean Outcome ==
/// Result of a journal clean.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanOutcome {
    /// Whole namespace wiped; no key list available
    All,
    /// Deduplicated keys whose bookkeeping was removed
    Keys(Vec<String>),
}

impl CleanOutcome {
    /// Removed keys, empty for [`CleanOutcome::All`].
    pub fn keys(&self) -> &[String] {
        match self {
            CleanOutcome::All => &[],
            CleanOutcome::Keys(keys) => keys,
        }
    }

    /// Merges outcomes from several shards.
    pub fn merge(self, other: CleanOutcome) -> CleanOutcome {
        match (self, other) {
            (CleanOutcome::Keys(mut keys), CleanOutcome::Keys(more)) => {
                keys.extend(more);
                CleanOutcome::Keys(dedup(keys))
            }
            _ => CleanOutcome::All,
        }
    }
}

// == Journal Trait ==
/// Tag and priority index over cache keys.
pub trait Journal: Send + Sync {
    /// Replaces whatever `key` was indexed under with `entry`.
    ///
    /// Writing an empty entry removes all bookkeeping for `key`.
    fn write(&self, key: &str, entry: &JournalEntry) -> Result<()>;

    /// Removes bookkeeping of every key matching `conditions`.
    fn clean(&self, conditions: &CleanConditions) -> Result<CleanOutcome>;
}

/// Escapes `\` and `:`, and turns the namespace separator into `:`.
pub fn escape_key(key: &str) -> String {
    let mut escaped = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            ':' => escaped.push_str("\\:"),
            NAMESPACE_SEPARATOR => escaped.push(':'),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Inverse of [`escape_key`].
pub fn unescape_key(escaped: &str) -> String {
    let mut key = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(next) => key.push(next),
                None => key.push('\\'),
            },
            ':' => key.push(NAMESPACE_SEPARATOR),
            c => key.push(c),
        }
    }
    key
}

/// `ns:name:suffix`; `name` must already be escaped.
pub(crate) fn journal_key(namespace: &str, escaped: &str, suffix: &str) -> String {
    format!("{}:{}:{}", namespace, escaped, suffix)
}

pub(crate) fn priority_key(namespace: &str) -> String {
    format!("{}:{}", namespace, PRIORITY_KEY)
}

/// Order-preserving deduplication.
pub(crate) fn dedup(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}
