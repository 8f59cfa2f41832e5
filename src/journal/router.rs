//! Journal Router
//!
//! A [`Journal`] spread over several shards: writes land on the shard owning
//! the key, cleans run on every shard.

use std::sync::Arc;

use super::{CleanConditions, CleanOutcome, Journal, JournalEntry};
use crate::error::Result;
use crate::shard::{Shard, ShardRouter};

// == Journal Router ==
/// One journal per shard; writes follow key ownership, cleans reach every shard.
pub struct JournalRouter {
    router: ShardRouter,
    local: Vec<Arc<dyn Journal>>,
    remote: Vec<Arc<dyn Journal>>,
}

impl JournalRouter {
    /// Builds one journal per shard of `router` with `build`.
    ///
    /// # Arguments
    /// * `router` - Shard set; local shards own keys, remote shards only clean
    /// * `build` - Journal factory invoked once per shard
    pub fn new<F>(router: ShardRouter, build: F) -> Self
    where
        F: Fn(&Shard) -> Arc<dyn Journal>,
    {
        let local = router.local().iter().map(&build).collect();
        let remote = router.remote().iter().map(&build).collect();
        Self {
            router,
            local,
            remote,
        }
    }

    pub fn shards(&self) -> &ShardRouter {
        &self.router
    }
}

impl Journal for JournalRouter {
    fn write(&self, key: &str, entry: &JournalEntry) -> Result<()> {
        self.local[self.router.choose_index(key)].write(key, entry)
    }

    fn clean(&self, conditions: &CleanConditions) -> Result<CleanOutcome> {
        let mut outcome = CleanOutcome::Keys(Vec::new());
        for journal in self.local.iter().chain(self.remote.iter()) {
            outcome = outcome.merge(journal.clean(conditions)?);
        }
        Ok(outcome)
    }
}
