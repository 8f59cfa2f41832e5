//! Lua Journal
//!
//! Journal maintained by server-side scripts. Each write and each clean runs
//! as one atomic script, so index maintenance never interleaves with other
//! clients. Requires a server with scripting (2.6.0 or later).

use std::sync::Arc;

use tracing::{debug, info};

use super::{
    dedup, escape_key, unescape_key, CleanConditions, CleanOutcome, Journal, JournalEntry,
    DEFAULT_NAMESPACE,
};
use crate::client::{KvClient, LuaScript, ScriptReply};
use crate::error::{JournalError, Result};

/// Oldest server version able to run the journal scripts.
pub const REQUIRED_VERSION: &str = "2.6.0";

const WRITE_SCRIPT: &str = "journal.write";
const CLEAN_SCRIPT: &str = "journal.clean";

// == Lua Journal ==
/// Journal whose write and clean each run as one server-side script.
pub struct LuaJournal {
    client: Arc<dyn KvClient>,
    namespace: String,
    write_script: LuaScript,
    clean_script: LuaScript,
}

impl LuaJournal {
    pub fn new(client: Arc<dyn KvClient>) -> Self {
        Self::with_namespace(client, DEFAULT_NAMESPACE)
    }

    pub fn with_namespace(client: Arc<dyn KvClient>, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            write_script: LuaScript::new(
                WRITE_SCRIPT,
                concat!(
                    include_str!("scripts/common.lua"),
                    include_str!("scripts/write.lua")
                ),
            ),
            clean_script: LuaScript::new(
                CLEAN_SCRIPT,
                concat!(
                    include_str!("scripts/common.lua"),
                    include_str!("scripts/clean.lua")
                ),
            ),
        }
    }

    fn eval(&self, script: &LuaScript, keys: &[String], payload: String) -> Result<ScriptReply> {
        let args = [self.namespace.clone(), payload];
        let reply = self
            .client
            .eval_script(script, keys, &args)
            .map_err(|err| JournalError::Script {
                script: script.name,
                message: err.to_string(),
            })?;
        Ok(reply)
    }
}

/// JSON argument of the write script; tags escaped and deduplicated.
pub(crate) fn write_payload(entry: &JournalEntry) -> Result<String> {
    let escaped = JournalEntry::new(
        entry.unique_tags().iter().map(|tag| escape_key(tag)).collect(),
        entry.priority,
    );
    Ok(serde_json::to_string(&escaped)?)
}

/// JSON argument of the clean script; tags escaped.
pub(crate) fn clean_payload(conditions: &CleanConditions) -> Result<String> {
    let escaped = CleanConditions {
        all: conditions.all,
        tags: conditions.tags.iter().map(|tag| escape_key(tag)).collect(),
        priority: conditions.priority,
    };
    Ok(serde_json::to_string(&escaped)?)
}

/// Maps the clean script's reply onto an outcome.
pub(crate) fn clean_outcome(reply: ScriptReply) -> Result<CleanOutcome> {
    match reply {
        ScriptReply::Integer(1) => Ok(CleanOutcome::All),
        ScriptReply::List(keys) => Ok(CleanOutcome::Keys(dedup(
            keys.iter().map(|key| unescape_key(key)).collect(),
        ))),
        other => Err(JournalError::UnexpectedReply {
            script: CLEAN_SCRIPT,
            reply: other.to_string(),
        }
        .into()),
    }
}

impl Journal for LuaJournal {
    fn write(&self, key: &str, entry: &JournalEntry) -> Result<()> {
        let payload = write_payload(entry)?;
        let keys = [escape_key(key)];
        match self.eval(&self.write_script, &keys, payload)? {
            ScriptReply::Integer(1) | ScriptReply::Status(_) => {
                debug!(
                    key,
                    tags = entry.tags.len(),
                    priority = ?entry.priority,
                    "Journal entry written"
                );
                Ok(())
            }
            other => Err(JournalError::UnexpectedReply {
                script: WRITE_SCRIPT,
                reply: other.to_string(),
            }
            .into()),
        }
    }

    fn clean(&self, conditions: &CleanConditions) -> Result<CleanOutcome> {
        let payload = clean_payload(conditions)?;
        let outcome = clean_outcome(self.eval(&self.clean_script, &[], payload)?)?;
        match &outcome {
            CleanOutcome::All => info!(namespace = %self.namespace, "Journal wiped"),
            CleanOutcome::Keys(keys) => debug!(removed = keys.len(), "Journal cleaned"),
        }
        Ok(outcome)
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryClient;
    use crate::error::CacheError;

    #[test]
    fn test_write_payload_escapes_and_dedups_tags() {
        let entry = JournalEntry::new(vec!["a:b".into(), "c".into(), "a:b".into()], Some(4));
        assert_eq!(
            write_payload(&entry).unwrap(),
            r#"{"tags":["a\\:b","c"],"priority":4}"#
        );
        assert_eq!(write_payload(&JournalEntry::default()).unwrap(), "{}");
    }

    #[test]
    fn test_clean_payload() {
        assert_eq!(
            clean_payload(&CleanConditions::tags(["x:y"])).unwrap(),
            r#"{"tags":["x\\:y"]}"#
        );
        assert_eq!(
            clean_payload(&CleanConditions::all()).unwrap(),
            r#"{"all":true}"#
        );
    }

    #[test]
    fn test_clean_outcome_decoding() {
        assert_eq!(
            clean_outcome(ScriptReply::Integer(1)).unwrap(),
            CleanOutcome::All
        );
        assert_eq!(
            clean_outcome(ScriptReply::List(vec![
                "ns:a".into(),
                "b\\:c".into(),
                "ns:a".into()
            ]))
            .unwrap(),
            CleanOutcome::Keys(vec!["ns\0a".into(), "b:c".into()])
        );
        assert!(matches!(
            clean_outcome(ScriptReply::Nil),
            Err(CacheError::Journal(JournalError::UnexpectedReply { .. }))
        ));
    }

    #[test]
    fn test_scripts_share_helpers() {
        let journal = LuaJournal::new(Arc::new(MemoryClient::new()));
        for script in [&journal.write_script, &journal.clean_script] {
            assert!(script.source.starts_with("-- shared helpers"));
            assert!(script.source.contains("local function unindex"));
        }
        assert!(journal.write_script.source.ends_with("return 1"));
        assert!(journal.clean_script.source.ends_with("return found"));
    }

    #[test]
    fn test_transport_failure_names_the_script() {
        let journal = LuaJournal::new(Arc::new(MemoryClient::new()));
        let err = journal.write("k", &JournalEntry::default()).unwrap_err();
        assert!(matches!(
            err,
            CacheError::Journal(JournalError::Script {
                script: "journal.write",
                ..
            })
        ));
    }
}
