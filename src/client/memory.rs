//! In-Memory Client
//!
//! Process-local [`KvClient`] with TTL expiration. Mirrors the Redis semantics
//! the cache relies on (empty sets vanish, SET clears the TTL, WRONGTYPE on
//! type mismatch). Scripting is not available.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;

use super::{Command, KvClient, LuaScript, ScriptReply, TransportResult};
use crate::error::TransportError;

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

// == Stored Value ==
#[derive(Debug, Clone)]
enum Value {
    Str(Vec<u8>),
    Set(BTreeSet<String>),
    ZSet(HashMap<String, f64>),
}

// == Slot ==
/// A value with its optional expiration instant.
#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    /// Expired once the current instant reaches the expiration instant.
    fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(at) => now >= at,
            None => false,
        }
    }
}

// == Keyspace ==
#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Slot>,
}

impl Keyspace {
    /// Returns the slot for `key`, dropping it first if it already expired.
    fn live(&mut self, key: &str) -> Option<&mut Slot> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|slot| slot.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn string(&mut self, command: &'static str, key: &str) -> TransportResult<Option<Vec<u8>>> {
        match self.live(key).map(|slot| &slot.value) {
            None => Ok(None),
            Some(Value::Str(bytes)) => Ok(Some(bytes.clone())),
            Some(_) => Err(wrong_type(command)),
        }
    }

    fn members(&mut self, command: &'static str, key: &str) -> TransportResult<Vec<String>> {
        match self.live(key).map(|slot| &slot.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(members)) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(wrong_type(command)),
        }
    }

    fn set(&mut self, key: &str, value: &[u8], ttl: Option<Duration>) {
        let mut slot = Slot::new(Value::Str(value.to_vec()));
        slot.expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.insert(key.to_string(), slot);
    }

    fn del(&mut self, keys: &[String]) -> u64 {
        keys.iter()
            .filter(|key| {
                let existed = self.live(key).is_some();
                self.entries.remove(key.as_str());
                existed
            })
            .count() as u64
    }

    fn sadd(&mut self, key: &str, members: &[String]) -> TransportResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        if self.live(key).is_none() {
            self.entries
                .insert(key.to_string(), Slot::new(Value::Set(BTreeSet::new())));
        }
        match self.live(key).map(|slot| &mut slot.value) {
            Some(Value::Set(set)) => Ok(members
                .iter()
                .filter(|member| set.insert((*member).clone()))
                .count() as u64),
            _ => Err(wrong_type("SADD")),
        }
    }

    fn srem(&mut self, key: &str, members: &[String]) -> TransportResult<u64> {
        let (removed, now_empty) = match self.live(key).map(|slot| &mut slot.value) {
            None => return Ok(0),
            Some(Value::Set(set)) => {
                let removed = members.iter().filter(|member| set.remove(*member)).count();
                (removed as u64, set.is_empty())
            }
            Some(_) => return Err(wrong_type("SREM")),
        };
        if now_empty {
            self.entries.remove(key);
        }
        Ok(removed)
    }

    fn zset(
        &mut self,
        command: &'static str,
        key: &str,
    ) -> TransportResult<Option<&mut HashMap<String, f64>>> {
        match self.live(key).map(|slot| &mut slot.value) {
            None => Ok(None),
            Some(Value::ZSet(scores)) => Ok(Some(scores)),
            Some(_) => Err(wrong_type(command)),
        }
    }

    fn zadd(&mut self, key: &str, score: f64, member: &str) -> TransportResult<u64> {
        if self.live(key).is_none() {
            self.entries
                .insert(key.to_string(), Slot::new(Value::ZSet(HashMap::new())));
        }
        let scores = self.zset("ZADD", key)?.ok_or_else(|| wrong_type("ZADD"))?;
        Ok(match scores.insert(member.to_string(), score) {
            Some(_) => 0,
            None => 1,
        })
    }

    fn zrange_by_score(&mut self, key: &str, min: f64, max: f64) -> TransportResult<Vec<String>> {
        let Some(scores) = self.zset("ZRANGEBYSCORE", key)? else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<(f64, String)> = scores
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(member, score)| (*score, member.clone()))
            .collect();
        hits.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(hits.into_iter().map(|(_, member)| member).collect())
    }

    fn zremove(
        &mut self,
        command: &'static str,
        key: &str,
        predicate: impl Fn(&String, f64) -> bool,
    ) -> TransportResult<u64> {
        let (removed, now_empty) = match self.zset(command, key)? {
            None => return Ok(0),
            Some(scores) => {
                let before = scores.len();
                scores.retain(|member, score| !predicate(member, *score));
                ((before - scores.len()) as u64, scores.is_empty())
            }
        };
        if now_empty {
            self.entries.remove(key);
        }
        Ok(removed)
    }

    fn apply(&mut self, command: &Command) -> TransportResult<()> {
        match command {
            Command::Del(keys) => {
                self.del(keys);
            }
            Command::SAdd { key, members } => {
                self.sadd(key, members)?;
            }
            Command::SRem { key, members } => {
                self.srem(key, members)?;
            }
            Command::ZAdd { key, score, member } => {
                self.zadd(key, *score, member)?;
            }
            Command::ZRem { key, members } => {
                self.zremove("ZREM", key, |member, _| members.contains(member))?;
            }
            Command::ZRemRangeByScore { key, min, max } => {
                self.zremove("ZREMRANGEBYSCORE", key, |_, score| {
                    score >= *min && score <= *max
                })?;
            }
        }
        Ok(())
    }
}

// == Memory Client ==
/// Thread-safe in-process key-value store.
#[derive(Debug, Default)]
pub struct MemoryClient {
    keyspace: Mutex<Keyspace>,
}

impl MemoryClient {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.keyspace
            .lock()
            .entries
            .values()
            .filter(|slot| !slot.is_expired(now))
            .count()
    }

    /// Returns true when no live key exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time to live of `key`, `None` when missing or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut keyspace = self.keyspace.lock();
        let at = keyspace.live(key)?.expires_at?;
        Some(at.saturating_duration_since(Instant::now()))
    }
}

impl KvClient for MemoryClient {
    fn set_nx(&self, key: &str, value: &[u8]) -> TransportResult<bool> {
        let mut keyspace = self.keyspace.lock();
        if keyspace.live(key).is_some() {
            return Ok(false);
        }
        keyspace.set(key, value, None);
        Ok(true)
    }

    fn get(&self, key: &str) -> TransportResult<Option<Vec<u8>>> {
        self.keyspace.lock().string("GET", key)
    }

    fn mget(&self, keys: &[String]) -> TransportResult<Vec<Option<Vec<u8>>>> {
        let mut keyspace = self.keyspace.lock();
        // MGET reports non-string keys as nil instead of failing
        Ok(keys
            .iter()
            .map(|key| keyspace.string("MGET", key).ok().flatten())
            .collect())
    }

    fn get_set(&self, key: &str, value: &[u8]) -> TransportResult<Option<Vec<u8>>> {
        let mut keyspace = self.keyspace.lock();
        let previous = keyspace.string("GETSET", key)?;
        keyspace.set(key, value, None);
        Ok(previous)
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> TransportResult<()> {
        self.keyspace.lock().set(key, value, ttl);
        Ok(())
    }

    fn expire(&self, key: &str, ttl: Duration) -> TransportResult<bool> {
        let mut keyspace = self.keyspace.lock();
        if ttl.is_zero() {
            return Ok(keyspace.del(&[key.to_string()]) > 0);
        }
        match keyspace.live(key) {
            Some(slot) => {
                slot.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn expire_at(&self, key: &str, unix_secs: i64) -> TransportResult<bool> {
        let remaining_ms = unix_secs.saturating_mul(1000) - Utc::now().timestamp_millis();
        if remaining_ms <= 0 {
            return Ok(self.keyspace.lock().del(&[key.to_string()]) > 0);
        }
        self.expire(key, Duration::from_millis(remaining_ms as u64))
    }

    fn del(&self, keys: &[String]) -> TransportResult<u64> {
        Ok(self.keyspace.lock().del(keys))
    }

    fn sadd(&self, key: &str, members: &[String]) -> TransportResult<u64> {
        self.keyspace.lock().sadd(key, members)
    }

    fn srem(&self, key: &str, members: &[String]) -> TransportResult<u64> {
        self.keyspace.lock().srem(key, members)
    }

    fn smembers(&self, key: &str) -> TransportResult<Vec<String>> {
        self.keyspace.lock().members("SMEMBERS", key)
    }

    fn sunion(&self, keys: &[String]) -> TransportResult<Vec<String>> {
        let mut keyspace = self.keyspace.lock();
        let mut union = BTreeSet::new();
        for key in keys {
            union.extend(keyspace.members("SUNION", key)?);
        }
        Ok(union.into_iter().collect())
    }

    fn zadd(&self, key: &str, score: f64, member: &str) -> TransportResult<u64> {
        self.keyspace.lock().zadd(key, score, member)
    }

    fn zrem(&self, key: &str, members: &[String]) -> TransportResult<u64> {
        self.keyspace
            .lock()
            .zremove("ZREM", key, |member, _| members.contains(member))
    }

    fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> TransportResult<Vec<String>> {
        self.keyspace.lock().zrange_by_score(key, min, max)
    }

    fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> TransportResult<u64> {
        self.keyspace
            .lock()
            .zremove("ZREMRANGEBYSCORE", key, |_, score| score >= min && score <= max)
    }

    fn keys(&self, pattern: &str) -> TransportResult<Vec<String>> {
        let now = Instant::now();
        let pattern: Vec<char> = pattern.chars().collect();
        let mut keys: Vec<String> = self
            .keyspace
            .lock()
            .entries
            .iter()
            .filter(|(_, slot)| !slot.is_expired(now))
            .filter(|(key, _)| glob_match(&pattern, &key.chars().collect::<Vec<_>>()))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn transaction(&self, commands: &[Command]) -> TransportResult<()> {
        let mut keyspace = self.keyspace.lock();
        // like EXEC, a failing command does not stop the rest of the block
        let mut first_error = None;
        for command in commands {
            if let Err(err) = keyspace.apply(command) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn eval_script(
        &self,
        _script: &LuaScript,
        _keys: &[String],
        _args: &[String],
    ) -> TransportResult<ScriptReply> {
        Err(TransportError::Unsupported { command: "EVALSHA" })
    }
}

fn wrong_type(command: &'static str) -> TransportError {
    TransportError::Command {
        command,
        message: WRONGTYPE.to_string(),
    }
}

/// Redis-style glob: `*`, `?` and `\` escapes.
fn glob_match(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => (0..=text.len()).any(|skip| glob_match(&pattern[1..], &text[skip..])),
        Some('?') => !text.is_empty() && glob_match(&pattern[1..], &text[1..]),
        Some('\\') if pattern.len() > 1 => {
            text.first() == Some(&pattern[1]) && glob_match(&pattern[2..], &text[1..])
        }
        Some(c) => text.first() == Some(c) && glob_match(&pattern[1..], &text[1..]),
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_set_nx_only_once() {
        let client = MemoryClient::new();
        assert!(client.set_nx("k", b"1").unwrap());
        assert!(!client.set_nx("k", b"2").unwrap());
        assert_eq!(client.get("k").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_get_set_returns_previous() {
        let client = MemoryClient::new();
        assert_eq!(client.get_set("k", b"a").unwrap(), None);
        assert_eq!(client.get_set("k", b"b").unwrap(), Some(b"a".to_vec()));
    }

    #[test]
    fn test_set_with_ttl_expires() {
        let client = MemoryClient::new();
        client
            .set("k", b"v", Some(Duration::from_millis(50)))
            .unwrap();
        assert!(client.get("k").unwrap().is_some());
        sleep(Duration::from_millis(80));
        assert!(client.get("k").unwrap().is_none());
        assert!(client.is_empty());
    }

    #[test]
    fn test_set_clears_ttl() {
        let client = MemoryClient::new();
        client.set("k", b"v", Some(Duration::from_secs(5))).unwrap();
        client.set("k", b"v", None).unwrap();
        assert!(client.ttl("k").is_none());
    }

    #[test]
    fn test_expire_at_in_the_past_deletes() {
        let client = MemoryClient::new();
        client.set("k", b"v", None).unwrap();
        assert!(client.expire_at("k", 1).unwrap());
        assert!(client.get("k").unwrap().is_none());
    }

    #[test]
    fn test_sets_disappear_when_empty() {
        let client = MemoryClient::new();
        client.sadd("s", &strings(&["a", "b"])).unwrap();
        assert_eq!(client.smembers("s").unwrap(), strings(&["a", "b"]));
        client.srem("s", &strings(&["a", "b"])).unwrap();
        assert!(client.keys("*").unwrap().is_empty());
    }

    #[test]
    fn test_sunion() {
        let client = MemoryClient::new();
        client.sadd("a", &strings(&["x", "y"])).unwrap();
        client.sadd("b", &strings(&["y", "z"])).unwrap();
        let union = client.sunion(&strings(&["a", "b", "missing"])).unwrap();
        assert_eq!(union, strings(&["x", "y", "z"]));
    }

    #[test]
    fn test_sorted_set_range_and_removal() {
        let client = MemoryClient::new();
        client.zadd("z", 10.0, "c").unwrap();
        client.zadd("z", 1.0, "a").unwrap();
        client.zadd("z", 5.0, "b").unwrap();

        let low = client
            .zrange_by_score("z", f64::NEG_INFINITY, 5.0)
            .unwrap();
        assert_eq!(low, strings(&["a", "b"]));

        assert_eq!(
            client
                .zrem_range_by_score("z", f64::NEG_INFINITY, 5.0)
                .unwrap(),
            2
        );
        assert_eq!(
            client
                .zrange_by_score("z", f64::NEG_INFINITY, f64::INFINITY)
                .unwrap(),
            strings(&["c"])
        );
    }

    #[test]
    fn test_wrong_type_is_reported() {
        let client = MemoryClient::new();
        client.set("k", b"v", None).unwrap();
        let err = client.sadd("k", &strings(&["m"])).unwrap_err();
        assert!(err.to_string().contains("WRONGTYPE"));
    }

    #[test]
    fn test_keys_glob() {
        let client = MemoryClient::new();
        client.set("ns:a", b"", None).unwrap();
        client.set("ns:b", b"", None).unwrap();
        client.set("other:a", b"", None).unwrap();
        assert_eq!(client.keys("ns:*").unwrap(), strings(&["ns:a", "ns:b"]));
        assert_eq!(client.keys("?s:a").unwrap(), strings(&["ns:a"]));
        assert_eq!(client.keys("ns\\:a").unwrap(), strings(&["ns:a"]));
    }

    #[test]
    fn test_transaction_applies_all_commands() {
        let client = MemoryClient::new();
        client
            .transaction(&[
                Command::SAdd {
                    key: "t".into(),
                    members: strings(&["a"]),
                },
                Command::ZAdd {
                    key: "p".into(),
                    score: 3.0,
                    member: "a".into(),
                },
                Command::Del(strings(&["nothing"])),
            ])
            .unwrap();
        assert_eq!(client.smembers("t").unwrap(), strings(&["a"]));
        assert_eq!(client.zrange_by_score("p", 0.0, 5.0).unwrap(), strings(&["a"]));
    }

    #[test]
    fn test_scripts_are_unsupported() {
        let client = MemoryClient::new();
        let script = LuaScript::new("noop", "return 1");
        assert!(matches!(
            client.eval_script(&script, &[], &[]),
            Err(TransportError::Unsupported { .. })
        ));
    }
}
