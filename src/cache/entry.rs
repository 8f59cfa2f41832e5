//! Cache Entry Module
//!
//! Persisted entry format: compact JSON metadata, one NUL byte, raw payload.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Separates metadata from payload in a stored entry.
pub const META_SEPARATOR: u8 = 0;

// == Callback ==
/// Named validity check persisted with an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Callback {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Callback {
    pub fn new<I, S>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

// == Entry Meta ==
/// Metadata envelope written in front of every payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    /// Write time (unix microseconds)
    pub time: i64,
    /// Payload is JSON produced by `write_value`
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub serialized: bool,
    /// Absolute expiration (unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire: Option<i64>,
    /// Sliding expiration (seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<u64>,
    /// Dependent item -> its write time when this entry was written
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub di: BTreeMap<String, Option<i64>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub callbacks: Vec<Callback>,
}

impl EntryMeta {
    /// Metadata stamped with the current time.
    pub fn now() -> Self {
        Self {
            time: current_timestamp_micros(),
            ..Self::default()
        }
    }

    // == Is Expired ==
    /// True once an absolute expiration has passed. Sliding entries never expire here.
    pub fn is_expired(&self) -> bool {
        match (self.delta, self.expire) {
            (Some(_), _) => false,
            (None, Some(expire)) => expire < current_timestamp_secs(),
            (None, None) => false,
        }
    }
}

// == Stored Entry ==
/// Decoded entry: metadata plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub meta: EntryMeta,
    pub payload: Vec<u8>,
}

impl StoredEntry {
    pub fn new(meta: EntryMeta, payload: Vec<u8>) -> Self {
        Self { meta, payload }
    }

    /// Serializes to `meta NUL payload`.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut raw = serde_json::to_vec(&self.meta)?;
        raw.push(META_SEPARATOR);
        raw.extend_from_slice(&self.payload);
        Ok(raw)
    }

    /// Splits on the first NUL; the payload may contain further NUL bytes.
    pub fn decode(raw: &[u8]) -> Result<Self, serde_json::Error> {
        let Some(split) = raw.iter().position(|b| *b == META_SEPARATOR) else {
            return Err(serde::de::Error::custom("missing metadata separator"));
        };
        let meta = serde_json::from_slice(&raw[..split])?;
        Ok(Self::new(meta, raw[split + 1..].to_vec()))
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Returns current Unix timestamp in microseconds.
pub fn current_timestamp_micros() -> i64 {
    Utc::now().timestamp_micros()
}

/// Returns current Unix timestamp in seconds.
pub fn current_timestamp_secs() -> i64 {
    Utc::now().timestamp()
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_meta_is_compact() {
        let meta = EntryMeta {
            time: 42,
            ..EntryMeta::default()
        };
        let raw = StoredEntry::new(meta, b"payload".to_vec()).encode().unwrap();
        assert_eq!(raw, b"{\"time\":42}\0payload".to_vec());
    }

    #[test]
    fn test_payload_may_contain_separator() {
        let entry = StoredEntry::new(EntryMeta::now(), b"a\0b\0".to_vec());
        let decoded = StoredEntry::decode(&entry.encode().unwrap()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_full_meta_field_names() {
        let mut meta = EntryMeta {
            time: 1,
            serialized: true,
            delta: Some(30),
            ..EntryMeta::default()
        };
        meta.di.insert("other".into(), None);
        meta.callbacks.push(Callback::new("exists", ["x"]));

        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(
            json,
            r#"{"time":1,"serialized":true,"delta":30,"di":{"other":null},"callbacks":[{"name":"exists","args":["x"]}]}"#
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(StoredEntry::decode(b"no separator").is_err());
        assert!(StoredEntry::decode(b"not json\0x").is_err());
    }

    #[test]
    fn test_expiration_boundary() {
        let now = current_timestamp_secs();
        let mut meta = EntryMeta {
            expire: Some(now - 1),
            ..EntryMeta::now()
        };
        assert!(meta.is_expired());

        meta.expire = Some(now + 60);
        assert!(!meta.is_expired());

        meta.expire = Some(now - 1);
        meta.delta = Some(5);
        assert!(!meta.is_expired());
    }

    #[test]
    fn test_timestamps_agree() {
        let ms = current_timestamp_ms();
        let secs = current_timestamp_secs();
        assert!((ms / 1000 - secs).abs() <= 1);
        assert!(current_timestamp_micros() >= ms * 1000);
    }
}
