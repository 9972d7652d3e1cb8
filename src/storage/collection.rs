use crate::core::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a record inside one collection.
///
/// Sequence keys sort before named keys, and sequence keys sort numerically,
/// so a scan of an auto-increment collection yields insertion order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RecordKey {
    Seq(u64),
    Name(String),
}

impl RecordKey {
    pub fn as_seq(&self) -> Option<u64> {
        match self {
            Self::Seq(seq) => Some(*seq),
            Self::Name(_) => None,
        }
    }
}

impl From<u64> for RecordKey {
    fn from(seq: u64) -> Self {
        Self::Seq(seq)
    }
}

impl From<&str> for RecordKey {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for RecordKey {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seq(seq) => write!(f, "{}", seq),
            Self::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPolicy {
    /// The store assigns a monotonically increasing sequence key on insert.
    AutoIncrement,
    /// The record carries its own key; writing an existing key overwrites.
    Explicit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    pub key_policy: KeyPolicy,
}

impl CollectionSchema {
    pub fn auto_increment(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_policy: KeyPolicy::AutoIncrement,
        }
    }

    pub fn explicit(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_policy: KeyPolicy::Explicit,
        }
    }
}

/// In-memory image of one named collection: encoded records by key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    schema: CollectionSchema,
    records: BTreeMap<RecordKey, Vec<u8>>,
    next_seq: u64,
}

impl Collection {
    pub fn new(schema: CollectionSchema) -> Self {
        Self {
            schema,
            records: BTreeMap::new(),
            next_seq: 1,
        }
    }

    /// Resolves the key a write will land on without mutating anything.
    pub fn resolve_key(&self, requested: Option<RecordKey>) -> Result<RecordKey> {
        match (requested, self.schema.key_policy) {
            (Some(key), _) => Ok(key),
            (None, KeyPolicy::AutoIncrement) => Ok(RecordKey::Seq(self.next_seq)),
            (None, KeyPolicy::Explicit) => Err(SyncError::Validation(format!(
                "collection '{}' requires records to carry their own key",
                self.schema.name
            ))),
        }
    }

    pub fn put(&mut self, key: RecordKey, bytes: Vec<u8>) {
        // The counter only moves forward, so deleted keys are never handed out again.
        if let RecordKey::Seq(seq) = key
            && seq >= self.next_seq
        {
            self.next_seq = seq + 1;
        }
        self.records.insert(key, bytes);
    }

    pub fn get(&self, key: &RecordKey) -> Option<&[u8]> {
        self.records.get(key).map(Vec::as_slice)
    }

    pub fn delete(&mut self, key: &RecordKey) -> bool {
        self.records.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn values(&self) -> impl Iterator<Item = &[u8]> {
        self.records.values().map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}
