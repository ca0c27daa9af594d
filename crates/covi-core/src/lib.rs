//! Company overview record model, canonical hashing and field normalization.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// One entity's overview data as delivered by a source, keyed by source field names.
pub type Record = Map<String, Value>;

/// Field holding the natural key (ticker symbol) of a record.
pub const NATURAL_KEY_FIELD: &str = "Symbol";

/// Source field names that are not valid identifiers downstream.
const FIELD_RENAMES: &[(&str, &str)] = &[
    ("52WeekHigh", "fiftytwoWeekHigh"),
    ("52WeekLow", "fiftytwoWeekLow"),
    ("50DayMovingAverage", "fiftyDayMovingAverage"),
    ("200DayMovingAverage", "twohundredDayMovingAverage"),
];

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("malformed batch payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("batch element {index} is not an object")]
    NotAnObject { index: usize },
}

/// Content hash of a canonicalized record, batch or snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeDigest(String);

impl ChangeDigest {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChangeDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Rebuild `value` with every mapping's keys in ascending order. Array order is kept.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (key, inner) in entries {
                sorted.insert(key.clone(), canonicalize(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Compact, key-sorted JSON text used as hashing input.
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

pub fn digest_value(value: &Value) -> ChangeDigest {
    ChangeDigest(sha256_hex(canonical_json(value).as_bytes()))
}

pub fn digest_record(record: &Record) -> ChangeDigest {
    digest_value(&Value::Object(record.clone()))
}

pub fn digest_records(records: &[Record]) -> ChangeDigest {
    digest_value(&records_to_value(records))
}

fn records_to_value(records: &[Record]) -> Value {
    Value::Array(records.iter().cloned().map(Value::Object).collect())
}

/// Natural key of a record, if it carries a non-empty string `Symbol`.
pub fn natural_key(record: &Record) -> Option<&str> {
    record
        .get(NATURAL_KEY_FIELD)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|key| !key.is_empty())
}

/// Stable document-store identifier derived from a natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(Uuid);

impl DocumentId {
    /// Version-5 UUID over the DNS namespace and the natural key.
    pub fn for_natural_key(key: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_DNS, key.as_bytes()))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub fn normalize_field_name(name: &str) -> String {
    if let Some((_, renamed)) = FIELD_RENAMES.iter().find(|(from, _)| *from == name) {
        return (*renamed).to_string();
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Copy of `record` with field names mapped to document property names.
pub fn normalize_record(record: &Record) -> Record {
    record
        .iter()
        .map(|(key, value)| (normalize_field_name(key), value.clone()))
        .collect()
}

/// Ordered sequence of records read atomically from one source fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub records: Vec<Record>,
    pub digest: ChangeDigest,
}

impl Batch {
    pub fn new(records: Vec<Record>) -> Self {
        let digest = digest_records(&records);
        Self { records, digest }
    }

    /// Parse a JSON array of objects.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, RecordError> {
        let values: Vec<Value> = serde_json::from_slice(bytes)?;
        let records = values
            .into_iter()
            .enumerate()
            .map(|(index, value)| match value {
                Value::Object(record) => Ok(record),
                _ => Err(RecordError::NotAnObject { index }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(records))
    }
}

/// Latest known record per natural key, folded during one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    entries: BTreeMap<String, Record>,
    /// Seeded records with no natural key, kept verbatim in source order.
    unkeyed: Vec<Record>,
}

impl Snapshot {
    /// Seed from previously persisted records. Records without a natural key
    /// cannot be folded into but are carried through to write-back unchanged.
    pub fn seeded<'a>(records: impl IntoIterator<Item = &'a Record>) -> Self {
        let mut snapshot = Self::default();
        for record in records {
            match natural_key(record) {
                Some(key) => {
                    snapshot.entries.insert(key.to_string(), record.clone());
                }
                None => snapshot.unkeyed.push(record.clone()),
            }
        }
        snapshot
    }

    /// Last write wins for a repeated key.
    pub fn fold(mut self, key: impl Into<String>, record: Record) -> Self {
        self.entries.insert(key.into(), record);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len() + self.unkeyed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.unkeyed.is_empty()
    }

    /// End of batch: no further folds arrive for this run. Keyed records come
    /// first in key order, followed by the unkeyed ones.
    pub fn complete(self) -> CompletedSnapshot {
        let records: Vec<Record> = self
            .entries
            .into_values()
            .chain(self.unkeyed)
            .collect();
        let digest = digest_records(&records);
        CompletedSnapshot { records, digest }
    }
}

/// Key-ordered snapshot ready for write-back.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedSnapshot {
    pub records: Vec<Record>,
    pub digest: ChangeDigest,
}

impl CompletedSnapshot {
    pub fn keys(&self) -> Vec<&str> {
        self.records.iter().filter_map(natural_key).collect()
    }

    /// Pretty-printed, key-sorted JSON array.
    pub fn to_pretty_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(&canonicalize(&records_to_value(&self.records)))
    }
}
