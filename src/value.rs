// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source document model.
//!
//! Documents arrive from the source collaborator as ordered field lists of
//! [`Value`]s. The set of value kinds is closed, so every conversion in the
//! normalizer is an exhaustive `match` rather than runtime type probing.
//!
//! The ordering key used to paginate the snapshot is [`DocKey`], extracted
//! from the `_id` field. Its `Ord` follows the source's cross-type sort
//! order: numbers, then strings, then object identifiers.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the field holding the ordering key.
pub const ID_FIELD: &str = "_id";

/// A single field value as delivered by the source.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// High-precision decimal, carried as its canonical string form.
    Decimal(String),
    String(String),
    /// Document identifier (hex form).
    ObjectId(String),
    /// Source timestamps may carry sub-millisecond precision.
    Timestamp(DateTime<Utc>),
    Document(Document),
    Array(Vec<Value>),
}

impl Value {
    /// Short kind name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Decimal(_) => "decimal",
            Value::String(_) => "string",
            Value::ObjectId(_) => "objectId",
            Value::Timestamp(_) => "timestamp",
            Value::Document(_) => "document",
            Value::Array(_) => "array",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// JSON rendering used for compound values.
    ///
    /// Identifiers, decimals and timestamps become strings; non-finite
    /// floats become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Value::Null => J::Null,
            Value::Bool(b) => J::Bool(*b),
            Value::Int(i) => J::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f).map(J::Number).unwrap_or(J::Null),
            Value::Decimal(d) => J::String(d.clone()),
            Value::String(s) => J::String(s.clone()),
            Value::ObjectId(oid) => J::String(oid.clone()),
            Value::Timestamp(ts) => J::String(iso_millis(ts)),
            Value::Document(doc) => {
                let map = doc
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<serde_json::Map<_, _>>();
                J::Object(map)
            }
            Value::Array(items) => J::Array(items.iter().map(Value::to_json).collect()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::String(s) => write!(f, "{}", s),
            Value::ObjectId(oid) => write!(f, "{}", oid),
            Value::Timestamp(ts) => write!(f, "{}", iso_millis(ts)),
            Value::Document(_) | Value::Array(_) => write!(f, "{}", self.to_json()),
        }
    }
}

/// ISO-8601 rendering truncated to milliseconds.
pub fn iso_millis(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Value::Document(doc)
    }
}

/// An ordered list of named fields.
///
/// Field order is preserved so output columns follow first-seen order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    fields: Vec<(String, Value)>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert or replace a field, keeping its original position on replace.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter().map(|(k, v)| (k, v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The document's ordering key, if its `_id` is a sortable kind.
    pub fn key(&self) -> Option<DocKey> {
        self.get(ID_FIELD).and_then(DocKey::from_value)
    }
}

impl IntoIterator for Document {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut doc = Document::new();
        for (k, v) in iter {
            doc.insert(k, v);
        }
        doc
    }
}

/// Ordering key used to paginate the snapshot.
///
/// Variant order defines cross-type ordering (numbers < strings < ids).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DocKey {
    Int(i64),
    Str(String),
    ObjectId(String),
}

impl DocKey {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => Some(DocKey::Int(*i)),
            Value::String(s) => Some(DocKey::Str(s.clone())),
            Value::ObjectId(oid) => Some(DocKey::ObjectId(oid.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            DocKey::Int(i) => Value::Int(*i),
            DocKey::Str(s) => Value::String(s.clone()),
            DocKey::ObjectId(oid) => Value::ObjectId(oid.clone()),
        }
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocKey::Int(i) => write!(f, "{}", i),
            DocKey::Str(s) => write!(f, "{}", s),
            DocKey::ObjectId(oid) => write!(f, "ObjectId({})", oid),
        }
    }
}
