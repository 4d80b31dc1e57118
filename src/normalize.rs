// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record normalization: rename, infer, coerce, cast.
//!
//! # Pipeline (per field)
//!
//! ```text
//! (name, Value)
//!    │ 1. rename lookup; unseen column -> infer + sanitize + register
//!    │ 2. apply rename
//!    ▼
//! coerce(target_type)  ── failure ──▶ default cell + ConversionFailure
//!    │
//!    ▼
//! cast(target_encoding) ── failure ──▶ warn, keep coerced cell
//!    │
//!    ▼
//! (column, Cell)
//! ```
//!
//! Given the same schema entry and raw value, coercion and casting are pure:
//! the same input always yields the same cell and the same substitution.
//! The only side effect is registering columns the registry has not seen.

use crate::error::Result;
use crate::schema::{
    infer_column_schema, sanitize_column_name, ColumnEncoding, SchemaEntry,
    SchemaRegistry, TargetType,
};
use crate::value::{iso_millis, Document, Value};
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// A normalized column value, ready for columnar encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Milliseconds since the Unix epoch, UTC.
    TimestampMillis(i64),
}

impl Cell {
    /// Whether this cell already has the physical form of `encoding`.
    pub fn matches(&self, encoding: ColumnEncoding) -> bool {
        matches!(
            (self, encoding),
            (Cell::Null, _)
                | (Cell::Text(_), ColumnEncoding::Utf8)
                | (Cell::Int(_), ColumnEncoding::Int64 | ColumnEncoding::NullableInt64)
                | (Cell::Float(_), ColumnEncoding::Float64)
                | (Cell::Bool(_), ColumnEncoding::Boolean | ColumnEncoding::NullableBoolean)
                | (Cell::TimestampMillis(_), ColumnEncoding::TimestampMillis)
        )
    }

    /// Text form used when a column falls back to UTF-8.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Cell::Null => None,
            Cell::Text(s) => Some(s.clone()),
            Cell::Int(i) => Some(i.to_string()),
            Cell::Float(f) => Some(f.to_string()),
            Cell::Bool(b) => Some(b.to_string()),
            Cell::TimestampMillis(ms) => Some(
                Utc.timestamp_millis_opt(*ms)
                    .single()
                    .map(|ts| iso_millis(&ts))
                    .unwrap_or_else(|| ms.to_string()),
            ),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_text() {
            Some(text) => write!(f, "{}", text),
            None => write!(f, "null"),
        }
    }
}

/// A value that could not be coerced and was replaced by a default.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionFailure {
    pub column: String,
    pub original: String,
    pub substituted: String,
}

impl ConversionFailure {
    /// Fixed-width line for the conversion log file.
    pub fn log_line(&self) -> String {
        format!("{:<20} | {:<20} | {:<20}", self.column, self.original, self.substituted)
    }
}

/// One normalized document: columns in the document's field order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedRecord {
    pub columns: Vec<(String, Cell)>,
    pub failures: Vec<ConversionFailure>,
}

impl NormalizedRecord {
    pub fn get(&self, column: &str) -> Option<&Cell> {
        self.columns.iter().find(|(name, _)| name == column).map(|(_, cell)| cell)
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Coercion: Value -> Cell by target type
// ═══════════════════════════════════════════════════════════════════════════════

type Converter = fn(&Value) -> Option<Cell>;

/// Converter for each target type. `None` from a converter is a failure.
fn converter(target: TargetType) -> Converter {
    match target {
        TargetType::String | TargetType::Json => to_text,
        TargetType::Int64 => to_int,
        TargetType::Float64 => to_float,
        TargetType::Boolean => to_bool,
        TargetType::Timestamp => to_timestamp_text,
    }
}

/// Substitute written in place of a value that failed coercion.
pub fn default_cell(target: TargetType) -> Cell {
    match target {
        TargetType::String | TargetType::Json => Cell::Text(String::new()),
        TargetType::Float64 => Cell::Float(0.0),
        TargetType::Int64 | TargetType::Boolean | TargetType::Timestamp => Cell::Null,
    }
}

/// Coerce `value` toward `target`, or return the default on failure.
pub fn coerce(target: TargetType, value: &Value) -> std::result::Result<Cell, Cell> {
    converter(target)(value).ok_or_else(|| default_cell(target))
}

fn to_text(value: &Value) -> Option<Cell> {
    Some(match value {
        Value::Null => Cell::Text(String::new()),
        Value::String(s) | Value::Decimal(s) | Value::ObjectId(s) => Cell::Text(s.clone()),
        Value::Document(_) | Value::Array(_) => Cell::Text(value.to_json().to_string()),
        Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Timestamp(_) => Cell::Text(value.to_string()),
    })
}

fn float_to_int(f: f64) -> Option<i64> {
    let truncated = f.trunc();
    if truncated.is_finite() && truncated >= i64::MIN as f64 && truncated < i64::MAX as f64 {
        Some(truncated as i64)
    } else {
        None
    }
}

fn parse_int(s: &str) -> Option<i64> {
    let s = s.trim();
    s.parse::<i64>().ok().or_else(|| s.parse::<f64>().ok().and_then(float_to_int))
}

fn to_int(value: &Value) -> Option<Cell> {
    match value {
        Value::Null => Some(Cell::Null),
        Value::Int(i) => Some(Cell::Int(*i)),
        Value::Float(f) => float_to_int(*f).map(Cell::Int),
        Value::Bool(b) => Some(Cell::Int(i64::from(*b))),
        Value::Decimal(s) | Value::String(s) => parse_int(s).map(Cell::Int),
        Value::ObjectId(_) | Value::Timestamp(_) | Value::Document(_) | Value::Array(_) => None,
    }
}

fn to_float(value: &Value) -> Option<Cell> {
    match value {
        Value::Null => Some(Cell::Null),
        Value::Float(f) => Some(Cell::Float(*f)),
        Value::Int(i) => Some(Cell::Float(*i as f64)),
        Value::Bool(b) => Some(Cell::Float(if *b { 1.0 } else { 0.0 })),
        Value::Decimal(s) | Value::String(s) => s.trim().parse::<f64>().ok().map(Cell::Float),
        Value::ObjectId(_) | Value::Timestamp(_) | Value::Document(_) | Value::Array(_) => None,
    }
}

fn to_bool(value: &Value) -> Option<Cell> {
    match value {
        Value::Null => Some(Cell::Null),
        Value::Bool(b) => Some(Cell::Bool(*b)),
        Value::Int(0) => Some(Cell::Bool(false)),
        Value::Int(1) => Some(Cell::Bool(true)),
        Value::Float(f) if *f == 0.0 => Some(Cell::Bool(false)),
        Value::Float(f) if *f == 1.0 => Some(Cell::Bool(true)),
        Value::String(s) => {
            if s == "0" || s.eq_ignore_ascii_case("false") {
                Some(Cell::Bool(false))
            } else if s == "1" || s.eq_ignore_ascii_case("true") {
                Some(Cell::Bool(true))
            } else {
                None
            }
        }
        _ => None,
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim()).ok().map(|ts| ts.with_timezone(&Utc))
}

/// Timestamps become ISO-8601 text at millisecond precision; the cast step
/// turns that text into the millisecond encoding.
fn to_timestamp_text(value: &Value) -> Option<Cell> {
    match value {
        Value::Null => Some(Cell::Null),
        Value::Timestamp(ts) => Some(Cell::Text(iso_millis(ts))),
        Value::String(s) => parse_timestamp(s).map(|ts| Cell::Text(iso_millis(&ts))),
        _ => None,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cast: Cell -> Cell by physical encoding
// ═══════════════════════════════════════════════════════════════════════════════

/// Cast a coerced cell to the column's physical encoding.
///
/// `None` means the cast failed; callers keep the uncast cell.
pub fn cast(cell: &Cell, encoding: ColumnEncoding) -> Option<Cell> {
    if cell.matches(encoding) {
        return Some(cell.clone());
    }
    match encoding {
        ColumnEncoding::Utf8 => cell.to_text().map(Cell::Text),
        ColumnEncoding::Int64 | ColumnEncoding::NullableInt64 => match cell {
            Cell::Float(f) if f.fract() == 0.0 => float_to_int(*f).map(Cell::Int),
            Cell::Text(s) => s.trim().parse::<i64>().ok().map(Cell::Int),
            Cell::Bool(b) => Some(Cell::Int(i64::from(*b))),
            _ => None,
        },
        ColumnEncoding::Float64 => match cell {
            Cell::Int(i) => Some(Cell::Float(*i as f64)),
            Cell::Text(s) => s.trim().parse::<f64>().ok().map(Cell::Float),
            _ => None,
        },
        ColumnEncoding::Boolean | ColumnEncoding::NullableBoolean => None,
        ColumnEncoding::TimestampMillis => match cell {
            Cell::Text(s) if s.is_empty() => Some(Cell::Null),
            Cell::Text(s) => parse_timestamp(s).map(|ts| Cell::TimestampMillis(ts.timestamp_millis())),
            _ => None,
        },
    }
}

/// Coerce and cast one value against a fixed schema entry.
///
/// Returns the final cell and, when coercion failed, the failure record.
pub fn convert_value(column: &str, entry: &SchemaEntry, value: &Value) -> (Cell, Option<ConversionFailure>) {
    let (coerced, failure) = match coerce(entry.target_type, value) {
        Ok(cell) => (cell, None),
        Err(substitute) => {
            warn!(
                column,
                original = %value,
                kind = value.kind(),
                target_type = ?entry.target_type,
                substituted = %substitute,
                "Value conversion failed, substituting default"
            );
            let failure = ConversionFailure {
                column: column.to_string(),
                original: value.to_string(),
                substituted: substitute.to_string(),
            };
            (substitute, Some(failure))
        }
    };

    let cell = match cast(&coerced, entry.target_encoding) {
        Some(cast) => cast,
        None => {
            warn!(
                column,
                value = %coerced,
                encoding = ?entry.target_encoding,
                "Column cast failed, keeping uncast value"
            );
            coerced
        }
    };
    (cell, failure)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Normalizer
// ═══════════════════════════════════════════════════════════════════════════════

/// Normalizes documents against the shared schema registry.
#[derive(Clone)]
pub struct Normalizer {
    registry: Arc<SchemaRegistry>,
}

impl Normalizer {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Resolve a source field name to its column and schema entry,
    /// registering the column if it has never been seen.
    async fn resolve(&self, collection: &str, name: &str, sample: &Value) -> Result<(String, SchemaEntry)> {
        let rename = self.registry.get_rename(collection, name).await?;
        if rename.is_none() {
            if let Some(entry) = self.registry.get_column(collection, name).await? {
                return Ok((name.to_string(), entry));
            }
        }

        let column = match rename {
            Some(renamed) => renamed,
            None => {
                let sanitized = sanitize_column_name(name);
                if sanitized != name {
                    self.registry.add_rename(collection, name, &sanitized).await?
                } else {
                    sanitized
                }
            }
        };

        if let Some(entry) = self.registry.get_column(collection, &column).await? {
            return Ok((column, entry));
        }

        let mut inferred = infer_column_schema(sample);
        if column != name {
            inferred = inferred.renamed_from(name);
        }
        let entry = self.registry.add_column(collection, &column, inferred).await?;
        Ok((column, entry))
    }

    /// Normalize one document.
    pub async fn normalize(&self, collection: &str, doc: &Document) -> Result<NormalizedRecord> {
        let mut record = NormalizedRecord::default();
        for (name, value) in doc.iter() {
            let (column, entry) = self.resolve(collection, name, value).await?;
            let (cell, failure) = convert_value(&column, &entry, value);
            if let Some(failure) = failure {
                record.failures.push(failure);
            }
            record.columns.push((column, cell));
        }

        crate::metrics::record_normalized(collection, 1);
        if record.has_failures() {
            crate::metrics::conversion_failures(collection, record.failures.len());
        }
        Ok(record)
    }

    /// Normalize a page of documents.
    ///
    /// Columns first seen in this page are inferred from their first
    /// non-null value across the page rather than from whichever document
    /// happens to come first.
    pub async fn normalize_page(&self, collection: &str, docs: &[Document]) -> Result<Vec<NormalizedRecord>> {
        let mut names: Vec<&String> = Vec::new();
        for doc in docs {
            for (name, _) in doc.iter() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }

        let null = Value::Null;
        for name in names {
            let known = self.registry.get_rename(collection, name).await?.is_some()
                || self.registry.get_column(collection, name).await?.is_some();
            if known {
                continue;
            }
            let first = docs
                .iter()
                .filter_map(|d| d.get(name))
                .find(|v| !v.is_null())
                .unwrap_or(&null);
            debug!(collection, column = %name, kind = first.kind(), "Inferring column from page sample");
            self.resolve(collection, name, first).await?;
        }

        let mut records = Vec::with_capacity(docs.len());
        for doc in docs {
            records.push(self.normalize(collection, doc).await?);
        }
        Ok(records)
    }
}
