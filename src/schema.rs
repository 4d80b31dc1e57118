// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-collection column schema and rename tables.
//!
//! The registry is the single source of truth for "what type is column X"
//! shared by the init and delta engines. Entries are append-only: the first
//! sighting of a column fixes its type and later values are coerced toward
//! it.
//!
//! # Locking
//!
//! ```text
//! SchemaRegistry
//!   tables: RwLock<HashMap<collection, Arc<Mutex<TableState>>>>
//!                                         │
//!                                         └─ held across mutate + persist
//! ```
//!
//! The outer map lock only guards table creation. Each collection's mutex
//! is held while the in-memory table changes and while its snapshot is
//! written to the checkpoint store, so two engines discovering the same new
//! column can never persist a stale table over a newer one.

use crate::checkpoint::{keys, Checkpoints};
use crate::error::Result;
use crate::resilience::{retry_transient, RetryConfig};
use crate::source::SourceRef;
use crate::value::{Document, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Longest column name the sink accepts.
pub const MAX_COLUMN_NAME_LEN: usize = 128;

/// Logical value type a column is coerced to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    String,
    Int64,
    Float64,
    Boolean,
    Timestamp,
    /// Compound values (documents, arrays) encoded as JSON text.
    Json,
}

/// Physical column representation in the output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnEncoding {
    Utf8,
    Int64,
    NullableInt64,
    Float64,
    Boolean,
    NullableBoolean,
    TimestampMillis,
}

/// Schema of one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub target_type: TargetType,
    pub target_encoding: ColumnEncoding,
    /// Source name when sanitization changed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renamed_from: Option<String>,
}

impl SchemaEntry {
    pub fn new(target_type: TargetType, target_encoding: ColumnEncoding) -> Self {
        Self {
            target_type,
            target_encoding,
            renamed_from: None,
        }
    }

    pub fn renamed_from(mut self, original: impl Into<String>) -> Self {
        self.renamed_from = Some(original.into());
        self
    }
}

/// Infer a column's schema from one sampled value.
///
/// Identifiers, decimals and nulls map to string; compound values to JSON
/// text. Integer and boolean columns get nullable encodings so rows missing
/// the field still fit. Timestamps are stored at millisecond precision.
pub fn infer_column_schema(sample: &Value) -> SchemaEntry {
    match sample {
        Value::Null | Value::String(_) | Value::ObjectId(_) | Value::Decimal(_) => {
            SchemaEntry::new(TargetType::String, ColumnEncoding::Utf8)
        }
        Value::Document(_) | Value::Array(_) => SchemaEntry::new(TargetType::Json, ColumnEncoding::Utf8),
        Value::Int(_) => SchemaEntry::new(TargetType::Int64, ColumnEncoding::NullableInt64),
        Value::Float(_) => SchemaEntry::new(TargetType::Float64, ColumnEncoding::Float64),
        Value::Bool(_) => SchemaEntry::new(TargetType::Boolean, ColumnEncoding::NullableBoolean),
        Value::Timestamp(_) => SchemaEntry::new(TargetType::Timestamp, ColumnEncoding::TimestampMillis),
    }
}

/// Infer from the first non-null value of a column, or string when every
/// sample is null.
pub fn infer_from_samples<'a>(samples: impl IntoIterator<Item = &'a Value>) -> SchemaEntry {
    match samples.into_iter().find(|v| !v.is_null()) {
        Some(first) => infer_column_schema(first),
        None => infer_column_schema(&Value::Null),
    }
}

/// Replace spaces with underscores and cap the length.
pub fn sanitize_column_name(name: &str) -> String {
    name.replace(' ', "_").chars().take(MAX_COLUMN_NAME_LEN).collect()
}

/// Outcome of [`SchemaRegistry::bootstrap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bootstrap {
    /// Schema restored from the checkpoint store.
    Loaded { columns: usize },
    /// Schema inferred from a sample of the source collection.
    Inferred { columns: usize, sampled: usize },
}

#[derive(Debug, Default)]
struct TableState {
    /// Columns in first-seen order.
    columns: Vec<(String, SchemaEntry)>,
    index: HashMap<String, usize>,
    /// Source name -> sanitized name.
    renames: HashMap<String, String>,
}

impl TableState {
    fn from_parts(columns: Vec<(String, SchemaEntry)>, renames: HashMap<String, String>) -> Self {
        let index = columns
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (name.clone(), i))
            .collect();
        Self { columns, index, renames }
    }

    fn get(&self, name: &str) -> Option<&SchemaEntry> {
        self.index.get(name).map(|&i| &self.columns[i].1)
    }

    fn push(&mut self, name: String, entry: SchemaEntry) {
        self.index.insert(name.clone(), self.columns.len());
        self.columns.push((name, entry));
    }
}

/// Concurrent-safe registry of per-collection schemas.
///
/// Constructed once and shared by handle; unknown collections are lazily
/// restored from checkpoints on first access.
pub struct SchemaRegistry {
    checkpoints: Checkpoints,
    tables: RwLock<HashMap<String, Arc<Mutex<TableState>>>>,
}

impl SchemaRegistry {
    pub fn new(checkpoints: Checkpoints) -> Self {
        Self {
            checkpoints,
            tables: RwLock::new(HashMap::new()),
        }
    }

    async fn table(&self, collection: &str) -> Result<Arc<Mutex<TableState>>> {
        if let Some(table) = self.tables.read().await.get(collection) {
            return Ok(Arc::clone(table));
        }

        let mut tables = self.tables.write().await;
        if let Some(table) = tables.get(collection) {
            return Ok(Arc::clone(table));
        }
        let columns: Vec<(String, SchemaEntry)> = self
            .checkpoints
            .get_json(collection, keys::SCHEMA)
            .await?
            .unwrap_or_default();
        let renames: HashMap<String, String> = self
            .checkpoints
            .get_json(collection, keys::COLUMN_RENAMES)
            .await?
            .unwrap_or_default();
        let table = Arc::new(Mutex::new(TableState::from_parts(columns, renames)));
        tables.insert(collection.to_string(), Arc::clone(&table));
        Ok(table)
    }

    pub async fn get_column(&self, collection: &str, name: &str) -> Result<Option<SchemaEntry>> {
        let table = self.table(collection).await?;
        let state = table.lock().await;
        Ok(state.get(name).cloned())
    }

    pub async fn get_rename(&self, collection: &str, name: &str) -> Result<Option<String>> {
        let table = self.table(collection).await?;
        let state = table.lock().await;
        Ok(state.renames.get(name).cloned())
    }

    /// Append a column, persisting the whole table under the lock.
    ///
    /// If another caller registered `name` first, nothing changes and the
    /// existing entry is returned.
    pub async fn add_column(&self, collection: &str, name: &str, entry: SchemaEntry) -> Result<SchemaEntry> {
        let table = self.table(collection).await?;
        let mut state = table.lock().await;
        if let Some(existing) = state.get(name) {
            return Ok(existing.clone());
        }
        state.push(name.to_string(), entry.clone());
        if let Err(e) = self.checkpoints.set_json(collection, keys::SCHEMA, &state.columns).await {
            // Keep memory and store in step: drop the column we could not persist.
            state.columns.pop();
            state.index.remove(name);
            return Err(e);
        }
        info!(
            collection,
            column = name,
            target_type = ?entry.target_type,
            encoding = ?entry.target_encoding,
            "Registered new column"
        );
        crate::metrics::record_schema_column_added(collection);
        Ok(entry)
    }

    /// Record a rename, persisting the rename table under the lock.
    ///
    /// Returns the effective sanitized name (an earlier rename wins).
    pub async fn add_rename(&self, collection: &str, original: &str, renamed: &str) -> Result<String> {
        let table = self.table(collection).await?;
        let mut state = table.lock().await;
        if let Some(existing) = state.renames.get(original) {
            return Ok(existing.clone());
        }
        state.renames.insert(original.to_string(), renamed.to_string());
        if let Err(e) = self
            .checkpoints
            .set_json(collection, keys::COLUMN_RENAMES, &state.renames)
            .await
        {
            state.renames.remove(original);
            return Err(e);
        }
        debug!(collection, original, renamed, "Registered column rename");
        Ok(renamed.to_string())
    }

    /// Columns in first-seen order.
    pub async fn columns(&self, collection: &str) -> Result<Vec<(String, SchemaEntry)>> {
        let table = self.table(collection).await?;
        let state = table.lock().await;
        Ok(state.columns.clone())
    }

    pub async fn renames(&self, collection: &str) -> Result<HashMap<String, String>> {
        let table = self.table(collection).await?;
        let state = table.lock().await;
        Ok(state.renames.clone())
    }

    /// Load a persisted schema, or infer one from the first `sample_size`
    /// documents of the source collection and persist it. Sample reads are
    /// retried under `retry`.
    ///
    /// A loaded schema is never rewritten.
    pub async fn bootstrap<S: SourceRef + ?Sized>(
        &self,
        collection: &str,
        source: &S,
        sample_size: usize,
        retry: &RetryConfig,
    ) -> Result<Bootstrap> {
        let table = self.table(collection).await?;
        let mut state = table.lock().await;

        let persisted = self
            .checkpoints
            .get_json::<serde_json::Value>(collection, keys::SCHEMA)
            .await?
            .is_some();
        if persisted {
            info!(collection, columns = state.columns.len(), "Loaded schema from checkpoint");
            return Ok(Bootstrap::Loaded {
                columns: state.columns.len(),
            });
        }

        let max = retry_transient(retry, "max_key", || source.max_key(collection)).await?;
        let sample = match max {
            Some(upper) => {
                retry_transient(retry, "find_page", || {
                    source.find_page(collection, None, &upper, sample_size)
                })
                .await?
            }
            None => Vec::new(),
        };

        let mut inferred = TableState::default();
        for name in column_names(&sample) {
            let entry = infer_from_samples(sample.iter().filter_map(|doc| doc.get(&name)));
            let sanitized = sanitize_column_name(&name);
            let entry = if sanitized != name {
                inferred.renames.insert(name.clone(), sanitized.clone());
                entry.renamed_from(name.clone())
            } else {
                entry
            };
            if inferred.get(&sanitized).is_none() {
                inferred.push(sanitized, entry);
            }
        }

        self.checkpoints
            .set_json(collection, keys::SCHEMA, &inferred.columns)
            .await?;
        self.checkpoints
            .set_json(collection, keys::COLUMN_RENAMES, &inferred.renames)
            .await?;

        let columns = inferred.columns.len();
        *state = inferred;
        info!(collection, columns, sampled = sample.len(), "Inferred schema from source sample");
        Ok(Bootstrap::Inferred {
            columns,
            sampled: sample.len(),
        })
    }
}

/// Distinct field names across documents, in first-seen order.
fn column_names(docs: &[Document]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut names = Vec::new();
    for doc in docs {
        for (name, _) in doc.iter() {
            if seen.insert(name.clone()) {
                names.push(name.clone());
            }
        }
    }
    names
}
