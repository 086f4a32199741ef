//! In-memory [`BulkStore`] for tests and dry runs.
//!
//! Tables are keyed by table name and enforce business-key and `unique`
//! field constraints the way the PostgreSQL schema does. Failures can be
//! injected to exercise retry and fallback paths.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tabload_core::registry::EntityDescriptor;
use tabload_core::validation::key_tuple_of;
use tabload_core::value::{CellValue, Record};

use crate::error::StoreError;
use crate::store::{sequence_rank, BulkStore, KeyTuple, WriteMode};

/// A call observed by the store, for assertions in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    ExistingKeys { table: String, keys: usize },
    BulkWrite { table: String, rows: usize, mode: WriteMode },
    Isolated { table: String, rows: usize, mode: WriteMode },
    ResolveReferences { table: String, keys: usize },
    MaxWithPrefix { table: String, column: String },
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, Vec<Record>>,
    calls: Vec<StoreCall>,
    /// Errors returned by the next bulk writes, consumed front first.
    pending_failures: Vec<StoreError>,
    /// `(field, value)` pairs whose records are rejected as constraint
    /// violations.
    rejected_values: Vec<(String, CellValue)>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a table.
    pub fn seed(&self, entity: &EntityDescriptor, records: Vec<Record>) {
        let mut state = self.lock();
        state
            .tables
            .entry(entity.table.clone())
            .or_default()
            .extend(records);
    }

    /// Fail the next `times` bulk writes with `error`.
    pub fn fail_next_bulk_writes(&self, times: usize, error: StoreError) {
        let mut state = self.lock();
        state
            .pending_failures
            .extend(std::iter::repeat(error).take(times));
    }

    /// Reject any record whose `field` equals `value`, in bulk and
    /// isolated writes alike.
    pub fn reject_value(&self, field: &str, value: CellValue) {
        self.lock().rejected_values.push((field.to_string(), value));
    }

    pub fn records(&self, entity: &EntityDescriptor) -> Vec<Record> {
        self.lock()
            .tables
            .get(&entity.table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the lock only happens in a failing test.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Column groups that must be unique: the business key and each `unique`
/// field.
fn unique_groups(entity: &EntityDescriptor) -> Vec<Vec<String>> {
    let mut groups = Vec::new();
    if entity.has_business_key() {
        groups.push(entity.business_key.clone());
    }
    for field in entity.fields.iter().filter(|f| f.unique) {
        let single = vec![field.name.clone()];
        if !groups.contains(&single) {
            groups.push(single);
        }
    }
    groups
}

impl State {
    fn check_rejected(&self, record: &Record) -> Result<(), StoreError> {
        for (field, value) in &self.rejected_values {
            if record.get(field) == Some(value) {
                return Err(StoreError::ConstraintViolation(format!(
                    "value '{value}' rejected for column {field}"
                )));
            }
        }
        Ok(())
    }

    /// Apply one record to `table`, enforcing uniqueness.
    fn apply(
        &mut self,
        entity: &EntityDescriptor,
        record: &Record,
        mode: WriteMode,
    ) -> Result<(), StoreError> {
        self.check_rejected(record)?;
        let table = self.tables.entry(entity.table.clone()).or_default();

        let existing_idx = match mode {
            WriteMode::Upsert => key_tuple_of(record, &entity.business_key).and_then(|key| {
                table
                    .iter()
                    .position(|r| key_tuple_of(r, &entity.business_key).as_ref() == Some(&key))
            }),
            WriteMode::Insert => None,
        };

        for group in unique_groups(entity) {
            let Some(key) = key_tuple_of(record, &group) else {
                continue;
            };
            let clash = table.iter().enumerate().any(|(idx, r)| {
                Some(idx) != existing_idx && key_tuple_of(r, &group).as_ref() == Some(&key)
            });
            if clash {
                return Err(StoreError::UniqueViolation(format!(
                    "duplicate key value ({}) = ({}) in {}",
                    group.join(", "),
                    key.join(", "),
                    entity.table
                )));
            }
        }

        match existing_idx {
            Some(idx) => {
                let target = &mut table[idx];
                for (column, value) in record {
                    if !entity.is_update_protected(column) {
                        target.insert(column.clone(), value.clone());
                    }
                }
            }
            None => table.push(record.clone()),
        }
        Ok(())
    }
}

#[async_trait]
impl BulkStore for MemoryStore {
    async fn existing_keys(
        &self,
        entity: &EntityDescriptor,
        keys: &[KeyTuple],
    ) -> Result<HashSet<KeyTuple>, StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::ExistingKeys {
            table: entity.table.clone(),
            keys: keys.len(),
        });
        let wanted: HashSet<&KeyTuple> = keys.iter().collect();
        Ok(state
            .tables
            .get(&entity.table)
            .map(|rows| {
                rows.iter()
                    .filter_map(|r| key_tuple_of(r, &entity.business_key))
                    .filter(|k| wanted.contains(k))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn bulk_write(
        &self,
        entity: &EntityDescriptor,
        records: &[Record],
        mode: WriteMode,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::BulkWrite {
            table: entity.table.clone(),
            rows: records.len(),
            mode,
        });
        if !state.pending_failures.is_empty() {
            return Err(state.pending_failures.remove(0));
        }

        // All or nothing: apply to a scratch copy, then swap in.
        let snapshot = state.tables.get(&entity.table).cloned();
        for record in records {
            if let Err(e) = state.apply(entity, record, mode) {
                match snapshot {
                    Some(rows) => state.tables.insert(entity.table.clone(), rows),
                    None => state.tables.remove(&entity.table),
                };
                return Err(e);
            }
        }
        Ok(())
    }

    async fn write_each_isolated(
        &self,
        entity: &EntityDescriptor,
        records: &[Record],
        mode: WriteMode,
    ) -> Result<Vec<Result<(), StoreError>>, StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::Isolated {
            table: entity.table.clone(),
            rows: records.len(),
            mode,
        });
        Ok(records
            .iter()
            .map(|record| state.apply(entity, record, mode))
            .collect())
    }

    async fn resolve_references(
        &self,
        target: &EntityDescriptor,
        lookup_field: &str,
        value_column: &str,
        keys: &[String],
    ) -> Result<HashMap<String, CellValue>, StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::ResolveReferences {
            table: target.table.clone(),
            keys: keys.len(),
        });
        let wanted: HashSet<&str> = keys.iter().map(String::as_str).collect();
        let mut resolved = HashMap::new();
        for record in state.tables.get(&target.table).into_iter().flatten() {
            let Some(lookup) = record.get(lookup_field).and_then(CellValue::key_text) else {
                continue;
            };
            if wanted.contains(lookup.as_str()) {
                if let Some(value) = record.get(value_column) {
                    resolved.insert(lookup, value.clone());
                }
            }
        }
        Ok(resolved)
    }

    async fn max_with_prefix(
        &self,
        entity: &EntityDescriptor,
        column: &str,
        prefix: &str,
    ) -> Result<Option<String>, StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::MaxWithPrefix {
            table: entity.table.clone(),
            column: column.to_string(),
        });
        Ok(state
            .tables
            .get(&entity.table)
            .into_iter()
            .flatten()
            .filter_map(|r| r.get(column).and_then(CellValue::key_text))
            .filter(|v| v.starts_with(prefix))
            .max_by(|a, b| sequence_rank(a).cmp(&sequence_rank(b))))
    }

    async fn fetch_by_key(
        &self,
        entity: &EntityDescriptor,
        key: &[String],
    ) -> Result<Option<Record>, StoreError> {
        let state = self.lock();
        Ok(state.tables.get(&entity.table).and_then(|rows| {
            rows.iter()
                .find(|r| key_tuple_of(r, &entity.business_key).as_deref() == Some(key))
                .cloned()
        }))
    }
}
