//! The persistence boundary consumed by the bulk write executor.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tabload_core::registry::EntityDescriptor;
use tabload_core::value::{CellValue, Record};

use crate::error::StoreError;

/// Business-key values of one record, in key field order, as canonical text.
pub type KeyTuple = Vec<String>;

/// Statement shape for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Plain insert; a business-key clash is a unique violation.
    Insert,
    /// Insert, or update the row sharing the business key. The update set
    /// excludes identity, creation-audit, and business-key columns.
    Upsert,
}

/// Bulk persistence operations for entity records.
///
/// Every chunk-level write runs in its own transaction: either all records
/// of the call are written or none are.
#[async_trait]
pub trait BulkStore: Send + Sync {
    /// Of `keys`, the tuples that already exist for `entity`.
    async fn existing_keys(
        &self,
        entity: &EntityDescriptor,
        keys: &[KeyTuple],
    ) -> Result<HashSet<KeyTuple>, StoreError>;

    /// Write all `records` in one statement and one transaction.
    async fn bulk_write(
        &self,
        entity: &EntityDescriptor,
        records: &[Record],
        mode: WriteMode,
    ) -> Result<(), StoreError>;

    /// Write `records` one at a time, each inside its own savepoint of a
    /// shared transaction. A failing row is rolled back alone. The outer
    /// `Err` is reserved for failures of the transaction itself.
    async fn write_each_isolated(
        &self,
        entity: &EntityDescriptor,
        records: &[Record],
        mode: WriteMode,
    ) -> Result<Vec<Result<(), StoreError>>, StoreError>;

    /// Map lookup keys to the value of `value_column` on the `target`
    /// record whose `lookup_field` matches. Unknown keys are absent.
    async fn resolve_references(
        &self,
        target: &EntityDescriptor,
        lookup_field: &str,
        value_column: &str,
        keys: &[String],
    ) -> Result<HashMap<String, CellValue>, StoreError>;

    /// Highest stored value of text `column` starting with `prefix`.
    /// Longer values rank higher, so zero-padded sequences compare by
    /// number.
    async fn max_with_prefix(
        &self,
        entity: &EntityDescriptor,
        column: &str,
        prefix: &str,
    ) -> Result<Option<String>, StoreError>;

    /// Read back one record by business key.
    async fn fetch_by_key(
        &self,
        entity: &EntityDescriptor,
        key: &[String],
    ) -> Result<Option<Record>, StoreError>;
}

/// Orders sequence values: longer first, then by text.
pub fn sequence_rank(value: &str) -> (usize, &str) {
    (value.len(), value)
}

/// Columns written for `records`: identity, then fields in descriptor
/// order, then audit columns; each only if some record carries it.
pub fn write_columns(entity: &EntityDescriptor, records: &[Record]) -> Vec<String> {
    let present = |column: &str| records.iter().any(|r| r.contains_key(column));

    let mut columns = Vec::new();
    if let Some(identity) = &entity.identity {
        if present(&identity.column) {
            columns.push(identity.column.clone());
        }
    }
    columns.extend(
        entity
            .fields
            .iter()
            .map(|f| f.name.clone())
            .filter(|name| present(name)),
    );
    for audit in [&entity.audit.created_at, &entity.audit.updated_at]
        .into_iter()
        .flatten()
    {
        if present(audit) && !columns.contains(audit) {
            columns.push(audit.clone());
        }
    }
    columns
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabload_core::registry::{FieldDescriptor, FieldKind};

    #[test]
    fn sequence_rank_orders_by_length_first() {
        let mut codes = vec!["PRT-1000000", "PRT-999999", "PRT-000002"];
        codes.sort_by_key(|c| sequence_rank(c));
        assert_eq!(codes, vec!["PRT-000002", "PRT-999999", "PRT-1000000"]);
    }

    #[test]
    fn write_columns_order_and_presence() {
        let entity = EntityDescriptor::new("thing", "Thing")
            .field(FieldDescriptor::new("code", "Code", FieldKind::Text))
            .field(FieldDescriptor::new("notes", "Notes", FieldKind::Text))
            .field(FieldDescriptor::new("name", "Name", FieldKind::Text))
            .uuid_identity("id")
            .audit_columns("created_at", "updated_at");

        let mut record = Record::new();
        record.insert("updated_at".into(), CellValue::Null);
        record.insert("name".into(), CellValue::text("n"));
        record.insert("id".into(), CellValue::Null);
        record.insert("code".into(), CellValue::text("c"));

        assert_eq!(
            write_columns(&entity, &[record]),
            vec!["id", "code", "name", "updated_at"]
        );
    }
}
