//! PostgreSQL [`BulkStore`] on `sqlx`.
//!
//! Statements are assembled with `QueryBuilder` from the entity descriptor.
//! Table and column names come from the registry, never from file content,
//! so they are interpolated; every value is bound.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Acquire, Postgres, QueryBuilder, Row};
use tabload_core::registry::{EntityDescriptor, FieldKind, IdentityStrategy};
use tabload_core::timestamps::to_utc;
use tabload_core::value::{CellValue, Record};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{write_columns, BulkStore, KeyTuple, WriteMode};
use crate::DbPool;

/// Storage type of a column, derived from the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Text,
    BigInt,
    Float,
    Bool,
    Date,
    Timestamp,
    Uuid,
}

impl ColumnType {
    fn of(entity: &EntityDescriptor, column: &str) -> Self {
        if let Some(identity) = entity.identity.as_ref().filter(|i| i.column == column) {
            return match identity.strategy {
                IdentityStrategy::Uuid => Self::Uuid,
                IdentityStrategy::Database => Self::BigInt,
            };
        }
        if entity.audit.created_at.as_deref() == Some(column)
            || entity.audit.updated_at.as_deref() == Some(column)
        {
            return Self::Timestamp;
        }
        match entity.get_field(column).map(|f| f.kind) {
            Some(FieldKind::Integer) => Self::BigInt,
            Some(FieldKind::Decimal) => Self::Float,
            Some(FieldKind::Boolean) => Self::Bool,
            Some(FieldKind::Date) => Self::Date,
            Some(FieldKind::Datetime) => Self::Timestamp,
            // References store the target's UUID identity.
            Some(FieldKind::Reference) => Self::Uuid,
            _ => Self::Text,
        }
    }

    /// Select expression decoding cleanly into this type.
    fn select_expr(&self, column: &str) -> String {
        match self {
            Self::Float => format!("{column}::float8 AS {column}"),
            Self::BigInt => format!("{column}::int8 AS {column}"),
            _ => column.to_string(),
        }
    }

    fn decode(&self, row: &PgRow, column: &str) -> Result<CellValue, sqlx::Error> {
        Ok(match self {
            Self::Text => row.try_get::<Option<String>, _>(column)?.into(),
            Self::BigInt => row.try_get::<Option<i64>, _>(column)?.into(),
            Self::Float => row.try_get::<Option<f64>, _>(column)?.into(),
            Self::Bool => row.try_get::<Option<bool>, _>(column)?.into(),
            Self::Date => row
                .try_get::<Option<NaiveDate>, _>(column)?
                .map_or(CellValue::Null, CellValue::Date),
            Self::Timestamp => row
                .try_get::<Option<DateTime<Utc>>, _>(column)?
                .map_or(CellValue::Null, |dt| CellValue::DateTime(dt.fixed_offset())),
            Self::Uuid => row
                .try_get::<Option<Uuid>, _>(column)?
                .map_or(CellValue::Null, CellValue::Uuid),
        })
    }
}

/// Bind one value. Timestamps are forced to UTC right here, at the last
/// step before the statement is sent.
fn push_value(sep: &mut sqlx::query_builder::Separated<'_, '_, Postgres, &str>, value: &CellValue) {
    match to_utc(value) {
        CellValue::Null => {
            sep.push("NULL");
        }
        CellValue::Text(s) => {
            sep.push_bind(s);
        }
        CellValue::Integer(i) => {
            sep.push_bind(i);
        }
        CellValue::Decimal(f) => {
            sep.push_bind(f);
        }
        CellValue::Boolean(b) => {
            sep.push_bind(b);
        }
        CellValue::Date(d) => {
            sep.push_bind(d);
        }
        CellValue::DateTime(dt) => {
            sep.push_bind(dt.with_timezone(&Utc));
        }
        CellValue::LocalDateTime(naive) => {
            sep.push_bind(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));
        }
        CellValue::Uuid(u) => {
            sep.push_bind(u);
        }
    }
}

fn build_write(
    entity: &EntityDescriptor,
    columns: &[String],
    records: &[Record],
    mode: WriteMode,
) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) ",
        entity.table,
        columns.join(", ")
    ));
    qb.push_values(records, |mut row, record| {
        for column in columns {
            push_value(&mut row, record.get(column).unwrap_or(&CellValue::Null));
        }
    });

    if mode == WriteMode::Upsert {
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !entity.is_update_protected(c))
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect();
        qb.push(format!(" ON CONFLICT ({}) ", entity.business_key.join(", ")));
        if updates.is_empty() {
            qb.push("DO NOTHING");
        } else {
            qb.push(format!("DO UPDATE SET {}", updates.join(", ")));
        }
    }
    qb
}

/// Append `col::text = ANY($n)` filters, one per key column.
fn push_key_filter(qb: &mut QueryBuilder<'_, Postgres>, key_fields: &[String], keys: &[KeyTuple]) {
    for (idx, field) in key_fields.iter().enumerate() {
        qb.push(if idx == 0 { " WHERE " } else { " AND " });
        let values: Vec<String> = keys.iter().filter_map(|k| k.get(idx).cloned()).collect();
        qb.push(format!("{field}::text = ANY("));
        qb.push_bind(values);
        qb.push(")");
    }
}

/// Escape `LIKE` wildcards; backslash is the default escape character.
fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// PostgreSQL implementation of [`BulkStore`].
#[derive(Debug, Clone)]
pub struct PgBulkStore {
    pool: DbPool,
}

impl PgBulkStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl BulkStore for PgBulkStore {
    async fn existing_keys(
        &self,
        entity: &EntityDescriptor,
        keys: &[KeyTuple],
    ) -> Result<HashSet<KeyTuple>, StoreError> {
        if keys.is_empty() || !entity.has_business_key() {
            return Ok(HashSet::new());
        }
        let select: Vec<String> = entity
            .business_key
            .iter()
            .map(|f| format!("{f}::text"))
            .collect();
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM {}",
            select.join(", "),
            entity.table
        ));
        push_key_filter(&mut qb, &entity.business_key, keys);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let wanted: HashSet<&KeyTuple> = keys.iter().collect();
        let mut found = HashSet::new();
        for row in rows {
            let tuple = (0..entity.business_key.len())
                .map(|idx| row.try_get::<String, _>(idx))
                .collect::<Result<KeyTuple, _>>()?;
            // Per-column ANY filters over-match composite keys.
            if wanted.contains(&tuple) {
                found.insert(tuple);
            }
        }
        Ok(found)
    }

    async fn bulk_write(
        &self,
        entity: &EntityDescriptor,
        records: &[Record],
        mode: WriteMode,
    ) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let columns = write_columns(entity, records);
        let mut tx = self.pool.begin().await?;
        build_write(entity, &columns, records, mode)
            .build()
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::debug!(table = %entity.table, rows = records.len(), ?mode, "Bulk write committed");
        Ok(())
    }

    async fn write_each_isolated(
        &self,
        entity: &EntityDescriptor,
        records: &[Record],
        mode: WriteMode,
    ) -> Result<Vec<Result<(), StoreError>>, StoreError> {
        let columns = write_columns(entity, records);
        let mut tx = self.pool.begin().await?;
        let mut results = Vec::with_capacity(records.len());

        for record in records {
            let mut savepoint = tx.begin().await?;
            let outcome = build_write(entity, &columns, std::slice::from_ref(record), mode)
                .build()
                .execute(&mut *savepoint)
                .await;
            match outcome {
                Ok(_) => {
                    savepoint.commit().await?;
                    results.push(Ok(()));
                }
                Err(e) => {
                    savepoint.rollback().await?;
                    results.push(Err(StoreError::from(e)));
                }
            }
        }

        tx.commit().await?;
        Ok(results)
    }

    async fn resolve_references(
        &self,
        target: &EntityDescriptor,
        lookup_field: &str,
        value_column: &str,
        keys: &[String],
    ) -> Result<HashMap<String, CellValue>, StoreError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let value_type = ColumnType::of(target, value_column);
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {lookup_field}::text AS lookup_key, {} FROM {}",
            value_type.select_expr(value_column),
            target.table
        ));
        qb.push(format!(" WHERE {lookup_field}::text = ANY("));
        qb.push_bind(keys.to_vec());
        qb.push(")");

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut resolved = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("lookup_key")?;
            resolved.insert(key, value_type.decode(&row, value_column)?);
        }
        Ok(resolved)
    }

    async fn max_with_prefix(
        &self,
        entity: &EntityDescriptor,
        column: &str,
        prefix: &str,
    ) -> Result<Option<String>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {column}::text FROM {} WHERE {column}::text LIKE ",
            entity.table
        ));
        qb.push_bind(format!("{}%", escape_like(prefix)));
        qb.push(format!(" ORDER BY length({column}::text) DESC, {column}::text DESC LIMIT 1"));

        let row = qb.build().fetch_optional(&self.pool).await?;
        Ok(row.map(|r| r.try_get::<String, _>(0)).transpose()?)
    }

    async fn fetch_by_key(
        &self,
        entity: &EntityDescriptor,
        key: &[String],
    ) -> Result<Option<Record>, StoreError> {
        if !entity.has_business_key() {
            return Ok(None);
        }
        let mut columns: Vec<String> = entity.identity.iter().map(|i| i.column.clone()).collect();
        columns.extend(entity.fields.iter().map(|f| f.name.clone()));
        columns.extend(entity.audit.created_at.iter().cloned());
        columns.extend(entity.audit.updated_at.iter().cloned());
        let types: Vec<ColumnType> = columns.iter().map(|c| ColumnType::of(entity, c)).collect();

        let select: Vec<String> = columns
            .iter()
            .zip(&types)
            .map(|(c, t)| t.select_expr(c))
            .collect();
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM {}",
            select.join(", "),
            entity.table
        ));
        push_key_filter(&mut qb, &entity.business_key, &[key.to_vec()]);
        qb.push(" LIMIT 1");

        let Some(row) = qb.build().fetch_optional(&self.pool).await? else {
            return Ok(None);
        };
        let mut record = Record::with_capacity(columns.len());
        for (column, ty) in columns.iter().zip(&types) {
            record.insert(column.clone(), ty.decode(&row, column)?);
        }
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabload_core::registry::catalog;

    fn make_record() -> Record {
        let mut r = Record::new();
        r.insert("id".into(), CellValue::Uuid(Uuid::nil()));
        r.insert("sku".into(), CellValue::text("A-1"));
        r.insert("name".into(), CellValue::text("Widget"));
        r.insert("created_at".into(), CellValue::Null);
        r.insert("updated_at".into(), CellValue::Null);
        r
    }

    #[test]
    fn column_types_follow_descriptor() {
        let product = catalog::product();
        assert_eq!(ColumnType::of(&product, "id"), ColumnType::Uuid);
        assert_eq!(ColumnType::of(&product, "quantity"), ColumnType::BigInt);
        assert_eq!(ColumnType::of(&product, "unit_price"), ColumnType::Float);
        assert_eq!(ColumnType::of(&product, "launched_at"), ColumnType::Timestamp);
        assert_eq!(ColumnType::of(&product, "created_at"), ColumnType::Timestamp);
        assert_eq!(ColumnType::of(&product, "sku"), ColumnType::Text);
    }

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(escape_like("PRT-"), "PRT-");
        assert_eq!(escape_like("A_B%"), "A\\_B\\%");
    }

    #[test]
    fn insert_statement_shape() {
        let product = catalog::product();
        let records = vec![make_record()];
        let columns = write_columns(&product, &records);
        let qb = build_write(&product, &columns, &records, WriteMode::Insert);
        let sql = qb.sql();
        assert!(sql.starts_with("INSERT INTO products (id, sku, name, created_at, updated_at) VALUES ("));
        assert!(!sql.contains("ON CONFLICT"));
        // Null values are emitted inline.
        assert!(sql.contains("NULL"));
    }

    #[test]
    fn upsert_excludes_protected_columns() {
        let product = catalog::product();
        let records = vec![make_record()];
        let columns = write_columns(&product, &records);
        let qb = build_write(&product, &columns, &records, WriteMode::Upsert);
        let sql = qb.sql();
        assert!(sql.contains("ON CONFLICT (sku) DO UPDATE SET name = EXCLUDED.name, updated_at = EXCLUDED.updated_at"));
        assert!(!sql.contains("id = EXCLUDED.id"));
        assert!(!sql.contains("created_at = EXCLUDED"));
        assert!(!sql.contains("sku = EXCLUDED"));
    }
}
