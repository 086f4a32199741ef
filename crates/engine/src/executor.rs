//! Bulk write executor: turns one batch of resolved rows into chunked
//! store writes under a write policy.
//!
//! Per call the executor moves `Validating -> Writing -> terminal`:
//!
//! 1. resolve reference fields against the target entity's records,
//! 2. drop rows that are invalid, repeat a key within the batch, or clash
//!    with the policy (existing key under create-only, missing key under
//!    update-only),
//! 3. stamp identity, generated fields (continuing after stored codes), and
//!    one unified audit timestamp,
//! 4. write fixed-size chunks, retrying transient failures with backoff,
//! 5. after retries are spent, either fall back to per-row writes
//!    (`skip_errors`) or fail the chunk and abort the rest.
//!
//! Update-only matches rows to existing keys before writing and then
//! writes them as upserts. A record deleted between the check and the write
//! is therefore re-created rather than reported missing.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tabload_core::coercion::{ErrorKind, ValidationError};
use tabload_core::error::CoreError;
use tabload_core::outcome::{
    RowError, WriteOutcomeCounters, WritePolicy, WriteState, DEFAULT_MAX_ERROR_SAMPLES,
};
use tabload_core::registry::{EntityDescriptor, EntityRegistry, FieldKind, IdentityStrategy};
use tabload_core::retry::RetryPolicy;
use tabload_core::timestamps::{enforce_utc, timestamp_value, unified_timestamp};
use tabload_core::types::DbId;
use tabload_core::validation::{ResolvedRow, UniquenessTracker};
use tabload_core::value::{CellValue, Record};
use tabload_db::{BulkStore, KeyTuple, StoreError, WriteMode};

use crate::config::DEFAULT_CHUNK_SIZE;
use crate::error::EngineResult;

/// A row cleared for writing.
#[derive(Debug)]
struct PendingRow {
    row_number: usize,
    record: Record,
    /// Whether the business key matched a stored record before the write.
    existed: bool,
}

pub struct BulkWriteExecutor {
    store: Arc<dyn BulkStore>,
    registry: Arc<EntityRegistry>,
    retry: RetryPolicy,
    chunk_size: usize,
    max_error_samples: usize,
}

impl BulkWriteExecutor {
    pub fn new(store: Arc<dyn BulkStore>, registry: Arc<EntityRegistry>) -> Self {
        Self {
            store,
            registry,
            retry: RetryPolicy::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_error_samples: DEFAULT_MAX_ERROR_SAMPLES,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_max_error_samples(mut self, max: usize) -> Self {
        self.max_error_samples = max;
        self
    }

    /// Write one batch of rows. Rows are reported in the order given.
    ///
    /// Only structural problems (a policy the entity cannot support, an
    /// unknown reference target, a failed key lookup) are returned as
    /// errors; everything row-level lands in the counters.
    pub async fn execute(
        &self,
        entity: &EntityDescriptor,
        rows: Vec<ResolvedRow>,
        policy: WritePolicy,
        skip_errors: bool,
    ) -> EngineResult<WriteOutcomeCounters> {
        let started = Instant::now();
        if policy.requires_business_key() && !entity.has_business_key() {
            return Err(CoreError::Validation(format!(
                "Entity '{}' has no business key; the {policy} policy needs one",
                entity.name
            ))
            .into());
        }

        let mut counters = WriteOutcomeCounters::new(self.max_error_samples);
        tracing::debug!(
            entity = %entity.name,
            rows = rows.len(),
            %policy,
            skip_errors,
            state = %WriteState::Validating,
            "Bulk write started",
        );

        let mut rows = rows;
        self.resolve_references(entity, &mut rows).await?;

        // -- in-batch validation --
        let mut tracker = UniquenessTracker::new(entity);
        let mut candidates = Vec::with_capacity(rows.len());
        let mut invalid_rows = 0;
        for mut row in rows {
            if row.is_valid() && policy.requires_business_key() && row.key_tuple(entity).is_none() {
                row.push_error(ValidationError::new(
                    &entity.business_key.join(","),
                    ErrorKind::RequiredFieldMissing,
                    format!("{} is needed to match existing records", entity.business_key.join(" + ")),
                    None,
                ));
            }
            if row.is_skip_only() {
                counters.reject_row(row_errors(&row), true);
                continue;
            }
            if !row.is_valid() {
                invalid_rows += 1;
                counters.reject_row(row_errors(&row), skip_errors);
                continue;
            }
            if tracker.check(&mut row) {
                counters.reject_row(row_errors(&row), true);
                continue;
            }
            candidates.push(row);
        }

        if invalid_rows > 0 && !skip_errors {
            counters.mark_unprocessed(candidates.len());
            counters.aborted = true;
            return Ok(self.finish(entity, counters, started));
        }

        // -- pre-existing keys --
        let existing = self.existing_keys(entity, &candidates).await?;
        let mut pending = Vec::with_capacity(candidates.len());
        for row in candidates {
            let existed = row
                .key_tuple(entity)
                .is_some_and(|key| existing.contains(&key));
            match policy {
                WritePolicy::CreateOnly if existed => counters.reject_row(
                    vec![RowError::row(
                        row.row_number,
                        ErrorKind::DuplicateKey,
                        format!("A {} with this {} already exists", entity.label, entity.business_key.join(" + ")),
                    )],
                    true,
                ),
                WritePolicy::UpdateOnly if !existed => counters.reject_row(
                    vec![RowError::row(
                        row.row_number,
                        ErrorKind::RecordNotFound,
                        format!("No {} with this {} exists", entity.label, entity.business_key.join(" + ")),
                    )],
                    true,
                ),
                _ => pending.push(PendingRow {
                    row_number: row.row_number,
                    record: row.values,
                    existed,
                }),
            }
        }

        self.resume_generators(entity, &pending).await?;
        normalize(entity, &mut pending);

        // -- chunked writes --
        let mode = match policy {
            WritePolicy::CreateOnly => WriteMode::Insert,
            WritePolicy::UpdateOnly | WritePolicy::Upsert => WriteMode::Upsert,
        };
        tracing::debug!(
            entity = %entity.name,
            rows = pending.len(),
            chunks = pending.len().div_ceil(self.chunk_size),
            state = %WriteState::Writing,
            "Writing chunks",
        );

        let mut written_through = 0;
        for chunk in pending.chunks(self.chunk_size) {
            written_through += chunk.len();
            // Offsets can be lost in any copy above; assert UTC once more.
            let records: Vec<Record> = chunk
                .iter()
                .map(|p| {
                    let mut record = p.record.clone();
                    enforce_utc(&mut record);
                    record
                })
                .collect();

            match self.write_chunk(entity, &records, mode).await {
                Ok(()) => {
                    for row in chunk {
                        count_success(&mut counters, row, policy);
                    }
                }
                Err(e) if skip_errors => {
                    self.write_rows_individually(entity, chunk, &records, mode, policy, &mut counters, &e)
                        .await;
                }
                Err(e) => {
                    tracing::error!(
                        entity = %entity.name,
                        rows = chunk.len(),
                        error = %e,
                        "Chunk write failed, aborting remaining chunks",
                    );
                    for row in chunk {
                        counters.reject_row(vec![store_error(row.row_number, &e)], false);
                    }
                    counters.mark_unprocessed(pending.len() - written_through);
                    counters.aborted = true;
                    break;
                }
            }
        }

        Ok(self.finish(entity, counters, started))
    }

    /// Replace reference lookup keys with the target's value column. A
    /// required reference that matches nothing invalidates the row; an
    /// optional one becomes null with a warning.
    pub(crate) async fn resolve_references(
        &self,
        entity: &EntityDescriptor,
        rows: &mut [ResolvedRow],
    ) -> EngineResult<()> {
        for field in entity.fields.iter().filter(|f| f.kind == FieldKind::Reference) {
            let Some(reference) = &field.reference else {
                continue;
            };
            let keys: BTreeSet<String> = rows
                .iter()
                .filter(|r| r.is_valid())
                .filter_map(|r| r.values.get(&field.name).and_then(CellValue::key_text))
                .collect();
            if keys.is_empty() {
                continue;
            }

            let target = self.registry.describe(&reference.entity)?;
            let keys: Vec<String> = keys.into_iter().collect();
            let resolved = self
                .store
                .resolve_references(&target, &reference.lookup_field, &reference.value_column, &keys)
                .await?;
            tracing::debug!(
                field = %field.name,
                target = %target.name,
                keys = keys.len(),
                resolved = resolved.len(),
                "References resolved",
            );

            for row in rows.iter_mut().filter(|r| r.is_valid()) {
                let Some(key) = row.values.get(&field.name).and_then(CellValue::key_text) else {
                    continue;
                };
                match resolved.get(&key) {
                    Some(value) => {
                        row.values.insert(field.name.clone(), value.clone());
                    }
                    None if field.required => {
                        let raw = CellValue::Text(key.clone());
                        row.push_error(ValidationError::new(
                            &field.name,
                            ErrorKind::MissingRequiredReference,
                            format!("No {} with {} '{key}'", target.label, reference.lookup_field),
                            Some(&raw),
                        ));
                    }
                    None => {
                        row.warnings.push(format!(
                            "{}: no {} with {} '{key}', left empty",
                            field.label, target.label, reference.lookup_field
                        ));
                        row.values.insert(field.name.clone(), CellValue::Null);
                    }
                }
            }
        }
        Ok(())
    }

    /// Move sequence generators past the values already stored, so codes
    /// generated by an earlier process are not handed out again.
    async fn resume_generators(
        &self,
        entity: &EntityDescriptor,
        pending: &[PendingRow],
    ) -> EngineResult<()> {
        for field in &entity.fields {
            let Some(generator) = &field.generator else {
                continue;
            };
            if pending.iter().all(|p| p.record.contains_key(&field.name)) {
                continue;
            }
            let Some(prefix) = generator.stored_prefix() else {
                continue;
            };
            if let Some(last) = self.store.max_with_prefix(entity, &field.name, &prefix).await? {
                tracing::debug!(field = %field.name, %last, "Generator resumed after stored value");
                generator.resume_after(&last);
            }
        }
        Ok(())
    }

    async fn existing_keys(
        &self,
        entity: &EntityDescriptor,
        rows: &[ResolvedRow],
    ) -> EngineResult<HashSet<KeyTuple>> {
        if !entity.has_business_key() || rows.is_empty() {
            return Ok(HashSet::new());
        }
        let keys: Vec<KeyTuple> = rows.iter().filter_map(|r| r.key_tuple(entity)).collect();
        Ok(self.store.existing_keys(entity, &keys).await?)
    }

    /// One bulk statement, retried while the failure is transient and the
    /// attempt budget lasts.
    async fn write_chunk(
        &self,
        entity: &EntityDescriptor,
        records: &[Record],
        mode: WriteMode,
    ) -> Result<(), StoreError> {
        let mut attempt = 1;
        loop {
            match self.store.bulk_write(entity, records, mode).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_after(attempt);
                    tracing::warn!(
                        entity = %entity.name,
                        rows = records.len(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Chunk write failed, retrying",
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_rows_individually(
        &self,
        entity: &EntityDescriptor,
        chunk: &[PendingRow],
        records: &[Record],
        mode: WriteMode,
        policy: WritePolicy,
        counters: &mut WriteOutcomeCounters,
        cause: &StoreError,
    ) {
        tracing::warn!(
            entity = %entity.name,
            rows = chunk.len(),
            error = %cause,
            "Chunk write failed, falling back to per-row writes",
        );
        match self.store.write_each_isolated(entity, records, mode).await {
            Ok(results) => {
                for (row, result) in chunk.iter().zip(results) {
                    match result {
                        Ok(()) => count_success(counters, row, policy),
                        Err(e) => counters.reject_row(vec![store_error(row.row_number, &e)], true),
                    }
                }
            }
            Err(e) => {
                tracing::error!(entity = %entity.name, error = %e, "Per-row fallback failed");
                for row in chunk {
                    counters.reject_row(vec![store_error(row.row_number, &e)], true);
                }
            }
        }
    }

    fn finish(
        &self,
        entity: &EntityDescriptor,
        mut counters: WriteOutcomeCounters,
        started: Instant,
    ) -> WriteOutcomeCounters {
        counters.finish(started.elapsed());
        let state = WriteState::terminal_for(&counters);
        tracing::info!(
            entity = %entity.name,
            state = %state,
            created = counters.created,
            updated = counters.updated,
            failed = counters.failed,
            skipped = counters.skipped,
            unprocessed = counters.unprocessed,
            elapsed_secs = counters.elapsed_secs,
            "Bulk write finished",
        );
        counters
    }
}

/// Stamp what the file does not supply: identity, generated fields, and
/// one timestamp shared by every audit column of the batch.
fn normalize(entity: &EntityDescriptor, rows: &mut [PendingRow]) {
    let stamp = timestamp_value(unified_timestamp());
    for row in rows {
        let record = &mut row.record;
        if let Some(identity) = &entity.identity {
            if identity.strategy == IdentityStrategy::Uuid && !record.contains_key(&identity.column) {
                record.insert(identity.column.clone(), CellValue::Uuid(DbId::now_v7()));
            }
        }
        for field in &entity.fields {
            if let Some(generator) = &field.generator {
                if !record.contains_key(&field.name) {
                    record.insert(field.name.clone(), generator.generate());
                }
            }
        }
        for column in [&entity.audit.created_at, &entity.audit.updated_at]
            .into_iter()
            .flatten()
        {
            record.insert(column.clone(), stamp.clone());
        }
        enforce_utc(record);
    }
}

fn count_success(counters: &mut WriteOutcomeCounters, row: &PendingRow, policy: WritePolicy) {
    match policy {
        WritePolicy::CreateOnly => counters.created += 1,
        WritePolicy::UpdateOnly | WritePolicy::Upsert if row.existed => counters.updated += 1,
        WritePolicy::UpdateOnly | WritePolicy::Upsert => counters.created += 1,
    }
}

fn row_errors(row: &ResolvedRow) -> Vec<RowError> {
    row.errors
        .iter()
        .map(|e| RowError::from_validation(row.row_number, e))
        .collect()
}

fn store_error(row_number: usize, error: &StoreError) -> RowError {
    RowError::row(row_number, error.error_kind(), error.to_string())
}
