//! `ImportService`: the caller-facing import surface.
//!
//! Ties the session manager, the registry, and the bulk write executor
//! together. Every operation is keyed by session token; structural problems
//! (unknown session, bad mapping) come back as errors, row problems come
//! back inside summaries.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tabload_core::coercion::{ErrorKind, ValidationError};
use tabload_core::error::CoreError;
use tabload_core::outcome::{ExecutionSummary, WriteOutcomeCounters, WritePolicy};
use tabload_core::registry::{EntityDescriptor, EntityRegistry, MappingSuggestion};
use tabload_core::retry::RetryPolicy;
use tabload_core::validation::{
    validate_mapping, ColumnMapping, FieldBindings, ResolvedRow, UniquenessTracker,
    ValidationSummary,
};
use tabload_core::value::{CellValue, Row};
use tabload_db::BulkStore;

use crate::config::{clamp_batch_size, clamp_preview_rows, ImportConfig};
use crate::error::EngineResult;
use crate::executor::BulkWriteExecutor;
use crate::session::{batch_count, ImportSession, SessionManager};

/// Options for [`ImportService::execute`].
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Mapping to use; falls back to the one stored on the session.
    pub mapping: Option<ColumnMapping>,
    pub write_policy: WritePolicy,
    pub skip_errors: bool,
    /// Rows per batch; the configured default when `None`.
    pub batch_size: Option<usize>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            mapping: None,
            write_policy: WritePolicy::CreateOnly,
            skip_errors: false,
            batch_size: None,
        }
    }
}

/// One validated page of a session's rows.
#[derive(Debug, Clone, Serialize)]
pub struct PreviewResult {
    pub rows: Vec<ResolvedRow>,
    pub summary: ValidationSummary,
    /// Whether the previewed rows would all be written.
    pub can_proceed: bool,
    pub batch_index: usize,
    pub batch_size: usize,
    pub total_batches: usize,
}

pub struct ImportService {
    registry: Arc<EntityRegistry>,
    sessions: Arc<SessionManager>,
    store: Arc<dyn BulkStore>,
    executor: BulkWriteExecutor,
    config: ImportConfig,
    /// Tokens with an `execute` in flight.
    running: Mutex<HashSet<String>>,
}

impl ImportService {
    pub fn new(
        registry: Arc<EntityRegistry>,
        store: Arc<dyn BulkStore>,
        config: ImportConfig,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(Arc::clone(&registry), config.clone()));
        let executor = BulkWriteExecutor::new(Arc::clone(&store), Arc::clone(&registry))
            .with_chunk_size(config.chunk_size)
            .with_max_error_samples(config.max_error_samples);
        Self {
            registry,
            sessions,
            store,
            executor,
            config,
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.executor = self.executor.with_retry(retry);
        self
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    /// Shared handle to the session manager, e.g. for the sweeper.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    // -- sessions --

    pub async fn create_session(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        entity_name: &str,
        owner_id: Option<&str>,
    ) -> EngineResult<ImportSession> {
        self.sessions
            .create_session(bytes, file_name, entity_name, owner_id)
            .await
    }

    pub async fn get_session(&self, token: &str) -> EngineResult<ImportSession> {
        self.sessions.get_session(token).await
    }

    pub async fn delete_session(&self, token: &str) -> bool {
        self.sessions.delete_session(token).await
    }

    // -- mapping --

    /// Best-guess field for every column of the session's file.
    pub async fn suggest_mapping(&self, token: &str) -> EngineResult<Vec<MappingSuggestion>> {
        let session = self.sessions.get_session(token).await?;
        Ok(self
            .registry
            .suggest_mapping(&session.entity_name, session.headers())?)
    }

    pub async fn set_mapping(&self, token: &str, mapping: ColumnMapping) -> EngineResult<()> {
        self.sessions.set_mapping(token, mapping).await
    }

    // -- validation --

    /// Validate one page of rows. Sizes are clamped into the preview
    /// bounds; an index past the end yields an empty page.
    ///
    /// Rows whose business key already exists in the store are reported
    /// as `duplicate_key`, whatever policy a later execution uses.
    pub async fn preview_batch(
        &self,
        token: &str,
        mapping: Option<ColumnMapping>,
        batch_size: Option<usize>,
        batch_index: Option<usize>,
    ) -> EngineResult<PreviewResult> {
        let session = self.sessions.get_session(token).await?;
        let mapping = resolve_mapping(&session, mapping)?;
        let batch_size = clamp_preview_rows(batch_size.unwrap_or(self.config.preview_row_count));
        let batch_index = batch_index.unwrap_or(0);

        let raw = self.sessions.read_batch(token, batch_size, batch_index).await?;
        let bindings = FieldBindings::new(Arc::clone(&session.entity), &mapping);
        let mut tracker = UniquenessTracker::new(&session.entity);
        let offset = batch_index.saturating_mul(batch_size);
        let mut rows = resolve_rows(&bindings, &mut tracker, &raw, offset);
        self.executor
            .resolve_references(&session.entity, &mut rows)
            .await?;
        self.check_existing(&session.entity, &mut rows, WritePolicy::CreateOnly)
            .await?;

        let mut summary = ValidationSummary::new(self.config.max_error_samples);
        for row in &rows {
            summary.record(row);
        }
        Ok(PreviewResult {
            can_proceed: summary.can_proceed(),
            rows,
            summary,
            batch_index,
            batch_size,
            total_batches: batch_count(session.total_rows(), batch_size),
        })
    }

    /// Validate every row of the file. Only a bounded sample of errors is
    /// kept in the summary.
    pub async fn validate_full(
        &self,
        token: &str,
        mapping: Option<ColumnMapping>,
    ) -> EngineResult<ValidationSummary> {
        let session = self.sessions.get_session(token).await?;
        let mapping = resolve_mapping(&session, mapping)?;
        let summary = self
            .validate_all(&session, &mapping, WritePolicy::CreateOnly, self.config.batch_size)
            .await?;
        tracing::info!(
            token = %token,
            total_rows = summary.total_rows,
            invalid_rows = summary.invalid_rows,
            "Full validation finished",
        );
        Ok(summary)
    }

    // -- execution --

    /// Write the whole session batch by batch.
    ///
    /// Without `skip_errors` the file is validated in full first and
    /// nothing is written if any row is invalid. Repeated keys, keys that
    /// already exist under create-only, and keys with nothing to update
    /// under update-only are skipped either way. A second `execute` on a
    /// token that is still running fails with a conflict.
    pub async fn execute(
        &self,
        token: &str,
        options: ExecuteOptions,
    ) -> EngineResult<ExecutionSummary> {
        let _guard = ExecutionGuard::acquire(&self.running, token)?;
        let started = Instant::now();

        let session = self.sessions.get_session(token).await?;
        let entity = Arc::clone(&session.entity);
        let mapping = resolve_mapping(&session, options.mapping)?;
        let policy = options.write_policy;
        let skip_errors = options.skip_errors;
        if policy.requires_business_key() && !entity.has_business_key() {
            return Err(CoreError::Validation(format!(
                "Entity '{}' has no business key; the {policy} policy needs one",
                entity.name
            ))
            .into());
        }

        let batch_size = clamp_batch_size(options.batch_size.unwrap_or(self.config.batch_size));
        let total_rows = session.total_rows();
        let total_batches = batch_count(total_rows, batch_size);
        tracing::info!(
            token = %token,
            entity = %entity.name,
            %policy,
            skip_errors,
            total_rows,
            batch_size,
            "Import execution started",
        );

        let mut counters = WriteOutcomeCounters::new(self.config.max_error_samples);
        let mut batches_processed = 0;

        let rejected_up_front = if skip_errors {
            None
        } else {
            self.prevalidate(&session, &mapping, policy, batch_size).await?
        };

        match rejected_up_front {
            Some(rejected) => counters = rejected,
            None => {
                let bindings = FieldBindings::new(Arc::clone(&entity), &mapping);
                let mut tracker = UniquenessTracker::new(&entity);
                let mut batches = self.sessions.stream_batches(token, batch_size).await?;
                let mut offset = 0;
                while let Some(raw) = batches.recv().await {
                    let raw = raw?;
                    let batch_index = batches_processed;
                    let rows = resolve_rows(&bindings, &mut tracker, &raw, offset);
                    offset += raw.len();
                    let batch = self
                        .executor
                        .execute(&entity, rows, policy, skip_errors)
                        .await?;
                    batches_processed += 1;

                    let aborted = batch.aborted;
                    counters.merge(batch);
                    if aborted {
                        counters.mark_unprocessed(total_rows.saturating_sub(offset));
                        tracing::warn!(token = %token, batch_index, "Import aborted");
                        break;
                    }
                }
            }
        }

        counters.finish(started.elapsed());
        let summary = ExecutionSummary {
            status: counters.status(),
            entity: entity.name.clone(),
            write_policy: policy,
            skip_errors,
            total_rows,
            batch_size,
            total_batches,
            batches_processed,
            aborted: counters.aborted,
            counters,
        };
        tracing::info!(
            token = %token,
            status = %summary.status,
            created = summary.counters.created,
            updated = summary.counters.updated,
            failed = summary.counters.failed,
            skipped = summary.counters.skipped,
            unprocessed = summary.counters.unprocessed,
            rows_per_second = summary.counters.rows_per_second,
            "Import execution finished",
        );
        Ok(summary)
    }

    /// Full pass run before a strict execution. Returns the counters of a
    /// run that writes nothing if any row would fail. Rows that would only
    /// be skipped (repeated, existing, or missing keys) do not block.
    async fn prevalidate(
        &self,
        session: &ImportSession,
        mapping: &ColumnMapping,
        policy: WritePolicy,
        batch_size: usize,
    ) -> EngineResult<Option<WriteOutcomeCounters>> {
        let summary = self.validate_all(session, mapping, policy, batch_size).await?;
        let blocking_rows = summary.blocking_rows();
        if blocking_rows == 0 {
            return Ok(None);
        }
        tracing::warn!(
            token = %session.token,
            blocking_rows,
            skip_only_rows = summary.skip_only_rows,
            "Pre-validation failed, nothing written",
        );

        let mut counters = WriteOutcomeCounters::new(self.config.max_error_samples);
        counters.failed = blocking_rows;
        counters.skipped = summary.skip_only_rows;
        counters.error_counts = summary.error_counts;
        counters.errors = summary.errors;
        counters.mark_unprocessed(summary.valid_rows);
        counters.aborted = true;
        Ok(Some(counters))
    }

    /// Resolve every row of a session batch by batch in one pass over the
    /// file, checking references, in-file repeats across the whole file, and
    /// keys against the store.
    async fn validate_all(
        &self,
        session: &ImportSession,
        mapping: &ColumnMapping,
        policy: WritePolicy,
        batch_size: usize,
    ) -> EngineResult<ValidationSummary> {
        let bindings = FieldBindings::new(Arc::clone(&session.entity), mapping);
        let mut tracker = UniquenessTracker::new(&session.entity);
        let mut summary = ValidationSummary::new(self.config.max_error_samples);

        let mut batches = self.sessions.stream_batches(&session.token, batch_size).await?;
        let mut offset = 0;
        while let Some(raw) = batches.recv().await {
            let raw = raw?;
            let mut rows = resolve_rows(&bindings, &mut tracker, &raw, offset);
            offset += raw.len();
            self.executor
                .resolve_references(&session.entity, &mut rows)
                .await?;
            self.check_existing(&session.entity, &mut rows, policy).await?;
            for row in &rows {
                summary.record(row);
            }
        }
        Ok(summary)
    }

    /// Flag valid rows whose key clashes with the store under `policy`:
    /// an existing key for create-only, a missing or null key for the
    /// policies that update.
    async fn check_existing(
        &self,
        entity: &EntityDescriptor,
        rows: &mut [ResolvedRow],
        policy: WritePolicy,
    ) -> EngineResult<()> {
        if !entity.has_business_key() {
            return Ok(());
        }
        let key_label = entity.business_key.join(" + ");
        let keys: Vec<Vec<String>> = rows
            .iter()
            .filter(|r| r.is_valid())
            .filter_map(|r| r.key_tuple(entity))
            .collect();
        let existing = if keys.is_empty() {
            HashSet::new()
        } else {
            self.store.existing_keys(entity, &keys).await?
        };

        for row in rows.iter_mut().filter(|r| r.is_valid()) {
            let key = row.key_tuple(entity);
            let error = match (policy, &key) {
                (WritePolicy::CreateOnly, Some(k)) if existing.contains(k) => Some((
                    ErrorKind::DuplicateKey,
                    format!("A {} with this {key_label} already exists", entity.label),
                )),
                (WritePolicy::UpdateOnly | WritePolicy::Upsert, None) => Some((
                    ErrorKind::RequiredFieldMissing,
                    format!("{key_label} is needed to match existing records"),
                )),
                (WritePolicy::UpdateOnly, Some(k)) if !existing.contains(k) => Some((
                    ErrorKind::RecordNotFound,
                    format!("No {} with this {key_label} exists", entity.label),
                )),
                _ => None,
            };
            if let Some((kind, message)) = error {
                let value = key.map(|k| CellValue::Text(k.join(", ")));
                row.push_error(ValidationError::new(
                    &entity.business_key.join(","),
                    kind,
                    message,
                    value.as_ref(),
                ));
            }
        }
        Ok(())
    }
}

/// The supplied mapping (checked against the file), else the session's.
fn resolve_mapping(
    session: &ImportSession,
    mapping: Option<ColumnMapping>,
) -> EngineResult<ColumnMapping> {
    match mapping {
        Some(mapping) => {
            validate_mapping(&session.entity, &mapping, Some(session.headers()))?;
            Ok(mapping)
        }
        None => session.mapping.clone().ok_or_else(|| {
            CoreError::InvalidMapping(format!(
                "Session '{}' has no column mapping; set one or pass it in",
                session.token
            ))
            .into()
        }),
    }
}

/// Resolve raw rows numbered from `offset + 1`, tracking in-file repeats.
fn resolve_rows(
    bindings: &FieldBindings,
    tracker: &mut UniquenessTracker,
    raw: &[Row],
    offset: usize,
) -> Vec<ResolvedRow> {
    raw.iter()
        .enumerate()
        .map(|(i, row)| {
            let mut resolved = bindings.resolve(offset + i + 1, row, false);
            tracker.check(&mut resolved);
            resolved
        })
        .collect()
}

/// Marks a token as executing until dropped.
struct ExecutionGuard<'a> {
    running: &'a Mutex<HashSet<String>>,
    token: String,
}

impl<'a> ExecutionGuard<'a> {
    fn acquire(running: &'a Mutex<HashSet<String>>, token: &str) -> Result<Self, CoreError> {
        let mut tokens = running.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !tokens.insert(token.to_string()) {
            return Err(CoreError::Conflict(format!(
                "An execution is already running for session '{token}'"
            )));
        }
        Ok(Self {
            running,
            token: token.to_string(),
        })
    }
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tabload_db::MemoryStore;

    use crate::error::EngineError;

    fn make_service(dir: &tempfile::TempDir) -> (ImportService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = ImportConfig {
            staging_dir: dir.path().to_path_buf(),
            ..ImportConfig::default()
        };
        let service = ImportService::new(
            Arc::new(EntityRegistry::with_builtin_catalog().unwrap()),
            Arc::clone(&store) as Arc<dyn BulkStore>,
            config,
        )
        .with_retry(RetryPolicy::without_delay(3));
        (service, store)
    }

    fn make_mapping(pairs: &[(&str, &str)]) -> ColumnMapping {
        pairs
            .iter()
            .map(|(c, f)| (c.to_string(), Some(f.to_string())))
            .collect()
    }

    async fn make_session(service: &ImportService, csv: &str) -> String {
        service
            .create_session(csv.as_bytes().to_vec(), "products.csv", "product", None)
            .await
            .unwrap()
            .token
    }

    // -- mapping --

    #[tokio::test]
    async fn suggest_mapping_uses_headers() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = make_service(&dir);
        let token = make_session(&service, "SKU,Name,Price\nA,Alpha,1\n").await;

        let suggestions = service.suggest_mapping(&token).await.unwrap();
        let sku = suggestions.iter().find(|s| s.column == "SKU").unwrap();
        assert_eq!(sku.suggested_field.as_deref(), Some("sku"));
    }

    #[tokio::test]
    async fn execute_without_mapping_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = make_service(&dir);
        let token = make_session(&service, "sku,name\nA,Alpha\n").await;

        let result = service.execute(&token, ExecuteOptions::default()).await;
        assert_matches!(result, Err(EngineError::Core(CoreError::InvalidMapping(_))));
    }

    // -- preview --

    #[tokio::test]
    async fn preview_flags_existing_and_repeated_keys() {
        let dir = tempfile::tempdir().unwrap();
        let (service, store) = make_service(&dir);
        let product = service.registry().describe("product").unwrap();
        let mut existing = tabload_core::value::Record::new();
        existing.insert("sku".into(), "A".into());
        store.seed(&product, vec![existing]);
        let token = make_session(&service, "sku,name\nA,Alpha\nB,Beta\nB,Again\nC,Gamma\n").await;

        let preview = service
            .preview_batch(&token, Some(make_mapping(&[("sku", "sku"), ("name", "name")])), None, None)
            .await
            .unwrap();

        assert_eq!(preview.batch_size, 10);
        assert_eq!(preview.rows.len(), 4);
        assert_eq!(preview.summary.invalid_rows, 2);
        assert_eq!(preview.summary.error_counts[&ErrorKind::DuplicateKey], 2);
        assert!(!preview.can_proceed);
        assert_eq!(preview.rows[2].row_number, 3);
    }

    #[tokio::test]
    async fn preview_page_numbers_rows_globally() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = make_service(&dir);
        let mut csv = String::from("sku,name\n");
        for i in 0..12 {
            csv.push_str(&format!("P{i},Item {i}\n"));
        }
        let token = make_session(&service, &csv).await;
        service
            .set_mapping(&token, make_mapping(&[("sku", "sku"), ("name", "name")]))
            .await
            .unwrap();

        let preview = service.preview_batch(&token, None, Some(5), Some(2)).await.unwrap();
        assert_eq!(preview.total_batches, 3);
        assert_eq!(preview.rows.len(), 2);
        assert_eq!(preview.rows[0].row_number, 11);
        assert!(preview.can_proceed);
    }

    // -- execute --

    #[tokio::test]
    async fn concurrent_execute_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = make_service(&dir);
        let token = make_session(&service, "sku,name\nA,Alpha\n").await;

        let _held = ExecutionGuard::acquire(&service.running, &token).unwrap();
        let result = service
            .execute(
                &token,
                ExecuteOptions {
                    mapping: Some(make_mapping(&[("sku", "sku"), ("name", "name")])),
                    ..ExecuteOptions::default()
                },
            )
            .await;
        assert_matches!(result, Err(EngineError::Core(CoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn guard_is_released_after_execute() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = make_service(&dir);
        let token = make_session(&service, "sku,name\nA,Alpha\n").await;
        let options = ExecuteOptions {
            mapping: Some(make_mapping(&[("sku", "sku"), ("name", "name")])),
            write_policy: WritePolicy::Upsert,
            ..ExecuteOptions::default()
        };

        let first = service.execute(&token, options.clone()).await.unwrap();
        let second = service.execute(&token, options).await.unwrap();
        assert_eq!(first.counters.created, 1);
        assert_eq!(second.counters.updated, 1);
    }

    #[tokio::test]
    async fn update_only_skips_missing_records_in_strict_mode() {
        let dir = tempfile::tempdir().unwrap();
        let (service, store) = make_service(&dir);
        let product = service.registry().describe("product").unwrap();
        let mut existing = tabload_core::value::Record::new();
        existing.insert("sku".into(), "A".into());
        existing.insert("name".into(), "Old".into());
        store.seed(&product, vec![existing]);
        let token = make_session(&service, "sku,name\nA,Alpha\nZ,Zeta\n").await;

        let summary = service
            .execute(
                &token,
                ExecuteOptions {
                    mapping: Some(make_mapping(&[("sku", "sku"), ("name", "name")])),
                    write_policy: WritePolicy::UpdateOnly,
                    ..ExecuteOptions::default()
                },
            )
            .await
            .unwrap();

        assert!(!summary.aborted);
        assert_eq!(summary.batches_processed, 1);
        assert_eq!(summary.counters.updated, 1);
        assert_eq!(summary.counters.skipped, 1);
        assert_eq!(summary.counters.failed, 0);
        assert_eq!(summary.counters.error_counts[&ErrorKind::RecordNotFound], 1);
        assert_eq!(store.records(&product).len(), 1);
        assert_eq!(store.records(&product)[0]["name"], CellValue::text("Alpha"));
    }

    #[tokio::test]
    async fn strict_create_only_skips_repeated_key() {
        let dir = tempfile::tempdir().unwrap();
        let (service, store) = make_service(&dir);
        let token = make_session(&service, "sku,name\nA,1\nA,2\nB,3\n").await;

        let summary = service
            .execute(
                &token,
                ExecuteOptions {
                    mapping: Some(make_mapping(&[("sku", "sku"), ("name", "name")])),
                    ..ExecuteOptions::default()
                },
            )
            .await
            .unwrap();

        assert!(!summary.aborted);
        assert_eq!(summary.counters.created, 2);
        assert_eq!(summary.counters.skipped, 1);
        assert_eq!(summary.counters.failed, 0);
        assert_eq!(summary.counters.unprocessed, 0);
        assert_eq!(summary.counters.errors[0].row_number, 2);
        assert_eq!(summary.counters.errors[0].kind, ErrorKind::DuplicateKey);
        let product = service.registry().describe("product").unwrap();
        assert_eq!(store.records(&product).len(), 2);
    }

    #[tokio::test]
    async fn strict_abort_counts_skip_only_rows_as_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (service, store) = make_service(&dir);
        let token = make_session(&service, "sku,name,unit_price\nA,1,1\nA,2,2\nB,3,abc\n").await;

        let summary = service
            .execute(
                &token,
                ExecuteOptions {
                    mapping: Some(make_mapping(&[
                        ("sku", "sku"),
                        ("name", "name"),
                        ("unit_price", "unit_price"),
                    ])),
                    ..ExecuteOptions::default()
                },
            )
            .await
            .unwrap();

        assert!(summary.aborted);
        assert_eq!(summary.batches_processed, 0);
        assert_eq!(summary.counters.failed, 1);
        assert_eq!(summary.counters.skipped, 1);
        assert_eq!(summary.counters.unprocessed, 1);
        assert!(store.calls().iter().all(|c| !matches!(c, tabload_db::StoreCall::BulkWrite { .. })));
    }
}
