//! Import sessions: a staged upload, its profile, and the caller's mapping.
//!
//! Sessions live in process memory behind an `RwLock`. Each one owns a
//! staged copy of the uploaded file at `{staging_dir}/{token}.{ext}`; the
//! copy is removed exactly once, by whichever of expiry, deletion, or the
//! sweeper takes the session out of the map.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tabload_core::error::CoreError;
use tabload_core::profile::{detect_columns, DetectedColumn, FileFormat, FileProfile};
use tabload_core::registry::{EntityDescriptor, EntityRegistry};
use tabload_core::types::Timestamp;
use tabload_core::validation::{validate_mapping, ColumnMapping};
use tabload_core::value::Row;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::config::ImportConfig;
use crate::error::{EngineError, EngineResult};
use crate::source::{self, SourceLayout};

/// Batches read ahead of the consumer by [`SessionManager::stream_batches`].
const BATCH_QUEUE_DEPTH: usize = 2;

/// One import in progress.
#[derive(Debug, Clone, Serialize)]
pub struct ImportSession {
    pub token: String,
    pub entity_name: String,
    #[serde(skip)]
    pub entity: Arc<EntityDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub profile: FileProfile,
    pub columns: Vec<DetectedColumn>,
    pub sample_rows: Vec<Row>,
    /// Column to field; `None` ignores the column.
    pub mapping: Option<ColumnMapping>,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    #[serde(skip)]
    file_path: PathBuf,
    #[serde(skip)]
    layout: SourceLayout,
    #[serde(skip)]
    headers: Vec<String>,
}

impl ImportSession {
    /// Normalised column names, in file order.
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn total_rows(&self) -> usize {
        self.profile.total_rows
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

/// Number of batches of `batch_size` covering `total_rows`.
pub fn batch_count(total_rows: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        return 0;
    }
    total_rows.div_ceil(batch_size)
}

/// Manages all live import sessions.
///
/// Thread-safe via interior `RwLock`; designed to be wrapped in `Arc` and
/// shared. Reads of different sessions proceed concurrently.
pub struct SessionManager {
    registry: Arc<EntityRegistry>,
    config: ImportConfig,
    sessions: RwLock<HashMap<String, ImportSession>>,
}

impl SessionManager {
    pub fn new(registry: Arc<EntityRegistry>, config: ImportConfig) -> Self {
        Self {
            registry,
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// Stage an uploaded file, profile it, and open a session for it.
    pub async fn create_session(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        entity_name: &str,
        owner_id: Option<&str>,
    ) -> EngineResult<ImportSession> {
        let entity = self.registry.describe(entity_name)?;
        let format = FileFormat::from_file_name(file_name)
            .ok_or_else(|| EngineError::UnsupportedFormat(file_name.to_string()))?;
        let size = bytes.len() as u64;
        if size > self.config.max_file_size_bytes {
            return Err(EngineError::FileTooLarge {
                size,
                max: self.config.max_file_size_bytes,
            });
        }

        let token = Uuid::new_v4().simple().to_string();
        tokio::fs::create_dir_all(&self.config.staging_dir).await?;
        let file_path = self
            .config
            .staging_dir
            .join(format!("{token}.{}", format.extension()));
        tokio::fs::write(&file_path, bytes).await?;

        let profiled = {
            let path = file_path.clone();
            tokio::task::spawn_blocking(move || source::profile(&path, format)).await
        };
        let profiled = match profiled {
            Ok(Ok(profiled)) => profiled,
            Ok(Err(e)) => {
                remove_staged_file(&file_path).await;
                return Err(e);
            }
            Err(e) => {
                remove_staged_file(&file_path).await;
                return Err(e.into());
            }
        };

        let now = Utc::now();
        let ttl = chrono::Duration::seconds(self.config.session_ttl.as_secs() as i64);
        let session = ImportSession {
            token: token.clone(),
            entity_name: entity.name.clone(),
            entity,
            owner_id: owner_id.map(str::to_string),
            profile: FileProfile {
                file_name: file_name.to_string(),
                size_bytes: size,
                format,
                encoding: profiled.layout.encoding,
                delimiter: profiled.layout.delimiter.map(char::from),
                total_rows: profiled.total_rows,
            },
            columns: detect_columns(&profiled.headers, &profiled.window),
            sample_rows: profiled
                .window
                .iter()
                .take(self.config.preview_row_count)
                .cloned()
                .collect(),
            mapping: None,
            created_at: now,
            expires_at: now + ttl,
            file_path,
            layout: profiled.layout,
            headers: profiled.headers,
        };

        tracing::info!(
            token = %token,
            entity = %session.entity_name,
            file_name,
            size_bytes = size,
            total_rows = session.profile.total_rows,
            columns = session.headers.len(),
            "Import session created",
        );
        self.sessions
            .write()
            .await
            .insert(token, session.clone());
        Ok(session)
    }

    /// Fetch a live session. An expired session is removed, along with its
    /// file, on this access.
    pub async fn get_session(&self, token: &str) -> EngineResult<ImportSession> {
        {
            let sessions = self.sessions.read().await;
            match sessions.get(token) {
                None => return Err(CoreError::SessionNotFound(token.to_string()).into()),
                Some(session) if !session.is_expired(Utc::now()) => return Ok(session.clone()),
                Some(_) => {}
            }
        }
        if let Some(session) = self.take(token).await {
            tracing::info!(token = %token, "Import session expired");
            remove_staged_file(&session.file_path).await;
        }
        Err(CoreError::SessionExpired(token.to_string()).into())
    }

    /// Store the caller's column mapping after checking it against the
    /// entity and the file's columns.
    pub async fn set_mapping(&self, token: &str, mapping: ColumnMapping) -> EngineResult<()> {
        let session = self.get_session(token).await?;
        validate_mapping(&session.entity, &mapping, Some(session.headers()))?;

        let mut sessions = self.sessions.write().await;
        let stored = sessions
            .get_mut(token)
            .ok_or_else(|| CoreError::SessionNotFound(token.to_string()))?;
        let mapped = mapping.values().filter(|f| f.is_some()).count();
        stored.mapping = Some(mapping);
        tracing::info!(token = %token, mapped_columns = mapped, "Import mapping set");
        Ok(())
    }

    /// `ceil(total_rows / batch_size)`; `0` for an unknown or expired
    /// session.
    pub async fn total_batches(&self, token: &str, batch_size: usize) -> usize {
        match self.get_session(token).await {
            Ok(session) => batch_count(session.total_rows(), batch_size),
            Err(_) => 0,
        }
    }

    /// Rows `[index * size, min((index + 1) * size, total))`. An index past
    /// the end yields an empty batch.
    pub async fn read_batch(
        &self,
        token: &str,
        batch_size: usize,
        batch_index: usize,
    ) -> EngineResult<Vec<Row>> {
        if batch_size == 0 {
            return Err(CoreError::Validation("Batch size must be at least 1".into()).into());
        }
        let session = self.get_session(token).await?;
        let total = session.total_rows();
        let start = match batch_index.checked_mul(batch_size) {
            Some(start) if start < total => start,
            _ => return Ok(Vec::new()),
        };
        let len = batch_size.min(total - start);
        let rows = read_session_rows(&session, start, len).await?;
        tracing::debug!(token = %token, batch_index, rows = rows.len(), "Batch read");
        Ok(rows)
    }

    /// Every row of the session in batches of `batch_size`, read in one
    /// pass over the staged file on the blocking pool. Reading stops early
    /// once the receiver is dropped; a read failure arrives as the last item.
    pub async fn stream_batches(
        &self,
        token: &str,
        batch_size: usize,
    ) -> EngineResult<mpsc::Receiver<EngineResult<Vec<Row>>>> {
        if batch_size == 0 {
            return Err(CoreError::Validation("Batch size must be at least 1".into()).into());
        }
        let session = self.get_session(token).await?;
        let (tx, rx) = mpsc::channel(BATCH_QUEUE_DEPTH);
        let path = session.file_path.clone();
        let layout = session.layout;
        let headers = session.headers.clone();
        let token = token.to_string();

        tokio::task::spawn_blocking(move || {
            let result = source::visit_batches(&path, &layout, &headers, batch_size, &mut |rows: Vec<Row>| {
                match tx.blocking_send(Ok(rows)) {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(_) => ControlFlow::Break(()),
                }
            });
            if let Err(e) = result {
                tracing::warn!(token = %token, error = %e, "Batch stream failed");
                let _ = tx.blocking_send(Err(e));
            }
        });
        Ok(rx)
    }

    /// Every row of the file, in batch order.
    pub async fn read_all(&self, token: &str) -> EngineResult<Vec<Row>> {
        let session = self.get_session(token).await?;
        read_session_rows(&session, 0, session.total_rows()).await
    }

    /// Drop a session and its staged file. Returns whether a session was
    /// removed; deleting twice is not an error.
    pub async fn delete_session(&self, token: &str) -> bool {
        match self.take(token).await {
            Some(session) => {
                remove_staged_file(&session.file_path).await;
                tracing::info!(token = %token, "Import session deleted");
                true
            }
            None => false,
        }
    }

    /// Remove every expired session. Returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<ImportSession> = {
            let mut sessions = self.sessions.write().await;
            let tokens: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.is_expired(now))
                .map(|(t, _)| t.clone())
                .collect();
            tokens
                .iter()
                .filter_map(|t| sessions.remove(t))
                .collect()
        };
        for session in &expired {
            remove_staged_file(&session.file_path).await;
            tracing::info!(token = %session.token, "Import session expired");
        }
        expired.len()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn take(&self, token: &str) -> Option<ImportSession> {
        self.sessions.write().await.remove(token)
    }
}

async fn read_session_rows(
    session: &ImportSession,
    start: usize,
    len: usize,
) -> EngineResult<Vec<Row>> {
    let path = session.file_path.clone();
    let layout = session.layout;
    let headers = session.headers.clone();
    tokio::task::spawn_blocking(move || source::read_rows(&path, &layout, &headers, start, len))
        .await?
}

async fn remove_staged_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove staged file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn make_manager(dir: &Path, ttl: Duration) -> SessionManager {
        let config = ImportConfig {
            staging_dir: dir.to_path_buf(),
            session_ttl: ttl,
            max_file_size_bytes: 1024,
            ..ImportConfig::default()
        };
        SessionManager::new(Arc::new(EntityRegistry::with_builtin_catalog().unwrap()), config)
    }

    fn make_products_csv(rows: usize) -> Vec<u8> {
        let mut content = String::from("SKU,Name,Price\n");
        for i in 0..rows {
            content.push_str(&format!("P-{i},Item {i},{i}.5\n"));
        }
        content.into_bytes()
    }

    const HOUR: Duration = Duration::from_secs(3600);

    // -- create --

    #[tokio::test]
    async fn create_profiles_and_stages_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(dir.path(), HOUR);
        let session = manager
            .create_session(make_products_csv(12), "products.csv", "product", Some("u1"))
            .await
            .unwrap();

        assert_eq!(session.profile.total_rows, 12);
        assert_eq!(session.profile.delimiter, Some(','));
        assert_eq!(session.headers(), vec!["SKU", "Name", "Price"]);
        assert_eq!(session.sample_rows.len(), 10);
        assert_eq!(session.columns[2].guessed_type, tabload_core::profile::ColumnType::Numeric);
        assert!(session.file_path().exists());
        assert!(session
            .file_path()
            .to_string_lossy()
            .ends_with(&format!("{}.csv", session.token)));
    }

    #[tokio::test]
    async fn create_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(dir.path(), HOUR);

        assert_matches!(
            manager.create_session(make_products_csv(1), "p.csv", "ghost", None).await,
            Err(EngineError::Core(CoreError::EntityNotFound(_)))
        );
        assert_matches!(
            manager.create_session(make_products_csv(1), "p.pdf", "product", None).await,
            Err(EngineError::UnsupportedFormat(_))
        );
        assert_matches!(
            manager.create_session(make_products_csv(200), "p.csv", "product", None).await,
            Err(EngineError::FileTooLarge { max: 1024, .. })
        );
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn failed_profile_removes_staged_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(dir.path(), HOUR);
        let result = manager
            .create_session(b"not a workbook".to_vec(), "p.xlsx", "product", None)
            .await;
        assert!(result.is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    // -- batches --

    #[tokio::test]
    async fn stream_yields_every_batch_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(dir.path(), HOUR);
        let session = manager
            .create_session(make_products_csv(7), "p.csv", "product", None)
            .await
            .unwrap();

        let mut batches = manager.stream_batches(&session.token, 3).await.unwrap();
        let mut sizes = Vec::new();
        let mut skus = Vec::new();
        while let Some(batch) = batches.recv().await {
            let rows = batch.unwrap();
            sizes.push(rows.len());
            skus.extend(rows.iter().map(|r| r["SKU"].to_string()));
        }
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(skus.first().map(String::as_str), Some("P-0"));
        assert_eq!(skus.last().map(String::as_str), Some("P-6"));
        assert_eq!(
            manager.read_all(&session.token).await.unwrap().len(),
            skus.len()
        );
    }

    #[tokio::test]
    async fn stream_rejects_zero_batch_size_and_unknown_token() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(dir.path(), HOUR);
        let session = manager
            .create_session(make_products_csv(2), "p.csv", "product", None)
            .await
            .unwrap();

        assert_matches!(
            manager.stream_batches(&session.token, 0).await,
            Err(EngineError::Core(CoreError::Validation(_)))
        );
        assert_matches!(
            manager.stream_batches("missing", 10).await,
            Err(EngineError::Core(CoreError::SessionNotFound(_)))
        );
    }

    #[tokio::test]
    async fn batch_beyond_total_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = ImportConfig {
            staging_dir: dir.path().to_path_buf(),
            ..ImportConfig::default()
        };
        let manager = SessionManager::new(Arc::new(EntityRegistry::with_builtin_catalog().unwrap()), config);
        let session = manager
            .create_session(make_products_csv(42), "p.csv", "product", None)
            .await
            .unwrap();

        assert_eq!(manager.total_batches(&session.token, 10).await, 5);
        assert!(manager.read_batch(&session.token, 10, 5).await.unwrap().is_empty());
        let last = manager.read_batch(&session.token, 10, 4).await.unwrap();
        assert_eq!(last.len(), 2);
        assert_eq!(last[0]["SKU"], tabload_core::value::CellValue::text("P-40"));
    }

    #[tokio::test]
    async fn unknown_session_has_no_batches() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(dir.path(), HOUR);
        assert_eq!(manager.total_batches("missing", 10).await, 0);
        assert_matches!(
            manager.read_batch("missing", 10, 0).await,
            Err(EngineError::Core(CoreError::SessionNotFound(_)))
        );
    }

    // -- mapping --

    #[tokio::test]
    async fn set_mapping_validates_fields() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(dir.path(), HOUR);
        let session = manager
            .create_session(make_products_csv(2), "p.csv", "product", None)
            .await
            .unwrap();

        let mut bad = ColumnMapping::new();
        bad.insert("SKU".into(), Some("serial".into()));
        assert_matches!(
            manager.set_mapping(&session.token, bad).await,
            Err(EngineError::Core(CoreError::InvalidMapping(_)))
        );

        let mut good = ColumnMapping::new();
        good.insert("SKU".into(), Some("sku".into()));
        good.insert("Price".into(), None);
        manager.set_mapping(&session.token, good.clone()).await.unwrap();
        let stored = manager.get_session(&session.token).await.unwrap();
        assert_eq!(stored.mapping, Some(good));
    }

    // -- lifecycle --

    #[tokio::test]
    async fn expired_session_is_removed_on_access() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(dir.path(), Duration::ZERO);
        let session = manager
            .create_session(make_products_csv(2), "p.csv", "product", None)
            .await
            .unwrap();

        assert_matches!(
            manager.get_session(&session.token).await,
            Err(EngineError::Core(CoreError::SessionExpired(_)))
        );
        assert!(!session.file_path().exists());
        assert_matches!(
            manager.get_session(&session.token).await,
            Err(EngineError::Core(CoreError::SessionNotFound(_)))
        );
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(dir.path(), HOUR);
        let session = manager
            .create_session(make_products_csv(2), "p.csv", "product", None)
            .await
            .unwrap();

        assert!(manager.delete_session(&session.token).await);
        assert!(!session.file_path().exists());
        assert!(!manager.delete_session(&session.token).await);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let expiring = make_manager(dir.path(), Duration::ZERO);
        expiring
            .create_session(make_products_csv(2), "a.csv", "product", None)
            .await
            .unwrap();
        expiring
            .create_session(make_products_csv(2), "b.csv", "product", None)
            .await
            .unwrap();
        assert_eq!(expiring.sweep_expired().await, 2);
        assert_eq!(expiring.session_count().await, 0);

        let live = make_manager(dir.path(), HOUR);
        live.create_session(make_products_csv(2), "c.csv", "product", None)
            .await
            .unwrap();
        assert_eq!(live.sweep_expired().await, 0);
        assert_eq!(live.session_count().await, 1);
    }

    #[test]
    fn batch_count_is_ceiling_division() {
        assert_eq!(batch_count(42, 10), 5);
        assert_eq!(batch_count(40, 10), 4);
        assert_eq!(batch_count(0, 10), 0);
        assert_eq!(batch_count(5, 0), 0);
    }
}
