/// Structural errors that abort a whole import operation.
///
/// Per-cell and per-row problems are never raised through this type; they
/// are collected as [`crate::coercion::ValidationError`] values instead.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Import session not found: {0}")]
    SessionNotFound(String),

    #[error("Import session expired: {0}")]
    SessionExpired(String),

    #[error("Invalid mapping: {0}")]
    InvalidMapping(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
