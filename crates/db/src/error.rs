//! Classified persistence failures.

use tabload_core::coercion::ErrorKind;

/// SQLSTATE for `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

/// SQLSTATE class for integrity constraint violations.
const INTEGRITY_CLASS: &str = "23";

/// `query_canceled` (statement timeout) and `lock_not_available`.
const TIMEOUT_CODES: &[&str] = &["57014", "55P03"];

/// `deadlock_detected` and `serialization_failure`.
const CONTENTION_CODES: &[&str] = &["40P01", "40001"];

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Database timeout: {0}")]
    Timeout(String),

    #[error("Lock contention: {0}")]
    LockContention(String),

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Constraint violated: {0}")]
    ConstraintViolation(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::LockContention(_))
    }

    /// Row error kind reported for rows lost to this failure.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::DatabaseTimeout,
            Self::LockContention(_) => ErrorKind::BulkWriteError,
            Self::UniqueViolation(_) => ErrorKind::DuplicateKey,
            Self::ConstraintViolation(_) => ErrorKind::ConstraintViolation,
            Self::Database(_) => ErrorKind::CriticalError,
        }
    }

    /// Classify a SQLSTATE code plus message.
    pub fn from_sqlstate(code: Option<&str>, message: String) -> Self {
        match code {
            Some(UNIQUE_VIOLATION) => Self::UniqueViolation(message),
            Some(c) if c.starts_with(INTEGRITY_CLASS) => Self::ConstraintViolation(message),
            Some(c) if TIMEOUT_CODES.contains(&c) => Self::Timeout(message),
            Some(c) if CONTENTION_CODES.contains(&c) => Self::LockContention(message),
            _ => Self::Database(message),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.into_owned());
                let message = match db_err.constraint() {
                    Some(constraint) => format!("{} ({constraint})", db_err.message()),
                    None => db_err.message().to_string(),
                };
                Self::from_sqlstate(code.as_deref(), message)
            }
            sqlx::Error::PoolTimedOut => Self::Timeout("connection pool timed out".to_string()),
            other => Self::Database(other.to_string()),
        }
    }
}
