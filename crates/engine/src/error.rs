use tabload_core::error::CoreError;
use tabload_db::StoreError;

/// Error type for engine operations.
///
/// Wraps [`CoreError`] for structural failures and [`StoreError`] for
/// persistence failures that escape the executor's retry and fallback
/// handling, and adds file-handling variants.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Spreadsheet error: {0}")]
    Spreadsheet(#[from] calamine::Error),

    #[error("Unsupported file format: {0}. Supported formats: csv, xlsx, xls")]
    UnsupportedFormat(String),

    #[error("File is {size} bytes, over the {max} byte limit")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Could not parse file: {0}")]
    Parse(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Core(CoreError::Internal(format!("File task failed: {err}")))
    }
}
