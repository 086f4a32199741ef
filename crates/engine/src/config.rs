use std::path::PathBuf;
use std::time::Duration;

use tabload_core::outcome::DEFAULT_MAX_ERROR_SAMPLES;

pub const DEFAULT_BATCH_SIZE: usize = 2000;
pub const MIN_BATCH_SIZE: usize = 1;
pub const MAX_BATCH_SIZE: usize = 10_000;

pub const DEFAULT_PREVIEW_ROW_COUNT: usize = 10;
pub const MIN_PREVIEW_ROW_COUNT: usize = 5;
pub const MAX_PREVIEW_ROW_COUNT: usize = 50;

/// Rows per bulk statement.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

pub const DEFAULT_SESSION_TTL_HOURS: u64 = 2;

/// 100 MB.
pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 100 * 1024 * 1024;

pub const DEFAULT_STAGING_DIR: &str = "/tmp/tabload/staging";

pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Import engine configuration.
///
/// Defaults suit local development; override via environment variables.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Rows read and written per batch when the caller gives no size.
    pub batch_size: usize,
    /// Rows shown by a preview when the caller gives no size.
    pub preview_row_count: usize,
    /// Rows per bulk statement within a batch.
    pub chunk_size: usize,
    /// Lifetime of a session from creation.
    pub session_ttl: Duration,
    pub max_file_size_bytes: u64,
    /// Where uploaded files are staged, one file per session.
    pub staging_dir: PathBuf,
    /// Cap on row errors echoed back in summaries.
    pub max_error_samples: usize,
    /// How often the sweeper looks for expired sessions.
    pub sweep_interval: Duration,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            preview_row_count: DEFAULT_PREVIEW_ROW_COUNT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_HOURS * 3600),
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
            staging_dir: PathBuf::from(DEFAULT_STAGING_DIR),
            max_error_samples: DEFAULT_MAX_ERROR_SAMPLES,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

impl ImportConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default                |
    /// |------------------------------|------------------------|
    /// | `IMPORT_BATCH_SIZE`          | `2000`                 |
    /// | `IMPORT_PREVIEW_ROW_COUNT`   | `10`                   |
    /// | `IMPORT_CHUNK_SIZE`          | `100`                  |
    /// | `IMPORT_SESSION_TTL_HOURS`   | `2`                    |
    /// | `IMPORT_MAX_FILE_SIZE_BYTES` | `104857600`            |
    /// | `IMPORT_STAGING_DIR`         | `/tmp/tabload/staging` |
    /// | `IMPORT_MAX_ERROR_SAMPLES`   | `100`                  |
    /// | `IMPORT_SWEEP_INTERVAL_SECS` | `300`                  |
    ///
    /// Unparseable values fall back to the default. Batch and preview sizes
    /// are clamped into their bounds.
    pub fn from_env() -> Self {
        let ttl_hours: u64 = env_or("IMPORT_SESSION_TTL_HOURS", DEFAULT_SESSION_TTL_HOURS);
        let sweep_secs: u64 = env_or("IMPORT_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS);

        Self {
            batch_size: clamp_batch_size(env_or("IMPORT_BATCH_SIZE", DEFAULT_BATCH_SIZE)),
            preview_row_count: clamp_preview_rows(env_or(
                "IMPORT_PREVIEW_ROW_COUNT",
                DEFAULT_PREVIEW_ROW_COUNT,
            )),
            chunk_size: env_or("IMPORT_CHUNK_SIZE", DEFAULT_CHUNK_SIZE).max(1),
            session_ttl: Duration::from_secs(ttl_hours * 3600),
            max_file_size_bytes: env_or("IMPORT_MAX_FILE_SIZE_BYTES", DEFAULT_MAX_FILE_SIZE_BYTES),
            staging_dir: std::env::var("IMPORT_STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_STAGING_DIR)),
            max_error_samples: env_or("IMPORT_MAX_ERROR_SAMPLES", DEFAULT_MAX_ERROR_SAMPLES),
            sweep_interval: Duration::from_secs(sweep_secs.max(1)),
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, "Ignoring unparseable setting");
            default
        }),
        Err(_) => default,
    }
}

pub fn clamp_batch_size(size: usize) -> usize {
    size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE)
}

pub fn clamp_preview_rows(rows: usize) -> usize {
    rows.clamp(MIN_PREVIEW_ROW_COUNT, MAX_PREVIEW_ROW_COUNT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ImportConfig::default();
        assert_eq!(config.batch_size, 2000);
        assert_eq!(config.preview_row_count, 10);
        assert_eq!(config.chunk_size, 100);
        assert_eq!(config.session_ttl, Duration::from_secs(7200));
        assert_eq!(config.max_file_size_bytes, 104_857_600);
    }

    #[test]
    fn sizes_are_clamped() {
        assert_eq!(clamp_batch_size(0), 1);
        assert_eq!(clamp_batch_size(50_000), 10_000);
        assert_eq!(clamp_batch_size(500), 500);
        assert_eq!(clamp_preview_rows(1), 5);
        assert_eq!(clamp_preview_rows(99), 50);
    }

    #[test]
    fn missing_env_var_uses_default() {
        assert_eq!(env_or("TABLOAD_TEST_SURELY_UNSET_VAR", 7usize), 7);
    }
}
