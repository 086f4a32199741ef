//! Async orchestration of tabular imports.
//!
//! [`session::SessionManager`] stages uploaded files and serves row
//! batches, [`executor::BulkWriteExecutor`] writes validated rows through a
//! [`tabload_db::BulkStore`], and [`service::ImportService`] ties both to
//! the metadata registry behind one facade.

pub mod config;
pub mod error;
pub mod executor;
pub mod service;
pub mod session;
pub mod source;
pub mod sweeper;

pub use config::ImportConfig;
pub use error::{EngineError, EngineResult};
pub use executor::BulkWriteExecutor;
pub use service::{ExecuteOptions, ImportService, PreviewResult};
pub use session::{ImportSession, SessionManager};
