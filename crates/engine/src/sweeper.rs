//! Periodic removal of expired import sessions.
//!
//! Expiry is also enforced lazily on access; this loop only reclaims
//! staged files of sessions nobody comes back for.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::session::SessionManager;

/// Run the session sweep loop until `cancel` is triggered.
pub async fn run(manager: Arc<SessionManager>, interval: Duration, cancel: CancellationToken) {
    tracing::info!(
        interval_secs = interval.as_secs(),
        "Import session sweeper started"
    );

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Import session sweeper stopping");
                break;
            }
            _ = ticker.tick() => {
                let removed = manager.sweep_expired().await;
                if removed > 0 {
                    tracing::info!(removed, "Session sweep: removed expired sessions");
                } else {
                    tracing::debug!("Session sweep: nothing expired");
                }
            }
        }
    }
}
