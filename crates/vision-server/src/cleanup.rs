use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use vision_db::{Database, now_ms};

/// Background task that permanently removes soft-deleted messages once
/// their restore window has passed.
pub async fn run_purge_loop(db: Arc<Database>, restore_window: chrono::Duration, every: Duration) {
    let mut interval = tokio::time::interval(every);

    loop {
        interval.tick().await;

        match purge_expired(&db, restore_window).await {
            Ok(count) => {
                if count > 0 {
                    info!("Purge: removed {} deleted messages", count);
                }
            }
            Err(e) => {
                warn!("Purge error: {:#}", e);
            }
        }
    }
}

pub async fn purge_expired(db: &Arc<Database>, restore_window: chrono::Duration) -> anyhow::Result<usize> {
    let cutoff = now_ms() - restore_window.num_milliseconds();
    let db = db.clone();
    tokio::task::spawn_blocking(move || db.purge_deleted_before(cutoff)).await?
}
