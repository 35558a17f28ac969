use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use vision_db::Database;
use vision_types::ChatError;

const MAX_ATTEMPTS: u32 = 2;

/// Runs storage calls on the blocking pool under a timeout, retrying a
/// failed attempt once after a backoff. Callers must only pass operations
/// that are safe to repeat.
#[derive(Clone)]
pub struct Persistence {
    db: Arc<Database>,
    timeout: Duration,
    backoff: Duration,
}

impl Persistence {
    pub fn new(db: Arc<Database>, timeout: Duration, backoff: Duration) -> Self {
        Self {
            db,
            timeout,
            backoff,
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T, ChatError>
    where
        F: Fn(&Database) -> anyhow::Result<T> + Clone + Send + 'static,
        T: Send + 'static,
    {
        let mut attempt = 1;
        loop {
            let db = self.db.clone();
            let call = f.clone();
            let task = tokio::task::spawn_blocking(move || call(&db));

            let failure = match tokio::time::timeout(self.timeout, task).await {
                Ok(Ok(Ok(value))) => return Ok(value),
                Ok(Ok(Err(e))) => format!("{:#}", e),
                Ok(Err(e)) => format!("task failed: {}", e),
                Err(_) => format!("timed out after {:?}", self.timeout),
            };

            if attempt >= MAX_ATTEMPTS {
                error!("Storage op {} failed after {} attempts: {}", op, attempt, failure);
                return Err(ChatError::StorageUnavailable(op.to_string()));
            }

            let delay = self.backoff * 2u32.pow(attempt - 1);
            warn!(
                "Storage op {} failed (attempt {}), retrying in {:?}: {}",
                op, attempt, delay, failure
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
