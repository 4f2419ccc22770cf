//! Async access to the synchronous [`Database`].
//!
//! rusqlite connections are blocking, so every operation is shipped to the
//! blocking thread pool via `spawn_blocking`.  Transient failures (lock
//! contention, I/O hiccups) are retried a bounded number of times with a
//! short backoff before surfacing.  The handle is cheap to clone and shared
//! across the server's components.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::database::Database;
use crate::error::{Result, StoreError};

/// Attempts per operation, counting the first.
const MAX_ATTEMPTS: u32 = 3;

/// Cloneable async handle over a single database connection.
#[derive(Clone)]
pub struct StoreHandle {
    db: Arc<Mutex<Database>>,
}

impl StoreHandle {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Run a store operation on the blocking pool.
    ///
    /// The closure receives exclusive access to the connection; keep the
    /// work inside it bounded (single queries or one transaction).  It may
    /// run more than once if the first attempt fails transiently, so it
    /// must be safe to repeat (all the typed helpers are).
    pub async fn call<T, F>(&self, op: F) -> Result<T>
    where
        F: Fn(&mut Database) -> Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let op = Arc::new(op);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let db = Arc::clone(&self.db);
            let op = Arc::clone(&op);
            let result = tokio::task::spawn_blocking(move || {
                let mut guard = db
                    .lock()
                    .map_err(|_| StoreError::Task("store mutex poisoned".into()))?;
                op(&mut guard)
            })
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?;

            match result {
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    tracing::warn!(error = %e, attempt, "transient store failure, retrying");
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                other => return other,
            }
        }
    }
}
