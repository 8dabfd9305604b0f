//! Background retention sweeps.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::error::VcrError;
use crate::store::CassetteStore;
use crate::store::SweepReport;

/// Deletes cassettes older than a fixed age.
///
/// Sweeps are idempotent and may run concurrently with request handling;
/// a request that races a deletion sees either the cassette or a miss.
#[derive(Debug, Clone)]
pub struct RetentionSweeper {
    store: Arc<CassetteStore>,
    max_age: TimeDelta,
}

impl RetentionSweeper {
    pub fn new(store: Arc<CassetteStore>, max_age: Duration) -> Result<Self> {
        let max_age = TimeDelta::from_std(max_age)
            .map_err(|e| VcrError::config(format!("retention age out of range: {e}")))?;
        Ok(Self { store, max_age })
    }

    /// Run one pass on the blocking pool.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let store = Arc::clone(&self.store);
        let max_age = self.max_age;
        let report =
            tokio::task::spawn_blocking(move || store.delete_older_than(max_age, Utc::now()))
                .await
                .map_err(|e| VcrError::internal(format!("retention sweep task failed: {e}")))??;
        tracing::info!(
            deleted = report.deleted,
            retained = report.retained,
            skipped = report.skipped,
            "retention sweep complete"
        );
        Ok(report)
    }

    /// Sweep now and then every `interval` until `cancel` fires. Failed
    /// passes are logged and retried on the next tick.
    pub fn spawn(self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("retention sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            tracing::warn!(error = %e, "retention sweep failed");
                        }
                    }
                }
            }
        })
    }
}
