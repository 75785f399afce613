//! Cooperative polling loop shared by every worker.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use ellie_core::Result;

/// A background worker that processes one bounded batch per call.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Process at most one batch and return how many items were handled.
    async fn run_once(&self) -> Result<usize>;
}

/// Repeat `run_once` until cancelled.
///
/// The loop only sleeps after a run that handled nothing, so a backlog drains
/// at full speed. Transient errors are logged and followed by an idle poll;
/// configuration errors end the loop.
pub async fn run_worker(worker: Arc<dyn Worker>, poll_interval: Duration, cancel: CancellationToken) -> Result<()> {
    let span = info_span!("worker", name = worker.name());
    async move {
        info!(poll_secs = poll_interval.as_secs(), "worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let processed = match worker.run_once().await {
                Ok(n) => n,
                Err(e) if e.is_config() => {
                    error!(error = %e, "worker stopped on configuration error");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "worker run failed, retrying after poll interval");
                    0
                }
            };

            if processed > 0 {
                debug!(processed, "worker run complete");
                continue;
            }

            if cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
        info!("worker stopped");
        Ok(())
    }
    .instrument(span)
    .await
}

/// Spawn `run_worker` as a tokio task.
pub fn spawn_worker(
    worker: Arc<dyn Worker>,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<Result<()>> {
    tokio::spawn(run_worker(worker, poll_interval, cancel))
}
