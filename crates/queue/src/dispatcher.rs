//! Worker pool and stall monitor.
//!
//! [`JobQueue::run`] spawns `concurrency` worker loops plus one stall
//! monitor and waits for all of them. Idle workers wake on the poll
//! interval or on an enqueue notification, then drain eligible jobs. On
//! cancellation a worker finishes its in-flight job before exiting.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::queue::JobQueue;

impl JobQueue {
    /// Run the worker pool until `cancel` is triggered.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Job queue started",
        );

        let mut tasks = JoinSet::new();
        for worker in 0..self.config.concurrency {
            let span = tracing::info_span!("queue_worker", worker);
            tasks.spawn(
                Arc::clone(&self)
                    .worker_loop(worker, cancel.clone())
                    .instrument(span),
            );
        }
        tasks.spawn(
            Arc::clone(&self)
                .stall_monitor(cancel.clone())
                .instrument(tracing::info_span!("stall_monitor")),
        );

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Queue task panicked");
            }
        }
        tracing::info!("Job queue stopped");
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Worker shutting down");
                    break;
                }
                _ = ticker.tick() => {}
                _ = self.wakeup.notified() => {}
            }

            while !cancel.is_cancelled() {
                match self.run_next(worker).await {
                    Ok(Some(_)) => continue,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, retryable = e.is_retryable(), "Claim cycle failed");
                        break;
                    }
                }
            }
        }
    }

    async fn stall_monitor(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.stall_check_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Stall monitor stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.recover_stalled().await {
                        Ok(recovered) if !recovered.is_empty() => {
                            tracing::info!(count = recovered.len(), "Stall monitor recovered jobs");
                        }
                        Ok(_) => tracing::trace!("No stalled jobs"),
                        Err(e) => tracing::error!(error = %e, "Stall scan failed"),
                    }
                }
            }
        }
    }
}
