use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::worker::{LocalWorker, RunState, Worker};

/// Periodically sample the worker's run cache and emit gauges.
///
/// Sampling reads the status cache only, so it never blocks `run` or
/// `status` calls.
pub fn spawn_sampler(
    worker: LocalWorker,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }

            let Ok(runs) = worker.status_all().await else {
                continue;
            };
            let active = runs.iter().filter(|r| !r.is_done()).count();
            let failed = runs
                .iter()
                .filter(|r| r.state == RunState::Failed)
                .count();
            let ended = runs.len() - active;
            let time_since_last_rpc_ms = if active > 0 {
                worker.time_since_last_rpc().as_millis() as u64
            } else {
                0
            };

            tracing::debug!(
                worker = %worker.name(),
                active_runs = active,
                failed_runs = failed,
                ended_runs = ended,
                time_since_last_rpc_ms,
                uptime_ms = started.elapsed().as_millis() as u64,
                "Worker stats"
            );
        }
    })
}
