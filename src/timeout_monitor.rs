//! Timeout Monitor (C7, §4.7) — background loop that detects jobs overdue in
//! Assigned/Running states and requeues or fails them.
//!
//! Grounded on `tasks::jobs::run_heartbeat_checker`: same `tokio::time::interval`
//! loop shape, same "collect stale ids, act on each, log a summary" structure.

use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::TimeoutMonitorConfig;
use crate::domain::Job;
use crate::orchestrator::SharedOrchestrator;

/// Runs until `shutdown` reports `true`. Each tick scans `Assigned` jobs past
/// `ackTimeout` and `Running` jobs past their effective timeout (§4.7),
/// requeuing (freeing the agent slot) up to `maxTimeoutRetries` and
/// dead-lettering beyond that.
pub async fn run(
    orchestrator: SharedOrchestrator,
    config: TimeoutMonitorConfig,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = interval(config.check_interval);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("timeout monitor stopping");
                    break;
                }
            }
            _ = ticker.tick() => {
                tick(&orchestrator, &config).await;
            }
        }
    }
}

async fn tick(orchestrator: &SharedOrchestrator, config: &TimeoutMonitorConfig) {
    let candidates = orchestrator
        .jobs()
        .get_candidates_for_timeout(config.default_job_timeout, config.ack_timeout)
        .await;
    debug!(candidates = candidates.len(), "timeout monitor tick");

    for job in candidates {
        handle_overdue(orchestrator, &job, config.max_timeout_retries).await;
    }
}

async fn handle_overdue(orchestrator: &SharedOrchestrator, job: &Job, max_timeout_retries: u32) {
    let job_id = job.id();
    match orchestrator.handle_timeout(job_id, max_timeout_retries).await {
        Ok(crate::domain::JobStatus::Pending) => {
            warn!(job_id, "job overdue — requeuing");
        }
        Ok(crate::domain::JobStatus::TimedOut) => {
            warn!(job_id, "job exceeded max timeout retries — dead-lettering");
        }
        Ok(_) | Err(_) => {}
    }
}
