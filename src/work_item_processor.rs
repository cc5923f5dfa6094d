//! Work-Item Processor (C6, §4.6) — background loop that drains pending jobs
//! from the store and hands them to the Router/Dispatcher under a
//! concurrency cap.
//!
//! Grounded on `tasks::jobs::run_heartbeat_checker`'s `tokio::time::interval`
//! shape: one ticker, one tick-handling function, `info`/`warn` logging at
//! the same density.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::WorkItemProcessorConfig;
use crate::orchestrator::SharedOrchestrator;
use crate::registry::SharedAgentRegistry;

/// Per-job dispatch attempt counter, reset once a job leaves `Pending`.
type AttemptCounts = Arc<Mutex<HashMap<String, u32>>>;

/// Runs until `shutdown` reports `true`. Each tick claims and dispatches up
/// to `config.max_concurrency` pending jobs. A job whose required
/// capabilities no currently-connected agent satisfies is left alone — the
/// processor does not busy-loop on it (§4.6) — and is only dead-lettered
/// once it has accrued `max_dispatch_retries` *attempted* dispatches that
/// found no agent at all.
pub async fn run(
    orchestrator: SharedOrchestrator,
    registry: SharedAgentRegistry,
    config: WorkItemProcessorConfig,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = interval(config.polling_interval);
    let attempts: AttemptCounts = Arc::new(Mutex::new(HashMap::new()));

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("work-item processor stopping");
                    break;
                }
            }
            _ = ticker.tick() => {
                tick(&orchestrator, &registry, &config, &attempts).await;
            }
        }
    }
}

async fn tick(
    orchestrator: &SharedOrchestrator,
    registry: &SharedAgentRegistry,
    config: &WorkItemProcessorConfig,
    attempts: &AttemptCounts,
) {
    let mut dispatched_this_tick = 0usize;
    while dispatched_this_tick < config.max_concurrency {
        let ready_agents = registry.list_by_status(crate::domain::AgentStatus::Ready).await;
        let claimed = orchestrator
            .claim_and_dispatch(|job| {
                ready_agents.iter().any(|a| {
                    a.satisfies_capabilities(&job.request.required_capabilities)
                        && a.satisfies_tags(&job.request.required_tags)
                })
            })
            .await;

        let Some((job_id, dispatched)) = claimed else { break };
        dispatched_this_tick += 1;

        if dispatched {
            attempts.lock().await.remove(&job_id);
        } else {
            // `claim_next`'s predicate already saw a capable agent, but it
            // may have gone stale (disconnected) between the scan and
            // `Router::select` re-checking live status — retry budget as if
            // dispatch failed.
            let mut guard = attempts.lock().await;
            let count = guard.entry(job_id.clone()).or_insert(0);
            *count += 1;
            if *count >= config.max_dispatch_retries {
                drop(guard);
                attempts.lock().await.remove(&job_id);
                if orchestrator.dead_letter_dispatch_failure(&job_id).await.is_ok() {
                    warn!(job_id = %job_id, "max dispatch retries exceeded — dead-lettering");
                }
            }
        }
    }
    debug!(
        dispatched = dispatched_this_tick,
        pending = orchestrator.jobs().get_pending().await.len(),
        "work-item processor tick"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResilienceConfig;
    use crate::dispatcher::{AgentTransport, Dispatcher};
    use crate::domain::{AgentInfo, AgentStatus, Capability, Job, JobRequest};
    use crate::events::DashboardBroadcaster;
    use crate::resilience::ResilienceService;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingTransport {
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl AgentTransport for CountingTransport {
        async fn deliver(&self, _agent_id: &str, _job: &Job) -> crate::error::Result<()> {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn cancel(&self, _agent_id: &str, _job_id: &str) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn resilience() -> ResilienceService {
        ResilienceService::new(&ResilienceConfig {
            max_retry_attempts: 1,
            base_delay: Duration::from_millis(1),
            timeout: Duration::from_millis(200),
            failure_threshold: 10,
            break_duration: Duration::from_millis(10),
        })
    }

    fn request(id: &str) -> JobRequest {
        JobRequest {
            id: id.to_string(),
            idempotency_key: None,
            command: "noop".to_string(),
            parameters: vec![],
            pattern: None,
            required_capabilities: vec![],
            required_tags: vec![],
            priority: 0,
            max_retries: 0,
            timeout: None,
            correlation_id: None,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn tick_dispatches_pending_job_once_agent_is_ready() {
        let events = Arc::new(DashboardBroadcaster::new());
        let registry = Arc::new(crate::registry::AgentRegistry::new(
            events.clone(),
            Duration::from_secs(60),
            Duration::from_secs(30),
        ));
        let jobs = Arc::new(crate::store::JobStore::new(events));
        let router = crate::router::Router::new(registry.clone(), jobs.clone());
        let transport = Arc::new(CountingTransport::default());
        let dispatcher = Dispatcher::new(transport.clone(), resilience());
        let idempotency = Arc::new(crate::idempotency::IdempotencyService::new(Duration::from_secs(60)));
        let progress = Arc::new(crate::progress::ProgressService::new());
        let dead_letter = Arc::new(crate::dead_letter::DeadLetterQueue::new());
        let orchestrator = Arc::new(crate::orchestrator::Orchestrator::new(
            jobs.clone(),
            router,
            dispatcher,
            idempotency,
            progress,
            dead_letter.clone(),
            resilience(),
        ));

        jobs.enqueue(request("j1")).await;
        registry
            .register(
                AgentInfo {
                    id: "a1".into(),
                    name: "a1".into(),
                    status: AgentStatus::Created,
                    tags: vec![],
                    capabilities: vec![Capability::named("cpu")],
                    group: None,
                    hostname: None,
                    version: None,
                    metadata: None,
                },
                "c1".into(),
            )
            .await;

        let config = WorkItemProcessorConfig {
            polling_interval: Duration::from_millis(10),
            max_concurrency: 4,
            max_dispatch_retries: 3,
        };
        let attempts: AttemptCounts = Arc::new(Mutex::new(HashMap::new()));
        tick(&orchestrator, &registry, &config, &attempts).await;

        assert_eq!(transport.delivered.load(Ordering::SeqCst), 1);
        let job = orchestrator.get_job("j1").await.unwrap();
        assert_eq!(job.status, crate::domain::JobStatus::Assigned);
    }

    #[tokio::test]
    async fn tick_leaves_unmatched_job_pending() {
        let events = Arc::new(DashboardBroadcaster::new());
        let registry = Arc::new(crate::registry::AgentRegistry::new(
            events.clone(),
            Duration::from_secs(60),
            Duration::from_secs(30),
        ));
        let jobs = Arc::new(crate::store::JobStore::new(events));
        let router = crate::router::Router::new(registry.clone(), jobs.clone());
        let transport = Arc::new(CountingTransport::default());
        let dispatcher = Dispatcher::new(transport.clone(), resilience());
        let idempotency = Arc::new(crate::idempotency::IdempotencyService::new(Duration::from_secs(60)));
        let progress = Arc::new(crate::progress::ProgressService::new());
        let dead_letter = Arc::new(crate::dead_letter::DeadLetterQueue::new());
        let orchestrator = Arc::new(crate::orchestrator::Orchestrator::new(
            jobs.clone(),
            router,
            dispatcher,
            idempotency,
            progress,
            dead_letter.clone(),
            resilience(),
        ));

        let mut req = request("j1");
        req.required_capabilities = vec![Capability::named("gpu")];
        jobs.enqueue(req).await;

        let config = WorkItemProcessorConfig {
            polling_interval: Duration::from_millis(10),
            max_concurrency: 4,
            max_dispatch_retries: 3,
        };
        let attempts: AttemptCounts = Arc::new(Mutex::new(HashMap::new()));
        tick(&orchestrator, &registry, &config, &attempts).await;

        assert_eq!(transport.delivered.load(Ordering::SeqCst), 0);
        let job = orchestrator.get_job("j1").await.unwrap();
        assert_eq!(job.status, crate::domain::JobStatus::Pending);
    }
}
