//! Dispatcher (C4, §4.4) — delivers assigned jobs to their agent over the
//! RPC Hub transport, and relays cancellation requests.
//!
//! The transport itself is abstracted behind `AgentTransport` so the
//! Dispatcher (and its tests) don't depend on the concrete WebSocket/MessagePack
//! connection table in `rpc_hub` — mirrors the trait seam
//! `agents::orchestrator::Orchestrator` draws around its handoff targets.

use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

use crate::config::ResilienceConfig;
use crate::domain::Job;
use crate::error::{OrbitMeshError, Result};
use crate::resilience::ResilienceService;

/// The Dispatcher's own retry-once-inline policy (§4.4) — distinct from the
/// Orchestrator's operator-tunable `resilience.maxRetryAttempts` budget, and
/// from the Work-Item Processor's re-route-to-a-different-agent retries.
pub fn default_resilience() -> ResilienceService {
    ResilienceService::new(&ResilienceConfig {
        max_retry_attempts: 2,
        base_delay: Duration::from_millis(50),
        timeout: Duration::from_secs(10),
        failure_threshold: 5,
        break_duration: Duration::from_secs(30),
    })
}

#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Deliver `job` to `agent_id`. Errors as `TransportFailure` or
    /// `AgentOverloaded` (§7) — the Dispatcher does not interpret the agent's
    /// eventual job outcome, only whether the *delivery* succeeded.
    async fn deliver(&self, agent_id: &str, job: &Job) -> Result<()>;

    /// Relay a cancellation request to the agent currently running `job_id`.
    /// Best-effort: the agent may have already finished or disconnected.
    async fn cancel(&self, agent_id: &str, job_id: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct Dispatcher {
    transport: std::sync::Arc<dyn AgentTransport>,
    resilience: ResilienceService,
}

impl Dispatcher {
    pub fn new(transport: std::sync::Arc<dyn AgentTransport>, resilience: ResilienceService) -> Self {
        Self { transport, resilience }
    }

    /// Deliver `job` to `agent_id`, retrying once inline on transport
    /// failure with a short backoff (§4.4) before surfacing the error to the
    /// caller — distinct from the Work-Item Processor's own outer
    /// dispatch-retry loop, which re-routes to a different agent entirely.
    pub async fn execute_job(&self, agent_id: &str, job: &Job) -> Result<()> {
        let job_id = job.id().to_string();
        self.resilience
            .execute_with_retry(&format!("dispatch:{job_id}"), || async {
                self.transport.deliver(agent_id, job).await
            })
            .await
    }

    pub async fn cancel_job(&self, agent_id: &str, job_id: &str) -> Result<()> {
        match self.transport.cancel(agent_id, job_id).await {
            Ok(()) => Ok(()),
            Err(OrbitMeshError::TransportFailure { .. }) => {
                warn!(agent_id, job_id, "cancel delivery failed — agent likely disconnected");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResilienceConfig;
    use crate::domain::JobRequest;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct FlakyTransport {
        failures_remaining: AtomicU32,
    }

    #[async_trait]
    impl AgentTransport for FlakyTransport {
        async fn deliver(&self, _agent_id: &str, _job: &Job) -> Result<()> {
            if self.failures_remaining.fetch_sub(1, Ordering::Relaxed) > 0 {
                return Err(OrbitMeshError::TransportFailure {
                    agent_id: "a1".into(),
                    reason: "connection reset".into(),
                });
            }
            Ok(())
        }

        async fn cancel(&self, _agent_id: &str, _job_id: &str) -> Result<()> {
            Err(OrbitMeshError::TransportFailure {
                agent_id: "a1".into(),
                reason: "gone".into(),
            })
        }
    }

    fn resilience() -> ResilienceService {
        ResilienceService::new(&ResilienceConfig {
            max_retry_attempts: 3,
            base_delay: Duration::from_millis(1),
            timeout: Duration::from_millis(200),
            failure_threshold: 10,
            break_duration: Duration::from_millis(10),
        })
    }

    fn job() -> Job {
        Job::new(JobRequest {
            id: "j1".to_string(),
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
        })
    }

    #[tokio::test]
    async fn retries_transport_failure_inline() {
        let transport = Arc::new(FlakyTransport {
            failures_remaining: AtomicU32::new(1),
        });
        let dispatcher = Dispatcher::new(transport, resilience());
        assert!(dispatcher.execute_job("a1", &job()).await.is_ok());
    }

    #[tokio::test]
    async fn cancel_swallows_transport_failure() {
        let transport = Arc::new(FlakyTransport {
            failures_remaining: AtomicU32::new(0),
        });
        let dispatcher = Dispatcher::new(transport, resilience());
        assert!(dispatcher.cancel_job("a1", "j1").await.is_ok());
    }
}
