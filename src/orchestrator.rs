//! Orchestrator (C5, §4.5) — the sole writer of terminal job transitions.
//!
//! Grounded on `agents::orchestrator::Orchestrator`: a thin façade holding
//! `Arc`-shared collaborators, public methods that take the write lock only
//! for the duration of a single check-then-mutate step, and a `thiserror`
//! error enum (here, the shared `OrbitMeshError` taxonomy instead of a
//! bespoke one, since §7 already specifies it for the whole core).

use uuid::Uuid;

use crate::dead_letter::SharedDeadLetterQueue;
use crate::dispatcher::Dispatcher;
use crate::domain::{
    Job, JobProgress, JobRequest, JobResult, JobResultStatus, JobStatus, SubmissionResult,
};
use crate::error::{OrbitMeshError, Result};
use crate::idempotency::SharedIdempotencyService;
use crate::progress::SharedProgressService;
use crate::resilience::ResilienceService;
use crate::router::Router;
use crate::store::SharedJobStore;

/// Owns the lifecycle state machine. The Hub, Work-Item Processor, and
/// Timeout Monitor all call into this rather than mutating the Job Store
/// directly (§4.5 rationale).
#[derive(Clone)]
pub struct Orchestrator {
    jobs: SharedJobStore,
    router: Router,
    dispatcher: Dispatcher,
    idempotency: SharedIdempotencyService,
    progress: SharedProgressService,
    dead_letter: SharedDeadLetterQueue,
    resilience: ResilienceService,
}

impl Orchestrator {
    pub fn new(
        jobs: SharedJobStore,
        router: Router,
        dispatcher: Dispatcher,
        idempotency: SharedIdempotencyService,
        progress: SharedProgressService,
        dead_letter: SharedDeadLetterQueue,
        resilience: ResilienceService,
    ) -> Self {
        Self {
            jobs,
            router,
            dispatcher,
            idempotency,
            progress,
            dead_letter,
            resilience,
        }
    }

    /// §4.5 `submitJob`.
    pub async fn submit_job(&self, request: JobRequest) -> SubmissionResult {
        if let Err(e) = request.validate() {
            return SubmissionResult {
                job_id: request.id,
                success: false,
                status: None,
                error: Some(e),
            };
        }

        let idempotency_key = request.idempotency_key.clone();
        if let Some(key) = &idempotency_key {
            match self.idempotency.try_acquire_lock(key, &request.id).await {
                Ok(Some(cached)) => return cached,
                Ok(None) => {}
                Err(e) => {
                    return SubmissionResult {
                        job_id: request.id,
                        success: false,
                        status: None,
                        error: Some(e.to_string()),
                    }
                }
            }
        }

        let job_id = request.id.clone();
        let outcome = self
            .resilience
            .execute_with_resilience(&format!("submit-job-{job_id}"), || {
                let request = request.clone();
                async { self.enqueue_and_dispatch(request).await }
            })
            .await;

        let result = match outcome {
            Ok(status) => SubmissionResult {
                job_id: job_id.clone(),
                success: true,
                status: Some(status),
                error: None,
            },
            Err(e) => SubmissionResult {
                job_id: job_id.clone(),
                success: false,
                status: None,
                error: Some(e.to_string()),
            },
        };

        if let Some(key) = &idempotency_key {
            self.idempotency.set_result(key, result.clone()).await;
        }
        result
    }

    async fn enqueue_and_dispatch(&self, request: JobRequest) -> Result<JobStatus> {
        let job = self.jobs.enqueue(request).await;
        match self.try_dispatch(&job).await {
            Some(()) => Ok(JobStatus::Assigned),
            None => Ok(JobStatus::Pending),
        }
    }

    /// Attempt to route + dispatch a single pending job. Returns `Some(())`
    /// on successful hand-off, `None` if no agent currently qualifies
    /// (§4.3: not an error, the job stays `Pending`).
    async fn try_dispatch(&self, job: &Job) -> Option<()> {
        let agent = self.router.select(&job.request).await?;
        self.jobs.assign(job.id(), &agent.id).await.ok()?;
        if let Err(e) = self.dispatcher.execute_job(&agent.id, job).await {
            tracing::warn!(job_id = job.id(), agent_id = %agent.id, err = %e, "dispatch failed — requeuing");
            let _ = self.jobs.requeue(job.id()).await;
            return None;
        }
        Some(())
    }

    /// Claim and dispatch the next pending job matching `matches` in one
    /// step — used by the Work-Item Processor (§4.6) so the claim reservation
    /// is never left dangling between a separate claim and a separate
    /// dispatch call. Returns `None` if nothing currently qualifies;
    /// otherwise the claimed job's id and whether dispatch succeeded.
    pub async fn claim_and_dispatch(&self, matches: impl Fn(&Job) -> bool) -> Option<(String, bool)> {
        let job = self.jobs.claim_next(matches).await?;
        let job_id = job.id().to_string();
        match self.try_dispatch_claimed(&job).await {
            Ok(()) => Some((job_id, true)),
            Err(()) => {
                self.jobs.release_reservation(&job_id).await;
                Some((job_id, false))
            }
        }
    }

    /// Dead-letters `job_id` once the Work-Item Processor's dispatch-attempt
    /// budget is exhausted (§4.6).
    pub async fn dead_letter_dispatch_failure(&self, job_id: &str) -> Result<()> {
        let failed = self
            .jobs
            .fail(job_id, "dispatch retries exhausted".to_string(), Some("TRANSPORT_FAILURE".to_string()))
            .await?;
        self.dead_letter
            .enqueue(failed, "dispatch retries exhausted".to_string())
            .await;
        Ok(())
    }

    /// §4.5/§4.12 `acknowledgeJob` — the agent identified by `agent_id` takes
    /// ownership of `job_id` (Assigned -> Running). Rejects an acknowledge
    /// from any agent other than the one the job was actually assigned to.
    pub async fn acknowledge_job(&self, job_id: &str, agent_id: &str) -> Result<Job> {
        let job = self
            .jobs
            .get(job_id)
            .await
            .ok_or_else(|| OrbitMeshError::UnknownJob(job_id.to_string()))?;
        if job.assigned_agent_id.as_deref() != Some(agent_id) {
            return Err(OrbitMeshError::Validation(format!(
                "agent {agent_id} is not the assigned agent for job {job_id}"
            )));
        }
        self.jobs.acknowledge(job_id).await
    }

    /// §4.7 timeout handling: mark `job_id` timed out and either requeue it
    /// (within `max_timeout_retries`) or dead-letter it. Returns the
    /// resulting status.
    pub async fn handle_timeout(&self, job_id: &str, max_timeout_retries: u32) -> Result<JobStatus> {
        let timed_out = self.jobs.mark_timed_out(job_id).await?;
        if timed_out.timeout_count <= max_timeout_retries {
            self.jobs.requeue(job_id).await?;
            // Let the Work-Item Processor pick this back up on its next
            // tick rather than re-dispatching inline here — mirrors how
            // `handle_failure` only re-dispatches immediately for
            // *execution* failures, not timeouts, since the agent that
            // timed out may still be the one the Router would pick again.
            Ok(JobStatus::Pending)
        } else {
            self.dead_letter
                .enqueue(timed_out, "timeout retries exhausted".to_string())
                .await;
            Ok(JobStatus::TimedOut)
        }
    }

    async fn try_dispatch_claimed(&self, job: &Job) -> std::result::Result<(), ()> {
        let Some(agent) = self.router.select(&job.request).await else {
            self.jobs.release_reservation(job.id()).await;
            return Err(());
        };
        self.jobs.assign(job.id(), &agent.id).await.map_err(|_| ())?;
        self.dispatcher
            .execute_job(&agent.id, job)
            .await
            .map_err(|_| ())
    }

    /// §4.5 `handleResult`, dispatched from the Hub on agent `reportResult`.
    ///
    /// A result for an unknown job id is a no-op, not an error (§8 boundary
    /// behavior) — the job may already have been cancelled or dead-lettered
    /// by the time a late agent reply arrives.
    pub async fn handle_result(&self, result: JobResult) -> Result<()> {
        self.progress.clear(&result.job_id).await;
        let outcome = match result.status {
            JobResultStatus::Completed => self
                .jobs
                .complete(&result.job_id, result.payload.unwrap_or_default())
                .await
                .map(|_| ()),
            JobResultStatus::Cancelled => self.jobs.cancel(&result.job_id).await.map(|_| ()),
            JobResultStatus::Failed => {
                return match self.handle_failure(&result.job_id, result.error).await {
                    Err(OrbitMeshError::UnknownJob(_)) => Ok(()),
                    other => other,
                }
            }
        };
        match outcome {
            Err(OrbitMeshError::UnknownJob(_)) => Ok(()),
            other => other,
        }
    }

    async fn handle_failure(&self, job_id: &str, error: Option<String>) -> Result<()> {
        let job = self
            .jobs
            .get(job_id)
            .await
            .ok_or_else(|| OrbitMeshError::UnknownJob(job_id.to_string()))?;

        if job.retry_count < job.request.max_retries {
            let requeued = self.jobs.requeue(job_id).await?;
            // Re-dispatch immediately rather than waiting for the next
            // Work-Item Processor tick (§4.5).
            self.try_dispatch(&requeued).await;
            Ok(())
        } else {
            let failed = self
                .jobs
                .fail(job_id, error.unwrap_or_else(|| "execution failed".into()), None)
                .await?;
            self.dead_letter
                .enqueue(failed, "max retries exceeded".to_string())
                .await;
            Ok(())
        }
    }

    /// §4.5 `handleProgress`.
    pub async fn handle_progress(&self, progress: JobProgress) {
        self.progress.report(progress.clone()).await;
        let _ = self.jobs.update_progress(progress).await;
    }

    /// §4.5 `cancelJob`.
    pub async fn cancel_job(&self, job_id: &str) -> Result<bool> {
        let Some(job) = self.jobs.get(job_id).await else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(false);
        }
        if let Some(agent_id) = &job.assigned_agent_id {
            let _ = self.dispatcher.cancel_job(agent_id, job_id).await;
        }
        self.jobs.cancel(job_id).await?;
        self.progress.clear(job_id).await;
        Ok(true)
    }

    pub async fn get_job(&self, job_id: &str) -> Option<Job> {
        self.jobs.get(job_id).await
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>, agent_id: Option<&str>) -> Vec<Job> {
        let jobs = match (status, agent_id) {
            (Some(s), _) => self.jobs.get_by_status(s).await,
            (None, Some(a)) => self.jobs.get_by_agent(a).await,
            (None, None) => {
                let mut all = Vec::new();
                for s in [
                    JobStatus::Pending,
                    JobStatus::Assigned,
                    JobStatus::Running,
                    JobStatus::Completed,
                    JobStatus::Failed,
                    JobStatus::Cancelled,
                    JobStatus::TimedOut,
                ] {
                    all.extend(self.jobs.get_by_status(s).await);
                }
                all
            }
        };
        match agent_id {
            Some(a) if status.is_some() => jobs
                .into_iter()
                .filter(|j| j.assigned_agent_id.as_deref() == Some(a))
                .collect(),
            _ => jobs,
        }
    }

    /// Used by a dead-letter `retry` operator action: re-enqueue a fresh copy
    /// of the original request with a reset retry budget.
    pub async fn resubmit(&self, request: JobRequest) -> SubmissionResult {
        self.submit_job(request).await
    }

    pub fn new_job_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn jobs(&self) -> &SharedJobStore {
        &self.jobs
    }

    pub fn dead_letter(&self) -> &SharedDeadLetterQueue {
        &self.dead_letter
    }

    pub fn progress(&self) -> &SharedProgressService {
        &self.progress
    }
}

pub type SharedOrchestrator = std::sync::Arc<Orchestrator>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResilienceConfig;
    use crate::dispatcher::AgentTransport;
    use crate::domain::{AgentInfo, AgentStatus, Capability};
    use crate::events::DashboardBroadcaster;
    use crate::registry::AgentRegistry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingTransport {
        delivered: AtomicUsize,
        cancelled: AtomicUsize,
    }

    #[async_trait]
    impl AgentTransport for RecordingTransport {
        async fn deliver(&self, _agent_id: &str, _job: &Job) -> Result<()> {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn cancel(&self, _agent_id: &str, _job_id: &str) -> Result<()> {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn resilience() -> ResilienceService {
        ResilienceService::new(&ResilienceConfig {
            max_retry_attempts: 2,
            base_delay: Duration::from_millis(1),
            timeout: Duration::from_millis(500),
            failure_threshold: 10,
            break_duration: Duration::from_millis(10),
        })
    }

    fn request(id: &str, caps: &[&str], max_retries: u32) -> JobRequest {
        JobRequest {
            id: id.to_string(),
            idempotency_key: None,
            command: "noop".to_string(),
            parameters: vec![],
            pattern: None,
            required_capabilities: caps.iter().map(|c| Capability::named(*c)).collect(),
            required_tags: vec![],
            priority: 0,
            max_retries,
            timeout: None,
            correlation_id: None,
            metadata: Default::default(),
        }
    }

    async fn setup() -> (Orchestrator, Arc<AgentRegistry>, Arc<RecordingTransport>) {
        let events = Arc::new(DashboardBroadcaster::new());
        let registry = Arc::new(AgentRegistry::new(events.clone(), Duration::from_secs(60), Duration::from_secs(30)));
        let jobs = Arc::new(crate::store::JobStore::new(events));
        let router = Router::new(registry.clone(), jobs.clone());
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Dispatcher::new(transport.clone(), resilience());
        let idempotency = Arc::new(crate::idempotency::IdempotencyService::new(Duration::from_secs(60)));
        let progress = Arc::new(crate::progress::ProgressService::new());
        let dead_letter = Arc::new(crate::dead_letter::DeadLetterQueue::new());
        let orchestrator = Orchestrator::new(jobs, router, dispatcher, idempotency, progress, dead_letter, resilience());
        (orchestrator, registry, transport)
    }

    #[tokio::test]
    async fn submit_with_no_eligible_agent_stays_pending() {
        let (orch, _registry, transport) = setup().await;
        let result = orch.submit_job(request("j1", &["gpu"], 0)).await;
        assert!(result.success);
        assert_eq!(result.status, Some(JobStatus::Pending));
        assert_eq!(transport.delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn submit_with_eligible_agent_dispatches() {
        let (orch, registry, transport) = setup().await;
        registry
            .register(
                AgentInfo {
                    id: "a1".into(),
                    name: "a1".into(),
                    status: AgentStatus::Created,
                    tags: vec![],
                    capabilities: vec![],
                    group: None,
                    hostname: None,
                    version: None,
                    metadata: None,
                },
                "c1".into(),
            )
            .await;
        let result = orch.submit_job(request("j1", &[], 0)).await;
        assert_eq!(result.status, Some(JobStatus::Assigned));
        assert_eq!(transport.delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn full_lifecycle_to_completion() {
        let (orch, registry, _) = setup().await;
        registry
            .register(
                AgentInfo {
                    id: "a1".into(),
                    name: "a1".into(),
                    status: AgentStatus::Created,
                    tags: vec![],
                    capabilities: vec![],
                    group: None,
                    hostname: None,
                    version: None,
                    metadata: None,
                },
                "c1".into(),
            )
            .await;
        orch.submit_job(request("j1", &[], 0)).await;
        orch.acknowledge_job("j1", "a1").await.unwrap();
        orch.handle_result(JobResult {
            job_id: "j1".into(),
            agent_id: "a1".into(),
            status: JobResultStatus::Completed,
            payload: Some(b"ok".to_vec()),
            error: None,
            error_code: None,
            duration: Duration::from_millis(10),
        })
        .await
        .unwrap();
        let job = orch.get_job("j1").await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(b"ok".to_vec()));
    }

    #[tokio::test]
    async fn failure_retries_until_dead_lettered() {
        let (orch, registry, _) = setup().await;
        registry
            .register(
                AgentInfo {
                    id: "a1".into(),
                    name: "a1".into(),
                    status: AgentStatus::Created,
                    tags: vec![],
                    capabilities: vec![],
                    group: None,
                    hostname: None,
                    version: None,
                    metadata: None,
                },
                "c1".into(),
            )
            .await;
        orch.submit_job(request("j1", &[], 2)).await;

        for _ in 0..2 {
            orch.acknowledge_job("j1", "a1").await.unwrap();
            orch.handle_result(JobResult {
                job_id: "j1".into(),
                agent_id: "a1".into(),
                status: JobResultStatus::Failed,
                payload: None,
                error: Some("boom".into()),
                error_code: None,
                duration: Duration::from_millis(1),
            })
            .await
            .unwrap();
        }

        orch.acknowledge_job("j1", "a1").await.unwrap();
        orch.handle_result(JobResult {
            job_id: "j1".into(),
            agent_id: "a1".into(),
            status: JobResultStatus::Failed,
            payload: None,
            error: Some("boom".into()),
            error_code: None,
            duration: Duration::from_millis(1),
        })
        .await
        .unwrap();

        let job = orch.get_job("j1").await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 2);
        assert!(orch.dead_letter().get_by_job_id("j1").await.is_some());
    }

    #[tokio::test]
    async fn idempotent_submit_returns_same_job_and_keeps_first_command() {
        let (orch, _registry, _) = setup().await;
        let mut first = request("j1", &["gpu"], 0);
        first.idempotency_key = Some("K".into());
        first.command = "cmd1".into();
        let r1 = orch.submit_job(first).await;

        let mut second = request("j2", &["gpu"], 0);
        second.idempotency_key = Some("K".into());
        second.command = "cmd2".into();
        let r2 = orch.submit_job(second).await;

        assert_eq!(r1.job_id, r2.job_id);
        let job = orch.get_job(&r1.job_id).await.unwrap();
        assert_eq!(job.request.command, "cmd1");
    }

    #[tokio::test]
    async fn cancel_in_flight_sends_cancel_rpc() {
        let (orch, registry, transport) = setup().await;
        registry
            .register(
                AgentInfo {
                    id: "a1".into(),
                    name: "a1".into(),
                    status: AgentStatus::Created,
                    tags: vec![],
                    capabilities: vec![],
                    group: None,
                    hostname: None,
                    version: None,
                    metadata: None,
                },
                "c1".into(),
            )
            .await;
        orch.submit_job(request("j1", &[], 0)).await;
        orch.acknowledge_job("j1", "a1").await.unwrap();
        assert!(orch.cancel_job("j1").await.unwrap());
        assert_eq!(transport.cancelled.load(Ordering::SeqCst), 1);
        let job = orch.get_job("j1").await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_pending_job_has_no_agent_side_effect() {
        let (orch, _registry, transport) = setup().await;
        orch.submit_job(request("j1", &["gpu"], 0)).await;
        assert!(orch.cancel_job("j1").await.unwrap());
        assert_eq!(transport.cancelled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn completing_unknown_job_is_a_no_op() {
        let (orch, _registry, _) = setup().await;
        let result = orch
            .handle_result(JobResult {
                job_id: "ghost".into(),
                agent_id: "a1".into(),
                status: JobResultStatus::Completed,
                payload: None,
                error: None,
                error_code: None,
                duration: Duration::from_millis(1),
            })
            .await;
        assert!(result.is_ok());
    }
}
