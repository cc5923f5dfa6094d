//! Job Store (C2, §4.2) — the job lifecycle state machine plus the
//! priority-ordered pending queue.
//!
//! Grounded on `scheduler::queue::SchedulerQueue` for the priority/FIFO
//! ordering (`BinaryHeap` with a custom `Ord` that breaks ties by earliest
//! `enqueued_at`) and on `agents::lifecycle::AgentRegistry` for the
//! `RwLock<HashMap<...>>` record-store shape.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::domain::{Capability, Job, JobProgress, JobRequest, JobStatus};
use crate::error::{OrbitMeshError, Result};
use crate::events::{DashboardBroadcaster, DashboardEvent};

/// An entry in the pending priority queue. Kept separate from `Job` itself so
/// the heap only ever holds the ordering key plus a lookup id — the
/// authoritative `Job` record lives in `jobs`.
#[derive(Debug, Clone, Eq, PartialEq)]
struct PendingEntry {
    job_id: String,
    priority: i64,
    enqueued_at: DateTime<Utc>,
}

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.enqueued_at.cmp(&self.enqueued_at))
    }
}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    jobs: HashMap<String, Job>,
    pending: BinaryHeap<PendingEntry>,
    /// Pending ids present in `pending` but provisionally reserved by a
    /// router scan (§4.2/§9 atomic peek-and-claim) — excluded from further
    /// scans until `assign` commits or `release_reservation` backs it out.
    reserved: std::collections::HashSet<String>,
}

/// The full job lifecycle store.
pub struct JobStore {
    inner: RwLock<Inner>,
    events: Arc<DashboardBroadcaster>,
}

impl JobStore {
    pub fn new(events: Arc<DashboardBroadcaster>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                jobs: HashMap::new(),
                pending: BinaryHeap::new(),
                reserved: std::collections::HashSet::new(),
            }),
            events,
        }
    }

    /// Insert a new job and place it on the pending queue. Callers are
    /// responsible for idempotency-key deduplication (§4.8, the Idempotency
    /// Service) — `enqueue` always creates a fresh record.
    pub async fn enqueue(&self, request: JobRequest) -> Job {
        let job = Job::new(request);
        let entry = PendingEntry {
            job_id: job.id().to_string(),
            priority: job.request.priority,
            enqueued_at: job.enqueued_at,
        };
        let mut inner = self.inner.write().await;
        inner.pending.push(entry);
        inner.jobs.insert(job.id().to_string(), job.clone());
        drop(inner);
        self.events.publish(DashboardEvent::JobCreated {
            job_id: job.id().to_string(),
        });
        job
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        self.inner.read().await.jobs.get(job_id).cloned()
    }

    /// Atomically scan the pending queue for the first entry an agent with
    /// `capabilities`/`tags` can satisfy and whose status is still `Pending`,
    /// reserving it so a concurrent scan cannot double-claim it. The caller
    /// (the Router/Dispatcher) must follow up with `assign` on success or
    /// `release_reservation` if dispatch is abandoned (§9 Open Question:
    /// plain `BinaryHeap::pop` cannot skip non-matching high-priority jobs
    /// without losing them, so the heap is drained into a scratch vec and
    /// rebuilt rather than popped destructively).
    pub async fn claim_next(
        &self,
        matches: impl Fn(&Job) -> bool,
    ) -> Option<Job> {
        let mut inner = self.inner.write().await;
        let mut scratch: Vec<PendingEntry> = Vec::with_capacity(inner.pending.len());
        let mut claimed: Option<String> = None;

        while let Some(entry) = inner.pending.pop() {
            if claimed.is_none() && !inner.reserved.contains(&entry.job_id) {
                if let Some(job) = inner.jobs.get(&entry.job_id) {
                    if job.status == JobStatus::Pending && matches(job) {
                        claimed = Some(entry.job_id.clone());
                        scratch.push(entry);
                        continue;
                    }
                }
            }
            scratch.push(entry);
        }
        inner.pending.extend(scratch);

        let job_id = claimed?;
        inner.reserved.insert(job_id.clone());
        inner.jobs.get(&job_id).cloned()
    }

    pub async fn release_reservation(&self, job_id: &str) {
        self.inner.write().await.reserved.remove(job_id);
    }

    /// Commit a reserved job to `Assigned` on `agent_id`. Removes it from the
    /// pending queue permanently.
    pub async fn assign(&self, job_id: &str, agent_id: &str) -> Result<Job> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| OrbitMeshError::UnknownJob(job_id.to_string()))?;
        if job.status != JobStatus::Pending {
            return Err(OrbitMeshError::InvalidState {
                job_id: job_id.to_string(),
                from: "non-pending",
                to: "assigned",
            });
        }
        job.status = JobStatus::Assigned;
        job.assigned_agent_id = Some(agent_id.to_string());
        job.assigned_at = Some(Utc::now());
        let snapshot = job.clone();
        inner.reserved.remove(job_id);
        inner
            .pending
            .retain(|e| e.job_id != job_id);
        drop(inner);
        self.events.publish(DashboardEvent::JobStatusChanged {
            job_id: job_id.to_string(),
            status: JobStatus::Assigned,
        });
        Ok(snapshot)
    }

    /// Agent acknowledges receipt and begins execution (Assigned -> Running).
    pub async fn acknowledge(&self, job_id: &str) -> Result<Job> {
        self.transition(job_id, JobStatus::Assigned, JobStatus::Running, |job| {
            job.started_at = Some(Utc::now());
        })
        .await
    }

    pub async fn complete(&self, job_id: &str, result: Vec<u8>) -> Result<Job> {
        let job = self
            .transition(job_id, JobStatus::Running, JobStatus::Completed, |job| {
                job.result = Some(result);
                job.completed_at = Some(Utc::now());
            })
            .await?;
        self.events.publish(DashboardEvent::JobCompleted {
            job_id: job_id.to_string(),
        });
        Ok(job)
    }

    pub async fn fail(&self, job_id: &str, error: String, error_code: Option<String>) -> Result<Job> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| OrbitMeshError::UnknownJob(job_id.to_string()))?;
        if job.status.is_terminal() {
            return Err(OrbitMeshError::InvalidState {
                job_id: job_id.to_string(),
                from: "terminal",
                to: "failed",
            });
        }
        job.status = JobStatus::Failed;
        job.error = Some(error.clone());
        job.error_code = error_code;
        job.completed_at = Some(Utc::now());
        let snapshot = job.clone();
        drop(inner);
        self.events.publish(DashboardEvent::JobFailed {
            job_id: job_id.to_string(),
            error,
        });
        Ok(snapshot)
    }

    pub async fn cancel(&self, job_id: &str) -> Result<Job> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| OrbitMeshError::UnknownJob(job_id.to_string()))?;
        if job.status.is_terminal() {
            return Err(OrbitMeshError::InvalidState {
                job_id: job_id.to_string(),
                from: "terminal",
                to: "cancelled",
            });
        }
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        let snapshot = job.clone();
        inner.reserved.remove(job_id);
        inner.pending.retain(|e| e.job_id != job_id);
        drop(inner);
        self.events.publish(DashboardEvent::JobStatusChanged {
            job_id: job_id.to_string(),
            status: JobStatus::Cancelled,
        });
        Ok(snapshot)
    }

    /// Mark a job `TimedOut` (§4.7). Distinct from `fail`: counted separately
    /// via `timeout_count` and routed back through the retry-vs-dead-letter
    /// decision in the Timeout Monitor rather than the Orchestrator's normal
    /// failure path.
    pub async fn mark_timed_out(&self, job_id: &str) -> Result<Job> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| OrbitMeshError::UnknownJob(job_id.to_string()))?;
        if job.status.is_terminal() {
            return Err(OrbitMeshError::InvalidState {
                job_id: job_id.to_string(),
                from: "terminal",
                to: "timed_out",
            });
        }
        job.status = JobStatus::TimedOut;
        job.timeout_count += 1;
        job.completed_at = Some(Utc::now());
        let snapshot = job.clone();
        inner.reserved.remove(job_id);
        drop(inner);
        self.events.publish(DashboardEvent::JobStatusChanged {
            job_id: job_id.to_string(),
            status: JobStatus::TimedOut,
        });
        Ok(snapshot)
    }

    /// Return a timed-out or failed job to `Pending` for another dispatch
    /// attempt, incrementing `retry_count` (§4.6/§4.7).
    pub async fn requeue(&self, job_id: &str) -> Result<Job> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| OrbitMeshError::UnknownJob(job_id.to_string()))?;
        job.status = JobStatus::Pending;
        job.assigned_agent_id = None;
        job.assigned_at = None;
        job.started_at = None;
        job.retry_count += 1;
        let entry = PendingEntry {
            job_id: job_id.to_string(),
            priority: job.request.priority,
            enqueued_at: job.enqueued_at,
        };
        let snapshot = job.clone();
        inner.pending.push(entry);
        drop(inner);
        self.events.publish(DashboardEvent::JobStatusChanged {
            job_id: job_id.to_string(),
            status: JobStatus::Pending,
        });
        Ok(snapshot)
    }

    pub async fn update_progress(&self, progress: JobProgress) -> Result<()> {
        let job_id = progress.job_id.clone();
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| OrbitMeshError::UnknownJob(job_id.clone()))?;
        let clamped = progress.clone().clamped();
        let percentage = clamped.percentage;
        job.last_progress = Some(clamped);
        drop(inner);
        self.events.publish(DashboardEvent::JobProgress { job_id, percentage });
        Ok(())
    }

    pub async fn get_pending(&self) -> Vec<Job> {
        let inner = self.inner.read().await;
        inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect()
    }

    pub async fn get_by_agent(&self, agent_id: &str) -> Vec<Job> {
        self.inner
            .read()
            .await
            .jobs
            .values()
            .filter(|j| j.assigned_agent_id.as_deref() == Some(agent_id))
            .cloned()
            .collect()
    }

    /// Non-terminal jobs currently assigned to `agent_id` — used by the
    /// Router's least-loaded selection (§4.3).
    pub async fn count_active_for_agent(&self, agent_id: &str) -> usize {
        self.inner
            .read()
            .await
            .jobs
            .values()
            .filter(|j| j.assigned_agent_id.as_deref() == Some(agent_id) && !j.status.is_terminal())
            .count()
    }

    pub async fn get_by_status(&self, status: JobStatus) -> Vec<Job> {
        self.inner
            .read()
            .await
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect()
    }

    /// Jobs in `Assigned` or `Running` whose deadline (per-job or default,
    /// ack vs execution) has elapsed — input to the Timeout Monitor (§4.7).
    pub async fn get_candidates_for_timeout(
        &self,
        default_timeout: std::time::Duration,
        ack_timeout: std::time::Duration,
    ) -> Vec<Job> {
        let now = Utc::now();
        self.inner
            .read()
            .await
            .jobs
            .values()
            .filter(|j| match j.status {
                JobStatus::Assigned => j
                    .assigned_at
                    .map(|at| (now - at).to_std().unwrap_or_default() > ack_timeout)
                    .unwrap_or(false),
                JobStatus::Running => j
                    .started_at
                    .map(|at| (now - at).to_std().unwrap_or_default() > j.effective_timeout(default_timeout))
                    .unwrap_or(false),
                _ => false,
            })
            .cloned()
            .collect()
    }

    async fn transition(
        &self,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
        mutate: impl FnOnce(&mut Job),
    ) -> Result<Job> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| OrbitMeshError::UnknownJob(job_id.to_string()))?;
        if job.status != from {
            return Err(OrbitMeshError::InvalidState {
                job_id: job_id.to_string(),
                from: status_name(job.status),
                to: status_name(to),
            });
        }
        job.status = to;
        mutate(job);
        let snapshot = job.clone();
        drop(inner);
        self.events.publish(DashboardEvent::JobStatusChanged {
            job_id: job_id.to_string(),
            status: to,
        });
        Ok(snapshot)
    }
}

fn status_name(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Assigned => "assigned",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
        JobStatus::TimedOut => "timed_out",
    }
}

/// Convenience predicate builder for `claim_next` — matches a job whose
/// required capabilities/tags are a subset of what the candidate agent has.
pub fn capability_match(agent_capabilities: &[Capability], agent_tags: &std::collections::BTreeSet<String>) -> impl Fn(&Job) -> bool + '_ {
    move |job: &Job| {
        job.request
            .required_capabilities
            .iter()
            .all(|req| agent_capabilities.iter().any(|c| c.name == req.name))
            && job.request.required_tags.iter().all(|t| agent_tags.contains(t))
    }
}

pub type SharedJobStore = Arc<JobStore>;
