//! Job data model and lifecycle records (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::agent::Capability;

/// Immutable submission payload (§3). Constructed once by the client and
/// never mutated after `enqueue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: String,
    pub idempotency_key: Option<String>,
    pub command: String,
    #[serde(with = "serde_bytes_as_base64")]
    pub parameters: Vec<u8>,
    /// Agent-id glob or `group:NAME` selector (§4.3).
    pub pattern: Option<String>,
    #[serde(default)]
    pub required_capabilities: Vec<Capability>,
    #[serde(default)]
    pub required_tags: Vec<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub max_retries: u32,
    pub timeout: Option<std::time::Duration>,
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl JobRequest {
    /// §7 ValidationError: malformed request rejected at submission.
    pub fn validate(&self) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err("command must not be empty".to_string());
        }
        if self.priority < 0 {
            return Err("priority must not be negative".to_string());
        }
        Ok(())
    }
}

mod serde_bytes_as_base64 {
    //! `Parameters` is an opaque byte buffer (§3). Plain JSON has no byte
    //! type, so it round-trips as an array of u8 — cheap and transparent for
    //! the in-process / REST paths; the wire (MessagePack) path uses native
    //! binary encoding via `serde_bytes`-compatible `Vec<u8>` support.
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        bytes.to_vec().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        Vec::<u8>::deserialize(d)
    }
}

/// Lifecycle status of a `Job` (§3). Terminal states are `Completed`,
/// `Failed`, `Cancelled`, `TimedOut` — see the state machine in §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

/// Mutable lifecycle record keyed by `JobRequest.id` (§3).
///
/// Status transitions are the only permitted mutation — see `JobStore` in
/// `crate::store` for the state machine that enforces this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub request: JobRequest,
    pub status: JobStatus,
    pub assigned_agent_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub timeout_count: u32,
    pub result: Option<Vec<u8>>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub last_progress: Option<JobProgress>,
    pub created_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    /// When `assigned_agent_id` was most recently set — used by the Timeout
    /// Monitor's `ackTimeout` check (§4.7). Distinct from `started_at`, which
    /// is only set once the agent acknowledges (Assigned → Running).
    pub assigned_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(request: JobRequest) -> Self {
        let now = Utc::now();
        Self {
            request,
            status: JobStatus::Pending,
            assigned_agent_id: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            timeout_count: 0,
            result: None,
            error: None,
            error_code: None,
            last_progress: None,
            created_at: now,
            enqueued_at: now,
            assigned_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.request.id
    }

    pub fn effective_timeout(&self, default_job_timeout: std::time::Duration) -> std::time::Duration {
        self.request.timeout.unwrap_or(default_job_timeout)
    }
}

/// Terminal outcome reported by an agent (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub agent_id: String,
    pub status: JobResultStatus,
    pub payload: Option<Vec<u8>>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub duration: std::time::Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobResultStatus {
    Completed,
    Failed,
    Cancelled,
}

/// A progress update (§3). Only the latest per `job_id` is retained by the
/// Progress Service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: String,
    pub percentage: u8,
    pub step_description: Option<String>,
    pub current_step: Option<u32>,
    pub total_steps: Option<u32>,
    pub estimated_time_remaining: Option<std::time::Duration>,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl JobProgress {
    /// Clamp `percentage` into [0, 100] (§3 invariant).
    pub fn clamped(mut self) -> Self {
        self.percentage = self.percentage.min(100);
        self
    }
}

/// Cached submission result + advisory lock state for one idempotency key
/// (§3, §4.8).
#[derive(Debug, Clone)]
pub struct IdempotencyEntry {
    pub key: String,
    pub lock_holder: Option<String>,
    pub submission_result: Option<SubmissionResult>,
    pub expires_at: DateTime<Utc>,
}

/// Snapshot of a job at the moment it was dead-lettered (§3, §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: String,
    pub job: Job,
    pub reason: String,
    pub enqueued_at: DateTime<Utc>,
    pub retry_requested: bool,
}

/// Returned by `Orchestrator::submit_job` (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub job_id: String,
    pub success: bool,
    pub status: Option<JobStatus>,
    pub error: Option<String>,
}
