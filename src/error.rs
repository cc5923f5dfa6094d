//! Error taxonomy (§7) — one variant per kind, shared by every component.
//!
//! Grounded on `agents::orchestrator::OrchestratorError`'s `thiserror` style:
//! small, descriptive, no string-soup `anyhow::Error` inside the core.

/// A core-level error. Propagation policy (§7): the core surfaces
/// user-visible errors only at the submission/cancellation boundaries;
/// everything else propagates as status transitions plus dashboard events.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum OrbitMeshError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("invalid state transition for job {job_id}: {from} -> {to}")]
    InvalidState {
        job_id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("duplicate submission in flight for idempotency key {0}")]
    DuplicateInFlight(String),

    #[error("transport failure delivering to agent {agent_id}: {reason}")]
    TransportFailure { agent_id: String, reason: String },

    #[error("agent {0} is overloaded — outbound queue full")]
    AgentOverloaded(String),

    #[error("execution failed on agent {agent_id}: {reason}")]
    ExecutionFailure { agent_id: String, reason: String },

    #[error("job {0} timed out")]
    Timeout(String),

    #[error("concurrency conflict writing stream {stream} (expected version {expected}, actual {actual})")]
    ConcurrencyConflict {
        stream: String,
        expected: u64,
        actual: u64,
    },

    #[error("circuit open for {0} — fast-failing")]
    CircuitOpen(String),
}

pub type Result<T> = std::result::Result<T, OrbitMeshError>;
