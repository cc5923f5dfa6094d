//! Dashboard outbound notifications (§4.12) — broadcast to observers.
//!
//! Grounded on `ipc::event::EventBroadcaster`: a `tokio::sync::broadcast`
//! channel gives exactly the "best-effort fan-out... a slow subscriber may
//! miss intermediate states but always receives the latest terminal event"
//! semantics required by §5 — lagging receivers silently drop old messages
//! rather than blocking the publisher.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::domain::{AgentStatus, JobStatus};

/// Typed dashboard events (§4.12). Serialized per the host transport — here,
/// JSON, matching the REST/WS dashboard surface's existing wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DashboardEvent {
    AgentConnected { agent_id: String },
    AgentDisconnected { agent_id: String },
    AgentStatusChanged { agent_id: String, status: AgentStatus },
    JobCreated { job_id: String },
    JobStatusChanged { job_id: String, status: JobStatus },
    JobProgress { job_id: String, percentage: u8 },
    JobCompleted { job_id: String },
    JobFailed { job_id: String, error: String },
}

/// Broadcasts dashboard events to all connected observers.
#[derive(Clone)]
pub struct DashboardBroadcaster {
    tx: broadcast::Sender<DashboardEvent>,
}

impl Default for DashboardBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl DashboardBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Publish an event to all current subscribers. Ignored if nobody is
    /// listening — fire-and-forget, matching §5's best-effort fan-out.
    pub fn publish(&self, event: DashboardEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.tx.subscribe()
    }
}
