//! Per-connection state (§4.12, §5) — one outbound queue per live agent
//! connection, bounded so a stuck agent can't grow memory unboundedly.
//!
//! Grounded on §5's dispatcher policy: "at most one in-flight write per
//! agent connection; additional sends queue with bounded capacity, oldest
//! wins (drop and fail the job with `AgentOverloaded`)" — implemented here as
//! a bounded `mpsc` channel with `try_send`, so a full queue surfaces as a
//! synchronous error to the caller instead of blocking it.

use tokio::sync::mpsc;

use super::wire::Frame;
use crate::error::{OrbitMeshError, Result};

/// Outbound queue capacity per connection (§5 "bounded capacity").
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct ConnectionHandle {
    pub connection_id: String,
    tx: mpsc::Sender<Frame>,
}

impl ConnectionHandle {
    pub fn new(connection_id: String) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        (Self { connection_id, tx }, rx)
    }

    /// Enqueue `frame` for delivery. Fails with `AgentOverloaded` rather than
    /// blocking when the per-connection queue is full (§5, §7).
    pub fn send(&self, agent_id: &str, frame: Frame) -> Result<()> {
        self.tx
            .try_send(frame)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => OrbitMeshError::AgentOverloaded(agent_id.to_string()),
                mpsc::error::TrySendError::Closed(_) => OrbitMeshError::TransportFailure {
                    agent_id: agent_id.to_string(),
                    reason: "connection closed".to_string(),
                },
            })
    }
}
