//! Agent data model (§3) — identity, capabilities, and presence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named skill an agent declares; jobs may require a subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub version: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl Capability {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            metadata: None,
        }
    }

    /// Capability-set membership ignores version/metadata — only the name is
    /// load-bearing for routing (§4.3 "capability set is a superset of required").
    fn matches(&self, required: &Capability) -> bool {
        self.name == required.name
    }
}

/// Lifecycle status of a registered agent (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Created,
    Initializing,
    Ready,
    Running,
    Paused,
    Stopping,
    Stopped,
    Faulted,
    Disconnected,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Faulted => "faulted",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Registration payload sent by an agent over the wire (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    #[serde(default = "default_created_status")]
    pub status: AgentStatus,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    pub group: Option<String>,
    pub hostname: Option<String>,
    pub version: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

fn default_created_status() -> AgentStatus {
    AgentStatus::Created
}

/// Result of a `register` call (§4.1, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationResult {
    pub success: bool,
    pub heartbeat_interval: std::time::Duration,
    pub error: Option<String>,
}

/// The server-side record for one connected (or recently-connected) agent.
///
/// Owned exclusively by the Agent Registry (§3). `connection_id` references
/// a live connection held by the RPC Hub — `None` whenever
/// `status == Disconnected`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub group: Option<String>,
    pub capabilities: Vec<Capability>,
    pub tags: std::collections::BTreeSet<String>,
    pub status: AgentStatus,
    pub hostname: Option<String>,
    pub version: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Opaque handle id into the RPC Hub's connection table. `None` while
    /// `status == Disconnected`.
    pub connection_id: Option<String>,
}

impl Agent {
    pub fn from_info(info: AgentInfo, connection_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: info.id,
            name: info.name,
            group: info.group,
            capabilities: info.capabilities,
            tags: info.tags.into_iter().collect(),
            status: AgentStatus::Ready,
            hostname: info.hostname,
            version: info.version,
            metadata: info.metadata,
            registered_at: now,
            last_heartbeat: now,
            connection_id: Some(connection_id),
        }
    }

    /// Superset check: does this agent have every required capability?
    pub fn satisfies_capabilities(&self, required: &[Capability]) -> bool {
        required
            .iter()
            .all(|req| self.capabilities.iter().any(|c| c.matches(req)))
    }

    /// Does this agent carry every required tag?
    pub fn satisfies_tags(&self, required: &[String]) -> bool {
        required.iter().all(|t| self.tags.contains(t))
    }

    pub fn is_connected(&self) -> bool {
        self.connection_id.is_some() && self.status != AgentStatus::Disconnected
    }
}
