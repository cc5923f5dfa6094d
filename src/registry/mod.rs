//! Agent Registry (C1, §4.1) — tracks connected agents, their capabilities,
//! tags, group, last heartbeat, and connection handle.
//!
//! Grounded on `agents::lifecycle::AgentRegistry`: an `RwLock`-guarded
//! `HashMap` with small, single-purpose mutator methods, plus
//! `agents::orchestrator::Orchestrator`'s "hold the write lock across the
//! whole check-then-mutate sequence" discipline to avoid TOCTOU races.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::domain::{Agent, AgentInfo, AgentStatus, RegistrationResult};
use crate::error::{OrbitMeshError, Result};
use crate::events::{DashboardBroadcaster, DashboardEvent};

/// Pagination options for `paged`.
#[derive(Debug, Clone, Copy)]
pub struct PageOptions {
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Agent>>,
    events: Arc<DashboardBroadcaster>,
    /// How long a `Disconnected` agent is retained before `evict_expired`
    /// removes it (§3: "retained for a configurable grace window so
    /// reconnects preserve identity").
    grace_period: Duration,
    heartbeat_interval: Duration,
}

impl AgentRegistry {
    pub fn new(events: Arc<DashboardBroadcaster>, grace_period: Duration, heartbeat_interval: Duration) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            events,
            grace_period,
            heartbeat_interval,
        }
    }

    /// Register (or re-register) an agent. Idempotent by `agent.id`:
    /// re-registering an existing id rebinds the connection handle and
    /// clears `Disconnected` — the old handle is considered closed by the
    /// caller (the RPC Hub) before this returns (§4.1 invariant: at most one
    /// live connection per agent id).
    pub async fn register(&self, info: AgentInfo, connection_id: String) -> RegistrationResult {
        let id = info.id.clone();
        let mut agents = self.agents.write().await;
        match agents.get_mut(&id) {
            Some(existing) => {
                existing.connection_id = Some(connection_id);
                existing.status = AgentStatus::Ready;
                existing.last_heartbeat = Utc::now();
                existing.name = info.name;
                existing.group = info.group;
                existing.capabilities = info.capabilities;
                existing.tags = info.tags.into_iter().collect();
                existing.hostname = info.hostname;
                existing.version = info.version;
                existing.metadata = info.metadata;
            }
            None => {
                agents.insert(id.clone(), Agent::from_info(info, connection_id));
            }
        }
        drop(agents);
        self.events.publish(DashboardEvent::AgentConnected { agent_id: id });
        RegistrationResult {
            success: true,
            heartbeat_interval: self.heartbeat_interval,
            error: None,
        }
    }

    /// Mark an agent `Disconnected` and clear its connection handle. Retained
    /// for `grace_period` so a reconnect preserves identity; `evict_expired`
    /// performs the actual removal once the grace window elapses.
    pub async fn unregister(&self, agent_id: &str) -> bool {
        let mut agents = self.agents.write().await;
        let Some(agent) = agents.get_mut(agent_id) else {
            return false;
        };
        agent.status = AgentStatus::Disconnected;
        agent.connection_id = None;
        drop(agents);
        self.events.publish(DashboardEvent::AgentDisconnected {
            agent_id: agent_id.to_string(),
        });
        true
    }

    /// Record a heartbeat. `LastHeartbeat` is monotonically non-decreasing
    /// while connected (§3 invariant) — an out-of-order (earlier) timestamp
    /// is silently dropped (§5), not an error.
    pub async fn heartbeat(&self, agent_id: &str, timestamp: DateTime<Utc>) -> Result<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| OrbitMeshError::UnknownAgent(agent_id.to_string()))?;
        if timestamp > agent.last_heartbeat {
            agent.last_heartbeat = timestamp;
        }
        Ok(())
    }

    pub async fn update_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| OrbitMeshError::UnknownAgent(agent_id.to_string()))?;
        agent.status = status;
        drop(agents);
        self.events.publish(DashboardEvent::AgentStatusChanged {
            agent_id: agent_id.to_string(),
            status,
        });
        Ok(())
    }

    pub async fn get(&self, agent_id: &str) -> Option<Agent> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn get_by_connection(&self, connection_id: &str) -> Option<Agent> {
        self.agents
            .read()
            .await
            .values()
            .find(|a| a.connection_id.as_deref() == Some(connection_id))
            .cloned()
    }

    pub async fn list(&self) -> Vec<Agent> {
        self.agents.read().await.values().cloned().collect()
    }

    pub async fn list_by_status(&self, status: AgentStatus) -> Vec<Agent> {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.status == status)
            .cloned()
            .collect()
    }

    pub async fn list_by_group(&self, group: &str) -> Vec<Agent> {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.group.as_deref() == Some(group))
            .cloned()
            .collect()
    }

    pub async fn list_by_capability(&self, capability_name: &str) -> Vec<Agent> {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.capabilities.iter().any(|c| c.name == capability_name))
            .cloned()
            .collect()
    }

    pub async fn paged(&self, opts: PageOptions) -> Page<Agent> {
        let agents = self.agents.read().await;
        let mut all: Vec<Agent> = agents.values().cloned().collect();
        all.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        let total = all.len();
        let items = all.into_iter().skip(opts.offset).take(opts.limit).collect();
        Page { items, total }
    }

    /// Agents whose last heartbeat is older than `timeout` (§4.1).
    pub async fn stale_since(&self, timeout: Duration) -> Vec<Agent> {
        let now = Utc::now();
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.is_connected() && (now - a.last_heartbeat).to_std().unwrap_or_default() > timeout)
            .cloned()
            .collect()
    }

    /// Remove `Disconnected` agents whose grace window has elapsed. Intended
    /// to be called from a periodic sweep (§9: "background services... TTL
    /// sweep").
    pub async fn evict_expired(&self) -> Vec<String> {
        let now = Utc::now();
        let grace = self.grace_period;
        let mut agents = self.agents.write().await;
        let expired: Vec<String> = agents
            .values()
            .filter(|a| {
                a.status == AgentStatus::Disconnected
                    && (now - a.last_heartbeat).to_std().unwrap_or_default() > grace
            })
            .map(|a| a.id.clone())
            .collect();
        for id in &expired {
            agents.remove(id);
        }
        expired
    }
}

pub type SharedAgentRegistry = Arc<AgentRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Capability;

    fn events() -> Arc<DashboardBroadcaster> {
        Arc::new(DashboardBroadcaster::new())
    }

    fn info(id: &str, caps: &[&str]) -> AgentInfo {
        AgentInfo {
            id: id.to_string(),
            name: id.to_string(),
            status: AgentStatus::Created,
            tags: vec![],
            capabilities: caps.iter().map(|c| Capability::named(*c)).collect(),
            group: None,
            hostname: None,
            version: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn register_is_idempotent_and_rebinds_connection() {
        let reg = AgentRegistry::new(events(), Duration::from_secs(60), Duration::from_secs(30));
        reg.register(info("a1", &["cpu"]), "conn-1".to_string()).await;
        let first = reg.get("a1").await.unwrap();
        assert_eq!(first.connection_id.as_deref(), Some("conn-1"));

        reg.register(info("a1", &["cpu"]), "conn-2".to_string()).await;
        let second = reg.get("a1").await.unwrap();
        assert_eq!(second.connection_id.as_deref(), Some("conn-2"));
        assert_eq!(second.status, AgentStatus::Ready);
    }

    #[tokio::test]
    async fn unregister_marks_disconnected_not_removed() {
        let reg = AgentRegistry::new(events(), Duration::from_secs(60), Duration::from_secs(30));
        reg.register(info("a1", &[]), "conn-1".to_string()).await;
        assert!(reg.unregister("a1").await);
        let agent = reg.get("a1").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Disconnected);
        assert!(agent.connection_id.is_none());
    }

    #[tokio::test]
    async fn heartbeat_unknown_agent_errors() {
        let reg = AgentRegistry::new(events(), Duration::from_secs(60), Duration::from_secs(30));
        let result = reg.heartbeat("ghost", Utc::now()).await;
        assert!(matches!(result, Err(OrbitMeshError::UnknownAgent(_))));
    }

    #[tokio::test]
    async fn heartbeat_drops_out_of_order_updates() {
        let reg = AgentRegistry::new(events(), Duration::from_secs(60), Duration::from_secs(30));
        reg.register(info("a1", &[]), "conn-1".to_string()).await;
        let later = Utc::now() + chrono::Duration::seconds(10);
        reg.heartbeat("a1", later).await.unwrap();
        let earlier = later - chrono::Duration::seconds(5);
        reg.heartbeat("a1", earlier).await.unwrap();
        let agent = reg.get("a1").await.unwrap();
        assert_eq!(agent.last_heartbeat, later);
    }

    #[tokio::test]
    async fn evict_expired_removes_only_past_grace_window() {
        let reg = AgentRegistry::new(events(), Duration::from_millis(10), Duration::from_secs(30));
        reg.register(info("a1", &[]), "conn-1".to_string()).await;
        reg.unregister("a1").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let evicted = reg.evict_expired().await;
        assert_eq!(evicted, vec!["a1".to_string()]);
        assert!(reg.get("a1").await.is_none());
    }
}
