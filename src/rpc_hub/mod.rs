//! RPC Hub (C12, §4.12) — the transport terminus. Accepts agent WebSocket
//! connections, multiplexes agent→server invocations into the core
//! components, and holds the outstanding-call table for server→agent
//! "client-results" calls (§9).
//!
//! Grounded on `ipc/mod.rs`'s accept loop (`TcpListener` + per-connection
//! `tokio::spawn`, `tokio::select!` over incoming frames and a shutdown
//! signal) — adapted from JSON-RPC-over-text to the MessagePack `Frame`
//! framing §6 specifies literally, and from a single request/response
//! dispatch to the bidirectional shape §4.12/§9 calls for (server-initiated
//! calls the agent replies to, correlated by `callId`).

pub mod connection;
pub mod wire;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use once_cell::sync::OnceCell;
use serde::{de::DeserializeOwned, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OrbitMeshConfig;
use crate::dispatcher::AgentTransport;
use crate::domain::{Agent, AgentInfo, Job, JobProgress, JobResult};
use crate::error::{OrbitMeshError, Result};
use crate::orchestrator::{Orchestrator, SharedOrchestrator};
use crate::registry::SharedAgentRegistry;
use connection::ConnectionHandle;
use wire::{AcknowledgeJobArgs, Frame};

/// How long the server waits for an agent's reply to a client-results call
/// (§9 "timeouts prune the table and fail the future") before giving up.
const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(15);

/// One entry in the outstanding-call table (§9): a pending client-results
/// request awaiting the agent's reply, keyed by `callbackId`.
struct PendingCall {
    resolver: oneshot::Sender<Frame>,
}

/// The transport terminus. Cheaply cloneable — every field is `Arc`/lock-backed.
///
/// `orchestrator` is late-bound via `OnceCell` rather than taken in `new`:
/// the Dispatcher needs a `Hub` (as `Arc<dyn AgentTransport>`) to construct
/// the Orchestrator, so the Hub necessarily exists before the Orchestrator
/// does. `set_orchestrator` is called once, immediately after, before the
/// Hub ever serves a connection.
#[derive(Clone)]
pub struct Hub {
    registry: SharedAgentRegistry,
    orchestrator: Arc<OnceCell<SharedOrchestrator>>,
    connections: Arc<RwLock<HashMap<String, ConnectionHandle>>>,
    outstanding: Arc<RwLock<HashMap<String, PendingCall>>>,
}

impl Hub {
    pub fn new(registry: SharedAgentRegistry) -> Self {
        Self {
            registry,
            orchestrator: Arc::new(OnceCell::new()),
            connections: Arc::new(RwLock::new(HashMap::new())),
            outstanding: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Bind the Orchestrator this Hub dispatches agent callbacks into. Must
    /// be called exactly once, before `run`.
    pub fn set_orchestrator(&self, orchestrator: SharedOrchestrator) {
        self.orchestrator
            .set(orchestrator)
            .unwrap_or_else(|_| panic!("Hub::set_orchestrator called more than once"));
    }

    fn orchestrator(&self) -> &Orchestrator {
        self.orchestrator
            .get()
            .expect("Hub used before set_orchestrator")
    }

    /// Accept loop (§4.12). Runs until `shutdown` reports `true`, at which
    /// point every connected agent is sent a `shutdown` notification before
    /// the listener stops (§C.4 of SPEC_FULL.md — host-lifecycle-driven
    /// graceful shutdown).
    pub async fn run(self, addr: SocketAddr, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| OrbitMeshError::TransportFailure {
                agent_id: String::new(),
                reason: format!("binding {addr}: {e}"),
            })?;
        info!(%addr, "RPC hub listening for agent connections");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("RPC hub stopping — notifying connected agents");
                        self.broadcast_shutdown("server shutting down").await;
                        break;
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(err = %e, "accept error");
                            continue;
                        }
                    };
                    let hub = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = hub.handle_connection(stream, peer).await {
                            warn!(%peer, err = %e, "connection closed with error");
                        }
                    });
                }
            }
        }
        Ok(())
    }

    async fn handle_connection(&self, stream: tokio::net::TcpStream, peer: SocketAddr) -> Result<()> {
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| OrbitMeshError::TransportFailure {
                agent_id: String::new(),
                reason: format!("websocket handshake with {peer}: {e}"),
            })?;
        let (mut sink, mut stream) = ws.split();

        let connection_id = Uuid::new_v4().to_string();
        let (handle, mut outbound_rx) = ConnectionHandle::new(connection_id.clone());
        self.connections.write().await.insert(connection_id.clone(), handle);
        debug!(%peer, connection_id = %connection_id, "agent connection opened");

        let mut agent_id: Option<String> = None;

        loop {
            tokio::select! {
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Binary(bytes))) => {
                            match Frame::from_bytes(&bytes) {
                                Ok(frame) => {
                                    if let Some(id) = self.route_frame(&connection_id, frame, &mut sink).await {
                                        agent_id = Some(id);
                                    }
                                }
                                Err(e) => warn!(connection_id = %connection_id, err = %e, "malformed frame dropped"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {} // pings/pongs handled by tungstenite
                        Some(Err(e)) => {
                            warn!(connection_id = %connection_id, err = %e, "websocket read error");
                            break;
                        }
                    }
                }
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(frame) => {
                            if let Ok(bytes) = frame.to_bytes() {
                                if sink.send(Message::Binary(bytes)).await.is_err() {
                                    break;
                                }
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        self.connections.write().await.remove(&connection_id);
        if let Some(id) = agent_id {
            self.registry.unregister(&id).await;
        }
        debug!(connection_id = %connection_id, "agent connection closed");
        Ok(())
    }

    /// Dispatch one inbound frame (§4.12 agent→server invocations, plus
    /// client-results replies). Returns the agent id the connection is now
    /// bound to, if this frame was a `register` call, so the connection loop
    /// can unregister it on disconnect.
    async fn route_frame<S>(&self, connection_id: &str, frame: Frame, sink: &mut S) -> Option<String>
    where
        S: futures_util::Sink<Message> + Unpin,
    {
        // A reply to an outstanding server→agent client-results call is
        // recognized by its callback id already being in the table — check
        // before trying to interpret it as a fresh invocation.
        if let Some(call_id) = &frame.call_id {
            let mut outstanding = self.outstanding.write().await;
            if let Some(pending) = outstanding.remove(call_id) {
                drop(outstanding);
                let _ = pending.resolver.send(frame);
                return None;
            }
        }

        let reply = match frame.method.as_str() {
            "register" => self.on_register(connection_id, &frame).await,
            "unregister" => self.on_unregister(&frame).await,
            "heartbeat" => self.on_heartbeat(&frame).await,
            "acknowledgeJob" => self.on_acknowledge(&frame).await,
            "reportResult" => self.on_report_result(&frame).await,
            "reportProgress" => self.on_report_progress(&frame).await,
            "streamItem" => {
                // Long-running streaming results are a built-in command
                // handler concern (Non-goal, §1) — the Hub only needs to
                // keep the channel alive, not interpret payloads.
                debug!(connection_id, "streamItem received — forwarded to no-op sink");
                Ok(None)
            }
            other => {
                warn!(connection_id, method = other, "unknown method");
                Ok(None)
            }
        };

        let mut bound_agent_id = None;
        let outcome = match reply {
            Ok(value) => value,
            Err(e) => {
                warn!(connection_id, method = %frame.method, err = %e, "handler failed");
                None
            }
        };
        if frame.method == "register" {
            if let Ok(registration) = frame.decode_args::<AgentInfo>() {
                bound_agent_id = Some(registration.id);
            }
        }

        if let (Some(call_id), Some(value)) = (&frame.call_id, outcome) {
            if let Ok(response) = Frame::request(&frame.method, call_id, &value) {
                let _ = sink.send(Message::Binary(response.to_bytes().unwrap_or_default())).await;
            }
        }

        bound_agent_id
    }

    async fn on_register(&self, connection_id: &str, frame: &Frame) -> Result<Option<serde_json::Value>> {
        let info: AgentInfo = frame.decode_args()?;
        let result = self.registry.register(info, connection_id.to_string()).await;
        Ok(Some(serde_json::to_value(result).unwrap_or_default()))
    }

    async fn on_unregister(&self, frame: &Frame) -> Result<Option<serde_json::Value>> {
        let agent_id: String = frame.decode_args()?;
        self.registry.unregister(&agent_id).await;
        Ok(None)
    }

    async fn on_heartbeat(&self, frame: &Frame) -> Result<Option<serde_json::Value>> {
        let agent_id: String = frame.decode_args()?;
        self.registry.heartbeat(&agent_id, chrono::Utc::now()).await?;
        Ok(None)
    }

    async fn on_acknowledge(&self, frame: &Frame) -> Result<Option<serde_json::Value>> {
        let args: AcknowledgeJobArgs = frame.decode_args()?;
        self.orchestrator().acknowledge_job(&args.job_id, &args.agent_id).await?;
        Ok(None)
    }

    async fn on_report_result(&self, frame: &Frame) -> Result<Option<serde_json::Value>> {
        let result: JobResult = frame.decode_args()?;
        self.orchestrator().handle_result(result).await?;
        Ok(None)
    }

    async fn on_report_progress(&self, frame: &Frame) -> Result<Option<serde_json::Value>> {
        let progress: JobProgress = frame.decode_args()?;
        self.orchestrator().handle_progress(progress).await;
        Ok(None)
    }

    /// Send a one-way notification to `agent_id` — `executeJob`, `cancelJob`,
    /// `ping`, `shutdown`, `updateDesiredState` (§4.12).
    async fn notify<T: Serialize>(&self, agent_id: &str, method: &str, args: &T) -> Result<()> {
        let agent = self
            .registry
            .get(agent_id)
            .await
            .ok_or_else(|| OrbitMeshError::UnknownAgent(agent_id.to_string()))?;
        let connection_id = agent
            .connection_id
            .ok_or_else(|| OrbitMeshError::TransportFailure {
                agent_id: agent_id.to_string(),
                reason: "agent not connected".to_string(),
            })?;
        let frame = Frame::notification(method, args)?;
        let connections = self.connections.read().await;
        let handle = connections
            .get(&connection_id)
            .ok_or_else(|| OrbitMeshError::TransportFailure {
                agent_id: agent_id.to_string(),
                reason: "connection handle missing".to_string(),
            })?;
        handle.send(agent_id, frame)
    }

    /// Send a client-results call and await the agent's reply, correlated by
    /// a fresh `callbackId` (§9). Prunes the outstanding-call table and
    /// fails with `Timeout` if no reply arrives within `deadline`.
    async fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        agent_id: &str,
        method: &str,
        args: &Req,
        deadline: Duration,
    ) -> Result<Resp> {
        let agent = self
            .registry
            .get(agent_id)
            .await
            .ok_or_else(|| OrbitMeshError::UnknownAgent(agent_id.to_string()))?;
        let connection_id = agent
            .connection_id
            .ok_or_else(|| OrbitMeshError::TransportFailure {
                agent_id: agent_id.to_string(),
                reason: "agent not connected".to_string(),
            })?;

        let callback_id = Uuid::new_v4().to_string();
        let frame = Frame::request(method, &callback_id, args)?;
        let (tx, rx) = oneshot::channel();
        self.outstanding
            .write()
            .await
            .insert(callback_id.clone(), PendingCall { resolver: tx });

        {
            let connections = self.connections.read().await;
            let handle = connections
                .get(&connection_id)
                .ok_or_else(|| OrbitMeshError::TransportFailure {
                    agent_id: agent_id.to_string(),
                    reason: "connection handle missing".to_string(),
                })?;
            handle.send(agent_id, frame)?;
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => reply.decode_args(),
            Ok(Err(_)) => Err(OrbitMeshError::Timeout(callback_id)),
            Err(_) => {
                self.outstanding.write().await.remove(&callback_id);
                Err(OrbitMeshError::Timeout(callback_id))
            }
        }
    }

    pub async fn ping(&self, agent_id: &str) -> Result<()> {
        self.notify(agent_id, "ping", &()).await
    }

    pub async fn shutdown_agent(&self, agent_id: &str, reason: Option<&str>) -> Result<()> {
        self.notify(agent_id, "shutdown", &reason).await
    }

    pub async fn update_desired_state(&self, agent_id: &str, kv: &serde_json::Value) -> Result<()> {
        self.notify(agent_id, "updateDesiredState", kv).await
    }

    pub async fn get_health(&self, agent_id: &str) -> Result<serde_json::Value> {
        self.call(agent_id, "getHealth", &(), DEFAULT_CALLBACK_TIMEOUT).await
    }

    pub async fn get_resource_usage(&self, agent_id: &str) -> Result<serde_json::Value> {
        self.call(agent_id, "getResourceUsage", &(), DEFAULT_CALLBACK_TIMEOUT).await
    }

    pub async fn validate_job(&self, agent_id: &str, job: &Job) -> Result<bool> {
        self.call(agent_id, "validateJob", &job.request, DEFAULT_CALLBACK_TIMEOUT).await
    }

    pub async fn process_callback(&self, agent_id: &str, request: &serde_json::Value) -> Result<serde_json::Value> {
        self.call(agent_id, "processCallback", request, DEFAULT_CALLBACK_TIMEOUT).await
    }

    async fn broadcast_shutdown(&self, reason: &str) {
        for agent in self.registry.list().await {
            if agent.is_connected() {
                let _ = self.shutdown_agent(&agent.id, Some(reason)).await;
            }
        }
    }

    /// Currently-connected agents — used by the CLI/REST `agents list` surface.
    pub async fn connected_agents(&self) -> Vec<Agent> {
        self.registry.list().await
    }
}

#[async_trait]
impl AgentTransport for Hub {
    async fn deliver(&self, agent_id: &str, job: &Job) -> Result<()> {
        self.notify(agent_id, "executeJob", &job.request).await
    }

    async fn cancel(&self, agent_id: &str, job_id: &str) -> Result<()> {
        self.notify(agent_id, "cancelJob", &job_id).await
    }
}

pub fn build_config_addr(config: &OrbitMeshConfig) -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], config.port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResilienceConfig;
    use crate::dead_letter::DeadLetterQueue;
    use crate::dispatcher::Dispatcher;
    use crate::events::DashboardBroadcaster;
    use crate::idempotency::IdempotencyService;
    use crate::progress::ProgressService;
    use crate::registry::AgentRegistry;
    use crate::resilience::ResilienceService;
    use crate::router::Router;
    use crate::store::JobStore;
    use std::time::Duration;

    fn resilience() -> ResilienceService {
        ResilienceService::new(&ResilienceConfig {
            max_retry_attempts: 1,
            base_delay: Duration::from_millis(1),
            timeout: Duration::from_millis(200),
            failure_threshold: 10,
            break_duration: Duration::from_millis(10),
        })
    }

    async fn hub() -> Hub {
        let events = Arc::new(DashboardBroadcaster::new());
        let registry = Arc::new(AgentRegistry::new(events.clone(), Duration::from_secs(60), Duration::from_secs(30)));
        let jobs = Arc::new(JobStore::new(events));
        let router = Router::new(registry.clone(), jobs.clone());
        // The hub itself is the transport, but it needs a Dispatcher to hand
        // to the Orchestrator — use a throwaway no-op transport here since
        // these unit tests only exercise direct Hub methods, not dispatch.
        struct NoopTransport;
        #[async_trait]
        impl AgentTransport for NoopTransport {
            async fn deliver(&self, _agent_id: &str, _job: &Job) -> Result<()> {
                Ok(())
            }
            async fn cancel(&self, _agent_id: &str, _job_id: &str) -> Result<()> {
                Ok(())
            }
        }
        let dispatcher = Dispatcher::new(Arc::new(NoopTransport), resilience());
        let idempotency = Arc::new(IdempotencyService::new(Duration::from_secs(60)));
        let progress = Arc::new(ProgressService::new());
        let dead_letter = Arc::new(DeadLetterQueue::new());
        let orchestrator = Arc::new(crate::orchestrator::Orchestrator::new(
            jobs, router, dispatcher, idempotency, progress, dead_letter, resilience(),
        ));
        let hub = Hub::new(registry);
        hub.set_orchestrator(orchestrator);
        hub
    }

    #[tokio::test]
    async fn notify_unknown_agent_errors() {
        let h = hub().await;
        let result = h.ping("ghost").await;
        assert!(matches!(result, Err(OrbitMeshError::UnknownAgent(_))));
    }

    #[tokio::test]
    async fn call_without_connection_errors() {
        let h = hub().await;
        h.registry
            .register(
                AgentInfo {
                    id: "a1".into(),
                    name: "a1".into(),
                    status: crate::domain::AgentStatus::Created,
                    tags: vec![],
                    capabilities: vec![],
                    group: None,
                    hostname: None,
                    version: None,
                    metadata: None,
                },
                "conn-1".into(),
            )
            .await;
        // No live ConnectionHandle registered for "conn-1" — the handle
        // table only gets entries from real accepted connections.
        let result = h.ping("a1").await;
        assert!(matches!(result, Err(OrbitMeshError::TransportFailure { .. })));
    }
}
