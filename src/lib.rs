//! OrbitMesh core — a distributed agent control plane: job lifecycle engine,
//! agent registry/presence tracking, and the RPC contract agents speak to the
//! server over.
//!
//! `OrbitMeshContext` is the wiring root: it builds every collaborator
//! (registry, store, router, dispatcher, orchestrator, resilience, RPC hub)
//! and owns the handles the binary needs to start/stop the background loops
//! and transports.

pub mod config;
pub mod dead_letter;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod resilience;
pub mod rest;
pub mod router;
pub mod rpc_hub;
pub mod store;
pub mod timeout_monitor;
pub mod work_item_processor;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use config::OrbitMeshConfig;
use dead_letter::DeadLetterQueue;
use dispatcher::Dispatcher;
use events::DashboardBroadcaster;
use idempotency::IdempotencyService;
use orchestrator::{Orchestrator, SharedOrchestrator};
use progress::ProgressService;
use registry::{AgentRegistry, SharedAgentRegistry};
use resilience::ResilienceService;
use router::Router;
use rpc_hub::Hub;
use store::{JobStore, SharedJobStore};

/// Everything a running OrbitMesh server needs, built once at startup and
/// shared with every background task, the RPC hub, and the REST server.
pub struct OrbitMeshContext {
    pub config: OrbitMeshConfig,
    pub registry: SharedAgentRegistry,
    pub jobs: SharedJobStore,
    pub orchestrator: SharedOrchestrator,
    pub hub: Hub,
    pub events: Arc<DashboardBroadcaster>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl OrbitMeshContext {
    /// Wire every collaborator together: registry → router → dispatcher (the
    /// Hub, acting as the `AgentTransport`) → orchestrator. The Hub is
    /// constructed first and handed to the Dispatcher as a trait object; its
    /// `orchestrator` back-reference is bound afterward via
    /// `Hub::set_orchestrator`, since the Orchestrator can't exist until the
    /// Dispatcher does.
    pub fn build(config: OrbitMeshConfig) -> Arc<Self> {
        let events = Arc::new(DashboardBroadcaster::new());
        let registry = Arc::new(AgentRegistry::new(
            events.clone(),
            config.agent_grace_period,
            config.heartbeat_interval,
        ));
        let jobs = Arc::new(JobStore::new(events.clone()));
        let router = Router::new(registry.clone(), jobs.clone());
        let resilience = ResilienceService::new(&config.resilience);
        let idempotency = Arc::new(IdempotencyService::new(config.idempotency.ttl));
        let progress = Arc::new(ProgressService::new());
        let dead_letter = Arc::new(DeadLetterQueue::new());

        let hub = Hub::new(registry.clone());
        let dispatcher = Dispatcher::new(Arc::new(hub.clone()), dispatcher::default_resilience());

        let orchestrator = Arc::new(Orchestrator::new(
            jobs.clone(),
            router,
            dispatcher,
            idempotency,
            progress,
            dead_letter,
            resilience,
        ));
        hub.set_orchestrator(orchestrator.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Arc::new(Self {
            config,
            registry,
            jobs,
            orchestrator,
            hub,
            events,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Trip the shutdown signal — every background loop and the Hub's accept
    /// loop select on this and exit on the next tick (§C.4).
    pub fn trigger_shutdown(&self) {
        info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Spawn the Work-Item Processor and Timeout Monitor background loops.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        tokio::spawn(work_item_processor::run(
            self.orchestrator.clone(),
            self.registry.clone(),
            self.config.work_item_processor.clone(),
            self.shutdown_rx(),
        ));
        tokio::spawn(timeout_monitor::run(
            self.orchestrator.clone(),
            self.config.timeout_monitor.clone(),
            self.shutdown_rx(),
        ));
    }
}
