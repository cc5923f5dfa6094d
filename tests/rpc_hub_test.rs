//! Integration test for the agent<->server wire contract: a real
//! `tokio-tungstenite` client plays the agent side against a live `Hub`,
//! exercising `register`, job dispatch (`executeJob`), `acknowledgeJob`, and
//! `reportResult` over actual MessagePack-framed WebSocket messages.

use futures_util::{SinkExt, StreamExt};
use orbitmesh::config::{OrbitMeshConfig, ResilienceConfig};
use orbitmesh::dead_letter::DeadLetterQueue;
use orbitmesh::dispatcher::Dispatcher;
use orbitmesh::domain::{AgentInfo, AgentStatus, Capability, JobRequest, JobResult, JobResultStatus};
use orbitmesh::events::DashboardBroadcaster;
use orbitmesh::idempotency::IdempotencyService;
use orbitmesh::orchestrator::Orchestrator;
use orbitmesh::progress::ProgressService;
use orbitmesh::registry::AgentRegistry;
use orbitmesh::resilience::ResilienceService;
use orbitmesh::router::Router;
use orbitmesh::rpc_hub::wire::{AcknowledgeJobArgs, Frame};
use orbitmesh::rpc_hub::Hub;
use orbitmesh::store::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

fn resilience() -> ResilienceService {
    ResilienceService::new(&ResilienceConfig {
        max_retry_attempts: 1,
        base_delay: Duration::from_millis(1),
        timeout: Duration::from_millis(500),
        failure_threshold: 10,
        break_duration: Duration::from_millis(10),
    })
}

#[tokio::test]
async fn agent_registers_receives_a_job_and_reports_completion() {
    let events = Arc::new(DashboardBroadcaster::new());
    let registry = Arc::new(AgentRegistry::new(events.clone(), Duration::from_secs(60), Duration::from_secs(30)));
    let jobs = Arc::new(JobStore::new(events));
    let router = Router::new(registry.clone(), jobs.clone());

    let hub = Hub::new(registry.clone());
    let dispatcher = Dispatcher::new(Arc::new(hub.clone()), resilience());
    let idempotency = Arc::new(IdempotencyService::new(Duration::from_secs(60)));
    let progress = Arc::new(ProgressService::new());
    let dead_letter = Arc::new(DeadLetterQueue::new());
    let orchestrator = Arc::new(Orchestrator::new(
        jobs, router, dispatcher, idempotency, progress, dead_letter, resilience(),
    ));
    hub.set_orchestrator(orchestrator.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let config = OrbitMeshConfig { port: addr.port(), ..OrbitMeshConfig::default() };
    let bind_addr = orbitmesh::rpc_hub::build_config_addr(&config);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let hub_task = tokio::spawn(hub.clone().run(bind_addr, shutdown_rx));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let url = format!("ws://127.0.0.1:{}/", addr.port());
    let (ws, _) = tokio_tungstenite::connect_async(url).await.expect("client connects");
    let (mut write, mut read) = ws.split();

    let register = Frame::notification(
        "register",
        &AgentInfo {
            id: "agent-1".into(),
            name: "agent-1".into(),
            status: AgentStatus::Created,
            tags: vec![],
            capabilities: vec![Capability::named("cpu")],
            group: None,
            hostname: None,
            version: None,
            metadata: None,
        },
    )
    .unwrap();
    write.send(Message::Binary(register.to_bytes().unwrap())).await.unwrap();

    // Give the Hub a moment to process `register` and bind the connection
    // before submitting a job for it.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let submission = orchestrator
        .submit_job(JobRequest {
            id: "job-1".into(),
            idempotency_key: None,
            command: "echo".into(),
            parameters: vec![],
            pattern: None,
            required_capabilities: vec![Capability::named("cpu")],
            required_tags: vec![],
            priority: 0,
            max_retries: 0,
            timeout: None,
            correlation_id: None,
            metadata: Default::default(),
        })
        .await;
    assert!(submission.success);

    let executed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match read.next().await {
                Some(Ok(Message::Binary(bytes))) => {
                    let frame = Frame::from_bytes(&bytes).unwrap();
                    if frame.method == "executeJob" {
                        return frame;
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("unexpected stream end: {other:?}"),
            }
        }
    })
    .await
    .expect("agent should receive executeJob");
    let dispatched: JobRequest = executed.decode_args().unwrap();
    assert_eq!(dispatched.id, "job-1");

    let ack = Frame::notification(
        "acknowledgeJob",
        &AcknowledgeJobArgs {
            job_id: "job-1".into(),
            agent_id: "agent-1".into(),
        },
    )
    .unwrap();
    write.send(Message::Binary(ack.to_bytes().unwrap())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(orchestrator.get_job("job-1").await.unwrap().status, orbitmesh::domain::JobStatus::Running);

    let result = Frame::notification(
        "reportResult",
        &JobResult {
            job_id: "job-1".into(),
            agent_id: "agent-1".into(),
            status: JobResultStatus::Completed,
            payload: Some(b"done".to_vec()),
            error: None,
            error_code: None,
            duration: Duration::from_millis(5),
        },
    )
    .unwrap();
    write.send(Message::Binary(result.to_bytes().unwrap())).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if orchestrator.get_job("job-1").await.unwrap().status == orbitmesh::domain::JobStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job should complete");

    let _ = shutdown_tx.send(true);
    let _ = hub_task.await;
}
