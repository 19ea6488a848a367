//! End-to-end flows through the coordination facade with the in-process
//! channel transport.

use std::sync::Arc;
use std::time::Duration;

use agent_mesh::{
    ChannelTransport, CoordinationMesh, FnHealthChecker, MeshConfig, MessageTransport,
    TaskDefinition, TaskStatus,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn test_config() -> MeshConfig {
    let mut config = MeshConfig::default();
    config.orchestrator.poll_interval_ms = 20;
    config.orchestrator.dispatch_timeout_ms = 500;
    config.consensus.gate_poll_interval_ms = 10;
    config.consensus.expiry_sweep_interval_ms = 50;
    config
}

fn build_mesh() -> (Arc<CoordinationMesh>, Arc<ChannelTransport>) {
    init_tracing();
    let transport = Arc::new(ChannelTransport::new(256, Duration::from_millis(300)));
    let checker = Arc::new(FnHealthChecker::new(|_| Ok(())));
    let mesh = CoordinationMesh::new(
        test_config(),
        Arc::clone(&transport) as Arc<dyn MessageTransport>,
        checker,
    )
    .unwrap();
    (Arc::new(mesh), transport)
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Worker that accepts every envelope and reports completion once the
/// orchestrator has marked the task running.
fn spawn_worker(mesh: Arc<CoordinationMesh>, transport: &ChannelTransport, agent_id: &str) {
    let mut mailbox = transport.subscribe(agent_id);
    tokio::spawn(async move {
        while let Some(envelope) = mailbox.recv().await {
            mailbox.ack(&envelope, true).ok();

            let mesh = Arc::clone(&mesh);
            tokio::spawn(async move {
                for _ in 0..100 {
                    let running = mesh
                        .get_task_status(&envelope.task_id)
                        .map(|e| e.status == TaskStatus::Running)
                        .unwrap_or(false);
                    if running {
                        mesh.complete_task(
                            &envelope.task_id,
                            serde_json::json!({"echo": envelope.input_data}),
                        )
                        .ok();
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            });
        }
    });
}

#[tokio::test]
async fn test_task_flows_to_completion() {
    let (mesh, transport) = build_mesh();
    mesh.register_agent_service("agent-1", "worker", vec!["math".into()], vec![])
        .unwrap();
    spawn_worker(Arc::clone(&mesh), &transport, "agent-1");
    mesh.start();

    let task_id = mesh
        .submit_distributed_task(
            TaskDefinition::new("sum", "compute")
                .with_required_capabilities(vec!["math".into()])
                .with_input(serde_json::json!({"values": [1, 2, 3]})),
        )
        .unwrap();

    let done = wait_for(|| {
        mesh.get_task_status(&task_id)
            .map(|e| e.status == TaskStatus::Completed)
            .unwrap_or(false)
    })
    .await;
    assert!(done, "task should complete end to end");

    let execution = mesh.get_task_status(&task_id).unwrap();
    assert_eq!(execution.assigned_agent.as_deref(), Some("agent-1"));
    assert_eq!(execution.progress_pct, 100);
    assert!(execution.output_data.is_some());

    let stats = mesh.comprehensive_stats();
    assert_eq!(stats.orchestrator.dispatched, 1);
    assert_eq!(stats.scheduler.completed, 1);
    // Completion released the dispatch connection.
    assert_eq!(stats.balancer.active_connections, 0);
    mesh.stop();
}

#[tokio::test]
async fn test_declining_agent_exhausts_retries() {
    let (mesh, transport) = build_mesh();
    mesh.register_agent_service("agent-1", "worker", vec!["math".into()], vec![])
        .unwrap();

    let mut mailbox = transport.subscribe("agent-1");
    tokio::spawn(async move {
        while let Some(envelope) = mailbox.recv().await {
            mailbox.ack(&envelope, false).ok();
        }
    });
    mesh.start();

    let task_id = mesh
        .submit_distributed_task(
            TaskDefinition::new("sum", "compute")
                .with_required_capabilities(vec!["math".into()])
                .with_max_retries(2),
        )
        .unwrap();

    let exhausted = wait_for(|| {
        mesh.get_task_status(&task_id)
            .map(|e| e.status == TaskStatus::Failed && e.attempt_number == 2)
            .unwrap_or(false)
    })
    .await;
    assert!(exhausted, "task should fail after the retry budget");

    // Terminal: nothing re-queues it afterwards.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let execution = mesh.get_task_status(&task_id).unwrap();
    assert_eq!(execution.status, TaskStatus::Failed);
    assert_eq!(execution.retry_history.len(), 1);
    assert!(mesh.scheduler().next_task().is_none());
    mesh.stop();
}

#[tokio::test]
async fn test_round_robin_over_three_agents() {
    let (mesh, _transport) = build_mesh();
    let a1 = mesh
        .register_agent_service("a1", "worker", vec!["math".into()], vec![])
        .unwrap();
    let a2 = mesh
        .register_agent_service("a2", "worker", vec!["math".into()], vec![])
        .unwrap();
    let a3 = mesh
        .register_agent_service("a3", "worker", vec!["math".into()], vec![])
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let chosen = mesh.select_agent(Some("math")).unwrap();
        seen.push(chosen.service_id.clone());
        mesh.release_agent(&chosen.service_id);
    }
    assert_eq!(seen, vec![a1, a2, a3]);
}

#[tokio::test]
async fn test_consensus_gated_task_dispatches_after_votes() {
    let (mesh, transport) = build_mesh();
    for i in 1..=3 {
        let agent = format!("agent-{}", i);
        mesh.register_agent_service(&agent, "worker", vec!["math".into()], vec![])
            .unwrap();
        spawn_worker(Arc::clone(&mesh), &transport, &agent);
    }
    mesh.start();

    let task_id = mesh
        .submit_distributed_task(
            TaskDefinition::new("sum", "compute")
                .with_required_capabilities(vec!["math".into()])
                .require_consensus(),
        )
        .unwrap();

    // The gate opens a majority proposal over the healthy agents.
    let opened = wait_for(|| !mesh.consensus().active_proposal_ids().is_empty()).await;
    assert!(opened, "gate proposal should open");
    let proposal_id = mesh.consensus().active_proposal_ids()[0].clone();

    mesh.cast_vote(&proposal_id, "agent-1", true, 1.0).unwrap();
    mesh.cast_vote(&proposal_id, "agent-2", true, 1.0).unwrap();

    let done = wait_for(|| {
        mesh.get_task_status(&task_id)
            .map(|e| e.status == TaskStatus::Completed)
            .unwrap_or(false)
    })
    .await;
    assert!(done, "gated task should run once the proposal is accepted");
    mesh.stop();
}

#[tokio::test]
async fn test_stop_halts_dispatch() {
    let (mesh, transport) = build_mesh();
    mesh.register_agent_service("agent-1", "worker", vec!["math".into()], vec![])
        .unwrap();
    spawn_worker(Arc::clone(&mesh), &transport, "agent-1");

    mesh.start();
    mesh.stop();
    assert!(!mesh.is_running());

    // Submission is rejected while stopped, so nothing reaches the worker.
    let result = mesh.submit_distributed_task(TaskDefinition::new("sum", "compute"));
    assert!(result.is_err());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mesh.comprehensive_stats().orchestrator.dispatched, 0);
}
