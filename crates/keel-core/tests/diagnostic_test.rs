//! Integration tests for the diagnostic engine: stuck detection with its
//! safeguards, the spawn pipeline, dedup-gated skips, and fallback
//! diagnosis.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use keel_core::config::{DedupThresholds, DiagnosticConfig};
use keel_core::dedup::DedupService;
use keel_core::diagnostic::DiagnosticEngine;
use keel_core::discovery::DiscoveryService;
use keel_core::embedding::Embedder;
use keel_core::events::EventBus;
use keel_core::llm::LlmGateway;
use keel_core::queue::scorer::TaskScorer;
use keel_core::queue::TaskQueue;
use keel_db::models::{DiagnosticRunStatus, TaskPriority, TaskStatus};
use keel_db::queries::{agents, diagnostics, tasks as task_db, tickets};

use keel_test_utils::{create_test_db, drop_test_db, HashEmbedder, RecordingSink, ScriptedGateway};

const PHASE: &str = "PHASE_IMPLEMENTATION";

fn test_config() -> DiagnosticConfig {
    DiagnosticConfig {
        stuck_threshold_s: 0,
        cooldown_s: 0,
        max_consecutive_failures: 3,
        max_diagnostics_per_workflow: 10,
        max_recovery_tasks: 5,
    }
}

fn build_engine(
    pool: &PgPool,
    gateway: Option<Arc<dyn LlmGateway>>,
    config: DiagnosticConfig,
) -> (Arc<DiagnosticEngine>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let bus = Arc::new(EventBus::new(Some(sink.clone())));
    let embedder = Arc::new(HashEmbedder) as Arc<dyn Embedder>;

    let queue = Arc::new(TaskQueue::new(
        pool.clone(),
        TaskScorer::default(),
        Arc::clone(&bus),
    ));
    let discovery = Arc::new(DiscoveryService::new(pool.clone(), queue, Arc::clone(&bus)));
    let dedup = Arc::new(DedupService::new(
        pool.clone(),
        embedder,
        DedupThresholds::default(),
    ));

    let engine = Arc::new(DiagnosticEngine::new(
        pool.clone(),
        discovery,
        dedup,
        gateway,
        bus,
        config,
    ));
    (engine, sink)
}

/// Seed a clone-ready ticket: project, owner, and GitHub token in place.
async fn seed_clone_ready_ticket(pool: &PgPool) -> Uuid {
    let owner = agents::insert_user(pool, "maintainer", Some("ghp_token"))
        .await
        .expect("user");
    let project = agents::insert_project(pool, "svc", Some(owner.id), Some("org/svc"))
        .await
        .expect("project");
    tickets::insert_ticket(
        pool,
        "stuck workflow",
        "deliver the feature",
        PHASE,
        TaskPriority::High,
        Some(project.id),
    )
    .await
    .expect("ticket")
    .id
}

/// Insert a task directly in a given status.
async fn seed_task_in_status(
    pool: &PgPool,
    ticket_id: Uuid,
    task_type: &str,
    status: TaskStatus,
) -> Uuid {
    let task = task_db::insert_task(
        pool,
        &task_db::NewTask {
            ticket_id,
            phase_id: PHASE,
            task_type,
            description: "original work item",
            priority: TaskPriority::Medium,
            max_retries: 3,
            deadline_at: None,
            owned_files: None,
            validation_enabled: true,
            content_hash: None,
            embedding: None,
        },
    )
    .await
    .expect("task");
    sqlx::query("UPDATE tasks SET status = $1, completed_at = NOW() WHERE id = $2")
        .bind(status)
        .bind(task.id)
        .execute(pool)
        .await
        .expect("force status");
    task.id
}

#[tokio::test]
async fn failed_workflow_is_detected_as_stuck() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_clone_ready_ticket(&pool).await;
    seed_task_in_status(&pool, ticket, "work", TaskStatus::Failed).await;

    let (engine, _sink) = build_engine(&pool, None, test_config());
    let stuck = engine.find_stuck_workflows().await.expect("scan");

    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].workflow_id, ticket);
    assert_eq!(stuck[0].failed_tasks, 1);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn all_completed_without_failures_is_not_stuck() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_clone_ready_ticket(&pool).await;
    seed_task_in_status(&pool, ticket, "work", TaskStatus::Completed).await;
    seed_task_in_status(&pool, ticket, "work", TaskStatus::Completed).await;

    let (engine, _sink) = build_engine(&pool, None, test_config());
    let stuck = engine.find_stuck_workflows().await.expect("scan");
    assert!(stuck.is_empty(), "successful workflow must not be diagnosed");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn active_tasks_suppress_detection() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_clone_ready_ticket(&pool).await;
    seed_task_in_status(&pool, ticket, "work", TaskStatus::Failed).await;
    seed_task_in_status(&pool, ticket, "work", TaskStatus::Running).await;

    let (engine, _sink) = build_engine(&pool, None, test_config());
    assert!(engine.find_stuck_workflows().await.expect("scan").is_empty());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn pending_recovery_work_suppresses_detection() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_clone_ready_ticket(&pool).await;
    seed_task_in_status(&pool, ticket, "work", TaskStatus::Failed).await;
    seed_task_in_status(
        &pool,
        ticket,
        "discovery_diagnostic_no_result",
        TaskStatus::Pending,
    )
    .await;

    let (engine, _sink) = build_engine(&pool, None, test_config());
    assert!(engine.find_stuck_workflows().await.expect("scan").is_empty());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn exhausted_diagnostics_defer_to_humans() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_clone_ready_ticket(&pool).await;
    seed_task_in_status(&pool, ticket, "work", TaskStatus::Failed).await;
    seed_task_in_status(
        &pool,
        ticket,
        "discovery_diagnostic_no_result",
        TaskStatus::Completed,
    )
    .await;

    let (engine, _sink) = build_engine(&pool, None, test_config());
    assert!(
        engine.find_stuck_workflows().await.expect("scan").is_empty(),
        "completed diagnostics plus failed originals means human review"
    );

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn missing_project_link_skips_workflow() {
    let (pool, db_name) = create_test_db().await;
    let ticket = tickets::insert_ticket(
        &pool,
        "orphan workflow",
        "no project attached",
        PHASE,
        TaskPriority::High,
        None,
    )
    .await
    .expect("ticket")
    .id;
    seed_task_in_status(&pool, ticket, "work", TaskStatus::Failed).await;

    let (engine, _sink) = build_engine(&pool, None, test_config());
    assert!(engine.find_stuck_workflows().await.expect("scan").is_empty());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn run_ceiling_stops_further_diagnostics() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_clone_ready_ticket(&pool).await;
    seed_task_in_status(&pool, ticket, "work", TaskStatus::Failed).await;

    let config = DiagnosticConfig {
        max_diagnostics_per_workflow: 1,
        ..test_config()
    };
    let (engine, _sink) = build_engine(&pool, None, config);

    // First scan finds it; a run is recorded.
    let stuck = engine.find_stuck_workflows().await.expect("scan");
    assert_eq!(stuck.len(), 1);
    engine
        .spawn_diagnostic(
            ticket,
            stuck[0].time_stuck_seconds,
            serde_json::json!({"trigger": "test"}),
            5,
        )
        .await
        .expect("spawn");

    // Recovery work is now pending, and even after it concludes the run
    // ceiling keeps the workflow out of scope.
    sqlx::query("UPDATE tasks SET status = 'completed', completed_at = NOW() WHERE task_type LIKE 'discovery_diagnostic%'")
        .execute(&pool)
        .await
        .expect("conclude recovery");
    sqlx::query("UPDATE tasks SET status = 'failed' WHERE task_type = 'work'")
        .execute(&pool)
        .await
        .expect("keep original failed");

    assert!(engine.find_stuck_workflows().await.expect("scan").is_empty());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn spawn_uses_analysis_and_boosts_recovery_priority() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_clone_ready_ticket(&pool).await;
    seed_task_in_status(&pool, ticket, "work", TaskStatus::Failed).await;

    let gateway = Arc::new(ScriptedGateway::new(vec![serde_json::json!({
        "root_cause": "worker lost database connectivity",
        "hypotheses": [
            {"statement": "pool exhausted under load", "likelihood": 0.7}
        ],
        "recommendations": [
            {"description": "re-run the failing tests and validate connectivity", "priority": "HIGH"}
        ]
    })]));

    let (engine, sink) = build_engine(&pool, Some(gateway as Arc<dyn LlmGateway>), test_config());
    let run_id = engine
        .spawn_diagnostic(ticket, 120, serde_json::json!({"trigger": "test"}), 5)
        .await
        .expect("spawn");

    let run = diagnostics::get_run(&pool, run_id).await.expect("get").expect("exists");
    assert_eq!(run.status, DiagnosticRunStatus::Completed);
    assert_eq!(run.tasks_created_count, 1);
    let diagnosis = run.diagnosis.expect("diagnosis recorded");
    assert!(diagnosis.contains("Root Cause: worker lost database connectivity"));

    // The recovery task went through the discovery branch with a boost
    // and routed to the testing phase per the recommendation.
    let recovery_id = run.tasks_created_ids.expect("ids")[0];
    let recovery = task_db::get_task(&pool, recovery_id).await.expect("get").expect("exists");
    assert_eq!(recovery.task_type, "discovery_diagnostic_no_result");
    assert_eq!(recovery.phase_id, "PHASE_TESTING");
    assert_eq!(recovery.priority, TaskPriority::Critical);
    assert!(recovery.embedding.is_some(), "embedding stored for future dedup");

    let run_events = sink.event_types_for(&run_id.to_string());
    assert_eq!(run_events, vec!["diagnostic.triggered", "diagnostic.completed"]);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn gateway_failure_degrades_to_fallback_diagnosis() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_clone_ready_ticket(&pool).await;
    seed_task_in_status(&pool, ticket, "work", TaskStatus::Failed).await;

    let gateway = Arc::new(ScriptedGateway::failing());
    let (engine, _sink) = build_engine(&pool, Some(gateway as Arc<dyn LlmGateway>), test_config());

    let run_id = engine
        .spawn_diagnostic(ticket, 300, serde_json::json!({"trigger": "test"}), 5)
        .await
        .expect("spawn");

    let run = diagnostics::get_run(&pool, run_id).await.expect("get").expect("exists");
    assert_eq!(run.status, DiagnosticRunStatus::Completed);
    let diagnosis = run.diagnosis.expect("diagnosis");
    assert!(
        diagnosis.contains("Diagnostic triggered: workflow stuck for 300 seconds"),
        "fallback diagnosis expected, got: {diagnosis}"
    );

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn semantically_duplicate_diagnosis_skips_the_run() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_clone_ready_ticket(&pool).await;
    seed_task_in_status(&pool, ticket, "work", TaskStatus::Failed).await;

    // A pending diagnostic task whose embedding matches the upcoming
    // fallback diagnosis exactly.
    let fallback = "Diagnostic triggered: workflow stuck for 120 seconds. \
                    All tasks completed but no validated result.";
    let content = format!("discovery_diagnostic_no_result: \n{fallback}");
    let embedding = HashEmbedder.embed(&content).await.expect("embed");
    let pending = task_db::insert_task(
        &pool,
        &task_db::NewTask {
            ticket_id: ticket,
            phase_id: PHASE,
            task_type: "discovery_diagnostic_no_result",
            description: fallback,
            priority: TaskPriority::High,
            max_retries: 3,
            deadline_at: None,
            owned_files: None,
            validation_enabled: true,
            content_hash: None,
            embedding: Some(&embedding),
        },
    )
    .await
    .expect("pending diagnostic task");

    let (engine, _sink) = build_engine(&pool, None, test_config());
    let run_id = engine
        .spawn_diagnostic(ticket, 120, serde_json::json!({"trigger": "test"}), 5)
        .await
        .expect("spawn");

    // Callers refetch: skipped is the persisted outcome.
    let run = diagnostics::get_run(&pool, run_id).await.expect("get").expect("exists");
    assert_eq!(run.status, DiagnosticRunStatus::Skipped);
    assert_eq!(run.tasks_created_count, 0);
    assert!(run.diagnosis.expect("diagnosis").contains("Skipped"));

    // No task beyond the pre-existing pending one was spawned.
    let all = task_db::list_tasks_for_ticket(&pool, ticket).await.expect("tasks");
    let diagnostic_tasks: Vec<_> = all
        .iter()
        .filter(|t| t.task_type.starts_with("discovery_diagnostic"))
        .collect();
    assert_eq!(diagnostic_tasks.len(), 1);
    assert_eq!(diagnostic_tasks[0].id, pending.id);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn failure_counters_track_recovery_outcomes() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_clone_ready_ticket(&pool).await;
    seed_task_in_status(&pool, ticket, "work", TaskStatus::Failed).await;

    let (engine, _sink) = build_engine(&pool, None, test_config());
    let run_id = engine
        .spawn_diagnostic(ticket, 60, serde_json::json!({"trigger": "test"}), 5)
        .await
        .expect("spawn");

    // The recovery task fails: the workflow's counter increments.
    sqlx::query("UPDATE tasks SET status = 'failed', completed_at = NOW() WHERE task_type LIKE 'discovery_diagnostic%'")
        .execute(&pool)
        .await
        .expect("fail recovery");
    engine.check_outcomes().await.expect("outcomes");
    assert_eq!(engine.failure_stats().get(&ticket), Some(&1));

    // The recovery task later completes: the counter clears.
    sqlx::query("UPDATE tasks SET status = 'completed' WHERE task_type LIKE 'discovery_diagnostic%'")
        .execute(&pool)
        .await
        .expect("complete recovery");
    engine.check_outcomes().await.expect("outcomes");
    assert!(engine.failure_stats().get(&ticket).is_none());

    let run = diagnostics::get_run(&pool, run_id).await.expect("get").expect("exists");
    assert_eq!(run.status, DiagnosticRunStatus::Completed);

    drop_test_db(&db_name).await;
}
