//! Integration tests for the validation lifecycle: submit, validator
//! spawn, review outcomes, the ACE handoff, and repeated-failure
//! diagnostics.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::mpsc;
use uuid::Uuid;

use keel_core::ace::AcePipeline;
use keel_core::diagnostic::{self, DiagnosticRequest};
use keel_core::events::EventBus;
use keel_core::queue::scorer::TaskScorer;
use keel_core::queue::{EnqueueRequest, TaskQueue};
use keel_core::spawn::AgentSpawner;
use keel_core::validation::{ReviewSubmission, ValidationOrchestrator};
use keel_db::models::{AgentKind, TaskPriority, TaskStatus};
use keel_db::queries::{memories, playbook, reviews, tasks as task_db, tickets};

use keel_test_utils::{create_test_db, drop_test_db, HashEmbedder, RecordingSink, RecordingSpawner};

const PHASE: &str = "PHASE_IMPLEMENTATION";

struct Harness {
    pool: PgPool,
    queue: Arc<TaskQueue>,
    orchestrator: Arc<ValidationOrchestrator>,
    spawner: Arc<RecordingSpawner>,
    sink: Arc<RecordingSink>,
    diagnostic_rx: mpsc::Receiver<DiagnosticRequest>,
}

async fn build_harness(pool: &PgPool) -> Harness {
    let sink = Arc::new(RecordingSink::default());
    let bus = Arc::new(EventBus::new(Some(sink.clone())));
    let embedder = Arc::new(HashEmbedder);
    let spawner = Arc::new(RecordingSpawner::new(pool.clone()));

    let queue = Arc::new(TaskQueue::new(
        pool.clone(),
        TaskScorer::default(),
        Arc::clone(&bus),
    ));

    let ace = Arc::new(AcePipeline::new(
        pool.clone(),
        embedder.clone() as Arc<dyn keel_core::embedding::Embedder>,
        None,
        Arc::clone(&bus),
    ));

    let (sender, diagnostic_rx) = diagnostic::work_queue(16);

    let orchestrator = Arc::new(ValidationOrchestrator::new(
        pool.clone(),
        spawner.clone() as Arc<dyn AgentSpawner>,
        embedder as Arc<dyn keel_core::embedding::Embedder>,
        ace,
        sender,
        bus,
        Duration::from_secs(600),
    ));

    Harness {
        pool: pool.clone(),
        queue,
        orchestrator,
        spawner,
        sink,
        diagnostic_rx,
    }
}

/// Enqueue a task and walk it to `running` with a worker assigned.
async fn start_task(harness: &Harness, ticket: Uuid) -> Uuid {
    let task = harness
        .queue
        .enqueue(EnqueueRequest::new(
            ticket,
            PHASE,
            "work",
            "implement the retry loop",
            TaskPriority::High,
        ))
        .await
        .expect("enqueue");

    harness.queue.next_ready(PHASE).await.expect("claim").expect("ready");
    let worker = harness
        .spawner
        .spawn_agent(AgentKind::Worker, PHASE, &[], &[])
        .await
        .expect("spawn worker");
    harness.queue.finalize(task.id, worker.id).await.expect("finalize");
    harness
        .queue
        .update_status(task.id, TaskStatus::Running, None, None)
        .await
        .expect("start");

    task.id
}

async fn seed_ticket(pool: &PgPool) -> Uuid {
    tickets::insert_ticket(pool, "validated work", "build it right", PHASE, TaskPriority::High, None)
        .await
        .expect("ticket")
        .id
}

#[tokio::test]
async fn passing_review_completes_task_and_records_knowledge() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;
    let harness = build_harness(&pool).await;

    let task_id = start_task(&harness, ticket).await;

    harness
        .orchestrator
        .submit_for_review(task_id, Some("c1"))
        .await
        .expect("submit");

    // Submitting spawned a validator and moved the task into review.
    let task = task_db::get_task(&pool, task_id).await.expect("get").expect("exists");
    assert_eq!(task.status, TaskStatus::ValidationInProgress);
    assert_eq!(task.validation_iteration, 1);

    // The spawned validator (the second agent registered) gives a pass.
    let validator_id = latest_validator(&harness).await;
    let outcome = harness
        .orchestrator
        .give_review(
            task_id,
            validator_id,
            ReviewSubmission {
                passed: true,
                feedback: "ok".into(),
                evidence: None,
                recommendations: None,
            },
        )
        .await
        .expect("review");
    assert_eq!(outcome.status, "completed");
    assert_eq!(outcome.iteration, 1);

    let task = task_db::get_task(&pool, task_id).await.expect("get").expect("exists");
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.review_done);

    // One review row for iteration 1.
    let review_rows = reviews::list_reviews_for_task(&pool, task_id).await.expect("reviews");
    assert_eq!(review_rows.len(), 1);
    assert_eq!(review_rows[0].iteration_number, 1);
    assert!(review_rows[0].validation_passed);

    // The ACE pipeline persisted a memory.
    let memory_rows = memories::list_memories_for_task(&pool, task_id).await.expect("memories");
    assert!(!memory_rows.is_empty());

    // Per-task event order: validation_started, then validation_passed,
    // then the ACE completion.
    let events = harness.sink.event_types_for(&task_id.to_string());
    let pos = |name: &str| {
        events
            .iter()
            .position(|e| e == name)
            .unwrap_or_else(|| panic!("missing event {name} in {events:?}"))
    };
    assert!(pos("validation_started") < pos("validation_passed"));
    assert!(pos("validation_passed") < pos("ace.workflow.completed"));

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn commit_sha_is_required_when_validation_enabled() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;
    let harness = build_harness(&pool).await;
    let task_id = start_task(&harness, ticket).await;

    let err = harness
        .orchestrator
        .submit_for_review(task_id, None)
        .await
        .expect_err("must require commit sha");
    assert!(err.to_string().contains("commit_sha"), "{err}");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn validation_disabled_completes_directly() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;
    let harness = build_harness(&pool).await;

    let mut request =
        EnqueueRequest::new(ticket, PHASE, "work", "no review needed", TaskPriority::Low);
    request.validation_enabled = false;
    let task = harness.queue.enqueue(request).await.expect("enqueue");

    harness.queue.next_ready(PHASE).await.expect("claim").expect("ready");
    harness.queue.finalize(task.id, Uuid::new_v4()).await.expect("finalize");
    harness
        .queue
        .update_status(task.id, TaskStatus::Running, None, None)
        .await
        .expect("start");

    harness
        .orchestrator
        .submit_for_review(task.id, None)
        .await
        .expect("submit without sha");

    let stored = task_db::get_task(&pool, task.id).await.expect("get").expect("exists");
    assert_eq!(stored.status, TaskStatus::Completed);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn only_validators_may_review() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;
    let harness = build_harness(&pool).await;
    let task_id = start_task(&harness, ticket).await;

    harness
        .orchestrator
        .submit_for_review(task_id, Some("c1"))
        .await
        .expect("submit");

    // A worker agent tries to self-approve.
    let worker = harness
        .spawner
        .spawn_agent(AgentKind::Worker, PHASE, &[], &[])
        .await
        .expect("spawn worker");
    let err = harness
        .orchestrator
        .give_review(
            task_id,
            worker.id,
            ReviewSubmission {
                passed: true,
                feedback: "looks great to me".into(),
                evidence: None,
                recommendations: None,
            },
        )
        .await
        .expect_err("worker must be rejected");
    assert!(matches!(err, keel_core::error::KernelError::Permission(_)), "{err}");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn failing_review_requires_feedback() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;
    let harness = build_harness(&pool).await;
    let task_id = start_task(&harness, ticket).await;

    harness
        .orchestrator
        .submit_for_review(task_id, Some("c1"))
        .await
        .expect("submit");
    let validator_id = latest_validator(&harness).await;

    let err = harness
        .orchestrator
        .give_review(
            task_id,
            validator_id,
            ReviewSubmission {
                passed: false,
                feedback: "  ".into(),
                evidence: None,
                recommendations: None,
            },
        )
        .await
        .expect_err("empty feedback must be rejected");
    assert!(err.to_string().contains("feedback"), "{err}");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn repeated_failures_request_a_diagnostic() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;
    let mut harness = build_harness(&pool).await;
    let task_id = start_task(&harness, ticket).await;

    // First failed iteration.
    harness
        .orchestrator
        .submit_for_review(task_id, Some("c1"))
        .await
        .expect("submit 1");
    let validator_id = latest_validator(&harness).await;
    harness
        .orchestrator
        .give_review(
            task_id,
            validator_id,
            ReviewSubmission {
                passed: false,
                feedback: "err1: tests missing".into(),
                evidence: None,
                recommendations: None,
            },
        )
        .await
        .expect("review 1");

    let task = task_db::get_task(&pool, task_id).await.expect("get").expect("exists");
    assert_eq!(task.status, TaskStatus::NeedsWork);
    assert_eq!(task.last_validation_feedback.as_deref(), Some("err1: tests missing"));

    // One failure does not trigger a diagnostic.
    assert!(harness.diagnostic_rx.try_recv().is_err());

    // External resume, second failed iteration.
    harness.orchestrator.resume(task_id).await.expect("resume");
    harness
        .orchestrator
        .submit_for_review(task_id, Some("c2"))
        .await
        .expect("submit 2");
    let validator_id = latest_validator(&harness).await;
    harness
        .orchestrator
        .give_review(
            task_id,
            validator_id,
            ReviewSubmission {
                passed: false,
                feedback: "err2: still failing".into(),
                evidence: None,
                recommendations: None,
            },
        )
        .await
        .expect("review 2");

    let request = harness
        .diagnostic_rx
        .try_recv()
        .expect("diagnostic requested after second failure");
    assert_eq!(request.workflow_id, ticket);
    assert_eq!(
        request.trigger.get("trigger").and_then(|v| v.as_str()),
        Some("repeated_validation_failures")
    );
    let consecutive = request
        .trigger
        .get("consecutive_failures")
        .and_then(|v| v.as_i64())
        .expect("failure count in trigger");
    assert!(consecutive >= 2);

    // Review iterations are recorded monotonically.
    let review_rows = reviews::list_reviews_for_task(&pool, task_id).await.expect("reviews");
    assert_eq!(review_rows.len(), 2);
    assert_eq!(review_rows[0].iteration_number, 2);
    assert_eq!(review_rows[1].iteration_number, 1);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn feedback_delivery_reports_agent_existence() {
    let (pool, db_name) = create_test_db().await;
    let harness = build_harness(&pool).await;

    let agent = harness
        .spawner
        .spawn_agent(AgentKind::Worker, PHASE, &[], &[])
        .await
        .expect("spawn");

    assert!(harness
        .orchestrator
        .send_feedback(agent.id, "fix the tests")
        .await
        .expect("send"));
    assert!(!harness
        .orchestrator
        .send_feedback(Uuid::new_v4(), "to nobody")
        .await
        .expect("send to missing"));

    let events = harness.sink.event_types_for(&agent.id.to_string());
    assert!(events.contains(&"agent.validation_feedback".to_owned()));

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn duplicate_insights_do_not_duplicate_playbook_entries() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;
    let harness = build_harness(&pool).await;

    // Two passing iterations with identical feedback text.
    for round in 0..2 {
        let task_id = start_task(&harness, ticket).await;
        harness
            .orchestrator
            .submit_for_review(task_id, Some("c1"))
            .await
            .expect("submit");
        let validator_id = latest_validator(&harness).await;
        harness
            .orchestrator
            .give_review(
                task_id,
                validator_id,
                ReviewSubmission {
                    passed: true,
                    feedback: "Always pin the schema version before migrating.".into(),
                    evidence: None,
                    recommendations: None,
                },
            )
            .await
            .unwrap_or_else(|e| panic!("review round {round}: {e}"));
    }

    let entries = playbook::list_active_entries(&pool, ticket).await.expect("entries");
    let pinned: Vec<_> = entries
        .iter()
        .filter(|e| e.content.contains("pin the schema version"))
        .collect();
    assert_eq!(pinned.len(), 1, "identical insight must not duplicate");

    drop_test_db(&db_name).await;
}

/// The most recently registered validator agent.
async fn latest_validator(harness: &Harness) -> Uuid {
    let row: (Uuid,) = sqlx::query_as(
        "SELECT id FROM agents WHERE agent_type = 'validator' ORDER BY created_at DESC LIMIT 1",
    )
    .fetch_one(&harness.pool)
    .await
    .expect("a validator was spawned");
    row.0
}
