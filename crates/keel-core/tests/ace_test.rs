//! Integration tests for the ACE pipeline: memory capture, playbook
//! curation, tagging, and idempotence.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use keel_core::ace::{AcePipeline, TaskCompletion};
use keel_core::embedding::Embedder;
use keel_core::events::EventBus;
use keel_core::llm::LlmGateway;
use keel_db::models::{MemoryType, PlaybookCategory, Task, TaskPriority};
use keel_db::queries::{memories, playbook, tasks as task_db, tickets};

use keel_test_utils::{create_test_db, drop_test_db, HashEmbedder, RecordingSink, ScriptedGateway};

const PHASE: &str = "PHASE_IMPLEMENTATION";

async fn seed_task(pool: &PgPool) -> Task {
    let ticket = tickets::insert_ticket(
        pool,
        "knowledge capture",
        "learn from the work",
        PHASE,
        TaskPriority::Medium,
        None,
    )
    .await
    .expect("ticket");

    task_db::insert_task(
        pool,
        &task_db::NewTask {
            ticket_id: ticket.id,
            phase_id: PHASE,
            task_type: "work",
            description: "wire the config loader into the daemon",
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
    .expect("task")
}

fn build_pipeline(pool: &PgPool) -> (AcePipeline, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let bus = Arc::new(EventBus::new(Some(sink.clone())));
    let pipeline = AcePipeline::new(
        pool.clone(),
        Arc::new(HashEmbedder) as Arc<dyn Embedder>,
        None,
        bus,
    );
    (pipeline, sink)
}

fn completion_with_insight() -> TaskCompletion {
    TaskCompletion {
        goal: "wire the config loader into the daemon".into(),
        result: "Loader wired. Always validate the env overrides before applying them.".into(),
        feedback: Some("Careful with precedence between file and env values.".into()),
        tool_usage: vec![
            serde_json::json!({"tool_name": "file_edit", "arguments": {"path": "src/config.rs"}}),
            serde_json::json!({"tool_name": "file_read", "arguments": {"file_path": "src/main.rs"}}),
        ],
        success: true,
        agent_id: None,
    }
}

#[tokio::test]
async fn pipeline_records_memory_and_playbook_entries() {
    let (pool, db_name) = create_test_db().await;
    let task = seed_task(&pool).await;
    let (pipeline, sink) = build_pipeline(&pool);

    let outcome = pipeline
        .run(&task, &completion_with_insight())
        .await
        .expect("pipeline run");

    let memory_id = outcome.memory_id.expect("memory persisted");
    let memory = memories::get_memory(&pool, memory_id)
        .await
        .expect("get")
        .expect("exists");
    assert!(memory.success);
    assert!(memory.execution_summary.contains("Loader wired"));
    assert!(memory.execution_summary.contains("Feedback:"));
    assert_eq!(memory.reused_count, 0);

    // "always ..." lands in patterns, "careful ..." in gotchas.
    let entries = playbook::list_active_entries(&pool, task.ticket_id)
        .await
        .expect("entries");
    assert!(outcome.entries_added >= 2);
    assert!(entries
        .iter()
        .any(|e| e.category == PlaybookCategory::Patterns && e.content.contains("always validate")));
    assert!(entries
        .iter()
        .any(|e| e.category == PlaybookCategory::Gotchas && e.content.contains("careful")));

    // Every new entry is backed by the memory that produced it.
    for entry in &entries {
        assert_eq!(entry.supporting_memory_ids, vec![memory_id]);
        assert!(entry.embedding.is_some());
    }

    let events = sink.event_types_for(&task.id.to_string());
    assert!(events.contains(&"ace.workflow.completed".to_owned()));

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn repeated_runs_do_not_duplicate_entries() {
    let (pool, db_name) = create_test_db().await;
    let task = seed_task(&pool).await;
    let (pipeline, _sink) = build_pipeline(&pool);

    let first = pipeline
        .run(&task, &completion_with_insight())
        .await
        .expect("first run");
    assert!(first.entries_added >= 2);

    let second = pipeline
        .run(&task, &completion_with_insight())
        .await
        .expect("second run");
    assert_eq!(second.entries_added, 0, "identical insights must be rejected");

    // The memory log is append-only, so two runs mean two memories, but
    // the playbook holds one entry per distinct insight.
    let memory_rows = memories::list_memories_for_task(&pool, task.id)
        .await
        .expect("memories");
    assert_eq!(memory_rows.len(), 2);

    let entries = playbook::list_active_entries(&pool, task.ticket_id)
        .await
        .expect("entries");
    let mut contents: Vec<&str> = entries.iter().map(|e| e.content.as_str()).collect();
    let before = contents.len();
    contents.dedup();
    assert_eq!(contents.len(), before, "no duplicate entry content");
    assert_eq!(entries.len(), first.entries_added);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn curation_is_idempotent_per_memory() {
    let (pool, db_name) = create_test_db().await;
    let task = seed_task(&pool).await;
    let (pipeline, _sink) = build_pipeline(&pool);

    let outcome = pipeline
        .run(&task, &completion_with_insight())
        .await
        .expect("run");
    let memory_id = outcome.memory_id.expect("memory");

    // Re-curating the same memory directly is a no-op.
    let curator = keel_core::ace::curator::Curator::new(
        pool.clone(),
        Arc::new(HashEmbedder) as Arc<dyn Embedder>,
    );
    let insights = keel_core::ace::reflector::extract_insights(
        "wire the config loader into the daemon",
        "Loader wired. Always validate the env overrides before applying them.",
        "Careful with precedence between file and env values.",
    );
    let rerun = curator
        .curate(task.ticket_id, memory_id, None, &[], &insights)
        .await
        .expect("curate");
    assert!(rerun.entries_added.is_empty());
    assert!(rerun.change_id.is_none());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn reflector_tags_related_entries_with_new_memory() {
    let (pool, db_name) = create_test_db().await;
    let task = seed_task(&pool).await;
    let (pipeline, _sink) = build_pipeline(&pool);

    // First run seeds playbook entries.
    let first = pipeline
        .run(&task, &completion_with_insight())
        .await
        .expect("first run");
    let first_memory = first.memory_id.expect("memory");

    // A later completion whose text closely matches a seeded entry
    // relates to it and tags it with the new memory.
    let followup = TaskCompletion {
        goal: "validate the env overrides".into(),
        result: "always validate the env overrides before applying them".into(),
        feedback: None,
        tool_usage: Vec::new(),
        success: true,
        agent_id: None,
    };
    let second = pipeline.run(&task, &followup).await.expect("second run");
    let second_memory = second.memory_id.expect("memory");
    assert!(second.entries_tagged >= 1);

    let entries = playbook::list_active_entries(&pool, task.ticket_id)
        .await
        .expect("entries");
    let tagged_entry = entries
        .iter()
        .find(|e| e.supporting_memory_ids.contains(&second_memory))
        .expect("an entry carries the new memory id");
    assert!(tagged_entry.supporting_memory_ids.contains(&first_memory));

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn gateway_classification_is_used_when_available() {
    let (pool, db_name) = create_test_db().await;
    let task = seed_task(&pool).await;

    let sink = Arc::new(RecordingSink::default());
    let bus = Arc::new(EventBus::new(Some(sink)));
    let gateway = Arc::new(ScriptedGateway::new(vec![serde_json::json!({
        "memory_type": "codebase_knowledge",
        "confidence": 0.9,
        "reasoning": "describes module structure"
    })]));
    let pipeline = AcePipeline::new(
        pool.clone(),
        Arc::new(HashEmbedder) as Arc<dyn Embedder>,
        Some(gateway as Arc<dyn LlmGateway>),
        bus,
    );

    let completion = TaskCompletion {
        goal: "map the crate layout".into(),
        result: "documented how modules depend on each other".into(),
        feedback: None,
        tool_usage: Vec::new(),
        success: true,
        agent_id: None,
    };
    let outcome = pipeline.run(&task, &completion).await.expect("run");

    let memory = memories::get_memory(&pool, outcome.memory_id.expect("memory"))
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(memory.memory_type, MemoryType::CodebaseKnowledge);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn reuse_counter_is_the_only_mutation() {
    let (pool, db_name) = create_test_db().await;
    let task = seed_task(&pool).await;
    let (pipeline, _sink) = build_pipeline(&pool);

    let outcome = pipeline
        .run(&task, &completion_with_insight())
        .await
        .expect("run");
    let memory_id = outcome.memory_id.expect("memory");

    memories::increment_reused_count(&pool, memory_id)
        .await
        .expect("increment");
    memories::increment_reused_count(&pool, memory_id)
        .await
        .expect("increment");

    let memory = memories::get_memory(&pool, memory_id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(memory.reused_count, 2);

    assert!(memories::increment_reused_count(&pool, Uuid::new_v4())
        .await
        .is_err());

    drop_test_db(&db_name).await;
}
