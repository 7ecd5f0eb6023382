//! Integration tests for two-phase deduplication over the task scope.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use keel_core::config::DedupThresholds;
use keel_core::dedup::{DedupAction, DedupService, TaskCandidate};
use keel_core::embedding::Embedder;
use keel_db::models::{TaskPriority, TaskStatus};
use keel_db::queries::{tasks as task_db, tickets};

use keel_test_utils::{create_test_db, drop_test_db, FailingEmbedder, HashEmbedder};

const PHASE: &str = "PHASE_IMPLEMENTATION";

async fn seed_ticket(pool: &PgPool) -> Uuid {
    tickets::insert_ticket(pool, "dedup scope", "scope", PHASE, TaskPriority::Medium, None)
        .await
        .expect("ticket")
        .id
}

fn service(pool: &PgPool) -> DedupService {
    DedupService::new(
        pool.clone(),
        Arc::new(HashEmbedder),
        DedupThresholds::default(),
    )
}

/// Insert a task and persist its dedup hash + embedding the way a caller
/// acting on a `create` outcome would.
async fn persist_task_with_dedup(
    pool: &PgPool,
    dedup: &DedupService,
    ticket: Uuid,
    task_type: &str,
    description: &str,
) -> Uuid {
    let outcome = dedup
        .check_task(ticket, task_type, None, description, None, 5)
        .await
        .expect("check");
    assert_eq!(outcome.action, DedupAction::Create);

    let task = task_db::insert_task(
        pool,
        &task_db::NewTask {
            ticket_id: ticket,
            phase_id: PHASE,
            task_type,
            description,
            priority: TaskPriority::Medium,
            max_retries: 3,
            deadline_at: None,
            owned_files: None,
            validation_enabled: true,
            content_hash: Some(&outcome.content_hash),
            embedding: outcome.embedding.as_deref(),
        },
    )
    .await
    .expect("insert");
    task.id
}

#[tokio::test]
async fn exact_content_match_skips_via_hash() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;
    let dedup = service(&pool);

    persist_task_with_dedup(&pool, &dedup, ticket, "work", "Restart the ingest worker").await;

    // Same content modulo case and whitespace: phase 1 catches it.
    let outcome = dedup
        .check_task(ticket, "work", None, "  restart   the INGEST worker ", None, 5)
        .await
        .expect("check");
    assert_eq!(outcome.action, DedupAction::Skip);
    assert!(outcome.is_duplicate);
    assert_eq!(outcome.highest_similarity, 1.0);
    assert!(outcome.candidates[0].is_exact_match);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn reworded_duplicate_skips_via_embedding() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;
    let dedup = service(&pool);

    persist_task_with_dedup(
        &pool,
        &dedup,
        ticket,
        "work",
        "restart the stalled ingest worker process",
    )
    .await;

    // Different word order: the hash differs but the bag-of-words
    // embedding is identical.
    let outcome = dedup
        .check_task(
            ticket,
            "work",
            None,
            "the stalled ingest worker process restart",
            None,
            5,
        )
        .await
        .expect("check");
    assert_eq!(outcome.action, DedupAction::Skip);
    assert!(!outcome.candidates[0].is_exact_match);
    assert!(outcome.highest_similarity >= 0.85);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn unrelated_content_creates() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;
    let dedup = service(&pool);

    persist_task_with_dedup(&pool, &dedup, ticket, "work", "restart the ingest worker").await;

    let outcome = dedup
        .check_task(ticket, "work", None, "write onboarding documentation", None, 5)
        .await
        .expect("check");
    assert_eq!(outcome.action, DedupAction::Create);
    assert!(!outcome.is_duplicate);
    assert!(outcome.embedding.is_some());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn terminal_tasks_leave_dedup_scope() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;
    let dedup = service(&pool);

    let existing =
        persist_task_with_dedup(&pool, &dedup, ticket, "work", "rebuild the search index").await;
    sqlx::query("UPDATE tasks SET status = $1 WHERE id = $2")
        .bind(TaskStatus::Completed)
        .bind(existing)
        .execute(&pool)
        .await
        .expect("complete");

    // A completed twin is no reason to suppress new work.
    let outcome = dedup
        .check_task(ticket, "work", None, "rebuild the search index", None, 5)
        .await
        .expect("check");
    assert_eq!(outcome.action, DedupAction::Create);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn embedder_failure_degrades_to_hash_only() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;

    let dedup = DedupService::new(
        pool.clone(),
        Arc::new(FailingEmbedder),
        DedupThresholds::default(),
    );

    let outcome = dedup
        .check_task(ticket, "work", None, "anything at all", None, 5)
        .await
        .expect("hash-only path must not error");
    assert_eq!(outcome.action, DedupAction::Create);
    assert!(outcome.embedding.is_none());
    assert!(!outcome.content_hash.is_empty());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn empty_scope_returns_create_not_error() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;
    let dedup = service(&pool);

    let outcome = dedup
        .check_task(ticket, "work", None, "first task ever", None, 5)
        .await
        .expect("empty scope is fine");
    assert_eq!(outcome.action, DedupAction::Create);
    assert!(outcome.candidates.is_empty());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn bulk_dedup_partitions_preserve_order() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;
    let dedup = service(&pool);

    persist_task_with_dedup(&pool, &dedup, ticket, "work", "migrate the billing schema").await;

    let items = vec![
        TaskCandidate {
            task_type: "work".into(),
            title: None,
            description: "add rate limiting to the api".into(),
        },
        TaskCandidate {
            task_type: "work".into(),
            title: None,
            description: "migrate the billing schema".into(),
        },
        TaskCandidate {
            task_type: "work".into(),
            title: None,
            description: "add dashboards for the queue".into(),
        },
    ];

    let result = dedup.bulk_check_tasks(ticket, items).await.expect("bulk");
    let (total, created, skipped, merged) = result.stats();
    assert_eq!(total, 3);
    assert_eq!(created, 2);
    assert_eq!(skipped, 1);
    assert_eq!(merged, 0);

    assert_eq!(result.to_create[0].description, "add rate limiting to the api");
    assert_eq!(result.to_create[1].description, "add dashboards for the queue");
    assert_eq!(result.to_skip[0].description, "migrate the billing schema");

    drop_test_db(&db_name).await;
}
