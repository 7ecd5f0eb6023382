//! Integration tests for ownership validation between parallel siblings.

use sqlx::PgPool;
use uuid::Uuid;

use keel_core::ownership::OwnershipValidator;
use keel_db::models::{Task, TaskPriority, TaskStatus};
use keel_db::queries::{tasks as task_db, tickets};

use keel_test_utils::{create_test_db, drop_test_db};

const PHASE: &str = "PHASE_IMPLEMENTATION";

async fn seed_ticket(pool: &PgPool) -> Uuid {
    tickets::insert_ticket(pool, "parallel work", "split it up", PHASE, TaskPriority::Medium, None)
        .await
        .expect("ticket")
        .id
}

async fn seed_owned_task(pool: &PgPool, ticket: Uuid, patterns: &[&str]) -> Task {
    let owned: Vec<String> = patterns.iter().map(|p| (*p).to_owned()).collect();
    task_db::insert_task(
        pool,
        &task_db::NewTask {
            ticket_id: ticket,
            phase_id: PHASE,
            task_type: "work",
            description: "parallel slice",
            priority: TaskPriority::Medium,
            max_retries: 3,
            deadline_at: None,
            owned_files: Some(&owned),
            validation_enabled: true,
            content_hash: None,
            embedding: None,
        },
    )
    .await
    .expect("task")
}

#[tokio::test]
async fn lenient_mode_warns_on_overlap() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;

    let broad = seed_owned_task(&pool, ticket, &["src/auth/**"]).await;
    let narrow = seed_owned_task(&pool, ticket, &["src/auth/jwt.py"]).await;

    let validator = OwnershipValidator::new(pool.clone(), false);
    let validation = validator
        .validate_task_ownership(&narrow)
        .await
        .expect("validate");

    assert!(validation.valid);
    assert!(validation.conflicts.is_empty());
    assert_eq!(validation.warnings.len(), 1);
    let expected = format!(
        "Ownership conflict with task {}: pattern 'src/auth/jwt.py' overlaps with 'src/auth/**'",
        broad.id
    );
    assert_eq!(validation.warnings[0], expected);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn strict_mode_blocks_on_overlap() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;

    seed_owned_task(&pool, ticket, &["src/auth/**"]).await;
    let narrow = seed_owned_task(&pool, ticket, &["src/auth/jwt.py"]).await;

    let validator = OwnershipValidator::new(pool.clone(), true);
    let validation = validator
        .validate_task_ownership(&narrow)
        .await
        .expect("validate");

    assert!(!validation.valid);
    assert_eq!(validation.conflicts.len(), 1);
    assert_eq!(validation.conflicts[0].task_pattern, "src/auth/jwt.py");
    assert_eq!(validation.conflicts[0].sibling_pattern, "src/auth/**");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn disjoint_patterns_validate_cleanly_in_strict_mode() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;

    seed_owned_task(&pool, ticket, &["src/auth/**"]).await;
    let billing = seed_owned_task(&pool, ticket, &["src/billing/**", "docs/billing.md"]).await;

    let validator = OwnershipValidator::new(pool.clone(), true);
    let validation = validator
        .validate_task_ownership(&billing)
        .await
        .expect("validate");

    assert!(validation.valid);
    assert!(validation.conflicts.is_empty());
    assert!(validation.warnings.is_empty());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn terminal_siblings_are_not_parallel() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;

    let finished = seed_owned_task(&pool, ticket, &["src/auth/**"]).await;
    sqlx::query("UPDATE tasks SET status = $1 WHERE id = $2")
        .bind(TaskStatus::Completed)
        .bind(finished.id)
        .execute(&pool)
        .await
        .expect("complete sibling");

    let narrow = seed_owned_task(&pool, ticket, &["src/auth/jwt.py"]).await;

    let validator = OwnershipValidator::new(pool.clone(), true);
    let validation = validator
        .validate_task_ownership(&narrow)
        .await
        .expect("validate");

    assert!(validation.valid, "completed siblings no longer own files");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn tasks_without_patterns_have_no_restrictions() {
    let (pool, db_name) = create_test_db().await;
    let ticket = seed_ticket(&pool).await;

    seed_owned_task(&pool, ticket, &["src/**"]).await;
    let unrestricted = task_db::insert_task(
        &pool,
        &task_db::NewTask {
            ticket_id: ticket,
            phase_id: PHASE,
            task_type: "work",
            description: "reads everything, owns nothing",
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

    let validator = OwnershipValidator::new(pool.clone(), true);
    let validation = validator
        .validate_task_ownership(&unrestricted)
        .await
        .expect("validate");
    assert!(validation.valid);

    drop_test_db(&db_name).await;
}
