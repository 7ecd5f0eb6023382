//! Database query functions for the `tasks` and `task_dependencies` tables.
//!
//! The dispatch path lives here: score-ordered candidate selection under
//! `FOR UPDATE SKIP LOCKED`, optimistic status transitions, claim reaping.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Task, TaskPriority, TaskStatus};

/// Fields for a new task row.
#[derive(Debug, Clone)]
pub struct NewTask<'a> {
    pub ticket_id: Uuid,
    pub phase_id: &'a str,
    pub task_type: &'a str,
    pub description: &'a str,
    pub priority: TaskPriority,
    pub max_retries: i32,
    pub deadline_at: Option<DateTime<Utc>>,
    pub owned_files: Option<&'a [String]>,
    pub validation_enabled: bool,
    pub content_hash: Option<&'a str>,
    pub embedding: Option<&'a [f32]>,
}

/// Insert a new task row. Returns the inserted task with server-generated
/// defaults (id, created_at, status).
pub async fn insert_task(pool: &PgPool, new: &NewTask<'_>) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (ticket_id, phase_id, task_type, description, priority, \
                            max_retries, deadline_at, owned_files, validation_enabled, \
                            content_hash, embedding) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
         RETURNING *",
    )
    .bind(new.ticket_id)
    .bind(new.phase_id)
    .bind(new.task_type)
    .bind(new.description)
    .bind(new.priority)
    .bind(new.max_retries)
    .bind(new.deadline_at)
    .bind(new.owned_files)
    .bind(new.validation_enabled)
    .bind(new.content_hash)
    .bind(new.embedding)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks for a ticket, ordered by creation time.
pub async fn list_tasks_for_ticket(pool: &PgPool, ticket_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE ticket_id = $1 ORDER BY created_at ASC",
    )
    .bind(ticket_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for ticket")?;

    Ok(tasks)
}

/// Read-only score-descending view of ready tasks for a phase.
///
/// A task is ready when it is `pending` and every dependency is `completed`.
pub async fn list_ready_tasks(pool: &PgPool, phase_id: &str, limit: i64) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT t.* \
         FROM tasks t \
         WHERE t.phase_id = $1 \
           AND t.status = 'pending' \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_dependencies td \
               JOIN tasks dep ON dep.id = td.depends_on \
               WHERE td.task_id = t.id AND dep.status != 'completed' \
           ) \
         ORDER BY t.score DESC, t.created_at ASC, t.id ASC \
         LIMIT $2",
    )
    .bind(phase_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list ready tasks")?;

    Ok(tasks)
}

/// Atomically claim the highest-scored ready task for a phase.
///
/// Runs as a single statement: candidates are ordered by
/// `(score DESC, created_at ASC, id ASC)` and locked with
/// `FOR UPDATE SKIP LOCKED`, so concurrent claimers never observe the same
/// row. The winner transitions `pending -> claiming` with `claimed_at` set.
///
/// Returns `None` when no ready task exists (or all are locked by
/// concurrent claimers).
pub async fn claim_next_ready(pool: &PgPool, phase_id: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "WITH candidate AS ( \
             SELECT t.id \
             FROM tasks t \
             WHERE t.phase_id = $1 \
               AND t.status = 'pending' \
               AND NOT EXISTS ( \
                   SELECT 1 FROM task_dependencies td \
                   JOIN tasks dep ON dep.id = td.depends_on \
                   WHERE td.task_id = t.id AND dep.status != 'completed' \
               ) \
             ORDER BY t.score DESC, t.created_at ASC, t.id ASC \
             LIMIT 1 \
             FOR UPDATE OF t SKIP LOCKED \
         ) \
         UPDATE tasks \
         SET status = 'claiming', claimed_at = NOW() \
         WHERE id IN (SELECT id FROM candidate) \
         RETURNING *",
    )
    .bind(phase_id)
    .fetch_optional(pool)
    .await
    .context("failed to claim next ready task")?;

    Ok(task)
}

/// Finalize a claim: `claiming -> assigned` with the dispatching agent.
///
/// Optimistically locked; returns rows affected (0 means the task was not
/// in `claiming`, e.g. the reaper already reverted it).
pub async fn finalize_claim(pool: &PgPool, task_id: Uuid, agent_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'assigned', assigned_agent_id = $1 \
         WHERE id = $2 AND status = 'claiming'",
    )
    .bind(agent_id)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to finalize claim")?;

    Ok(result.rows_affected())
}

/// Release a claim back to the queue: `claiming -> pending`.
pub async fn release_claim(pool: &PgPool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', claimed_at = NULL \
         WHERE id = $1 AND status = 'claiming'",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to release claim")?;

    Ok(result.rows_affected())
}

/// Revert claims older than the cutoff back to `pending`.
///
/// Backs the claim-reaper tick: a claim that was never finalized to
/// `assigned` within the TTL is returned to the queue.
pub async fn reap_expired_claims(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "UPDATE tasks \
         SET status = 'pending', claimed_at = NULL \
         WHERE status = 'claiming' AND claimed_at < $1 \
         RETURNING id",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to reap expired claims")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Atomically transition a task from one status to another.
///
/// Uses optimistic locking: the UPDATE's WHERE clause includes
/// `status = $from`, so the row is only updated if the current status
/// matches. Returns the number of rows affected (0 means the status did
/// not match).
pub async fn transition_status(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, \
             started_at = COALESCE($2, started_at), \
             completed_at = COALESCE($3, completed_at) \
         WHERE id = $4 AND status = $5",
    )
    .bind(to)
    .bind(started_at)
    .bind(completed_at)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Transition `running -> under_review`, incrementing the validation
/// iteration and clearing `review_done`. Stores the commit SHA into the
/// result blob when provided.
pub async fn transition_to_under_review(
    pool: &PgPool,
    task_id: Uuid,
    commit_sha: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'under_review', \
             validation_iteration = validation_iteration + 1, \
             review_done = FALSE, \
             result = CASE \
                 WHEN $1::text IS NULL THEN result \
                 ELSE COALESCE(result, '{}'::jsonb) \
                      || jsonb_build_object('validation_commit_sha', $1::text) \
             END \
         WHERE id = $2 AND status = 'running'",
    )
    .bind(commit_sha)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to transition task to under_review")?;

    Ok(result.rows_affected())
}

/// Complete a task: terminal `completed` with `review_done` set and an
/// optional result blob merged in.
pub async fn complete_task(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    result_blob: Option<&serde_json::Value>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'completed', \
             review_done = TRUE, \
             completed_at = NOW(), \
             result = CASE \
                 WHEN $1::jsonb IS NULL THEN result \
                 ELSE COALESCE(result, '{}'::jsonb) || $1::jsonb \
             END \
         WHERE id = $2 AND status = $3",
    )
    .bind(result_blob)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to complete task")?;

    Ok(result.rows_affected())
}

/// Record a failed review: `validation_in_progress -> needs_work` with the
/// validator's feedback stored.
pub async fn transition_to_needs_work(pool: &PgPool, task_id: Uuid, feedback: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'needs_work', last_validation_feedback = $1 \
         WHERE id = $2 AND status = 'validation_in_progress'",
    )
    .bind(feedback)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to transition task to needs_work")?;

    Ok(result.rows_affected())
}

/// Fail a task back to `pending` for retry, incrementing the retry counter.
///
/// Only fires while the retry budget holds (`retry_count < max_retries`);
/// clears assignment and claim metadata so the queue can re-dispatch.
pub async fn fail_to_retry(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    error: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', \
             retry_count = retry_count + 1, \
             error_message = $1, \
             assigned_agent_id = NULL, \
             claimed_at = NULL, \
             started_at = NULL \
         WHERE id = $2 AND status = $3 AND retry_count < max_retries",
    )
    .bind(error)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to retry task to pending")?;

    Ok(result.rows_affected())
}

/// Fail a task terminally: retry budget exhausted or unrecoverable error.
pub async fn fail_terminal(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    error: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'failed', \
             error_message = $1, \
             completed_at = NOW() \
         WHERE id = $2 AND status = $3",
    )
    .bind(error)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to fail task")?;

    Ok(result.rows_affected())
}

/// Write a freshly computed score.
pub async fn update_score(pool: &PgPool, task_id: Uuid, score: f64) -> Result<()> {
    sqlx::query("UPDATE tasks SET score = $1 WHERE id = $2")
        .bind(score)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to update task score")?;

    Ok(())
}

/// List non-terminal tasks, optionally restricted to a phase, for score
/// recomputation.
pub async fn list_scorable_tasks(pool: &PgPool, phase_id: Option<&str>) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status NOT IN ('completed', 'failed') \
           AND ($1::text IS NULL OR phase_id = $1)",
    )
    .bind(phase_id)
    .fetch_all(pool)
    .await
    .context("failed to list scorable tasks")?;

    Ok(tasks)
}

/// Insert a dependency edge: `task_id` depends on `depends_on_id`.
///
/// Uses `ON CONFLICT DO NOTHING` so this is idempotent.
pub async fn insert_task_dependency(
    pool: &PgPool,
    task_id: Uuid,
    depends_on_id: Uuid,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_dependencies (task_id, depends_on) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(task_id)
    .bind(depends_on_id)
    .execute(pool)
    .await
    .context("failed to insert task dependency")?;

    Ok(())
}

/// Get the IDs of all tasks that a given task depends on.
pub async fn get_task_dependencies(pool: &PgPool, task_id: Uuid) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT depends_on FROM task_dependencies WHERE task_id = $1")
            .bind(task_id)
            .fetch_all(pool)
            .await
            .context("failed to get task dependencies")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Count non-terminal tasks that depend on the given task (its blockers).
pub async fn count_blocked_dependents(pool: &PgPool, task_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM task_dependencies td \
         JOIN tasks dep ON dep.id = td.task_id \
         WHERE td.depends_on = $1 \
           AND dep.status NOT IN ('completed', 'failed')",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to count blocked dependents")?;

    Ok(row.0)
}

/// Count tasks for a ticket in any of the given statuses.
pub async fn count_tasks_in_statuses(
    pool: &PgPool,
    ticket_id: Uuid,
    statuses: &[TaskStatus],
) -> Result<i64> {
    let status_strings: Vec<String> = statuses.iter().map(ToString::to_string).collect();
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks WHERE ticket_id = $1 AND status = ANY($2)",
    )
    .bind(ticket_id)
    .bind(&status_strings)
    .fetch_one(pool)
    .await
    .context("failed to count tasks by status")?;

    Ok(row.0)
}

/// Count all tasks for a ticket.
pub async fn count_tasks_for_ticket(pool: &PgPool, ticket_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE ticket_id = $1")
        .bind(ticket_id)
        .fetch_one(pool)
        .await
        .context("failed to count tasks for ticket")?;

    Ok(row.0)
}

/// Count diagnostic-spawned tasks (`discovery_diagnostic*`) for a ticket in
/// the given statuses.
pub async fn count_diagnostic_tasks_in_statuses(
    pool: &PgPool,
    ticket_id: Uuid,
    statuses: &[TaskStatus],
) -> Result<i64> {
    let status_strings: Vec<String> = statuses.iter().map(ToString::to_string).collect();
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks \
         WHERE ticket_id = $1 \
           AND task_type LIKE 'discovery_diagnostic%' \
           AND status = ANY($2)",
    )
    .bind(ticket_id)
    .bind(&status_strings)
    .fetch_one(pool)
    .await
    .context("failed to count diagnostic tasks")?;

    Ok(row.0)
}

/// Count failed tasks for a ticket that were not spawned by diagnostics.
pub async fn count_failed_original_tasks(pool: &PgPool, ticket_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks \
         WHERE ticket_id = $1 \
           AND status = 'failed' \
           AND task_type NOT LIKE 'discovery_diagnostic%'",
    )
    .bind(ticket_id)
    .fetch_one(pool)
    .await
    .context("failed to count failed original tasks")?;

    Ok(row.0)
}

/// The most recent task activity timestamp for a ticket
/// (`completed_at` when set, else `created_at`).
pub async fn last_task_activity(pool: &PgPool, ticket_id: Uuid) -> Result<Option<DateTime<Utc>>> {
    let row: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(
        "SELECT MAX(COALESCE(completed_at, created_at)) FROM tasks WHERE ticket_id = $1",
    )
    .bind(ticket_id)
    .fetch_optional(pool)
    .await
    .context("failed to query last task activity")?;

    Ok(row.and_then(|(ts,)| ts))
}

/// Task count by phase for a ticket.
pub async fn task_distribution_by_phase(
    pool: &PgPool,
    ticket_id: Uuid,
) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT phase_id, COUNT(*) FROM tasks WHERE ticket_id = $1 GROUP BY phase_id",
    )
    .bind(ticket_id)
    .fetch_all(pool)
    .await
    .context("failed to query task distribution")?;

    Ok(rows)
}

/// The most recent tasks for a ticket, newest activity first.
pub async fn recent_tasks_for_ticket(
    pool: &PgPool,
    ticket_id: Uuid,
    limit: i64,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE ticket_id = $1 \
         ORDER BY completed_at DESC NULLS LAST, created_at DESC \
         LIMIT $2",
    )
    .bind(ticket_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list recent tasks")?;

    Ok(tasks)
}

/// Find a non-terminal task by content hash within a ticket + task-type
/// scope. Terminal tasks leave dedup scope: finished work is no reason to
/// suppress new work.
pub async fn find_by_content_hash(
    pool: &PgPool,
    ticket_id: Uuid,
    task_type: &str,
    content_hash: &str,
) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE ticket_id = $1 AND task_type = $2 AND content_hash = $3 \
           AND status NOT IN ('completed', 'failed') \
         LIMIT 1",
    )
    .bind(ticket_id)
    .bind(task_type)
    .bind(content_hash)
    .fetch_optional(pool)
    .await
    .context("failed to look up task by content hash")?;

    Ok(task)
}

/// Fetch in-scope tasks with embeddings for semantic dedup.
///
/// Scope: same ticket, matching task-type prefix, statuses outside the
/// excluded set, non-null embedding.
pub async fn list_embedded_tasks_in_scope(
    pool: &PgPool,
    ticket_id: Uuid,
    task_type_prefix: &str,
    exclude_statuses: &[TaskStatus],
) -> Result<Vec<Task>> {
    let excluded: Vec<String> = exclude_statuses.iter().map(ToString::to_string).collect();
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE ticket_id = $1 \
           AND task_type LIKE $2 || '%' \
           AND status != ALL($3) \
           AND embedding IS NOT NULL",
    )
    .bind(ticket_id)
    .bind(task_type_prefix)
    .bind(&excluded)
    .fetch_all(pool)
    .await
    .context("failed to list embedded tasks in scope")?;

    Ok(tasks)
}

/// Store a dedup embedding (and content hash) on an existing task.
pub async fn store_task_embedding(
    pool: &PgPool,
    task_id: Uuid,
    content_hash: &str,
    embedding: &[f32],
) -> Result<()> {
    sqlx::query("UPDATE tasks SET content_hash = $1, embedding = $2 WHERE id = $3")
        .bind(content_hash)
        .bind(embedding)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to store task embedding")?;

    Ok(())
}

/// Parallel siblings of a task for ownership validation: same ticket,
/// different id, dispatchable status, with ownership patterns declared.
pub async fn list_parallel_siblings(pool: &PgPool, task: &Task) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE ticket_id = $1 \
           AND id != $2 \
           AND status IN ('pending', 'claiming', 'assigned', 'running') \
           AND owned_files IS NOT NULL",
    )
    .bind(task.ticket_id)
    .bind(task.id)
    .fetch_all(pool)
    .await
    .context("failed to list parallel siblings")?;

    Ok(tasks)
}
