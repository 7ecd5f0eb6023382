//! Database query functions for the `diagnostic_runs` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{DiagnosticRun, DiagnosticRunStatus};

/// Counts and context captured when a diagnostic run is opened.
#[derive(Debug, Clone)]
pub struct NewDiagnosticRun<'a> {
    pub workflow_id: Uuid,
    pub total_tasks_at_trigger: i32,
    pub done_tasks_at_trigger: i32,
    pub failed_tasks_at_trigger: i32,
    pub time_since_last_task_seconds: i64,
    pub workflow_goal: Option<&'a str>,
    pub phases_analyzed: Option<&'a serde_json::Value>,
    pub agents_reviewed: Option<&'a serde_json::Value>,
}

/// Open a diagnostic run in `running` status.
pub async fn insert_run(pool: &PgPool, new: &NewDiagnosticRun<'_>) -> Result<DiagnosticRun> {
    let run = sqlx::query_as::<_, DiagnosticRun>(
        "INSERT INTO diagnostic_runs (workflow_id, total_tasks_at_trigger, \
                                      done_tasks_at_trigger, failed_tasks_at_trigger, \
                                      time_since_last_task_seconds, workflow_goal, \
                                      phases_analyzed, agents_reviewed, status) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'running') \
         RETURNING *",
    )
    .bind(new.workflow_id)
    .bind(new.total_tasks_at_trigger)
    .bind(new.done_tasks_at_trigger)
    .bind(new.failed_tasks_at_trigger)
    .bind(new.time_since_last_task_seconds)
    .bind(new.workflow_goal)
    .bind(new.phases_analyzed)
    .bind(new.agents_reviewed)
    .fetch_one(pool)
    .await
    .context("failed to insert diagnostic run")?;

    Ok(run)
}

/// Fetch a run by ID.
pub async fn get_run(pool: &PgPool, id: Uuid) -> Result<Option<DiagnosticRun>> {
    let run = sqlx::query_as::<_, DiagnosticRun>("SELECT * FROM diagnostic_runs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch diagnostic run")?;

    Ok(run)
}

/// Close a run with its outcome: terminal status, diagnosis text, and the
/// recovery tasks it created.
pub async fn close_run(
    pool: &PgPool,
    run_id: Uuid,
    status: DiagnosticRunStatus,
    diagnosis: &str,
    tasks_created_ids: &[Uuid],
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE diagnostic_runs \
         SET status = $1, \
             diagnosis = $2, \
             tasks_created_count = $3, \
             tasks_created_ids = $4, \
             completed_at = NOW() \
         WHERE id = $5 AND status = 'running'",
    )
    .bind(status)
    .bind(diagnosis)
    .bind(tasks_created_ids.len() as i32)
    .bind(tasks_created_ids)
    .bind(run_id)
    .execute(pool)
    .await
    .context("failed to close diagnostic run")?;

    Ok(result.rows_affected())
}

/// Total runs recorded for a workflow.
pub async fn count_runs_for_workflow(pool: &PgPool, workflow_id: Uuid) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM diagnostic_runs WHERE workflow_id = $1")
            .bind(workflow_id)
            .fetch_one(pool)
            .await
            .context("failed to count diagnostic runs")?;

    Ok(row.0)
}

/// Diagnostic run history, newest first, optionally filtered by workflow.
pub async fn list_runs(
    pool: &PgPool,
    workflow_id: Option<Uuid>,
    limit: i64,
) -> Result<Vec<DiagnosticRun>> {
    let runs = sqlx::query_as::<_, DiagnosticRun>(
        "SELECT * FROM diagnostic_runs \
         WHERE ($1::uuid IS NULL OR workflow_id = $1) \
         ORDER BY triggered_at DESC \
         LIMIT $2",
    )
    .bind(workflow_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list diagnostic runs")?;

    Ok(runs)
}
