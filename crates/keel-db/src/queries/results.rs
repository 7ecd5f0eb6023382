//! Database query functions for the `workflow_results`, `agent_results`,
//! `monitor_anomalies`, and `resource_locks` tables.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{AgentResult, MonitorAnomaly, ResourceLock, WorkflowResult, WorkflowResultStatus};

/// Record a workflow-level result submission.
pub async fn insert_workflow_result(
    pool: &PgPool,
    workflow_id: Uuid,
    markdown_file_path: Option<&str>,
    summary: Option<&str>,
    submitted_by: Option<Uuid>,
) -> Result<WorkflowResult> {
    let result = sqlx::query_as::<_, WorkflowResult>(
        "INSERT INTO workflow_results (workflow_id, markdown_file_path, summary, submitted_by) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(workflow_id)
    .bind(markdown_file_path)
    .bind(summary)
    .bind(submitted_by)
    .fetch_one(pool)
    .await
    .context("failed to insert workflow result")?;

    Ok(result)
}

/// Update a workflow result's validation status.
pub async fn update_workflow_result_status(
    pool: &PgPool,
    result_id: Uuid,
    status: WorkflowResultStatus,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE workflow_results \
         SET status = $1, \
             validated_at = CASE WHEN $1 = 'validated' THEN NOW() ELSE validated_at END \
         WHERE id = $2",
    )
    .bind(status)
    .bind(result_id)
    .execute(pool)
    .await
    .context("failed to update workflow result status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("workflow result {result_id} not found");
    }

    Ok(())
}

/// Whether a validated workflow result exists for the given workflow.
pub async fn has_validated_result(pool: &PgPool, workflow_id: Uuid) -> Result<bool> {
    let row: (bool,) = sqlx::query_as(
        "SELECT EXISTS(SELECT 1 FROM workflow_results \
                       WHERE workflow_id = $1 AND status = 'validated')",
    )
    .bind(workflow_id)
    .fetch_one(pool)
    .await
    .context("failed to check validated workflow result")?;

    Ok(row.0)
}

/// List result submissions for a workflow, newest first.
pub async fn list_workflow_results(pool: &PgPool, workflow_id: Uuid) -> Result<Vec<WorkflowResult>> {
    let results = sqlx::query_as::<_, WorkflowResult>(
        "SELECT * FROM workflow_results WHERE workflow_id = $1 ORDER BY submitted_at DESC",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list workflow results")?;

    Ok(results)
}

/// Record a per-task deliverable receipt.
pub async fn insert_agent_result(
    pool: &PgPool,
    task_id: Uuid,
    agent_id: Uuid,
    markdown_content: &str,
) -> Result<AgentResult> {
    let result = sqlx::query_as::<_, AgentResult>(
        "INSERT INTO agent_results (task_id, agent_id, markdown_content) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(agent_id)
    .bind(markdown_content)
    .fetch_one(pool)
    .await
    .context("failed to insert agent result")?;

    Ok(result)
}

/// Record a detected anomaly.
pub async fn insert_anomaly(
    pool: &PgPool,
    entity_type: &str,
    entity_id: Uuid,
    anomaly_type: &str,
    details: Option<&serde_json::Value>,
) -> Result<MonitorAnomaly> {
    let anomaly = sqlx::query_as::<_, MonitorAnomaly>(
        "INSERT INTO monitor_anomalies (entity_type, entity_id, anomaly_type, details) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(entity_type)
    .bind(entity_id)
    .bind(anomaly_type)
    .bind(details)
    .fetch_one(pool)
    .await
    .context("failed to insert monitor anomaly")?;

    Ok(anomaly)
}

/// Try to acquire a named lock for an agent.
///
/// Returns `None` when another agent holds the lock (the partial unique
/// index on active locks rejects the insert).
pub async fn try_acquire_lock(
    pool: &PgPool,
    resource_name: &str,
    owner_agent_id: Uuid,
) -> Result<Option<ResourceLock>> {
    let lock = sqlx::query_as::<_, ResourceLock>(
        "INSERT INTO resource_locks (resource_name, owner_agent_id) \
         VALUES ($1, $2) \
         ON CONFLICT (resource_name) WHERE released_at IS NULL DO NOTHING \
         RETURNING *",
    )
    .bind(resource_name)
    .bind(owner_agent_id)
    .fetch_optional(pool)
    .await
    .context("failed to acquire resource lock")?;

    Ok(lock)
}

/// Release a lock held by an agent. Returns whether a live lock was
/// released.
pub async fn release_lock(
    pool: &PgPool,
    resource_name: &str,
    owner_agent_id: Uuid,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE resource_locks \
         SET released_at = NOW() \
         WHERE resource_name = $1 AND owner_agent_id = $2 AND released_at IS NULL",
    )
    .bind(resource_name)
    .bind(owner_agent_id)
    .execute(pool)
    .await
    .context("failed to release resource lock")?;

    Ok(result.rows_affected() > 0)
}
