//! Database query functions for the `task_discoveries` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ResolutionStatus, TaskDiscovery};

/// Record a discovery edge in the workflow branch graph.
pub async fn insert_discovery(
    pool: &PgPool,
    source_task_id: Uuid,
    discovery_type: &str,
    description: &str,
    priority_boost: bool,
) -> Result<TaskDiscovery> {
    let discovery = sqlx::query_as::<_, TaskDiscovery>(
        "INSERT INTO task_discoveries (source_task_id, discovery_type, description, \
                                       priority_boost) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(source_task_id)
    .bind(discovery_type)
    .bind(description)
    .bind(priority_boost)
    .fetch_one(pool)
    .await
    .context("failed to insert task discovery")?;

    Ok(discovery)
}

/// Fetch a discovery by ID.
pub async fn get_discovery(pool: &PgPool, id: Uuid) -> Result<Option<TaskDiscovery>> {
    let discovery =
        sqlx::query_as::<_, TaskDiscovery>("SELECT * FROM task_discoveries WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch task discovery")?;

    Ok(discovery)
}

/// Append a spawned task id to a discovery's value list.
pub async fn append_spawned_task(pool: &PgPool, discovery_id: Uuid, task_id: Uuid) -> Result<()> {
    let result = sqlx::query(
        "UPDATE task_discoveries \
         SET spawned_task_ids = spawned_task_ids || $1 \
         WHERE id = $2",
    )
    .bind(task_id)
    .bind(discovery_id)
    .execute(pool)
    .await
    .context("failed to append spawned task to discovery")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("task discovery {discovery_id} not found");
    }

    Ok(())
}

/// Update the resolution status of a discovery.
pub async fn update_resolution(
    pool: &PgPool,
    discovery_id: Uuid,
    resolution: ResolutionStatus,
) -> Result<()> {
    let result = sqlx::query("UPDATE task_discoveries SET resolution_status = $1 WHERE id = $2")
        .bind(resolution)
        .bind(discovery_id)
        .execute(pool)
        .await
        .context("failed to update discovery resolution")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("task discovery {discovery_id} not found");
    }

    Ok(())
}
