//! Database query functions for the `task_memories` and `learned_patterns`
//! tables.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{MemoryType, TaskMemory};

/// Fields for a new task memory row.
#[derive(Debug, Clone)]
pub struct NewTaskMemory<'a> {
    pub task_id: Uuid,
    pub execution_summary: &'a str,
    pub memory_type: MemoryType,
    pub context_embedding: &'a [f32],
    pub success: bool,
    pub error_patterns: Option<&'a [String]>,
    pub goal: Option<&'a str>,
    pub result: Option<&'a str>,
    pub feedback: Option<&'a str>,
    pub tool_usage: Option<&'a serde_json::Value>,
}

/// Insert a new task memory. Memories are append-only; only `reused_count`
/// ever changes afterwards.
pub async fn insert_memory(pool: &PgPool, new: &NewTaskMemory<'_>) -> Result<TaskMemory> {
    let memory = sqlx::query_as::<_, TaskMemory>(
        "INSERT INTO task_memories (task_id, execution_summary, memory_type, \
                                    context_embedding, success, error_patterns, \
                                    goal, result, feedback, tool_usage) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(new.execution_summary)
    .bind(new.memory_type)
    .bind(new.context_embedding)
    .bind(new.success)
    .bind(new.error_patterns)
    .bind(new.goal)
    .bind(new.result)
    .bind(new.feedback)
    .bind(new.tool_usage)
    .fetch_one(pool)
    .await
    .context("failed to insert task memory")?;

    Ok(memory)
}

/// Fetch a single memory by ID.
pub async fn get_memory(pool: &PgPool, id: Uuid) -> Result<Option<TaskMemory>> {
    let memory = sqlx::query_as::<_, TaskMemory>("SELECT * FROM task_memories WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task memory")?;

    Ok(memory)
}

/// List memories for a task, newest first.
pub async fn list_memories_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskMemory>> {
    let memories = sqlx::query_as::<_, TaskMemory>(
        "SELECT * FROM task_memories WHERE task_id = $1 ORDER BY learned_at DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list memories for task")?;

    Ok(memories)
}

/// Bump the reuse counter on a memory. The only permitted mutation.
pub async fn increment_reused_count(pool: &PgPool, id: Uuid) -> Result<()> {
    let result =
        sqlx::query("UPDATE task_memories SET reused_count = reused_count + 1 WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await
            .context("failed to increment memory reuse count")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("task memory {id} not found");
    }

    Ok(())
}
