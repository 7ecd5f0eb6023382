//! Database query functions for the `playbook_entries` and
//! `playbook_changes` tables.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{PlaybookCategory, PlaybookChange, PlaybookEntry};

/// Insert a new playbook entry.
pub async fn insert_entry(
    pool: &PgPool,
    ticket_id: Uuid,
    content: &str,
    category: PlaybookCategory,
    tags: Option<&[String]>,
    embedding: Option<&[f32]>,
    supporting_memory_ids: &[Uuid],
    created_by: Option<Uuid>,
) -> Result<PlaybookEntry> {
    let entry = sqlx::query_as::<_, PlaybookEntry>(
        "INSERT INTO playbook_entries (ticket_id, content, category, tags, embedding, \
                                       supporting_memory_ids, created_by) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(ticket_id)
    .bind(content)
    .bind(category)
    .bind(tags)
    .bind(embedding)
    .bind(supporting_memory_ids)
    .bind(created_by)
    .fetch_one(pool)
    .await
    .context("failed to insert playbook entry")?;

    Ok(entry)
}

/// List active entries for a ticket.
pub async fn list_active_entries(pool: &PgPool, ticket_id: Uuid) -> Result<Vec<PlaybookEntry>> {
    let entries = sqlx::query_as::<_, PlaybookEntry>(
        "SELECT * FROM playbook_entries \
         WHERE ticket_id = $1 AND is_active \
         ORDER BY created_at ASC",
    )
    .bind(ticket_id)
    .fetch_all(pool)
    .await
    .context("failed to list playbook entries")?;

    Ok(entries)
}

/// Append a supporting memory id to an entry, skipping when already present.
pub async fn append_supporting_memory(pool: &PgPool, entry_id: Uuid, memory_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE playbook_entries \
         SET supporting_memory_ids = supporting_memory_ids || $1, \
             updated_at = NOW() \
         WHERE id = $2 AND NOT ($1 = ANY(supporting_memory_ids))",
    )
    .bind(memory_id)
    .bind(entry_id)
    .execute(pool)
    .await
    .context("failed to append supporting memory")?;

    Ok(result.rows_affected() > 0)
}

/// Soft-delete an entry by flipping `is_active`.
pub async fn deactivate_entry(pool: &PgPool, entry_id: Uuid) -> Result<()> {
    let result = sqlx::query(
        "UPDATE playbook_entries SET is_active = FALSE, updated_at = NOW() WHERE id = $1",
    )
    .bind(entry_id)
    .execute(pool)
    .await
    .context("failed to deactivate playbook entry")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("playbook entry {entry_id} not found");
    }

    Ok(())
}

/// Append a playbook change audit row.
pub async fn insert_change(
    pool: &PgPool,
    ticket_id: Uuid,
    operation: &str,
    new_content: Option<&str>,
    delta: &serde_json::Value,
    reason: Option<&str>,
    related_memory_id: Option<Uuid>,
    changed_by: Option<Uuid>,
) -> Result<PlaybookChange> {
    let change = sqlx::query_as::<_, PlaybookChange>(
        "INSERT INTO playbook_changes (ticket_id, operation, new_content, delta, \
                                       reason, related_memory_id, changed_by) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(ticket_id)
    .bind(operation)
    .bind(new_content)
    .bind(delta)
    .bind(reason)
    .bind(related_memory_id)
    .bind(changed_by)
    .fetch_one(pool)
    .await
    .context("failed to insert playbook change")?;

    Ok(change)
}

/// Whether a curator delta has already been recorded for a memory.
///
/// Backs the ACE pipeline's idempotence check.
pub async fn change_exists_for_memory(pool: &PgPool, memory_id: Uuid) -> Result<bool> {
    let row: (bool,) = sqlx::query_as(
        "SELECT EXISTS(SELECT 1 FROM playbook_changes WHERE related_memory_id = $1)",
    )
    .bind(memory_id)
    .fetch_one(pool)
    .await
    .context("failed to check playbook change existence")?;

    Ok(row.0)
}
