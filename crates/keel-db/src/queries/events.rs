//! Database query functions for the `system_events` append-only log.

use anyhow::{Context, Result};
use sqlx::PgPool;

/// Append an event to the durable log.
pub async fn append_event(
    pool: &PgPool,
    event_type: &str,
    entity_type: &str,
    entity_id: &str,
    payload: &serde_json::Value,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO system_events (event_type, entity_type, entity_id, payload) \
         VALUES ($1, $2, $3, $4) \
         RETURNING id",
    )
    .bind(event_type)
    .bind(entity_type)
    .bind(entity_id)
    .bind(payload)
    .fetch_one(pool)
    .await
    .context("failed to append system event")?;

    Ok(row.0)
}

/// Count events of a given type for an entity. Test and audit surface.
pub async fn count_events(pool: &PgPool, event_type: &str, entity_id: &str) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM system_events WHERE event_type = $1 AND entity_id = $2",
    )
    .bind(event_type)
    .bind(entity_id)
    .fetch_one(pool)
    .await
    .context("failed to count system events")?;

    Ok(row.0)
}
