//! Claim reaper: returns expired claims to the queue.
//!
//! A dispatcher that claims a task and dies before finalizing would
//! otherwise strand it in `claiming` forever. The reaper sweeps claims
//! older than the TTL back to `pending`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use keel_db::queries::tasks as db;

use crate::error::KernelResult;
use crate::events::{EventBus, SystemEvent};

/// One reaper sweep: revert claims older than `claim_ttl`.
///
/// Returns the ids of reverted tasks.
pub async fn reap_once(
    pool: &PgPool,
    bus: &EventBus,
    claim_ttl: Duration,
) -> KernelResult<Vec<uuid::Uuid>> {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(claim_ttl).unwrap_or_else(|_| chrono::Duration::seconds(60));
    let reaped = db::reap_expired_claims(pool, cutoff).await?;

    for task_id in &reaped {
        tracing::warn!(task_id = %task_id, "reaped expired claim back to pending");
        bus.publish(SystemEvent::new(
            "task.status.changed",
            "task",
            task_id,
            serde_json::json!({
                "previous_status": "claiming",
                "new_status": "pending",
                "reason": "claim_ttl_expired",
            }),
        ))
        .await;
    }

    Ok(reaped)
}

/// Run the reaper tick until cancelled.
///
/// A failed sweep is logged and the tick continues; the reaper never
/// aborts the scheduler.
pub async fn run_reaper(
    pool: PgPool,
    bus: Arc<EventBus>,
    claim_ttl: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => {
                tracing::info!("claim reaper shutting down");
                return;
            }
        }

        match reap_once(&pool, &bus, claim_ttl).await {
            Ok(reaped) if !reaped.is_empty() => {
                tracing::info!(count = reaped.len(), "reaped expired claims");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "claim reaper sweep failed");
            }
        }
    }
}
