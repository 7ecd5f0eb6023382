//! Task state machine transitions.
//!
//! Validates and executes status transitions for tasks, enforcing the
//! allowed transition graph, optimistic locking, and timestamp management.
//! Illegal transitions fail closed.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use keel_db::models::TaskStatus;
use keel_db::queries::tasks as db;

use crate::error::{KernelError, KernelResult};

/// The task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// pending                -> claiming               (atomic claim)
/// claiming               -> assigned               (finalize)
/// claiming               -> pending                (release / reap)
/// assigned               -> running                (worker start)
/// assigned               -> pending                (dispatch failure, retry)
/// assigned               -> failed                 (dispatch failure, exhausted)
/// running                -> under_review           (submit)
/// running                -> pending                (worker failure, retry)
/// running                -> failed                 (worker failure, exhausted)
/// under_review           -> validation_in_progress (validator spawned)
/// under_review           -> completed              (validation disabled)
/// validation_in_progress -> completed              (review passed)
/// validation_in_progress -> needs_work             (review failed)
/// validation_in_progress -> failed                 (validator timeout)
/// needs_work             -> running                (external resume)
/// ```
///
/// `completed` and `failed` are terminal: no outgoing edges.
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Pending, Claiming)
                | (Claiming, Assigned)
                | (Claiming, Pending)
                | (Assigned, Running)
                | (Assigned, Pending)
                | (Assigned, Failed)
                | (Running, UnderReview)
                | (Running, Pending)
                | (Running, Failed)
                | (UnderReview, ValidationInProgress)
                | (UnderReview, Completed)
                | (ValidationInProgress, Completed)
                | (ValidationInProgress, NeedsWork)
                | (ValidationInProgress, Failed)
                | (NeedsWork, Running)
        )
    }

    /// Execute a simple state transition with optimistic locking.
    ///
    /// - Validates the transition is legal.
    /// - Sets `started_at` when transitioning `assigned -> running`.
    /// - Sets `completed_at` when transitioning into a terminal status.
    ///
    /// Transitions that touch more than status and timestamps (retry,
    /// submit-for-review, review outcomes) have dedicated paths in the
    /// queue and validation modules.
    ///
    /// Returns an error if the transition is invalid, the task does not
    /// exist, or the stored status does not match `from`.
    pub async fn transition(
        pool: &PgPool,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> KernelResult<()> {
        if !Self::is_valid_transition(from, to) {
            return Err(KernelError::validation(format!(
                "invalid state transition: {from} -> {to} for task {task_id}"
            )));
        }

        let started_at = if from == TaskStatus::Assigned && to == TaskStatus::Running {
            Some(Utc::now())
        } else {
            None
        };

        let completed_at = if to.is_terminal() { Some(Utc::now()) } else { None };

        let rows = db::transition_status(pool, task_id, from, to, started_at, completed_at).await?;

        if rows == 0 {
            return Self::lock_failure(pool, task_id, from).await;
        }

        Ok(())
    }

    /// Diagnose an optimistic-lock failure: missing row or stale status.
    pub(crate) async fn lock_failure(
        pool: &PgPool,
        task_id: Uuid,
        expected: TaskStatus,
    ) -> KernelResult<()> {
        match db::get_task(pool, task_id).await? {
            None => Err(KernelError::not_found("task", task_id)),
            Some(task) => Err(KernelError::validation(format!(
                "optimistic lock failed: task {task_id} has status {}, expected {expected}",
                task.status
            ))),
        }
    }
}
