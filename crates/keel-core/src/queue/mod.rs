//! Task queue: enqueue, score-ordered atomic claim, status updates, retry.
//!
//! The queue owns no in-process state; every operation is a storage
//! round-trip so any number of scheduler ticks can share one queue.

pub mod reaper;
pub mod scorer;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use keel_db::models::{Task, TaskPriority, TaskStatus};
use keel_db::queries::tasks as db;

use crate::error::{backoff_delay, KernelError, KernelResult, RETRY_ATTEMPTS};
use crate::events::{EventBus, SystemEvent};
use crate::state::TaskStateMachine;
use scorer::TaskScorer;

/// Fields for enqueuing a new task.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub ticket_id: Uuid,
    pub phase_id: String,
    pub task_type: String,
    pub description: String,
    pub priority: TaskPriority,
    pub depends_on: Vec<Uuid>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub owned_files: Option<Vec<String>>,
    pub validation_enabled: bool,
    pub max_retries: i32,
}

impl EnqueueRequest {
    pub fn new(
        ticket_id: Uuid,
        phase_id: impl Into<String>,
        task_type: impl Into<String>,
        description: impl Into<String>,
        priority: TaskPriority,
    ) -> Self {
        Self {
            ticket_id,
            phase_id: phase_id.into(),
            task_type: task_type.into(),
            description: description.into(),
            priority,
            depends_on: Vec::new(),
            deadline_at: None,
            owned_files: None,
            validation_enabled: true,
            max_retries: 3,
        }
    }
}

/// The task queue and dynamic scorer.
pub struct TaskQueue {
    pool: PgPool,
    scorer: TaskScorer,
    bus: Arc<EventBus>,
}

impl TaskQueue {
    pub fn new(pool: PgPool, scorer: TaskScorer, bus: Arc<EventBus>) -> Self {
        Self { pool, scorer, bus }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Persist a new task with `status = pending`, compute its initial
    /// score, and publish `task.enqueued`.
    pub async fn enqueue(&self, request: EnqueueRequest) -> KernelResult<Task> {
        if request.description.trim().is_empty() {
            return Err(KernelError::validation("task description must not be empty"));
        }
        if request.max_retries < 0 {
            return Err(KernelError::validation("max_retries must be non-negative"));
        }

        let new = db::NewTask {
            ticket_id: request.ticket_id,
            phase_id: &request.phase_id,
            task_type: &request.task_type,
            description: &request.description,
            priority: request.priority,
            max_retries: request.max_retries,
            deadline_at: request.deadline_at,
            owned_files: request.owned_files.as_deref(),
            validation_enabled: request.validation_enabled,
            content_hash: None,
            embedding: None,
        };
        let mut task = db::insert_task(&self.pool, &new).await?;

        for dep in &request.depends_on {
            db::insert_task_dependency(&self.pool, task.id, *dep).await?;
        }

        let score = self.scorer.compute_score(&task, 0, Utc::now());
        db::update_score(&self.pool, task.id, score).await?;
        task.score = score;

        self.bus
            .publish(SystemEvent::new(
                "task.enqueued",
                "task",
                task.id,
                serde_json::json!({
                    "ticket_id": task.ticket_id,
                    "phase_id": task.phase_id,
                    "task_type": task.task_type,
                    "priority": task.priority,
                    "score": score,
                }),
            ))
            .await;

        Ok(task)
    }

    /// Claim the highest-scored ready task for a phase.
    ///
    /// The winner is atomically transitioned `pending -> claiming`; the
    /// caller must finalize to `assigned` with [`Self::finalize`] or hand
    /// it back with [`Self::release`]. Unfinalized claims are reaped after
    /// the claim TTL.
    pub async fn next_ready(&self, phase_id: &str) -> KernelResult<Option<Task>> {
        let mut attempt = 0;
        loop {
            match db::claim_next_ready(&self.pool, phase_id).await {
                Ok(task) => return Ok(task),
                Err(e) if attempt + 1 < RETRY_ATTEMPTS => {
                    tracing::warn!(
                        phase_id,
                        attempt,
                        error = %e,
                        "claim attempt failed, backing off"
                    );
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(KernelError::Transient(e)),
            }
        }
    }

    /// Read-only score-descending view of ready tasks for a phase.
    pub async fn ready_tasks(&self, phase_id: &str, limit: i64) -> KernelResult<Vec<Task>> {
        Ok(db::list_ready_tasks(&self.pool, phase_id, limit).await?)
    }

    /// Finalize a claim: `claiming -> assigned` with the dispatching agent.
    pub async fn finalize(&self, task_id: Uuid, agent_id: Uuid) -> KernelResult<()> {
        let rows = db::finalize_claim(&self.pool, task_id, agent_id).await?;
        if rows == 0 {
            return TaskStateMachine::lock_failure(&self.pool, task_id, TaskStatus::Claiming).await;
        }
        self.publish_status_change(task_id, TaskStatus::Claiming, TaskStatus::Assigned)
            .await;
        Ok(())
    }

    /// Release a claim back to the queue without dispatching.
    pub async fn release(&self, task_id: Uuid) -> KernelResult<()> {
        let rows = db::release_claim(&self.pool, task_id).await?;
        if rows == 0 {
            return TaskStateMachine::lock_failure(&self.pool, task_id, TaskStatus::Claiming).await;
        }
        self.publish_status_change(task_id, TaskStatus::Claiming, TaskStatus::Pending)
            .await;
        Ok(())
    }

    /// Update a task's status along a simple state-machine edge.
    ///
    /// Terminal completion attaches the result blob; terminal failure the
    /// error message. Review-loop edges belong to the validation
    /// orchestrator, not this method.
    pub async fn update_status(
        &self,
        task_id: Uuid,
        to: TaskStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> KernelResult<()> {
        let task = db::get_task(&self.pool, task_id)
            .await?
            .ok_or_else(|| KernelError::not_found("task", task_id))?;
        let from = task.status;

        if !TaskStateMachine::is_valid_transition(from, to) {
            return Err(KernelError::validation(format!(
                "invalid state transition: {from} -> {to} for task {task_id}"
            )));
        }

        match to {
            TaskStatus::Completed => {
                let rows = db::complete_task(&self.pool, task_id, from, result.as_ref()).await?;
                if rows == 0 {
                    return TaskStateMachine::lock_failure(&self.pool, task_id, from).await;
                }
                self.publish_status_change(task_id, from, to).await;
                self.bus
                    .publish(SystemEvent::new(
                        "task.completed",
                        "task",
                        task_id,
                        serde_json::json!({ "ticket_id": task.ticket_id }),
                    ))
                    .await;
            }
            TaskStatus::Failed => {
                let reason = error.unwrap_or_else(|| "unspecified failure".to_owned());
                let rows = db::fail_terminal(&self.pool, task_id, from, &reason).await?;
                if rows == 0 {
                    return TaskStateMachine::lock_failure(&self.pool, task_id, from).await;
                }
                self.publish_status_change(task_id, from, to).await;
                self.bus
                    .publish(SystemEvent::new(
                        "task.failed",
                        "task",
                        task_id,
                        serde_json::json!({
                            "ticket_id": task.ticket_id,
                            "error": reason,
                        }),
                    ))
                    .await;
            }
            _ => {
                TaskStateMachine::transition(&self.pool, task_id, from, to).await?;
                self.publish_status_change(task_id, from, to).await;
            }
        }

        Ok(())
    }

    /// Record a worker failure: retry while the budget holds, terminal
    /// `failed` otherwise.
    ///
    /// Returns the status the task landed in.
    pub async fn mark_failed(&self, task_id: Uuid, error: &str) -> KernelResult<TaskStatus> {
        let task = db::get_task(&self.pool, task_id)
            .await?
            .ok_or_else(|| KernelError::not_found("task", task_id))?;
        let from = task.status;

        if !matches!(from, TaskStatus::Assigned | TaskStatus::Running) {
            return Err(KernelError::validation(format!(
                "cannot mark task {task_id} failed from status {from}"
            )));
        }

        if task.retry_count < task.max_retries {
            let rows = db::fail_to_retry(&self.pool, task_id, from, error).await?;
            if rows == 0 {
                // Raced with another failure path or the retry budget; fall
                // through to terminal failure.
                return self.mark_failed_terminal(task_id, from, &task, error).await;
            }
            tracing::info!(
                task_id = %task_id,
                retry_count = task.retry_count + 1,
                max_retries = task.max_retries,
                "task failed, returned to pending for retry"
            );
            self.publish_status_change(task_id, from, TaskStatus::Pending).await;
            if let Err(e) = self.recompute_score(task_id).await {
                tracing::warn!(task_id = %task_id, error = %e, "score recompute failed, keeping stale score");
            }
            return Ok(TaskStatus::Pending);
        }

        self.mark_failed_terminal(task_id, from, &task, error).await
    }

    async fn mark_failed_terminal(
        &self,
        task_id: Uuid,
        from: TaskStatus,
        task: &Task,
        error: &str,
    ) -> KernelResult<TaskStatus> {
        let rows = db::fail_terminal(&self.pool, task_id, from, error).await?;
        if rows == 0 {
            TaskStateMachine::lock_failure(&self.pool, task_id, from).await?;
        }
        tracing::warn!(
            task_id = %task_id,
            retry_count = task.retry_count,
            "task failed terminally, retry budget exhausted"
        );
        self.publish_status_change(task_id, from, TaskStatus::Failed).await;
        self.bus
            .publish(SystemEvent::new(
                "task.failed",
                "task",
                task_id,
                serde_json::json!({
                    "ticket_id": task.ticket_id,
                    "error": error,
                }),
            ))
            .await;
        Ok(TaskStatus::Failed)
    }

    /// Recompute the score of one task.
    pub async fn recompute_score(&self, task_id: Uuid) -> KernelResult<f64> {
        let task = db::get_task(&self.pool, task_id)
            .await?
            .ok_or_else(|| KernelError::not_found("task", task_id))?;
        let blockers = db::count_blocked_dependents(&self.pool, task_id).await?;
        let score = self.scorer.compute_score(&task, blockers, Utc::now());
        db::update_score(&self.pool, task_id, score).await?;
        Ok(score)
    }

    /// Batch score refresh for all non-terminal tasks, optionally scoped to
    /// one phase. Per-task failures are logged and skipped; stale scores
    /// are acceptable.
    pub async fn recompute_scores(&self, phase_id: Option<&str>) -> KernelResult<usize> {
        let tasks = db::list_scorable_tasks(&self.pool, phase_id).await?;
        let now = Utc::now();

        let mut updated = 0;
        for task in &tasks {
            let blockers = match db::count_blocked_dependents(&self.pool, task.id).await {
                Ok(count) => count,
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "skipping score recompute");
                    continue;
                }
            };
            let score = self.scorer.compute_score(task, blockers, now);
            if let Err(e) = db::update_score(&self.pool, task.id, score).await {
                tracing::warn!(task_id = %task.id, error = %e, "failed to write recomputed score");
                continue;
            }
            updated += 1;
        }

        Ok(updated)
    }

    async fn publish_status_change(&self, task_id: Uuid, from: TaskStatus, to: TaskStatus) {
        self.bus
            .publish(SystemEvent::new(
                "task.status.changed",
                "task",
                task_id,
                serde_json::json!({
                    "previous_status": from,
                    "new_status": to,
                }),
            ))
            .await;
    }
}
