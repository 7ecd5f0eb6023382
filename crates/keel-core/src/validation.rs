//! Validation orchestrator: the per-task review lifecycle.
//!
//! Workers submit finished work for review; the orchestrator spawns a
//! validator, enforces the review state machine, delivers feedback, and
//! hands passing tasks to the ACE pipeline. Exactly one validator is
//! active per task per iteration, tracked in an in-memory map behind the
//! orchestrator's mutex (advisory; task state in storage is
//! authoritative).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use keel_db::models::{AgentKind, Task, TaskStatus};
use keel_db::queries::{
    agents as agent_db, memories, reviews as review_db, tasks as task_db,
};

use crate::ace::{AcePipeline, TaskCompletion};
use crate::diagnostic::{DiagnosticRequest, DiagnosticSender};
use crate::embedding::Embedder;
use crate::error::{KernelError, KernelResult};
use crate::events::{EventBus, SystemEvent};
use crate::spawn::AgentSpawner;
use crate::state::TaskStateMachine;

/// Consecutive failed reviews that trigger a diagnostic.
const REPEATED_FAILURE_THRESHOLD: i64 = 2;
/// Recovery-task budget for validation-triggered diagnostics.
const VALIDATION_DIAGNOSTIC_MAX_TASKS: usize = 5;

/// Tracks the single active validator per task.
///
/// Encapsulated acquire/release so callers cannot leave stale entries
/// behind on the error paths.
#[derive(Default)]
pub struct ActiveValidators {
    inner: Mutex<HashMap<Uuid, Uuid>>,
}

impl ActiveValidators {
    /// Claim the validator slot for a task. Fails when one is active.
    fn acquire(&self, task_id: Uuid, validator_id: Uuid) -> bool {
        let mut map = self.inner.lock().expect("active validators lock poisoned");
        if map.contains_key(&task_id) {
            return false;
        }
        map.insert(task_id, validator_id);
        true
    }

    /// Release the slot, returning the validator that held it.
    fn release(&self, task_id: Uuid) -> Option<Uuid> {
        self.inner
            .lock()
            .expect("active validators lock poisoned")
            .remove(&task_id)
    }

    fn get(&self, task_id: Uuid) -> Option<Uuid> {
        self.inner
            .lock()
            .expect("active validators lock poisoned")
            .get(&task_id)
            .copied()
    }

    fn snapshot(&self) -> Vec<(Uuid, Uuid)> {
        self.inner
            .lock()
            .expect("active validators lock poisoned")
            .iter()
            .map(|(task, validator)| (*task, *validator))
            .collect()
    }
}

/// A validator's review of one iteration.
#[derive(Debug, Clone)]
pub struct ReviewSubmission {
    pub passed: bool,
    pub feedback: String,
    pub evidence: Option<serde_json::Value>,
    pub recommendations: Option<Vec<String>>,
}

/// Outcome reported back to the reviewing validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewOutcome {
    pub status: &'static str,
    pub message: &'static str,
    pub iteration: i32,
}

/// Read-only validation status view for a task.
#[derive(Debug, Clone)]
pub struct ValidationStatus {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub iteration: i32,
    pub review_done: bool,
    pub last_feedback: Option<String>,
}

/// The validation orchestrator.
pub struct ValidationOrchestrator {
    pool: PgPool,
    spawner: Arc<dyn AgentSpawner>,
    embedder: Arc<dyn Embedder>,
    ace: Arc<AcePipeline>,
    diagnostics: DiagnosticSender,
    bus: Arc<EventBus>,
    active: ActiveValidators,
    validator_timeout: Duration,
}

impl ValidationOrchestrator {
    pub fn new(
        pool: PgPool,
        spawner: Arc<dyn AgentSpawner>,
        embedder: Arc<dyn Embedder>,
        ace: Arc<AcePipeline>,
        diagnostics: DiagnosticSender,
        bus: Arc<EventBus>,
        validator_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            spawner,
            embedder,
            ace,
            diagnostics,
            bus,
            active: ActiveValidators::default(),
            validator_timeout,
        }
    }

    /// Submit a finished task for review: `running -> under_review`,
    /// incrementing the validation iteration.
    ///
    /// A commit SHA is required when validation is enabled; it is stored
    /// in the task's result blob for the validator. When validation is
    /// disabled the task completes directly.
    pub async fn submit_for_review(
        &self,
        task_id: Uuid,
        commit_sha: Option<&str>,
    ) -> KernelResult<()> {
        let task = self.get_task(task_id).await?;

        if task.validation_enabled && commit_sha.is_none() {
            return Err(KernelError::validation(format!(
                "commit_sha required for task {task_id} with validation enabled"
            )));
        }

        let rows = task_db::transition_to_under_review(&self.pool, task_id, commit_sha).await?;
        if rows == 0 {
            return TaskStateMachine::lock_failure(&self.pool, task_id, TaskStatus::Running).await;
        }

        let iteration = task.validation_iteration + 1;
        self.bus
            .publish(SystemEvent::new(
                "task.status.changed",
                "task",
                task_id,
                serde_json::json!({
                    "previous_status": TaskStatus::Running,
                    "new_status": TaskStatus::UnderReview,
                    "validation_iteration": iteration,
                }),
            ))
            .await;

        if task.validation_enabled {
            self.spawn_validator(task_id).await?;
        } else {
            // Nothing to review; the task is done.
            let rows =
                task_db::complete_task(&self.pool, task_id, TaskStatus::UnderReview, None).await?;
            if rows == 0 {
                return TaskStateMachine::lock_failure(&self.pool, task_id, TaskStatus::UnderReview)
                    .await;
            }
            self.bus
                .publish(SystemEvent::new(
                    "task.completed",
                    "task",
                    task_id,
                    serde_json::json!({ "ticket_id": task.ticket_id }),
                ))
                .await;
        }

        Ok(())
    }

    /// Spawn a validator for a task under review and move it to
    /// `validation_in_progress`.
    ///
    /// Returns `None` when a validator is already active for this
    /// iteration.
    pub async fn spawn_validator(&self, task_id: Uuid) -> KernelResult<Option<Uuid>> {
        let task = self.get_task(task_id).await?;

        if !task.validation_enabled {
            return Ok(None);
        }
        if self.active.get(task_id).is_some() {
            return Ok(None);
        }

        let validator = self
            .spawner
            .spawn_agent(
                AgentKind::Validator,
                &task.phase_id,
                &[
                    "validation".to_owned(),
                    "code_review".to_owned(),
                    "testing".to_owned(),
                ],
                &["validator".to_owned()],
            )
            .await?;

        if !self.active.acquire(task_id, validator.id) {
            // Lost the race to a concurrent spawn; this iteration already
            // has its validator.
            return Ok(None);
        }

        TaskStateMachine::transition(
            &self.pool,
            task_id,
            TaskStatus::UnderReview,
            TaskStatus::ValidationInProgress,
        )
        .await?;

        self.bus
            .publish(SystemEvent::new(
                "validation_started",
                "task",
                task_id,
                serde_json::json!({
                    "task_id": task_id,
                    "iteration": task.validation_iteration,
                    "validator_agent_id": validator.id,
                }),
            ))
            .await;

        Ok(Some(validator.id))
    }

    /// Accept a validator's review and apply the resulting transition.
    ///
    /// Only agents of type `validator` may call this; failing reviews
    /// require non-empty feedback.
    pub async fn give_review(
        &self,
        task_id: Uuid,
        validator_agent_id: Uuid,
        submission: ReviewSubmission,
    ) -> KernelResult<ReviewOutcome> {
        let validator = agent_db::get_agent(&self.pool, validator_agent_id).await?;
        match &validator {
            Some(agent) if agent.agent_type == AgentKind::Validator => {}
            Some(agent) => {
                return Err(KernelError::Permission(format!(
                    "only validator agents may give reviews; agent {validator_agent_id} has type {}",
                    agent.agent_type
                )));
            }
            None => {
                return Err(KernelError::Permission(format!(
                    "only validator agents may give reviews; agent {validator_agent_id} not found"
                )));
            }
        }

        let task = self.get_task(task_id).await?;
        if task.status != TaskStatus::ValidationInProgress {
            return Err(KernelError::validation(format!(
                "task {task_id} must be in validation_in_progress to review, but is {}",
                task.status
            )));
        }

        if !submission.passed && submission.feedback.trim().is_empty() {
            return Err(KernelError::validation(
                "feedback required when validation fails",
            ));
        }

        let review = review_db::insert_review(
            &self.pool,
            task_id,
            validator_agent_id,
            task.validation_iteration,
            submission.passed,
            &submission.feedback,
            submission.evidence.as_ref(),
            submission.recommendations.as_deref(),
        )
        .await?;

        self.bus
            .publish(SystemEvent::new(
                "validation_review_submitted",
                "validation_review",
                review.id,
                serde_json::json!({
                    "task_id": task_id,
                    "iteration": review.iteration_number,
                    "passed": submission.passed,
                    "validator_agent_id": validator_agent_id,
                }),
            ))
            .await;

        if submission.passed {
            self.finish_passed(&task, &review.feedback).await?;
            Ok(ReviewOutcome {
                status: "completed",
                message: "Validation passed",
                iteration: task.validation_iteration,
            })
        } else {
            self.finish_failed(&task, &review.feedback).await?;
            Ok(ReviewOutcome {
                status: "needs_work",
                message: "Validation failed; feedback recorded",
                iteration: task.validation_iteration,
            })
        }
    }

    async fn finish_passed(&self, task: &Task, feedback: &str) -> KernelResult<()> {
        let rows =
            task_db::complete_task(&self.pool, task.id, TaskStatus::ValidationInProgress, None)
                .await?;
        if rows == 0 {
            return TaskStateMachine::lock_failure(
                &self.pool,
                task.id,
                TaskStatus::ValidationInProgress,
            )
            .await;
        }

        self.active.release(task.id);

        self.bus
            .publish(SystemEvent::new(
                "validation_passed",
                "task",
                task.id,
                serde_json::json!({
                    "task_id": task.id,
                    "iteration": task.validation_iteration,
                }),
            ))
            .await;

        // Capture what was learned. A pipeline failure is logged, never
        // surfaced to the validator.
        let completion = TaskCompletion {
            goal: task.description.clone(),
            result: format!(
                "Validation iteration {} passed",
                task.validation_iteration
            ),
            feedback: Some(feedback.to_owned()),
            tool_usage: Vec::new(),
            success: true,
            agent_id: task.assigned_agent_id,
        };
        if let Err(e) = self.ace.run(task, &completion).await {
            tracing::warn!(task_id = %task.id, error = %e, "ACE pipeline failed after validation pass");
        }

        Ok(())
    }

    async fn finish_failed(&self, task: &Task, feedback: &str) -> KernelResult<()> {
        let rows = task_db::transition_to_needs_work(&self.pool, task.id, feedback).await?;
        if rows == 0 {
            return TaskStateMachine::lock_failure(
                &self.pool,
                task.id,
                TaskStatus::ValidationInProgress,
            )
            .await;
        }

        self.active.release(task.id);

        self.bus
            .publish(SystemEvent::new(
                "validation_failed",
                "task",
                task.id,
                serde_json::json!({
                    "task_id": task.id,
                    "iteration": task.validation_iteration,
                    "feedback": feedback,
                }),
            ))
            .await;

        // Best-effort memory of the failed iteration.
        self.record_validation_memory(task, feedback, false).await;

        // Two consecutive failed reviews hand the workflow to the
        // diagnostic engine via its work queue.
        let consecutive = review_db::count_consecutive_failures(&self.pool, task.id).await?;
        if consecutive >= REPEATED_FAILURE_THRESHOLD {
            tracing::warn!(
                task_id = %task.id,
                consecutive_failures = consecutive,
                "repeated validation failures, requesting diagnostic"
            );
            self.diagnostics.request(DiagnosticRequest {
                workflow_id: task.ticket_id,
                trigger: serde_json::json!({
                    "trigger": "repeated_validation_failures",
                    "task_id": task.id,
                    "consecutive_failures": consecutive,
                    "last_feedback": feedback,
                }),
                max_tasks: VALIDATION_DIAGNOSTIC_MAX_TASKS,
            });
        }

        Ok(())
    }

    /// Resume a task that received failing feedback: `needs_work -> running`.
    pub async fn resume(&self, task_id: Uuid) -> KernelResult<()> {
        TaskStateMachine::transition(
            &self.pool,
            task_id,
            TaskStatus::NeedsWork,
            TaskStatus::Running,
        )
        .await
    }

    /// Deliver validation feedback to an agent over the bus. Returns
    /// whether the agent exists.
    pub async fn send_feedback(&self, agent_id: Uuid, feedback: &str) -> KernelResult<bool> {
        if agent_db::get_agent(&self.pool, agent_id).await?.is_none() {
            return Ok(false);
        }

        self.bus
            .publish(SystemEvent::new(
                "agent.validation_feedback",
                "agent",
                agent_id,
                serde_json::json!({
                    "agent_id": agent_id,
                    "feedback": feedback,
                    "timestamp": Utc::now(),
                }),
            ))
            .await;

        Ok(true)
    }

    /// Read-only validation status for a task.
    pub async fn validation_status(&self, task_id: Uuid) -> KernelResult<ValidationStatus> {
        let task = self.get_task(task_id).await?;
        Ok(ValidationStatus {
            task_id,
            status: task.status,
            iteration: task.validation_iteration,
            review_done: task.review_done,
            last_feedback: task.last_validation_feedback,
        })
    }

    /// Sweep active validators whose heartbeat has gone stale: the task
    /// fails with a timeout reason and a timeout-triggered diagnostic is
    /// requested.
    pub async fn check_validator_timeouts(&self) -> KernelResult<usize> {
        let mut timed_out = 0;

        for (task_id, validator_id) in self.active.snapshot() {
            let Some(task) = task_db::get_task(&self.pool, task_id).await? else {
                self.active.release(task_id);
                continue;
            };
            if task.status != TaskStatus::ValidationInProgress {
                // Review concluded through the normal path; the entry is
                // stale.
                self.active.release(task_id);
                continue;
            }

            let Some(validator) = agent_db::get_agent(&self.pool, validator_id).await? else {
                continue;
            };
            let Some(heartbeat) = validator.last_heartbeat else {
                continue;
            };
            let age = (Utc::now() - heartbeat).num_seconds();
            if age <= self.validator_timeout.as_secs() as i64 {
                continue;
            }

            tracing::warn!(
                task_id = %task_id,
                validator_id = %validator_id,
                heartbeat_age_s = age,
                "validator timed out, failing task"
            );

            let reason = format!(
                "validation timeout after {} seconds",
                self.validator_timeout.as_secs()
            );
            let rows = task_db::fail_terminal(
                &self.pool,
                task_id,
                TaskStatus::ValidationInProgress,
                &reason,
            )
            .await?;
            if rows == 0 {
                continue;
            }

            self.active.release(task_id);
            timed_out += 1;

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

            self.diagnostics.request(DiagnosticRequest {
                workflow_id: task.ticket_id,
                trigger: serde_json::json!({
                    "trigger": "validation_timeout",
                    "task_id": task_id,
                    "validator_agent_id": validator_id,
                    "timeout_seconds": self.validator_timeout.as_secs(),
                }),
                max_tasks: VALIDATION_DIAGNOSTIC_MAX_TASKS,
            });
        }

        Ok(timed_out)
    }

    /// Run the validator-timeout tick until cancelled.
    pub async fn run_timeout_sweep(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => {
                    tracing::info!("validator timeout sweep shutting down");
                    return;
                }
            }

            match self.check_validator_timeouts().await {
                Ok(count) if count > 0 => {
                    tracing::warn!(count, "validator timeouts handled");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "validator timeout sweep failed");
                }
            }
        }
    }

    async fn record_validation_memory(&self, task: &Task, feedback: &str, passed: bool) {
        let summary = format!(
            "Validation iteration {}: {}. Feedback: {feedback}",
            task.validation_iteration,
            if passed { "PASSED" } else { "FAILED" },
        );

        let embedding = match self.embedder.embed(&summary).await {
            Ok(vector) => vector,
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "failed to embed validation memory");
                return;
            }
        };

        let error_patterns = (!passed).then(|| vec![feedback.to_owned()]);
        let result = memories::insert_memory(
            &self.pool,
            &memories::NewTaskMemory {
                task_id: task.id,
                execution_summary: &summary,
                memory_type: keel_db::models::MemoryType::Learning,
                context_embedding: &embedding,
                success: passed,
                error_patterns: error_patterns.as_deref(),
                goal: Some(&task.description),
                result: None,
                feedback: Some(feedback),
                tool_usage: None,
            },
        )
        .await;

        if let Err(e) = result {
            tracing::warn!(task_id = %task.id, error = %e, "failed to record validation memory");
        }
    }

    async fn get_task(&self, task_id: Uuid) -> KernelResult<Task> {
        task_db::get_task(&self.pool, task_id)
            .await?
            .ok_or_else(|| KernelError::not_found("task", task_id))
    }
}
