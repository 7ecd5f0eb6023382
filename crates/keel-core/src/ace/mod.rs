//! ACE pipeline: Executor -> Reflector -> Curator.
//!
//! Invoked when a task completes (typically on `validation_passed`).
//! Each phase failure is logged and later phases still run when safe: a
//! Reflector failure never loses the Executor's persisted memory.

pub mod curator;
pub mod executor;
pub mod reflector;

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use keel_db::models::Task;

use crate::embedding::Embedder;
use crate::error::KernelResult;
use crate::events::{EventBus, SystemEvent};
use crate::llm::LlmGateway;

use curator::Curator;
use executor::Executor;
use reflector::Reflector;

/// Inputs gathered from a completed task's report.
#[derive(Debug, Clone, Default)]
pub struct TaskCompletion {
    pub goal: String,
    pub result: String,
    pub feedback: Option<String>,
    pub tool_usage: Vec<serde_json::Value>,
    pub success: bool,
    pub agent_id: Option<Uuid>,
}

/// Counters summarizing one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct AceOutcome {
    pub memory_id: Option<Uuid>,
    pub insights_found: usize,
    pub errors_identified: usize,
    pub entries_added: usize,
    pub entries_tagged: usize,
}

/// The ACE pipeline.
pub struct AcePipeline {
    executor: Executor,
    reflector: Reflector,
    curator: Curator,
    bus: Arc<EventBus>,
}

impl AcePipeline {
    pub fn new(
        pool: PgPool,
        embedder: Arc<dyn Embedder>,
        gateway: Option<Arc<dyn LlmGateway>>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            executor: Executor::new(pool.clone(), Arc::clone(&embedder), gateway),
            reflector: Reflector::new(pool.clone(), Arc::clone(&embedder)),
            curator: Curator::new(pool, embedder),
            bus,
        }
    }

    /// Run the full pipeline for a completed task.
    ///
    /// Idempotent per `(task, memory)`: re-running curation for a memory
    /// that already has a playbook change is a no-op.
    pub async fn run(&self, task: &Task, completion: &TaskCompletion) -> KernelResult<AceOutcome> {
        let mut outcome = AceOutcome::default();

        // Execute: persist the memory. A failure here aborts the pipeline,
        // there is nothing to reflect on.
        let executed = self
            .executor
            .execute(
                task,
                &completion.goal,
                &completion.result,
                &completion.tool_usage,
                completion.feedback.as_deref(),
                completion.success,
            )
            .await?;
        outcome.memory_id = Some(executed.memory.id);

        self.bus
            .publish(SystemEvent::new(
                "memory.stored",
                "task_memory",
                executed.memory.id,
                serde_json::json!({
                    "task_id": task.id,
                    "memory_type": executed.memory.memory_type,
                    "files_linked": executed.files_linked,
                }),
            ))
            .await;

        // Reflect: failure is logged and curation proceeds with nothing to
        // add; the memory row above is already safe.
        let reflected = match self
            .reflector
            .analyze(
                executed.memory.id,
                task.ticket_id,
                &completion.goal,
                &completion.result,
                completion.feedback.as_deref().unwrap_or_default(),
            )
            .await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    task_id = %task.id,
                    error = %e,
                    "reflector phase failed, continuing without insights"
                );
                Default::default()
            }
        };
        outcome.insights_found = reflected.insights.len();
        outcome.errors_identified = reflected.errors.len();
        outcome.entries_tagged = reflected.tags_added.len();

        // Curate: failure is logged; memory and tags survive.
        match self
            .curator
            .curate(
                task.ticket_id,
                executed.memory.id,
                completion.agent_id,
                &executed.tags,
                &reflected.insights,
            )
            .await
        {
            Ok(curated) => {
                outcome.entries_added = curated.entries_added.len();
            }
            Err(e) => {
                tracing::warn!(
                    task_id = %task.id,
                    error = %e,
                    "curator phase failed, playbook not updated"
                );
            }
        }

        self.bus
            .publish(SystemEvent::new(
                "ace.workflow.completed",
                "task",
                task.id,
                serde_json::json!({
                    "memory_id": outcome.memory_id,
                    "insights_found": outcome.insights_found,
                    "errors_identified": outcome.errors_identified,
                    "playbook_entries_added": outcome.entries_added,
                    "playbook_entries_tagged": outcome.entries_tagged,
                }),
            ))
            .await;

        Ok(outcome)
    }
}
