//! Diagnostic context: everything the analysis prompt needs about a stuck
//! workflow.

use sqlx::PgPool;
use uuid::Uuid;

use keel_db::models::TaskStatus;
use keel_db::queries::{results as result_db, tasks as task_db, tickets as ticket_db};

use crate::error::{KernelError, KernelResult};

/// Max recent task summaries included in the context.
const MAX_RECENT_TASKS: i64 = 15;

/// Summary of one recent task.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskSummary {
    pub task_id: Uuid,
    pub phase_id: String,
    pub task_type: String,
    pub status: TaskStatus,
    pub description: String,
    pub error_message: Option<String>,
}

/// Context assembled for one diagnostic analysis.
#[derive(Debug, Clone)]
pub struct DiagnosticContext {
    pub workflow_id: Uuid,
    pub workflow_goal: String,
    pub ticket_title: String,
    pub current_phase: String,
    pub total_tasks: i64,
    pub done_tasks: i64,
    pub failed_tasks: i64,
    pub time_stuck_seconds: i64,
    pub recent_tasks: Vec<TaskSummary>,
    pub task_distribution: Vec<(String, i64)>,
    pub result_history: Vec<String>,
}

impl DiagnosticContext {
    /// Assemble the context for a workflow.
    pub async fn build(
        pool: &PgPool,
        workflow_id: Uuid,
        time_stuck_seconds: i64,
    ) -> KernelResult<Self> {
        let ticket = ticket_db::get_ticket(pool, workflow_id)
            .await?
            .ok_or_else(|| KernelError::not_found("ticket", workflow_id))?;

        let total_tasks = task_db::count_tasks_for_ticket(pool, workflow_id).await?;
        let done_tasks =
            task_db::count_tasks_in_statuses(pool, workflow_id, &[TaskStatus::Completed]).await?;
        let failed_tasks =
            task_db::count_tasks_in_statuses(pool, workflow_id, &[TaskStatus::Failed]).await?;

        let recent_tasks = task_db::recent_tasks_for_ticket(pool, workflow_id, MAX_RECENT_TASKS)
            .await?
            .into_iter()
            .map(|task| TaskSummary {
                task_id: task.id,
                phase_id: task.phase_id,
                task_type: task.task_type,
                status: task.status,
                description: task.description,
                error_message: task.error_message,
            })
            .collect();

        let task_distribution = task_db::task_distribution_by_phase(pool, workflow_id).await?;

        let result_history = result_db::list_workflow_results(pool, workflow_id)
            .await?
            .into_iter()
            .map(|r| format!("{} ({})", r.summary.unwrap_or_else(|| "no summary".into()), r.status))
            .collect();

        Ok(Self {
            workflow_id,
            workflow_goal: ticket.description.clone(),
            ticket_title: ticket.title,
            current_phase: ticket.phase_id,
            total_tasks,
            done_tasks,
            failed_tasks,
            time_stuck_seconds,
            recent_tasks,
            task_distribution,
            result_history,
        })
    }

    /// Render the analysis prompt for the LLM gateway.
    pub fn render_prompt(&self) -> String {
        let mut prompt = format!(
            "A workflow is stuck and needs diagnosis.\n\n\
             Goal: {}\n\
             Ticket: {}\n\
             Current phase: {}\n\
             Tasks: {} total, {} completed, {} failed\n\
             Stuck for: {} seconds\n",
            self.workflow_goal,
            self.ticket_title,
            self.current_phase,
            self.total_tasks,
            self.done_tasks,
            self.failed_tasks,
            self.time_stuck_seconds,
        );

        if !self.task_distribution.is_empty() {
            prompt.push_str("\nTask distribution by phase:\n");
            for (phase, count) in &self.task_distribution {
                prompt.push_str(&format!("  {phase}: {count}\n"));
            }
        }

        if !self.recent_tasks.is_empty() {
            prompt.push_str("\nRecent tasks (newest first):\n");
            for task in self.recent_tasks.iter().take(10) {
                prompt.push_str(&format!(
                    "  - [{}] {} ({}): {}\n",
                    task.status, task.task_type, task.phase_id, task.description
                ));
                if let Some(error) = &task.error_message {
                    prompt.push_str(&format!("    error: {error}\n"));
                }
            }
        }

        if !self.result_history.is_empty() {
            prompt.push_str("\nSubmitted results:\n");
            for result in &self.result_history {
                prompt.push_str(&format!("  - {result}\n"));
            }
        }

        prompt.push_str(
            "\nIdentify the root cause, list hypotheses with likelihoods, and \
             recommend corrective actions with priorities.",
        );
        prompt
    }

    /// Serialized phase analysis stored on the diagnostic run.
    pub fn phases_analyzed(&self) -> serde_json::Value {
        serde_json::json!({
            "current_phase": self.current_phase,
            "task_distribution": self
                .task_distribution
                .iter()
                .map(|(phase, count)| (phase.clone(), *count))
                .collect::<std::collections::BTreeMap<_, _>>(),
        })
    }

    /// Serialized review of recent agent work stored on the diagnostic run.
    pub fn agents_reviewed(&self) -> serde_json::Value {
        serde_json::json!({
            "count": self.recent_tasks.len(),
            "tasks": self.recent_tasks,
        })
    }
}
