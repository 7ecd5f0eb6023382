//! Diagnostic engine: stuck-workflow detection and bounded recovery.
//!
//! A periodic scan looks for tickets whose work has gone quiet without a
//! validated result, runs an LLM analysis over the workflow's history, and
//! spawns recovery tasks through the discovery branch. Layered safeguards
//! (completed-without-failures, diagnostics-already-tried, pending
//! recovery work, failure counters, per-workflow run ceilings, clone
//! readiness, cooldowns) keep the engine from spawning itself into a
//! runaway loop. Semantic dedup is the last gate before any spawn.

pub mod context;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use keel_db::models::{DiagnosticRunStatus, TaskPriority, TaskStatus};
use keel_db::queries::{
    agents as agent_db, diagnostics as diag_db, results as result_db, tasks as task_db,
    tickets as ticket_db,
};

use crate::config::DiagnosticConfig;
use crate::dedup::DedupService;
use crate::discovery::DiscoveryService;
use crate::error::KernelResult;
use crate::events::{EventBus, SystemEvent};
use crate::llm::{self, DiagnosticAnalysis, LlmGateway};

use context::DiagnosticContext;

/// A workflow that met every stuck condition.
#[derive(Debug, Clone)]
pub struct StuckWorkflow {
    pub workflow_id: Uuid,
    pub time_stuck_seconds: i64,
    pub total_tasks: i64,
    pub done_tasks: i64,
    pub failed_tasks: i64,
}

/// A request to diagnose a workflow, enqueued onto the engine's work
/// queue by other components (e.g. the validation orchestrator on
/// repeated failures).
#[derive(Debug, Clone)]
pub struct DiagnosticRequest {
    pub workflow_id: Uuid,
    pub trigger: serde_json::Value,
    pub max_tasks: usize,
}

/// Sender half handed to components that may request diagnostics.
#[derive(Clone)]
pub struct DiagnosticSender(mpsc::Sender<DiagnosticRequest>);

impl DiagnosticSender {
    /// Enqueue a diagnostic request. A full queue drops the request with a
    /// warning; the periodic scan will re-detect the condition.
    pub fn request(&self, request: DiagnosticRequest) {
        if let Err(e) = self.0.try_send(request) {
            tracing::warn!(error = %e, "diagnostic work queue full, dropping request");
        }
    }
}

/// Create the engine's work queue.
pub fn work_queue(capacity: usize) -> (DiagnosticSender, mpsc::Receiver<DiagnosticRequest>) {
    let (tx, rx) = mpsc::channel(capacity);
    (DiagnosticSender(tx), rx)
}

#[derive(Default)]
struct EngineState {
    /// workflow_id -> last diagnostic trigger time (cooldown tracking).
    last_diagnostic: HashMap<Uuid, DateTime<Utc>>,
    /// workflow_id -> consecutive failed recovery attempts.
    consecutive_failures: HashMap<Uuid, u32>,
}

/// The diagnostic engine.
pub struct DiagnosticEngine {
    pool: PgPool,
    discovery: Arc<DiscoveryService>,
    dedup: Arc<DedupService>,
    gateway: Option<Arc<dyn LlmGateway>>,
    bus: Arc<EventBus>,
    config: DiagnosticConfig,
    state: Mutex<EngineState>,
}

impl DiagnosticEngine {
    pub fn new(
        pool: PgPool,
        discovery: Arc<DiscoveryService>,
        dedup: Arc<DedupService>,
        gateway: Option<Arc<dyn LlmGateway>>,
        bus: Arc<EventBus>,
        config: DiagnosticConfig,
    ) -> Self {
        Self {
            pool,
            discovery,
            dedup,
            gateway,
            bus,
            config,
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Find workflows meeting all stuck conditions and none of the
    /// safeguard conditions.
    pub async fn find_stuck_workflows(&self) -> KernelResult<Vec<StuckWorkflow>> {
        let mut stuck = Vec::new();

        for ticket in ticket_db::list_open_tickets(&self.pool).await? {
            let total_tasks = task_db::count_tasks_for_ticket(&self.pool, ticket.id).await?;
            if total_tasks == 0 {
                continue;
            }

            let active_tasks =
                task_db::count_tasks_in_statuses(&self.pool, ticket.id, &TaskStatus::ACTIVE)
                    .await?;
            if active_tasks > 0 {
                continue;
            }

            if result_db::has_validated_result(&self.pool, ticket.id).await? {
                continue;
            }

            let done_tasks =
                task_db::count_tasks_in_statuses(&self.pool, ticket.id, &[TaskStatus::Completed])
                    .await?;
            let failed_tasks =
                task_db::count_tasks_in_statuses(&self.pool, ticket.id, &[TaskStatus::Failed])
                    .await?;

            // Safeguard: every task completed and none failed means the
            // workflow simply succeeded without a WorkflowResult.
            if done_tasks > 0 && failed_tasks == 0 {
                tracing::debug!(
                    workflow_id = %ticket.id,
                    done_tasks,
                    "skipping workflow: all tasks completed successfully"
                );
                continue;
            }

            // Safeguard: diagnostics already ran and the original work is
            // still failed. More diagnostics will not help.
            let completed_diagnostics = task_db::count_diagnostic_tasks_in_statuses(
                &self.pool,
                ticket.id,
                &[TaskStatus::Completed],
            )
            .await?;
            let failed_originals =
                task_db::count_failed_original_tasks(&self.pool, ticket.id).await?;
            if completed_diagnostics > 0 && failed_originals > 0 {
                tracing::info!(
                    workflow_id = %ticket.id,
                    completed_diagnostics,
                    failed_originals,
                    "skipping workflow: needs human review, not more diagnostics"
                );
                continue;
            }

            // Safeguard: recovery work is already queued or running.
            let pending_diagnostics = task_db::count_diagnostic_tasks_in_statuses(
                &self.pool,
                ticket.id,
                &[
                    TaskStatus::Pending,
                    TaskStatus::Claiming,
                    TaskStatus::Assigned,
                    TaskStatus::Running,
                ],
            )
            .await?;
            if pending_diagnostics > 0 {
                continue;
            }

            // Safeguard: consecutive-failure ceiling.
            let consecutive = self.consecutive_failures(ticket.id);
            if consecutive >= self.config.max_consecutive_failures {
                tracing::warn!(
                    workflow_id = %ticket.id,
                    consecutive,
                    "skipping workflow: exceeded max consecutive failures"
                );
                continue;
            }

            // Safeguard: total-run ceiling.
            let total_runs = diag_db::count_runs_for_workflow(&self.pool, ticket.id).await?;
            if total_runs >= self.config.max_diagnostics_per_workflow {
                tracing::warn!(
                    workflow_id = %ticket.id,
                    total_runs,
                    "skipping workflow: exceeded max diagnostics per workflow"
                );
                continue;
            }

            // Safeguard: recovery agents must be able to clone the project.
            if let Some(reason) = self.clone_readiness_gap(&ticket).await? {
                tracing::debug!(
                    workflow_id = %ticket.id,
                    reason,
                    "skipping workflow: not clone-ready"
                );
                continue;
            }

            // Cooldown between diagnostics for the same workflow.
            let now = Utc::now();
            if let Some(last) = self.last_diagnostic(ticket.id) {
                if (now - last).num_seconds() < self.config.cooldown_s {
                    continue;
                }
            }

            // Stuck time since the most recent task activity.
            let Some(last_activity) = task_db::last_task_activity(&self.pool, ticket.id).await?
            else {
                continue;
            };
            let time_stuck = (now - last_activity).num_seconds();
            if time_stuck < self.config.stuck_threshold_s {
                continue;
            }

            stuck.push(StuckWorkflow {
                workflow_id: ticket.id,
                time_stuck_seconds: time_stuck,
                total_tasks,
                done_tasks,
                failed_tasks,
            });
        }

        Ok(stuck)
    }

    /// Run one diagnostic for a workflow: analyze, dedup-check, spawn
    /// recovery tasks, close the run.
    ///
    /// Returns the run id; callers must refetch the row to observe the
    /// final status (`completed`, `skipped`, or `failed`).
    pub async fn spawn_diagnostic(
        &self,
        workflow_id: Uuid,
        time_stuck_seconds: i64,
        trigger: serde_json::Value,
        max_tasks: usize,
    ) -> KernelResult<Uuid> {
        let ctx = DiagnosticContext::build(&self.pool, workflow_id, time_stuck_seconds).await?;

        let run = diag_db::insert_run(
            &self.pool,
            &diag_db::NewDiagnosticRun {
                workflow_id,
                total_tasks_at_trigger: ctx.total_tasks as i32,
                done_tasks_at_trigger: ctx.done_tasks as i32,
                failed_tasks_at_trigger: ctx.failed_tasks as i32,
                time_since_last_task_seconds: time_stuck_seconds,
                workflow_goal: Some(&ctx.workflow_goal),
                phases_analyzed: Some(&ctx.phases_analyzed()),
                agents_reviewed: Some(&ctx.agents_reviewed()),
            },
        )
        .await?;

        self.touch_last_diagnostic(workflow_id);

        self.bus
            .publish(SystemEvent::new(
                "diagnostic.triggered",
                "diagnostic_run",
                run.id,
                serde_json::json!({
                    "workflow_id": workflow_id,
                    "time_stuck_seconds": time_stuck_seconds,
                    "trigger": trigger,
                }),
            ))
            .await;

        // Analyze. A gateway failure or absence degrades to the fallback
        // diagnosis with default phase and priority.
        let (diagnosis, suggested_phase, suggested_priority) = match self.analyze(&ctx).await {
            Some(analysis) => summarize_analysis(&analysis, max_tasks),
            None => (
                format!(
                    "Diagnostic triggered: workflow stuck for {time_stuck_seconds} seconds. \
                     All tasks completed but no validated result."
                ),
                "PHASE_IMPLEMENTATION".to_owned(),
                TaskPriority::High,
            ),
        };

        // Last gate: skip when a semantically similar diagnostic task is
        // already pending.
        match self
            .dedup
            .similar_pending_diagnostic(workflow_id, &diagnosis)
            .await
        {
            Ok(outcome) if outcome.is_duplicate => {
                let note = format!(
                    "Skipped: found semantically similar pending task(s) (similarity: {:.2})",
                    outcome.highest_similarity
                );
                tracing::warn!(
                    workflow_id = %workflow_id,
                    similarity = outcome.highest_similarity,
                    "skipping diagnostic spawn: duplicate pending recovery task"
                );
                diag_db::close_run(&self.pool, run.id, DiagnosticRunStatus::Skipped, &note, &[])
                    .await?;
                self.publish_run_closed(run.id, workflow_id, DiagnosticRunStatus::Skipped, 0)
                    .await;
                return Ok(run.id);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "dedup check failed, continuing with spawn");
            }
        }

        // Spawn recovery tasks and close the run.
        match self
            .discovery
            .spawn_diagnostic_recovery(
                workflow_id,
                &truncate_chars(&diagnosis, 2000),
                &suggested_phase,
                suggested_priority,
                max_tasks,
            )
            .await
        {
            Ok(spawned) => {
                // Store embeddings so future dedup sees these tasks.
                for task in &spawned {
                    match self
                        .dedup
                        .check_task(workflow_id, &task.task_type, None, &task.description, None, 1)
                        .await
                    {
                        Ok(outcome) => {
                            if let Some(embedding) = outcome.embedding {
                                if let Err(e) = task_db::store_task_embedding(
                                    &self.pool,
                                    task.id,
                                    &outcome.content_hash,
                                    &embedding,
                                )
                                .await
                                {
                                    tracing::debug!(task_id = %task.id, error = %e, "could not store task embedding");
                                }
                            }
                        }
                        Err(e) => {
                            tracing::debug!(task_id = %task.id, error = %e, "could not store task embedding");
                        }
                    }
                }

                let ids: Vec<Uuid> = spawned.iter().map(|t| t.id).collect();
                diag_db::close_run(
                    &self.pool,
                    run.id,
                    DiagnosticRunStatus::Completed,
                    &diagnosis,
                    &ids,
                )
                .await?;
                self.publish_run_closed(
                    run.id,
                    workflow_id,
                    DiagnosticRunStatus::Completed,
                    ids.len(),
                )
                .await;
            }
            Err(e) => {
                let note = format!("Failed to spawn recovery tasks: {e}");
                tracing::error!(workflow_id = %workflow_id, error = %e, "diagnostic spawn failed");
                diag_db::close_run(&self.pool, run.id, DiagnosticRunStatus::Failed, &note, &[])
                    .await?;
                self.publish_run_closed(run.id, workflow_id, DiagnosticRunStatus::Failed, 0)
                    .await;
            }
        }

        Ok(run.id)
    }

    /// One scan over all workflows; failures are isolated per candidate.
    pub async fn scan_once(&self) -> KernelResult<usize> {
        let stuck = self.find_stuck_workflows().await?;
        let found = stuck.len();

        for workflow in stuck {
            let trigger = serde_json::json!({
                "trigger": "stuck_workflow_scan",
                "total_tasks": workflow.total_tasks,
                "done_tasks": workflow.done_tasks,
                "failed_tasks": workflow.failed_tasks,
            });
            if let Err(e) = self
                .spawn_diagnostic(
                    workflow.workflow_id,
                    workflow.time_stuck_seconds,
                    trigger,
                    self.config.max_recovery_tasks,
                )
                .await
            {
                tracing::error!(
                    workflow_id = %workflow.workflow_id,
                    error = %e,
                    "diagnostic failed for workflow, continuing scan"
                );
            }
        }

        Ok(found)
    }

    /// Run the diagnostic tick until cancelled: drain explicit requests,
    /// scan on the interval, and refresh outcome counters.
    pub async fn run(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<DiagnosticRequest>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("diagnostic engine shutting down");
                    return;
                }
                Some(request) = requests.recv() => {
                    let time_stuck = task_db::last_task_activity(&self.pool, request.workflow_id)
                        .await
                        .ok()
                        .flatten()
                        .map(|ts| (Utc::now() - ts).num_seconds())
                        .unwrap_or(0);
                    if let Err(e) = self
                        .spawn_diagnostic(
                            request.workflow_id,
                            time_stuck,
                            request.trigger,
                            request.max_tasks,
                        )
                        .await
                    {
                        tracing::error!(
                            workflow_id = %request.workflow_id,
                            error = %e,
                            "requested diagnostic failed"
                        );
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.check_outcomes().await {
                        tracing::warn!(error = %e, "diagnostic outcome check failed");
                    }
                    match self.scan_once().await {
                        Ok(found) if found > 0 => {
                            tracing::info!(found, "diagnostic scan found stuck workflows");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "diagnostic scan failed");
                        }
                    }
                }
            }
        }
    }

    /// Record a failed recovery attempt for a workflow. Returns the new
    /// counter value.
    pub fn record_failure(&self, workflow_id: Uuid) -> u32 {
        let mut state = self.state.lock().expect("diagnostic state lock poisoned");
        let counter = state.consecutive_failures.entry(workflow_id).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Clear the failure counter after a successful recovery.
    pub fn record_success(&self, workflow_id: Uuid) {
        let mut state = self.state.lock().expect("diagnostic state lock poisoned");
        state.consecutive_failures.remove(&workflow_id);
    }

    /// Reset failure tracking for one workflow, or all of them.
    pub fn reset_failure_tracking(&self, workflow_id: Option<Uuid>) {
        let mut state = self.state.lock().expect("diagnostic state lock poisoned");
        match workflow_id {
            Some(id) => {
                state.consecutive_failures.remove(&id);
            }
            None => state.consecutive_failures.clear(),
        }
    }

    /// Snapshot of the consecutive-failure counters.
    pub fn failure_stats(&self) -> HashMap<Uuid, u32> {
        self.state
            .lock()
            .expect("diagnostic state lock poisoned")
            .consecutive_failures
            .clone()
    }

    /// Examine recently spawned recovery tasks and update the failure
    /// counters: a run whose recovery tasks all completed clears the
    /// workflow's counter, a run with failed recovery tasks increments it.
    pub async fn check_outcomes(&self) -> KernelResult<()> {
        let runs = diag_db::list_runs(&self.pool, None, 100).await?;

        for run in runs {
            if run.status != DiagnosticRunStatus::Completed {
                continue;
            }
            let Some(task_ids) = &run.tasks_created_ids else {
                continue;
            };
            if task_ids.is_empty() {
                continue;
            }

            let mut any_failed = false;
            let mut all_completed = true;
            for task_id in task_ids {
                match task_db::get_task(&self.pool, *task_id).await? {
                    Some(task) => {
                        match task.status {
                            TaskStatus::Failed => {
                                any_failed = true;
                                all_completed = false;
                            }
                            TaskStatus::Completed => {}
                            _ => all_completed = false,
                        }
                    }
                    None => all_completed = false,
                }
            }

            if any_failed {
                self.record_failure(run.workflow_id);
            } else if all_completed {
                self.record_success(run.workflow_id);
            }
        }

        Ok(())
    }

    async fn analyze(&self, ctx: &DiagnosticContext) -> Option<DiagnosticAnalysis> {
        let gateway = self.gateway.as_ref()?;
        let system_prompt = "You are a workflow diagnostician. Analyze why the workflow is \
                             stuck and produce a root cause, hypotheses with likelihoods, and \
                             prioritized recommendations."
            .to_owned();
        match llm::diagnose(gateway.as_ref(), ctx.render_prompt(), system_prompt).await {
            Ok(analysis) => Some(analysis),
            Err(e) => {
                tracing::warn!(
                    workflow_id = %ctx.workflow_id,
                    error = %e,
                    "hypothesis generation failed, using fallback diagnosis"
                );
                None
            }
        }
    }

    /// The clone-readiness chain: ticket -> project -> owner -> GitHub
    /// token. Returns the first gap, or `None` when clone-ready.
    async fn clone_readiness_gap(
        &self,
        ticket: &keel_db::models::Ticket,
    ) -> KernelResult<Option<&'static str>> {
        // No project link: ownership is ambiguous in multi-tenant setups,
        // never auto-attach.
        let Some(project_id) = ticket.project_id else {
            return Ok(Some("ticket has no project link"));
        };
        let Some(project) = agent_db::get_project(&self.pool, project_id).await? else {
            return Ok(Some("project missing"));
        };
        let Some(owner_id) = project.owner_id else {
            return Ok(Some("project has no owner"));
        };
        let Some(owner) = agent_db::get_user(&self.pool, owner_id).await? else {
            return Ok(Some("project owner missing"));
        };
        if owner.github_access_token.is_none() {
            return Ok(Some("owner has no GitHub access token"));
        }
        Ok(None)
    }

    fn last_diagnostic(&self, workflow_id: Uuid) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .expect("diagnostic state lock poisoned")
            .last_diagnostic
            .get(&workflow_id)
            .copied()
    }

    fn touch_last_diagnostic(&self, workflow_id: Uuid) {
        self.state
            .lock()
            .expect("diagnostic state lock poisoned")
            .last_diagnostic
            .insert(workflow_id, Utc::now());
    }

    fn consecutive_failures(&self, workflow_id: Uuid) -> u32 {
        self.state
            .lock()
            .expect("diagnostic state lock poisoned")
            .consecutive_failures
            .get(&workflow_id)
            .copied()
            .unwrap_or(0)
    }

    async fn publish_run_closed(
        &self,
        run_id: Uuid,
        workflow_id: Uuid,
        status: DiagnosticRunStatus,
        tasks_created: usize,
    ) {
        let event_type = match status {
            DiagnosticRunStatus::Failed => "diagnostic.failed",
            _ => "diagnostic.completed",
        };
        self.bus
            .publish(SystemEvent::new(
                event_type,
                "diagnostic_run",
                run_id,
                serde_json::json!({
                    "workflow_id": workflow_id,
                    "status": status,
                    "tasks_created": tasks_created,
                }),
            ))
            .await;
    }
}

/// Collapse an analysis into a diagnosis string plus suggested phase and
/// priority for the recovery tasks.
fn summarize_analysis(
    analysis: &DiagnosticAnalysis,
    max_recommendations: usize,
) -> (String, String, TaskPriority) {
    let mut parts = Vec::new();
    if !analysis.root_cause.is_empty() {
        parts.push(format!("Root Cause: {}", analysis.root_cause));
    }
    if !analysis.hypotheses.is_empty() {
        parts.push("\nHypotheses:".to_owned());
        for hyp in analysis.hypotheses.iter().take(3) {
            parts.push(format!(
                "  - {} (likelihood: {:.2})",
                hyp.statement, hyp.likelihood
            ));
        }
    }
    if !analysis.recommendations.is_empty() {
        parts.push("\nRecommendations:".to_owned());
        for rec in analysis.recommendations.iter().take(max_recommendations) {
            parts.push(format!("  - [{}] {}", rec.priority, rec.description));
        }
    }

    let diagnosis = if parts.is_empty() {
        "No specific diagnosis generated".to_owned()
    } else {
        parts.join("\n")
    };

    let (phase, priority) = match analysis.recommendations.first() {
        Some(rec) => {
            let description = rec.description.to_lowercase();
            let phase = if description.contains("test") || description.contains("validate") {
                "PHASE_TESTING"
            } else if description.contains("requirement") || description.contains("clarify") {
                "PHASE_REQUIREMENTS"
            } else {
                "PHASE_IMPLEMENTATION"
            };
            let priority = rec.priority.parse().unwrap_or(TaskPriority::High);
            (phase, priority)
        }
        None => ("PHASE_IMPLEMENTATION", TaskPriority::High),
    };

    (diagnosis, phase.to_owned(), priority)
}

/// Truncate to at most `max` chars on a char boundary.
fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Hypothesis, Recommendation};

    #[test]
    fn summarize_prefers_first_recommendation() {
        let analysis = DiagnosticAnalysis {
            root_cause: "validator never spawned".into(),
            hypotheses: vec![Hypothesis {
                statement: "registry out of capacity".into(),
                likelihood: 0.8,
            }],
            recommendations: vec![Recommendation {
                description: "re-run the failing tests and validate the output".into(),
                priority: "CRITICAL".into(),
            }],
        };

        let (diagnosis, phase, priority) = summarize_analysis(&analysis, 5);
        assert!(diagnosis.contains("Root Cause: validator never spawned"));
        assert!(diagnosis.contains("likelihood: 0.80"));
        assert_eq!(phase, "PHASE_TESTING");
        assert_eq!(priority, TaskPriority::Critical);
    }

    #[test]
    fn summarize_defaults_without_recommendations() {
        let analysis = DiagnosticAnalysis {
            root_cause: String::new(),
            hypotheses: vec![],
            recommendations: vec![],
        };
        let (diagnosis, phase, priority) = summarize_analysis(&analysis, 5);
        assert_eq!(diagnosis, "No specific diagnosis generated");
        assert_eq!(phase, "PHASE_IMPLEMENTATION");
        assert_eq!(priority, TaskPriority::High);
    }

    #[test]
    fn requirement_keywords_route_to_requirements_phase() {
        let analysis = DiagnosticAnalysis {
            root_cause: "unclear scope".into(),
            hypotheses: vec![],
            recommendations: vec![Recommendation {
                description: "clarify the acceptance requirements with the owner".into(),
                priority: "MEDIUM".into(),
            }],
        };
        let (_, phase, priority) = summarize_analysis(&analysis, 5);
        assert_eq!(phase, "PHASE_REQUIREMENTS");
        assert_eq!(priority, TaskPriority::Medium);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "αβγδε".repeat(1000);
        let truncated = truncate_chars(&text, 2000);
        assert_eq!(truncated.chars().count(), 2000);
    }
}
