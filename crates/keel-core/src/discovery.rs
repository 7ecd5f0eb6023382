//! Discovery service: record findings and branch new tasks from them.
//!
//! A discovery is a logged finding by an agent that may spawn follow-up
//! work. Diagnostic recovery tasks are spawned through this same branch
//! path so the workflow graph stays uniform.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use keel_db::models::{ResolutionStatus, Task, TaskDiscovery, TaskPriority};
use keel_db::queries::{discoveries as db, tasks as task_db};

use crate::error::{KernelError, KernelResult};
use crate::events::{EventBus, SystemEvent};
use crate::queue::{EnqueueRequest, TaskQueue};

/// Discovery service.
pub struct DiscoveryService {
    pool: PgPool,
    queue: Arc<TaskQueue>,
    bus: Arc<EventBus>,
}

/// Parameters for branching a task off a discovery.
#[derive(Debug, Clone)]
pub struct BranchSpec {
    pub phase_id: String,
    pub description: String,
    pub priority: TaskPriority,
    pub priority_boost: bool,
    pub validation_enabled: bool,
}

impl DiscoveryService {
    pub fn new(pool: PgPool, queue: Arc<TaskQueue>, bus: Arc<EventBus>) -> Self {
        Self { pool, queue, bus }
    }

    /// Record a discovery without spawning work.
    pub async fn record_discovery(
        &self,
        source_task_id: Uuid,
        discovery_type: &str,
        description: &str,
        priority_boost: bool,
    ) -> KernelResult<TaskDiscovery> {
        let discovery =
            db::insert_discovery(&self.pool, source_task_id, discovery_type, description, priority_boost)
                .await?;

        self.bus
            .publish(SystemEvent::new(
                "discovery.recorded",
                "task_discovery",
                discovery.id,
                serde_json::json!({
                    "source_task_id": source_task_id,
                    "discovery_type": discovery_type,
                }),
            ))
            .await;

        Ok(discovery)
    }

    /// Record a discovery and spawn a task from it.
    ///
    /// The spawned task's type is `discovery_<type>`; a priority boost
    /// raises the requested priority one band.
    pub async fn record_discovery_and_branch(
        &self,
        source_task_id: Uuid,
        discovery_type: &str,
        description: &str,
        branch: BranchSpec,
    ) -> KernelResult<(TaskDiscovery, Task)> {
        let source = task_db::get_task(&self.pool, source_task_id)
            .await?
            .ok_or_else(|| KernelError::not_found("task", source_task_id))?;

        let discovery = self
            .record_discovery(source_task_id, discovery_type, description, branch.priority_boost)
            .await?;

        let priority = if branch.priority_boost {
            branch.priority.boosted()
        } else {
            branch.priority
        };

        let mut request = EnqueueRequest::new(
            source.ticket_id,
            branch.phase_id,
            format!("discovery_{discovery_type}"),
            branch.description,
            priority,
        );
        request.validation_enabled = branch.validation_enabled;
        let task = self.queue.enqueue(request).await?;

        db::append_spawned_task(&self.pool, discovery.id, task.id).await?;

        self.bus
            .publish(SystemEvent::new(
                "discovery.branch_created",
                "task_discovery",
                discovery.id,
                serde_json::json!({
                    "spawned_task_id": task.id,
                    "ticket_id": source.ticket_id,
                    "priority": priority,
                }),
            ))
            .await;

        Ok((discovery, task))
    }

    /// Update a discovery's resolution status.
    pub async fn resolve_discovery(
        &self,
        discovery_id: Uuid,
        resolution: ResolutionStatus,
    ) -> KernelResult<TaskDiscovery> {
        db::update_resolution(&self.pool, discovery_id, resolution).await?;
        let discovery = db::get_discovery(&self.pool, discovery_id)
            .await?
            .ok_or_else(|| KernelError::not_found("task_discovery", discovery_id))?;

        self.bus
            .publish(SystemEvent::new(
                "discovery.resolved",
                "task_discovery",
                discovery.id,
                serde_json::json!({ "resolution_status": resolution }),
            ))
            .await;

        Ok(discovery)
    }

    /// Spawn recovery tasks for a stuck workflow through the discovery
    /// branch. The last-active task anchors the discovery edge.
    pub async fn spawn_diagnostic_recovery(
        &self,
        ticket_id: Uuid,
        reason: &str,
        suggested_phase: &str,
        suggested_priority: TaskPriority,
        max_tasks: usize,
    ) -> KernelResult<Vec<Task>> {
        let recent = task_db::recent_tasks_for_ticket(&self.pool, ticket_id, 1).await?;
        let source = recent
            .first()
            .ok_or_else(|| KernelError::not_found("tasks for ticket", ticket_id))?;

        let mut spawned = Vec::new();
        let (_, task) = self
            .record_discovery_and_branch(
                source.id,
                "diagnostic_no_result",
                &format!("Diagnostic: {reason}"),
                BranchSpec {
                    phase_id: suggested_phase.to_owned(),
                    description: format!("Diagnostic recovery: {reason}"),
                    priority: suggested_priority,
                    priority_boost: true,
                    validation_enabled: true,
                },
            )
            .await?;
        spawned.push(task);

        spawned.truncate(max_tasks);
        Ok(spawned)
    }
}
