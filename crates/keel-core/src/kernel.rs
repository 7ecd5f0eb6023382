//! The long-lived kernel process: dependency graph assembly and the
//! cooperating background ticks.
//!
//! Actors: one scheduler tick per workflow phase, a claim reaper, a
//! diagnostic tick (periodic scan + explicit work queue), a validator
//! timeout sweep, and a score-refresh timer. Within an actor work is
//! sequential; across actors the storage layer's transactional guarantees
//! bound the concurrency. No actor holds an in-process lock across a
//! suspension point.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use keel_db::models::AgentKind;

use crate::ace::AcePipeline;
use crate::config::KernelConfig;
use crate::dedup::DedupService;
use crate::diagnostic::{self, DiagnosticEngine, DiagnosticSender};
use crate::discovery::DiscoveryService;
use crate::embedding::Embedder;
use crate::events::{EventBus, EventSink};
use crate::llm::LlmGateway;
use crate::ownership::OwnershipValidator;
use crate::queue::{reaper, scorer::TaskScorer, TaskQueue};
use crate::spawn::AgentSpawner;
use crate::validation::ValidationOrchestrator;

/// Tick cadences. Not environment-tunable; operators tune the behavior
/// thresholds instead.
const SCHEDULER_INTERVAL: Duration = Duration::from_millis(500);
const REAPER_INTERVAL: Duration = Duration::from_secs(15);
const DIAGNOSTIC_INTERVAL: Duration = Duration::from_secs(30);
const VALIDATOR_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SCORE_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// External collaborators injected at startup.
pub struct KernelDeps {
    pub embedder: Arc<dyn Embedder>,
    pub gateway: Option<Arc<dyn LlmGateway>>,
    pub spawner: Arc<dyn AgentSpawner>,
    pub event_sink: Option<Arc<dyn EventSink>>,
}

/// The assembled kernel.
pub struct Kernel {
    pool: PgPool,
    config: KernelConfig,
    bus: Arc<EventBus>,
    queue: Arc<TaskQueue>,
    ownership: Arc<OwnershipValidator>,
    validation: Arc<ValidationOrchestrator>,
    diagnostic: Arc<DiagnosticEngine>,
    diagnostic_sender: DiagnosticSender,
    diagnostic_rx: Option<tokio::sync::mpsc::Receiver<diagnostic::DiagnosticRequest>>,
    spawner: Arc<dyn AgentSpawner>,
}

impl Kernel {
    /// Build the full dependency graph.
    pub fn new(pool: PgPool, config: KernelConfig, deps: KernelDeps) -> Self {
        let bus = Arc::new(EventBus::new(deps.event_sink));

        let queue = Arc::new(TaskQueue::new(
            pool.clone(),
            TaskScorer::new(config.scorer.clone()),
            Arc::clone(&bus),
        ));

        let dedup = Arc::new(DedupService::new(
            pool.clone(),
            Arc::clone(&deps.embedder),
            config.dedup.clone(),
        ));

        let discovery = Arc::new(DiscoveryService::new(
            pool.clone(),
            Arc::clone(&queue),
            Arc::clone(&bus),
        ));

        let diagnostic = Arc::new(DiagnosticEngine::new(
            pool.clone(),
            discovery,
            dedup,
            deps.gateway.clone(),
            Arc::clone(&bus),
            config.diagnostic.clone(),
        ));

        let (diagnostic_sender, diagnostic_rx) = diagnostic::work_queue(64);

        let ace = Arc::new(AcePipeline::new(
            pool.clone(),
            Arc::clone(&deps.embedder),
            deps.gateway.clone(),
            Arc::clone(&bus),
        ));

        let validation = Arc::new(ValidationOrchestrator::new(
            pool.clone(),
            Arc::clone(&deps.spawner),
            Arc::clone(&deps.embedder),
            ace,
            diagnostic_sender.clone(),
            Arc::clone(&bus),
            config.validator_timeout,
        ));

        let ownership = Arc::new(OwnershipValidator::new(pool.clone(), false));

        Self {
            pool,
            config,
            bus,
            queue,
            ownership,
            validation,
            diagnostic,
            diagnostic_sender,
            diagnostic_rx: Some(diagnostic_rx),
            spawner: deps.spawner,
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn validation(&self) -> &Arc<ValidationOrchestrator> {
        &self.validation
    }

    pub fn diagnostic(&self) -> &Arc<DiagnosticEngine> {
        &self.diagnostic
    }

    pub fn diagnostic_sender(&self) -> DiagnosticSender {
        self.diagnostic_sender.clone()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Run all background ticks until the token is cancelled.
    pub async fn run(mut self, phases: Vec<String>, cancel: CancellationToken) {
        let mut tasks = tokio::task::JoinSet::new();

        for phase in phases {
            let queue = Arc::clone(&self.queue);
            let ownership = Arc::clone(&self.ownership);
            let spawner = Arc::clone(&self.spawner);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                scheduler_tick(queue, ownership, spawner, phase, cancel).await;
            });
        }

        {
            let pool = self.pool.clone();
            let bus = Arc::clone(&self.bus);
            let claim_ttl = self.config.claim_ttl;
            let cancel = cancel.clone();
            tasks.spawn(async move {
                reaper::run_reaper(pool, bus, claim_ttl, REAPER_INTERVAL, cancel).await;
            });
        }

        if let Some(rx) = self.diagnostic_rx.take() {
            let engine = Arc::clone(&self.diagnostic);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                engine.run(rx, DIAGNOSTIC_INTERVAL, cancel).await;
            });
        }

        {
            let validation = Arc::clone(&self.validation);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                validation
                    .run_timeout_sweep(VALIDATOR_SWEEP_INTERVAL, cancel)
                    .await;
            });
        }

        {
            let queue = Arc::clone(&self.queue);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                score_refresh_tick(queue, cancel).await;
            });
        }

        while tasks.join_next().await.is_some() {}
        tracing::info!("kernel stopped");
    }
}

/// One phase's scheduler: claim the top-scored ready task, validate
/// ownership, spawn a worker, finalize the claim.
///
/// Per-task failures release the claim and continue; the tick never
/// aborts.
async fn scheduler_tick(
    queue: Arc<TaskQueue>,
    ownership: Arc<OwnershipValidator>,
    spawner: Arc<dyn AgentSpawner>,
    phase_id: String,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(SCHEDULER_INTERVAL) => {}
            _ = cancel.cancelled() => {
                tracing::info!(phase_id, "scheduler tick shutting down");
                return;
            }
        }

        let task = match queue.next_ready(&phase_id).await {
            Ok(Some(task)) => task,
            Ok(None) => continue,
            Err(e) => {
                tracing::error!(phase_id, error = %e, "claim failed");
                continue;
            }
        };

        // Ownership check: in strict mode conflicts block dispatch; the
        // default lenient validator only warns.
        match ownership.validate_task_ownership(&task).await {
            Ok(validation) => {
                for warning in &validation.warnings {
                    tracing::warn!(task_id = %task.id, "{warning}");
                }
                if !validation.valid {
                    tracing::warn!(
                        task_id = %task.id,
                        conflicts = validation.conflicts.len(),
                        "ownership conflicts block dispatch, releasing claim"
                    );
                    if let Err(e) = queue.release(task.id).await {
                        tracing::error!(task_id = %task.id, error = %e, "failed to release claim");
                    }
                    continue;
                }
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "ownership validation failed, dispatching anyway");
            }
        }

        // Hand the task to a worker agent.
        let agent = match spawner
            .spawn_agent(AgentKind::Worker, &phase_id, &[], &[])
            .await
        {
            Ok(agent) => agent,
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "worker spawn failed, releasing claim");
                if let Err(e) = queue.release(task.id).await {
                    tracing::error!(task_id = %task.id, error = %e, "failed to release claim");
                }
                continue;
            }
        };

        if let Err(e) = queue.finalize(task.id, agent.id).await {
            tracing::error!(
                task_id = %task.id,
                agent_id = %agent.id,
                error = %e,
                "failed to finalize claim"
            );
            continue;
        }

        tracing::info!(
            task_id = %task.id,
            agent_id = %agent.id,
            phase_id,
            score = task.score,
            "task dispatched"
        );
    }
}

/// Periodic batch score refresh across all phases.
async fn score_refresh_tick(queue: Arc<TaskQueue>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(SCORE_REFRESH_INTERVAL) => {}
            _ = cancel.cancelled() => {
                tracing::info!("score refresh tick shutting down");
                return;
            }
        }

        match queue.recompute_scores(None).await {
            Ok(updated) => {
                tracing::debug!(updated, "scores refreshed");
            }
            Err(e) => {
                tracing::warn!(error = %e, "score refresh failed, keeping stale scores");
            }
        }
    }
}
