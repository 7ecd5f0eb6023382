//! The keel daemon: builds the dependency graph and runs the kernel ticks
//! until interrupted.
//!
//! External collaborators (model gateway, embedding provider, sandbox
//! spawner) are provided by deployment-specific builds; this binary wires
//! the storage-backed defaults: a durable event sink over the
//! `system_events` table and a registry-only agent spawner.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use keel_core::config::KernelConfig;
use keel_core::embedding::{pad_to_dim, Embedder, EMBEDDING_DIM};
use keel_core::error::{KernelError, KernelResult};
use keel_core::events::{EventSink, SystemEvent};
use keel_core::kernel::{Kernel, KernelDeps};
use keel_core::spawn::{AgentHandle, AgentSpawner, MessageKind};
use keel_db::config::DbConfig;
use keel_db::models::AgentKind;
use keel_db::pool;
use keel_db::queries::{agents as agent_db, events as event_db};

#[derive(Parser)]
#[command(name = "keel-kernel", about = "Task coordination kernel for agent fleets")]
struct Cli {
    /// Database URL (overrides KEEL_DATABASE_URL env var)
    #[arg(long)]
    database_url: Option<String>,

    /// Workflow phases to run scheduler ticks for
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "PHASE_BACKLOG,PHASE_REQUIREMENTS,PHASE_DESIGN,PHASE_IMPLEMENTATION,PHASE_TESTING"
    )]
    phases: Vec<String>,

    /// Create the database and run migrations before starting
    #[arg(long)]
    init: bool,
}

/// Durable event sink backed by the `system_events` table.
struct PgEventSink {
    pool: PgPool,
}

#[async_trait]
impl EventSink for PgEventSink {
    async fn append(&self, event: &SystemEvent) -> Result<()> {
        event_db::append_event(
            &self.pool,
            &event.event_type,
            &event.entity_type,
            &event.entity_id,
            &event.payload,
        )
        .await?;
        Ok(())
    }
}

/// Registry-only spawner: records agents so the kernel can address them;
/// actual sandbox provisioning is a deployment concern.
struct RegistrySpawner {
    pool: PgPool,
}

#[async_trait]
impl AgentSpawner for RegistrySpawner {
    async fn spawn_agent(
        &self,
        agent_type: AgentKind,
        phase_id: &str,
        capabilities: &[String],
        tags: &[String],
    ) -> KernelResult<AgentHandle> {
        let agent = agent_db::insert_agent(&self.pool, agent_type, phase_id, capabilities, tags)
            .await
            .map_err(KernelError::Storage)?;
        tracing::info!(agent_id = %agent.id, %agent_type, phase_id, "agent registered");
        Ok(AgentHandle {
            id: agent.id,
            agent_type,
            phase_id: phase_id.to_owned(),
        })
    }

    async fn send_message(
        &self,
        target_id: uuid::Uuid,
        _message: &str,
        kind: MessageKind,
    ) -> KernelResult<()> {
        tracing::debug!(target_id = %target_id, ?kind, "message delivery not wired in this build");
        Ok(())
    }
}

/// Stand-in embedder for deployments without an embedding provider:
/// hashed bag-of-words, zero-padded. Deterministic and cheap; replace
/// with a real provider for production similarity quality.
struct LocalEmbedder;

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed(&self, text: &str) -> KernelResult<Vec<f32>> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut vector = vec![0.0f32; EMBEDDING_DIM];
        for token in text.to_lowercase().split_whitespace() {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let bucket = (hasher.finish() as usize) % EMBEDDING_DIM;
            vector[bucket] += 1.0;
        }
        Ok(pad_to_dim(vector, EMBEDDING_DIM))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let db_config = match cli.database_url {
        Some(url) => DbConfig::new(url),
        None => DbConfig::from_env(),
    };

    if cli.init {
        pool::ensure_database_exists(&db_config)
            .await
            .context("database bootstrap failed")?;
    }

    let pg = pool::create_pool(&db_config)
        .await
        .context("database connection failed")?;

    if cli.init {
        pool::run_migrations(&pg).await.context("migrations failed")?;
    }

    let config = KernelConfig::from_env();
    let deps = KernelDeps {
        embedder: Arc::new(LocalEmbedder),
        gateway: None,
        spawner: Arc::new(RegistrySpawner { pool: pg.clone() }),
        event_sink: Some(Arc::new(PgEventSink { pool: pg.clone() })),
    };

    let kernel = Kernel::new(pg, config, deps);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            signal_cancel.cancel();
        }
    });

    tracing::info!(phases = ?cli.phases, "kernel starting");
    kernel.run(cli.phases, cancel).await;

    Ok(())
}
