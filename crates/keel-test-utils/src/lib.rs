//! Shared test utilities for keel integration tests.
//!
//! Provides a PostgreSQL instance shared across tests (each test gets its
//! own database within the instance) plus deterministic fakes for the
//! kernel's external contracts.
//!
//! Two database modes:
//! - **`KEEL_TEST_PG_URL`** set (CI setup script): use the external
//!   server directly. No testcontainers overhead per process.
//! - **No env var** (`cargo test`): spin up a container via
//!   testcontainers, shared per binary through a `OnceCell`.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use keel_core::embedding::{pad_to_dim, Embedder, EMBEDDING_DIM};
use keel_core::error::{KernelError, KernelResult};
use keel_core::events::{EventSink, SystemEvent};
use keel_core::llm::{LlmGateway, StructuredRequest};
use keel_core::spawn::{AgentHandle, AgentSpawner, MessageKind};
use keel_db::models::AgentKind;
use keel_db::pool;
use keel_db::queries::agents as agent_db;

/// Shared container state: base URL and optional container handle (kept
/// alive).
struct SharedPg {
    base_url: String,
    /// Held to keep the container alive. `None` when using an external URL.
    _container: Option<ContainerAsync<Postgres>>,
}

static SHARED_PG: OnceCell<SharedPg> = OnceCell::const_new();

async fn init_shared_pg() -> SharedPg {
    if let Ok(url) = std::env::var("KEEL_TEST_PG_URL") {
        return SharedPg {
            base_url: url,
            _container: None,
        };
    }

    let container = Postgres::default()
        .with_tag("16")
        .start()
        .await
        .expect("failed to start PostgreSQL container");

    let host = container.get_host().await.expect("failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("failed to get mapped port");

    let base_url = format!("postgresql://postgres:postgres@{host}:{port}");

    SharedPg {
        base_url,
        _container: Some(container),
    }
}

/// Base URL for the shared PostgreSQL (no database name appended).
pub async fn pg_url() -> &'static str {
    let shared = SHARED_PG.get_or_init(init_shared_pg).await;
    &shared.base_url
}

/// Create a temporary database with migrations applied.
///
/// Returns `(pool, db_name)`. Call [`drop_test_db`] with the returned
/// `db_name` when the test is done.
pub async fn create_test_db() -> (PgPool, String) {
    let base_url = pg_url().await;

    let maint_url = format!("{base_url}/postgres");
    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&maint_url)
        .await
        .expect("failed to connect to maintenance database");

    let db_name = format!("keel_test_{}", Uuid::new_v4().simple());
    let stmt = format!("CREATE DATABASE {db_name}");
    maint_pool
        .execute(stmt.as_str())
        .await
        .unwrap_or_else(|e| panic!("failed to create temp database {db_name}: {e}"));
    maint_pool.close().await;

    let temp_url = format!("{base_url}/{db_name}");
    let temp_pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&temp_url)
        .await
        .unwrap_or_else(|e| panic!("failed to connect to temp database {db_name}: {e}"));

    pool::run_migrations(&temp_pool)
        .await
        .expect("migrations should succeed");

    (temp_pool, db_name)
}

/// Drop a temporary database. Safe to call even if already dropped.
pub async fn drop_test_db(db_name: &str) {
    let base_url = pg_url().await;
    let maint_url = format!("{base_url}/postgres");

    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&maint_url)
        .await
        .expect("failed to connect to maintenance database for cleanup");

    let terminate = format!(
        "SELECT pg_terminate_backend(pid) \
         FROM pg_stat_activity \
         WHERE datname = '{db_name}' AND pid <> pg_backend_pid()"
    );
    let _ = maint_pool.execute(terminate.as_str()).await;

    let stmt = format!("DROP DATABASE IF EXISTS {db_name}");
    let _ = maint_pool.execute(stmt.as_str()).await;
    maint_pool.close().await;
}

// ---------------------------------------------------------------------------
// Deterministic fakes for external contracts
// ---------------------------------------------------------------------------

/// Deterministic bag-of-words embedder.
///
/// Each lowercase token hashes to a bucket; identical texts embed
/// identically, disjoint vocabularies embed near-orthogonally. Good
/// enough geometry for similarity-threshold tests without a model.
#[derive(Debug, Default, Clone)]
pub struct HashEmbedder;

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> KernelResult<Vec<f32>> {
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

/// An embedder that always fails, for degradation paths.
#[derive(Debug, Default, Clone)]
pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _text: &str) -> KernelResult<Vec<f32>> {
        Err(KernelError::ExternalTimeout("embedding provider down".into()))
    }
}

/// LLM gateway that replays scripted responses in order and errors when
/// the script runs dry.
#[derive(Default)]
pub struct ScriptedGateway {
    responses: Mutex<Vec<serde_json::Value>>,
}

impl ScriptedGateway {
    pub fn new(responses: Vec<serde_json::Value>) -> Self {
        Self {
            responses: Mutex::new(responses),
        }
    }

    /// A gateway with no script: every call errors, exercising fallback
    /// paths.
    pub fn failing() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LlmGateway for ScriptedGateway {
    async fn structured_output(
        &self,
        _request: StructuredRequest,
    ) -> KernelResult<serde_json::Value> {
        let mut responses = self.responses.lock().expect("scripted gateway lock");
        if responses.is_empty() {
            return Err(KernelError::ExternalTimeout("gateway script exhausted".into()));
        }
        Ok(responses.remove(0))
    }
}

/// Spawner that registers real agent rows and records sent messages.
pub struct RecordingSpawner {
    pool: PgPool,
    pub messages: Mutex<Vec<(Uuid, String, MessageKind)>>,
}

impl RecordingSpawner {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            messages: Mutex::new(Vec::new()),
        }
    }

    pub fn sent_messages(&self) -> Vec<(Uuid, String, MessageKind)> {
        self.messages.lock().expect("spawner lock").clone()
    }
}

#[async_trait]
impl AgentSpawner for RecordingSpawner {
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
        Ok(AgentHandle {
            id: agent.id,
            agent_type,
            phase_id: phase_id.to_owned(),
        })
    }

    async fn send_message(
        &self,
        target_id: Uuid,
        message: &str,
        kind: MessageKind,
    ) -> KernelResult<()> {
        self.messages
            .lock()
            .expect("spawner lock")
            .push((target_id, message.to_owned(), kind));
        Ok(())
    }
}

/// Event sink that remembers every appended event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SystemEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<SystemEvent> {
        self.events.lock().expect("sink lock").clone()
    }

    pub fn event_types_for(&self, entity_id: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.entity_id == entity_id)
            .map(|e| e.event_type)
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn append(&self, event: &SystemEvent) -> anyhow::Result<()> {
        self.events.lock().expect("sink lock").push(event.clone());
        Ok(())
    }
}
