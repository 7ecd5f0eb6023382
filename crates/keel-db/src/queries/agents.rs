//! Database query functions for the `agents`, `projects`, and `users`
//! tables.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Agent, AgentKind, Project, User};

/// Register a new agent row.
pub async fn insert_agent(
    pool: &PgPool,
    agent_type: AgentKind,
    phase_id: &str,
    capabilities: &[String],
    tags: &[String],
) -> Result<Agent> {
    let agent = sqlx::query_as::<_, Agent>(
        "INSERT INTO agents (agent_type, phase_id, capabilities, tags) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(agent_type)
    .bind(phase_id)
    .bind(capabilities)
    .bind(tags)
    .fetch_one(pool)
    .await
    .context("failed to insert agent")?;

    Ok(agent)
}

/// Fetch a single agent by ID.
pub async fn get_agent(pool: &PgPool, id: Uuid) -> Result<Option<Agent>> {
    let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch agent")?;

    Ok(agent)
}

/// Record an agent heartbeat.
pub async fn update_heartbeat(pool: &PgPool, id: Uuid, at: DateTime<Utc>) -> Result<()> {
    let result = sqlx::query("UPDATE agents SET last_heartbeat = $1 WHERE id = $2")
        .bind(at)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update agent heartbeat")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("agent {id} not found");
    }

    Ok(())
}

/// Fetch a single project by ID.
pub async fn get_project(pool: &PgPool, id: Uuid) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch project")?;

    Ok(project)
}

/// Fetch a single user by ID.
pub async fn get_user(pool: &PgPool, id: Uuid) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch user")?;

    Ok(user)
}

/// Insert a user row (test and bootstrap surface).
pub async fn insert_user(
    pool: &PgPool,
    name: &str,
    github_access_token: Option<&str>,
) -> Result<User> {
    let user = sqlx::query_as::<_, User>(
        "INSERT INTO users (name, github_access_token) VALUES ($1, $2) RETURNING *",
    )
    .bind(name)
    .bind(github_access_token)
    .fetch_one(pool)
    .await
    .context("failed to insert user")?;

    Ok(user)
}

/// Insert a project row (test and bootstrap surface).
pub async fn insert_project(
    pool: &PgPool,
    name: &str,
    owner_id: Option<Uuid>,
    github_repo: Option<&str>,
) -> Result<Project> {
    let project = sqlx::query_as::<_, Project>(
        "INSERT INTO projects (name, owner_id, github_repo) VALUES ($1, $2, $3) RETURNING *",
    )
    .bind(name)
    .bind(owner_id)
    .bind(github_repo)
    .fetch_one(pool)
    .await
    .context("failed to insert project")?;

    Ok(project)
}
