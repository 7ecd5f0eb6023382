//! Database query functions for the `tickets` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{TaskPriority, Ticket, TicketStatus};

/// Insert a new ticket row. Returns the inserted ticket with
/// server-generated defaults (id, created_at, status).
pub async fn insert_ticket(
    pool: &PgPool,
    title: &str,
    description: &str,
    phase_id: &str,
    priority: TaskPriority,
    project_id: Option<Uuid>,
) -> Result<Ticket> {
    let ticket = sqlx::query_as::<_, Ticket>(
        "INSERT INTO tickets (title, description, phase_id, priority, project_id) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(title)
    .bind(description)
    .bind(phase_id)
    .bind(priority)
    .bind(project_id)
    .fetch_one(pool)
    .await
    .context("failed to insert ticket")?;

    Ok(ticket)
}

/// Fetch a single ticket by ID.
pub async fn get_ticket(pool: &PgPool, id: Uuid) -> Result<Option<Ticket>> {
    let ticket = sqlx::query_as::<_, Ticket>("SELECT * FROM tickets WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch ticket")?;

    Ok(ticket)
}

/// List all tickets that have not reached `done`.
pub async fn list_open_tickets(pool: &PgPool) -> Result<Vec<Ticket>> {
    let tickets = sqlx::query_as::<_, Ticket>(
        "SELECT * FROM tickets WHERE status != 'done' ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list open tickets")?;

    Ok(tickets)
}

/// Update the status of a ticket.
pub async fn update_ticket_status(pool: &PgPool, id: Uuid, status: TicketStatus) -> Result<()> {
    let result = sqlx::query("UPDATE tickets SET status = $1 WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update ticket status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("ticket {id} not found");
    }

    Ok(())
}

/// Move a ticket to a new workflow phase.
pub async fn update_ticket_phase(pool: &PgPool, id: Uuid, phase_id: &str) -> Result<()> {
    let result = sqlx::query("UPDATE tickets SET phase_id = $1 WHERE id = $2")
        .bind(phase_id)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update ticket phase")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("ticket {id} not found");
    }

    Ok(())
}
