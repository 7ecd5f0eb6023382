//! Database query functions for the `validation_reviews` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::ValidationReview;

/// Append a validation review. Reviews are append-only per iteration.
pub async fn insert_review(
    pool: &PgPool,
    task_id: Uuid,
    validator_agent_id: Uuid,
    iteration_number: i32,
    validation_passed: bool,
    feedback: &str,
    evidence: Option<&serde_json::Value>,
    recommendations: Option<&[String]>,
) -> Result<ValidationReview> {
    let review = sqlx::query_as::<_, ValidationReview>(
        "INSERT INTO validation_reviews (task_id, validator_agent_id, iteration_number, \
                                         validation_passed, feedback, evidence, recommendations) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(validator_agent_id)
    .bind(iteration_number)
    .bind(validation_passed)
    .bind(feedback)
    .bind(evidence)
    .bind(recommendations)
    .fetch_one(pool)
    .await
    .context("failed to insert validation review")?;

    Ok(review)
}

/// List reviews for a task, newest iteration first.
pub async fn list_reviews_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<ValidationReview>> {
    let reviews = sqlx::query_as::<_, ValidationReview>(
        "SELECT * FROM validation_reviews \
         WHERE task_id = $1 \
         ORDER BY iteration_number DESC, created_at DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list validation reviews")?;

    Ok(reviews)
}

/// Count consecutive failed reviews, newest first, stopping at the first
/// pass.
pub async fn count_consecutive_failures(pool: &PgPool, task_id: Uuid) -> Result<i64> {
    let reviews = list_reviews_for_task(pool, task_id).await?;
    let mut failures = 0;
    for review in &reviews {
        if review.validation_passed {
            break;
        }
        failures += 1;
    }
    Ok(failures)
}
