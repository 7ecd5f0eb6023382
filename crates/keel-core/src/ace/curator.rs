//! Curator phase: fold accepted insights into the ticket's playbook.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use keel_db::models::{PlaybookCategory, PlaybookEntry};
use keel_db::queries::playbook;

use crate::embedding::{cosine_similarity, Embedder};
use crate::error::KernelResult;

use super::reflector::{Insight, InsightKind};

/// Similarity at or above which an insight counts as already known.
const NEAR_DUPLICATE_THRESHOLD: f32 = 0.85;
/// Minimum content length for a playbook entry.
const MIN_CONTENT_LEN: usize = 10;

/// One accepted delta operation.
#[derive(Debug, Clone)]
pub struct DeltaOperation {
    pub operation: &'static str,
    pub content: String,
    pub category: PlaybookCategory,
}

/// Result of the Curator phase.
#[derive(Debug, Clone, Default)]
pub struct CuratorResult {
    pub entries_added: Vec<PlaybookEntry>,
    pub change_id: Option<Uuid>,
    /// Insights dropped as duplicates or below the quality bar.
    pub rejected: usize,
}

/// Curator phase of the ACE pipeline.
pub struct Curator {
    pool: PgPool,
    embedder: Arc<dyn Embedder>,
}

impl Curator {
    pub fn new(pool: PgPool, embedder: Arc<dyn Embedder>) -> Self {
        Self { pool, embedder }
    }

    /// Propose, validate, and apply playbook updates for a batch of
    /// insights.
    ///
    /// Idempotent per memory: when a playbook change already references
    /// `memory_id`, the whole curation is skipped.
    pub async fn curate(
        &self,
        ticket_id: Uuid,
        memory_id: Uuid,
        agent_id: Option<Uuid>,
        tags: &[String],
        insights: &[Insight],
    ) -> KernelResult<CuratorResult> {
        if playbook::change_exists_for_memory(&self.pool, memory_id).await? {
            tracing::debug!(
                ticket_id = %ticket_id,
                memory_id = %memory_id,
                "playbook already curated for this memory, skipping"
            );
            return Ok(CuratorResult::default());
        }

        let current = playbook::list_active_entries(&self.pool, ticket_id).await?;

        // Propose adds for novel, substantial insights.
        let mut proposals: Vec<DeltaOperation> = Vec::new();
        let mut rejected = 0usize;
        for insight in insights {
            if insight.content.len() < MIN_CONTENT_LEN {
                rejected += 1;
                continue;
            }
            if self.has_near_duplicate(&current, &insight.content).await? {
                rejected += 1;
                continue;
            }
            proposals.push(DeltaOperation {
                operation: "add",
                content: insight.content.clone(),
                category: infer_category(insight.kind),
            });
        }

        // Validate: drop any operation that exact-matches an active entry.
        proposals.retain(|op| {
            let duplicate = current.iter().any(|entry| {
                entry.content.trim().eq_ignore_ascii_case(op.content.trim())
            });
            if duplicate {
                rejected += 1;
            }
            !duplicate
        });

        if proposals.is_empty() {
            return Ok(CuratorResult {
                entries_added: Vec::new(),
                change_id: None,
                rejected,
            });
        }

        // Apply.
        let mut entries_added = Vec::with_capacity(proposals.len());
        for op in &proposals {
            let embedding = self.embedder.embed(&op.content).await?;
            let entry = playbook::insert_entry(
                &self.pool,
                ticket_id,
                &op.content,
                op.category,
                (!tags.is_empty()).then_some(tags),
                Some(&embedding),
                &[memory_id],
                agent_id,
            )
            .await?;
            entries_added.push(entry);
        }

        // Audit trail.
        let delta = serde_json::json!({
            "operations": proposals
                .iter()
                .map(|op| serde_json::json!({
                    "operation": op.operation,
                    "content": op.content,
                    "category": op.category,
                }))
                .collect::<Vec<_>>(),
            "summary": format!("Added {} new insights from task completion", proposals.len()),
        });
        let new_content: Vec<&str> = entries_added.iter().map(|e| e.content.as_str()).collect();
        let change = playbook::insert_change(
            &self.pool,
            ticket_id,
            "add",
            Some(&serde_json::to_string(&new_content).unwrap_or_default()),
            &delta,
            Some("ACE workflow completion"),
            Some(memory_id),
            agent_id,
        )
        .await?;

        Ok(CuratorResult {
            entries_added,
            change_id: Some(change.id),
            rejected,
        })
    }

    /// Whether an active entry is semantically close enough to count as
    /// already knowing this insight.
    async fn has_near_duplicate(
        &self,
        current: &[PlaybookEntry],
        content: &str,
    ) -> KernelResult<bool> {
        if current.iter().all(|e| e.embedding.is_none()) {
            return Ok(false);
        }
        let query = self.embedder.embed(content).await?;
        Ok(current.iter().any(|entry| {
            entry
                .embedding
                .as_deref()
                .is_some_and(|stored| cosine_similarity(&query, stored) >= NEAR_DUPLICATE_THRESHOLD)
        }))
    }
}

/// Map an insight bucket to its playbook category.
pub fn infer_category(kind: InsightKind) -> PlaybookCategory {
    match kind {
        InsightKind::Pattern => PlaybookCategory::Patterns,
        InsightKind::Gotcha => PlaybookCategory::Gotchas,
        InsightKind::BestPractice => PlaybookCategory::BestPractices,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_inference() {
        assert_eq!(infer_category(InsightKind::Pattern), PlaybookCategory::Patterns);
        assert_eq!(infer_category(InsightKind::Gotcha), PlaybookCategory::Gotchas);
        assert_eq!(
            infer_category(InsightKind::BestPractice),
            PlaybookCategory::BestPractices
        );
    }
}
