//! Semantic deduplication for tasks and spec entities.
//!
//! Two phases: an exact content-hash match inside the entity's scope, then
//! a cosine-similarity pass over in-scope embeddings. Either phase hitting
//! its threshold recommends `skip`; otherwise the caller persists the new
//! row with the precomputed hash and embedding. Embedding failures degrade
//! to hash-only checking rather than erroring.

use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use keel_db::models::TaskStatus;
use keel_db::queries::tasks as task_db;

use crate::config::DedupThresholds;
use crate::embedding::{cosine_similarity, Embedder};
use crate::error::KernelResult;

/// Entity scopes with their own similarity thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupEntity {
    Spec,
    Requirement,
    Task,
    /// Acceptance criteria are short; hash-only, embeddings ignored.
    AcceptanceCriterion,
}

/// Recommended action for a candidate item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupAction {
    Create,
    Skip,
    Merge,
}

/// A potential duplicate found in scope.
#[derive(Debug, Clone)]
pub struct DuplicateCandidate {
    pub task_id: Uuid,
    pub task_type: String,
    pub description: String,
    pub status: TaskStatus,
    pub similarity: f32,
    pub is_exact_match: bool,
}

/// Outcome of a dedup check.
#[derive(Debug, Clone)]
pub struct DedupOutcome {
    pub action: DedupAction,
    pub is_duplicate: bool,
    pub highest_similarity: f32,
    pub candidates: Vec<DuplicateCandidate>,
    /// SHA-256 over the normalized content, ready to persist.
    pub content_hash: String,
    /// Embedding of the content, ready to persist. Absent when the
    /// embedder failed or the entity is hash-only.
    pub embedding: Option<Vec<f32>>,
    /// Present when `action` is `Merge`.
    pub merge_target_id: Option<Uuid>,
}

impl DedupOutcome {
    fn no_duplicate(content_hash: String, embedding: Option<Vec<f32>>) -> Self {
        Self {
            action: DedupAction::Create,
            is_duplicate: false,
            highest_similarity: 0.0,
            candidates: Vec::new(),
            content_hash,
            embedding,
            merge_target_id: None,
        }
    }
}

/// Partitioned result of a bulk dedup pass. Input order is preserved
/// within each partition.
#[derive(Debug, Default)]
pub struct BulkDedupResult {
    pub to_create: Vec<TaskCandidate>,
    pub to_skip: Vec<TaskCandidate>,
    pub to_merge: Vec<(TaskCandidate, Uuid)>,
}

impl BulkDedupResult {
    pub fn stats(&self) -> (usize, usize, usize, usize) {
        let total = self.to_create.len() + self.to_skip.len() + self.to_merge.len();
        (total, self.to_create.len(), self.to_skip.len(), self.to_merge.len())
    }
}

/// An item submitted to bulk dedup.
#[derive(Debug, Clone)]
pub struct TaskCandidate {
    pub task_type: String,
    pub title: Option<String>,
    pub description: String,
}

/// Normalize text for hashing: lowercase, trim, collapse whitespace runs.
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// SHA-256 hex digest of the normalized content.
pub fn content_hash(text: &str) -> String {
    let normalized = normalize_text(text);
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(digest)
}

/// Statuses excluded from duplicate scope by default: a terminal task is no
/// longer a reason to suppress new work.
const DEFAULT_EXCLUDED: [TaskStatus; 2] = [TaskStatus::Completed, TaskStatus::Failed];

/// The deduplication service.
pub struct DedupService {
    pool: PgPool,
    embedder: Arc<dyn Embedder>,
    thresholds: DedupThresholds,
}

impl DedupService {
    pub fn new(pool: PgPool, embedder: Arc<dyn Embedder>, thresholds: DedupThresholds) -> Self {
        Self {
            pool,
            embedder,
            thresholds,
        }
    }

    /// Cosine threshold for an entity scope.
    pub fn threshold_for(&self, entity: DedupEntity) -> f32 {
        match entity {
            DedupEntity::Spec => self.thresholds.spec,
            DedupEntity::Requirement => self.thresholds.requirement,
            DedupEntity::Task => self.thresholds.task,
            // Hash-only: the value is never compared, 1.0 keeps it inert.
            DedupEntity::AcceptanceCriterion => 1.0,
        }
    }

    /// Check whether a semantically similar task already exists in scope.
    ///
    /// Scope is `(ticket_id, task_type)` for the hash phase and
    /// `(ticket_id, task_type prefix)` for the semantic phase, mirroring
    /// how diagnostic task types fan out into `discovery_diagnostic_*`.
    pub async fn check_task(
        &self,
        ticket_id: Uuid,
        task_type: &str,
        title: Option<&str>,
        description: &str,
        threshold: Option<f32>,
        top_k: usize,
    ) -> KernelResult<DedupOutcome> {
        let threshold = threshold.unwrap_or_else(|| self.threshold_for(DedupEntity::Task));
        let content = match title {
            Some(title) => format!("{task_type}: {title}\n{description}"),
            None => format!("{task_type}: \n{description}"),
        };
        let hash = content_hash(&content);

        // Phase 1: exact hash match in scope.
        if let Some(existing) =
            task_db::find_by_content_hash(&self.pool, ticket_id, task_type, &hash).await?
        {
            return Ok(DedupOutcome {
                action: DedupAction::Skip,
                is_duplicate: true,
                highest_similarity: 1.0,
                candidates: vec![DuplicateCandidate {
                    task_id: existing.id,
                    task_type: existing.task_type,
                    description: existing.description,
                    status: existing.status,
                    similarity: 1.0,
                    is_exact_match: true,
                }],
                content_hash: hash,
                embedding: None,
                merge_target_id: None,
            });
        }

        // Phase 2: semantic match. An embedder failure degrades to
        // hash-only: the item is treated as new.
        let embedding = match self.embedder.embed(&content).await {
            Ok(vector) => vector,
            Err(e) => {
                tracing::warn!(error = %e, "embedding failed, falling back to hash-only dedup");
                return Ok(DedupOutcome::no_duplicate(hash, None));
            }
        };

        let in_scope = task_db::list_embedded_tasks_in_scope(
            &self.pool,
            ticket_id,
            scope_prefix(task_type),
            &DEFAULT_EXCLUDED,
        )
        .await?;

        let mut candidates: Vec<DuplicateCandidate> = in_scope
            .into_iter()
            .filter_map(|task| {
                let stored = task.embedding.as_deref()?;
                let similarity = cosine_similarity(&embedding, stored);
                if similarity >= threshold {
                    Some(DuplicateCandidate {
                        task_id: task.id,
                        task_type: task.task_type,
                        description: task.description,
                        status: task.status,
                        similarity,
                        is_exact_match: false,
                    })
                } else {
                    None
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(top_k);

        match candidates.first() {
            Some(best) => Ok(DedupOutcome {
                action: DedupAction::Skip,
                is_duplicate: true,
                highest_similarity: best.similarity,
                candidates,
                content_hash: hash,
                embedding: Some(embedding),
                merge_target_id: None,
            }),
            None => Ok(DedupOutcome::no_duplicate(hash, Some(embedding))),
        }
    }

    /// Strict-threshold check for pending diagnostic work: is a
    /// semantically similar `discovery_diagnostic_*` task already queued
    /// for this workflow?
    pub async fn similar_pending_diagnostic(
        &self,
        ticket_id: Uuid,
        description: &str,
    ) -> KernelResult<DedupOutcome> {
        self.check_task(
            ticket_id,
            "discovery_diagnostic_no_result",
            None,
            description,
            Some(self.thresholds.diagnostic),
            5,
        )
        .await
    }

    /// Run single-item dedup over an ordered input list and partition the
    /// results. Order is preserved within each partition.
    pub async fn bulk_check_tasks(
        &self,
        ticket_id: Uuid,
        items: Vec<TaskCandidate>,
    ) -> KernelResult<BulkDedupResult> {
        let mut result = BulkDedupResult::default();

        for item in items {
            let outcome = self
                .check_task(
                    ticket_id,
                    &item.task_type,
                    item.title.as_deref(),
                    &item.description,
                    None,
                    3,
                )
                .await?;

            match outcome.action {
                DedupAction::Create => result.to_create.push(item),
                DedupAction::Skip => result.to_skip.push(item),
                DedupAction::Merge => {
                    let target = outcome
                        .merge_target_id
                        .unwrap_or_else(Uuid::nil);
                    result.to_merge.push((item, target));
                }
            }
        }

        Ok(result)
    }
}

/// Semantic scope prefix: diagnostic task types all share the
/// `discovery_diagnostic` family, everything else matches its own type.
fn scope_prefix(task_type: &str) -> &str {
    if task_type.starts_with("discovery_diagnostic") {
        "discovery_diagnostic"
    } else {
        task_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_collapses_whitespace_and_case() {
        assert_eq!(
            normalize_text("  Fix   the\n\tParser  "),
            "fix the parser"
        );
    }

    #[test]
    fn equivalent_texts_hash_identically() {
        let a = content_hash("Restart the   worker pool");
        let b = content_hash("restart the worker POOL");
        assert_eq!(a, b);
    }

    #[test]
    fn different_texts_hash_differently() {
        assert_ne!(content_hash("restart workers"), content_hash("drain workers"));
    }

    #[test]
    fn hash_is_hex_sha256() {
        let hash = content_hash("anything");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn diagnostic_types_share_a_scope() {
        assert_eq!(scope_prefix("discovery_diagnostic_no_result"), "discovery_diagnostic");
        assert_eq!(scope_prefix("discovery_diagnostic_timeout"), "discovery_diagnostic");
        assert_eq!(scope_prefix("work"), "work");
    }
}
