//! Reflector phase: analyze what happened and connect it to existing
//! knowledge.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use keel_db::queries::playbook;

use crate::embedding::{cosine_similarity, Embedder};
use crate::error::KernelResult;

/// Similarity floor for relating a memory to playbook entries.
const RELATED_ENTRY_THRESHOLD: f32 = 0.7;
/// Max related entries tagged per memory.
const RELATED_ENTRY_LIMIT: usize = 5;
/// Context captured around an identified error, in chars each side.
const ERROR_CONTEXT_CHARS: usize = 100;
/// Confidence assigned to keyword-extracted insights.
const INSIGHT_CONFIDENCE: f64 = 0.7;

/// Known error type names scanned for in feedback.
const ERROR_TYPES: [&str; 7] = [
    "ImportError",
    "ValueError",
    "KeyError",
    "AttributeError",
    "TypeError",
    "FileNotFoundError",
    "PermissionError",
];

/// Generic failure keywords for the catch-all bucket.
const FAILURE_KEYWORDS: [&str; 4] = ["failed", "error", "exception", "traceback"];

/// An error identified in feedback text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifiedError {
    pub error_type: String,
    pub message: String,
    pub context: String,
}

/// Bucket an insight falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsightKind {
    Pattern,
    Gotcha,
    BestPractice,
}

/// A structured insight extracted from task completion.
#[derive(Debug, Clone)]
pub struct Insight {
    pub kind: InsightKind,
    pub content: String,
    pub confidence: f64,
}

/// Result of the Reflector phase.
#[derive(Debug, Clone, Default)]
pub struct ReflectorResult {
    /// Entry ids whose `supporting_memory_ids` gained this memory.
    pub tags_added: Vec<Uuid>,
    pub insights: Vec<Insight>,
    pub errors: Vec<IdentifiedError>,
    pub related_entries: Vec<Uuid>,
}

/// Reflector phase of the ACE pipeline.
pub struct Reflector {
    pool: PgPool,
    embedder: Arc<dyn Embedder>,
}

impl Reflector {
    pub fn new(pool: PgPool, embedder: Arc<dyn Embedder>) -> Self {
        Self { pool, embedder }
    }

    /// Analyze a completed task: identify errors, relate the new memory to
    /// existing playbook entries, and extract insights.
    pub async fn analyze(
        &self,
        memory_id: Uuid,
        ticket_id: Uuid,
        goal: &str,
        result: &str,
        feedback: &str,
    ) -> KernelResult<ReflectorResult> {
        let errors = identify_errors(feedback);

        let query_text = format!("{goal}\n\nResult: {result}");
        let related = self
            .search_playbook_entries(ticket_id, &query_text)
            .await?;

        let mut tags_added = Vec::new();
        for (entry_id, _similarity) in &related {
            if playbook::append_supporting_memory(&self.pool, *entry_id, memory_id).await? {
                tags_added.push(*entry_id);
            }
        }

        let insights = extract_insights(goal, result, feedback);

        Ok(ReflectorResult {
            tags_added,
            insights,
            errors,
            related_entries: related.into_iter().map(|(id, _)| id).collect(),
        })
    }

    /// Semantic search over the ticket's active playbook entries. Returns
    /// `(entry_id, similarity)` pairs above the threshold, best first.
    async fn search_playbook_entries(
        &self,
        ticket_id: Uuid,
        query_text: &str,
    ) -> KernelResult<Vec<(Uuid, f32)>> {
        let query_embedding = self.embedder.embed(query_text).await?;
        let entries = playbook::list_active_entries(&self.pool, ticket_id).await?;

        let mut scored: Vec<(Uuid, f32)> = entries
            .iter()
            .filter_map(|entry| {
                let embedding = entry.embedding.as_deref()?;
                let similarity = cosine_similarity(&query_embedding, embedding);
                (similarity >= RELATED_ENTRY_THRESHOLD).then_some((entry.id, similarity))
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(RELATED_ENTRY_LIMIT);
        Ok(scored)
    }
}

/// Scan feedback for known error types plus a generic failure bucket.
pub fn identify_errors(feedback: &str) -> Vec<IdentifiedError> {
    let mut errors = Vec::new();
    if feedback.is_empty() {
        return errors;
    }

    let lower = feedback.to_lowercase();

    for error_type in ERROR_TYPES {
        let needle = error_type.to_lowercase();
        let mut search_from = 0;
        while let Some(offset) = lower[search_from..].find(&needle) {
            let start = search_from + offset;
            let line_end = feedback[start..]
                .find('\n')
                .map_or(feedback.len(), |pos| start + pos);
            let context_start = start.saturating_sub(ERROR_CONTEXT_CHARS);
            let context_end = (line_end + ERROR_CONTEXT_CHARS).min(feedback.len());

            errors.push(IdentifiedError {
                error_type: (*error_type).to_owned(),
                message: slice_at_bounds(feedback, start, line_end),
                context: slice_at_bounds(feedback, context_start, context_end),
            });

            search_from = line_end.min(feedback.len());
            if search_from >= lower.len() {
                break;
            }
        }
    }

    // One generic failure entry when any catch-all keyword appears and the
    // typed scan did not already cover it.
    for keyword in FAILURE_KEYWORDS {
        if let Some(idx) = lower.find(keyword) {
            let already_covered = errors
                .iter()
                .any(|e| e.message.to_lowercase().starts_with(keyword));
            if !already_covered {
                let context_start = idx.saturating_sub(ERROR_CONTEXT_CHARS);
                let context_end = (idx + keyword.len() + ERROR_CONTEXT_CHARS).min(feedback.len());
                let context = slice_at_bounds(feedback, context_start, context_end);
                errors.push(IdentifiedError {
                    error_type: "Failure".to_owned(),
                    message: format!("{keyword}: {context}"),
                    context,
                });
            }
            break;
        }
    }

    errors
}

/// Slice on char boundaries, widening inward as needed.
fn slice_at_bounds(text: &str, mut start: usize, mut end: usize) -> String {
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    while end > start && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[start..end].to_owned()
}

/// Extract sentence-level insights into pattern / gotcha / best-practice
/// buckets.
pub fn extract_insights(goal: &str, result: &str, feedback: &str) -> Vec<Insight> {
    let text = format!("{goal}\n\nResult: {result}\n\nFeedback: {feedback}").to_lowercase();
    let sentences: Vec<&str> = text
        .split(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let buckets: [(InsightKind, &[&str]); 3] = [
        (
            InsightKind::Pattern,
            &["always", "never", "make sure", "must", "should"],
        ),
        (
            InsightKind::Gotcha,
            &["careful", "watch out", "gotcha", "beware", "caution"],
        ),
        (
            InsightKind::BestPractice,
            &["prefer", "recommend", "best practice", "should use"],
        ),
    ];

    let mut insights = Vec::new();
    for (kind, keywords) in buckets {
        for keyword in keywords {
            if !text.contains(keyword) {
                continue;
            }
            if let Some(sentence) = sentences.iter().find(|s| s.contains(keyword)) {
                insights.push(Insight {
                    kind,
                    content: (*sentence).to_owned(),
                    confidence: INSIGHT_CONFIDENCE,
                });
            }
        }
    }

    insights
}
