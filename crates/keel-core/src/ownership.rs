//! Ownership validation for parallel sibling tasks.
//!
//! Tasks may declare `owned_files` glob patterns. Before dispatch, a
//! task's patterns are checked against every parallel sibling (same
//! ticket, dispatchable status, own patterns declared) for possible
//! overlap. The overlap check is conservative: any chance two patterns
//! could match the same file counts as overlap.

use sqlx::PgPool;

use keel_db::models::Task;
use keel_db::queries::tasks as task_db;

use crate::error::KernelResult;

/// A detected overlap between two sibling ownership patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipConflict {
    pub sibling_task_id: uuid::Uuid,
    pub task_pattern: String,
    pub sibling_pattern: String,
}

/// Result of validating a task's ownership patterns.
#[derive(Debug, Clone, Default)]
pub struct OwnershipValidation {
    pub valid: bool,
    pub warnings: Vec<String>,
    pub conflicts: Vec<OwnershipConflict>,
}

impl OwnershipValidation {
    fn clean() -> Self {
        Self {
            valid: true,
            warnings: Vec::new(),
            conflicts: Vec::new(),
        }
    }
}

/// Validates ownership disjointness between parallel siblings.
///
/// Lenient mode (default) downgrades conflicts to warnings; strict mode
/// makes them hard errors.
pub struct OwnershipValidator {
    pool: PgPool,
    strict_mode: bool,
}

impl OwnershipValidator {
    pub fn new(pool: PgPool, strict_mode: bool) -> Self {
        Self { pool, strict_mode }
    }

    /// Validate a task about to be dispatched.
    ///
    /// Tasks without ownership patterns have no restrictions.
    pub async fn validate_task_ownership(&self, task: &Task) -> KernelResult<OwnershipValidation> {
        let Some(own_patterns) = task.owned_files.as_deref() else {
            return Ok(OwnershipValidation::clean());
        };
        if own_patterns.is_empty() {
            return Ok(OwnershipValidation::clean());
        }

        let siblings = task_db::list_parallel_siblings(&self.pool, task).await?;

        let mut conflicts = Vec::new();
        for sibling in &siblings {
            let Some(sibling_patterns) = sibling.owned_files.as_deref() else {
                continue;
            };
            for own in own_patterns {
                for theirs in sibling_patterns {
                    if patterns_may_overlap(own, theirs) {
                        conflicts.push(OwnershipConflict {
                            sibling_task_id: sibling.id,
                            task_pattern: own.clone(),
                            sibling_pattern: theirs.clone(),
                        });
                    }
                }
            }
        }

        if !conflicts.is_empty() {
            tracing::info!(
                task_id = %task.id,
                ticket_id = %task.ticket_id,
                conflict_count = conflicts.len(),
                sibling_count = siblings.len(),
                strict_mode = self.strict_mode,
                "ownership conflicts detected"
            );
        }

        if self.strict_mode {
            Ok(OwnershipValidation {
                valid: conflicts.is_empty(),
                warnings: Vec::new(),
                conflicts,
            })
        } else {
            // Lenient: conflicts become warnings and do not block.
            let warnings = conflicts
                .iter()
                .map(|c| {
                    format!(
                        "Ownership conflict with task {}: pattern '{}' overlaps with '{}'",
                        c.sibling_task_id, c.task_pattern, c.sibling_pattern
                    )
                })
                .collect();
            Ok(OwnershipValidation {
                valid: true,
                warnings,
                conflicts: Vec::new(),
            })
        }
    }
}

/// Whether two glob patterns may match the same files.
///
/// Conservative: returns true on any chance of overlap.
pub fn patterns_may_overlap(pattern1: &str, pattern2: &str) -> bool {
    if pattern1 == pattern2 {
        return true;
    }

    let p1 = pattern1.trim_end_matches('/');
    let p2 = pattern2.trim_end_matches('/');

    // One pattern is a prefix of the other, ignoring a trailing `**`
    // (e.g. "src/**" covers "src/services/handler.rs").
    let stem1 = strip_recursive_suffix(p1);
    let stem2 = strip_recursive_suffix(p2);
    if !stem1.is_empty() && p2.starts_with(stem1) {
        return true;
    }
    if !stem2.is_empty() && p1.starts_with(stem2) {
        return true;
    }

    // Segment-by-segment walk.
    let mut shared_prefix = false;
    for (seg1, seg2) in p1.split('/').zip(p2.split('/')) {
        if seg1 == "**" || seg2 == "**" {
            return true;
        }
        if seg1.contains('*') || seg2.contains('*') {
            // Wildcards at matched depth could collide.
            return true;
        }
        if seg1 != seg2 {
            // First differing literal segments: paths diverge.
            return false;
        }
        shared_prefix = true;
    }

    // All compared segments matched, so one path sits under the other.
    shared_prefix
}

fn strip_recursive_suffix(pattern: &str) -> &str {
    pattern
        .strip_suffix("**")
        .map(|stem| stem.trim_end_matches('/'))
        .unwrap_or("")
}
