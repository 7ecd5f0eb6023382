//! Dynamic task scoring.
//!
//! Scores live in [0, 1] and are a weighted sum of five normalized
//! components (priority, age, deadline proximity, blocked dependents,
//! retry penalty), with an SLA boost for imminent deadlines and a
//! starvation floor for long-waiting tasks.

use chrono::{DateTime, Utc};

use keel_db::models::Task;

use crate::config::ScorerConfig;

/// Component weights. Fixed; the tunables are the normalization constants.
const PRIORITY_WEIGHT: f64 = 0.45;
const AGE_WEIGHT: f64 = 0.20;
const DEADLINE_WEIGHT: f64 = 0.15;
const BLOCKER_WEIGHT: f64 = 0.15;
const RETRY_WEIGHT: f64 = 0.05;

/// Computes dispatch scores for tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskScorer {
    config: ScorerConfig,
}

impl TaskScorer {
    pub fn new(config: ScorerConfig) -> Self {
        Self { config }
    }

    /// Compute the score for a task at `now`, given how many non-terminal
    /// tasks depend on it.
    pub fn compute_score(&self, task: &Task, blocked_dependents: i64, now: DateTime<Utc>) -> f64 {
        let cfg = &self.config;

        let priority_norm = task.priority.weight();

        let age_seconds = (now - task.created_at).num_milliseconds() as f64 / 1000.0;
        let age_seconds = age_seconds.max(0.0);
        let age_norm = (age_seconds / cfg.age_ceiling_s).min(1.0);

        let seconds_until_deadline = task
            .deadline_at
            .map(|deadline| (deadline - now).num_milliseconds() as f64 / 1000.0);

        let deadline_norm = match seconds_until_deadline {
            None => 0.0,
            Some(remaining) if remaining <= 0.0 => 1.0,
            Some(remaining) => (1.0 - remaining / cfg.deadline_horizon_s).max(0.0),
        };

        let blocker_norm = (blocked_dependents as f64 / cfg.blocker_ceiling).min(1.0);

        let retry_penalty = if task.max_retries > 0 {
            (1.0 - f64::from(task.retry_count) / f64::from(task.max_retries)).max(0.0)
        } else {
            1.0
        };

        let mut base = PRIORITY_WEIGHT * priority_norm
            + AGE_WEIGHT * age_norm
            + DEADLINE_WEIGHT * deadline_norm
            + BLOCKER_WEIGHT * blocker_norm
            + RETRY_WEIGHT * retry_penalty;

        if let Some(remaining) = seconds_until_deadline {
            if remaining < cfg.sla_urgency_window_s {
                base *= cfg.sla_boost_multiplier;
            }
        }

        if age_seconds > cfg.starvation_limit_s && base < cfg.starvation_floor_score {
            base = cfg.starvation_floor_score;
        }

        base.min(1.0)
    }
}
