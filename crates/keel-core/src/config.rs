//! Environment-driven kernel configuration.
//!
//! Every tunable reads a plain environment variable with a spec-fixed
//! default; unparseable values fall back to the default with a warning.

use std::env;
use std::time::Duration;

use tracing::warn;

/// Scoring constants for the dynamic task scorer.
#[derive(Debug, Clone)]
pub struct ScorerConfig {
    /// Saturation age for the age component, seconds.
    pub age_ceiling_s: f64,
    /// Window over which deadline proximity scales, seconds.
    pub deadline_horizon_s: f64,
    /// Deadline distance below which the SLA boost applies, seconds.
    pub sla_urgency_window_s: f64,
    /// Score multiplier under SLA boost.
    pub sla_boost_multiplier: f64,
    /// Age past which the starvation floor kicks in, seconds.
    pub starvation_limit_s: f64,
    /// Minimum score for starved tasks.
    pub starvation_floor_score: f64,
    /// Saturation count for the blocker component.
    pub blocker_ceiling: f64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            age_ceiling_s: 3600.0,
            deadline_horizon_s: 7200.0,
            sla_urgency_window_s: 900.0,
            sla_boost_multiplier: 1.25,
            starvation_limit_s: 7200.0,
            starvation_floor_score: 0.6,
            blocker_ceiling: 10.0,
        }
    }
}

impl ScorerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            age_ceiling_s: env_f64("AGE_CEILING_S", d.age_ceiling_s),
            deadline_horizon_s: env_f64("DEADLINE_HORIZON_S", d.deadline_horizon_s),
            sla_urgency_window_s: env_f64("SLA_URGENCY_WINDOW_S", d.sla_urgency_window_s),
            sla_boost_multiplier: env_f64("SLA_BOOST_MULTIPLIER", d.sla_boost_multiplier),
            starvation_limit_s: env_f64("STARVATION_LIMIT_S", d.starvation_limit_s),
            starvation_floor_score: env_f64("STARVATION_FLOOR_SCORE", d.starvation_floor_score),
            blocker_ceiling: d.blocker_ceiling,
        }
    }
}

/// Bounds and timings for the diagnostic engine.
#[derive(Debug, Clone)]
pub struct DiagnosticConfig {
    /// Min seconds since last task activity before a workflow counts as stuck.
    pub stuck_threshold_s: i64,
    /// Min seconds between diagnostics for the same workflow.
    pub cooldown_s: i64,
    /// Consecutive-failure ceiling before diagnostics stop for a workflow.
    pub max_consecutive_failures: u32,
    /// Total diagnostic-run ceiling per workflow.
    pub max_diagnostics_per_workflow: i64,
    /// Max recovery tasks spawned per run.
    pub max_recovery_tasks: usize,
}

impl Default for DiagnosticConfig {
    fn default() -> Self {
        Self {
            stuck_threshold_s: 60,
            cooldown_s: 60,
            max_consecutive_failures: 3,
            max_diagnostics_per_workflow: 10,
            max_recovery_tasks: 5,
        }
    }
}

impl DiagnosticConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            stuck_threshold_s: env_i64("DIAGNOSTIC_STUCK_THRESHOLD_S", d.stuck_threshold_s),
            cooldown_s: env_i64("DIAGNOSTIC_COOLDOWN_S", d.cooldown_s),
            max_consecutive_failures: env_i64(
                "MAX_CONSECUTIVE_FAILURES",
                d.max_consecutive_failures as i64,
            ) as u32,
            max_diagnostics_per_workflow: env_i64(
                "MAX_DIAGNOSTICS_PER_WORKFLOW",
                d.max_diagnostics_per_workflow,
            ),
            max_recovery_tasks: env_i64("MAX_RECOVERY_TASKS", d.max_recovery_tasks as i64)
                as usize,
        }
    }
}

/// Cosine thresholds for each dedup entity scope.
#[derive(Debug, Clone)]
pub struct DedupThresholds {
    pub spec: f32,
    pub requirement: f32,
    pub task: f32,
    pub diagnostic: f32,
}

impl Default for DedupThresholds {
    fn default() -> Self {
        Self {
            spec: 0.92,
            requirement: 0.88,
            task: 0.85,
            diagnostic: 0.90,
        }
    }
}

impl DedupThresholds {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            spec: env_f64("DEDUP_THRESHOLD_SPEC", d.spec as f64) as f32,
            requirement: env_f64("DEDUP_THRESHOLD_REQ", d.requirement as f64) as f32,
            task: env_f64("DEDUP_THRESHOLD_TASK", d.task as f64) as f32,
            diagnostic: env_f64("DEDUP_THRESHOLD_DIAG", d.diagnostic as f64) as f32,
        }
    }
}

/// Top-level kernel configuration.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub scorer: ScorerConfig,
    pub diagnostic: DiagnosticConfig,
    pub dedup: DedupThresholds,
    /// Claims not finalized within this TTL are reaped back to pending.
    pub claim_ttl: Duration,
    /// Validator heartbeat-age limit.
    pub validator_timeout: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            scorer: ScorerConfig::default(),
            diagnostic: DiagnosticConfig::default(),
            dedup: DedupThresholds::default(),
            claim_ttl: Duration::from_secs(60),
            validator_timeout: Duration::from_secs(600),
        }
    }
}

impl KernelConfig {
    pub fn from_env() -> Self {
        Self {
            scorer: ScorerConfig::from_env(),
            diagnostic: DiagnosticConfig::from_env(),
            dedup: DedupThresholds::from_env(),
            claim_ttl: Duration::from_secs(env_i64("CLAIM_TTL_S", 60) as u64),
            validator_timeout: Duration::from_secs(env_i64("VALIDATOR_TIMEOUT_S", 600) as u64),
        }
    }
}

fn env_f64(name: &str, default: f64) -> f64 {
    match env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(option = name, value = %raw, "unparseable config value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_i64(name: &str, default: i64) -> i64 {
    match env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(option = name, value = %raw, "unparseable config value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.scorer.age_ceiling_s, 3600.0);
        assert_eq!(cfg.scorer.deadline_horizon_s, 7200.0);
        assert_eq!(cfg.scorer.sla_urgency_window_s, 900.0);
        assert_eq!(cfg.scorer.sla_boost_multiplier, 1.25);
        assert_eq!(cfg.claim_ttl, Duration::from_secs(60));
        assert_eq!(cfg.validator_timeout, Duration::from_secs(600));
        assert_eq!(cfg.diagnostic.max_recovery_tasks, 5);
        assert_eq!(cfg.dedup.task, 0.85);
    }
}
