//! Kernel error taxonomy.
//!
//! Validation, not-found, and permission errors surface to the caller and
//! are never recovered. Transient storage errors retry with bounded
//! backoff. External timeouts degrade per component. Invariant violations
//! fail the current operation and trigger a cache rebuild on the next tick.

use std::time::Duration;

use rand::Rng;

/// Error type for kernel operations.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// Malformed input, illegal state transition, or missing required field.
    #[error("validation error: {0}")]
    Validation(String),

    /// Entity absent from storage.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// Wrong agent type invoking a privileged operation.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Transient storage failure (lock wait, serialization conflict).
    #[error("transient storage error: {0}")]
    Transient(#[source] anyhow::Error),

    /// An external call (LLM, sandbox, embedding, vector query) timed out.
    #[error("external call timed out: {0}")]
    ExternalTimeout(String),

    /// In-memory state inconsistent with storage.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Anything else from the storage layer.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl KernelError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether this error is worth retrying at the call site.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Result alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Number of attempts for transient-error retry.
pub const RETRY_ATTEMPTS: u32 = 3;

/// Jittered exponential backoff delay for the given zero-based attempt.
///
/// 100ms base doubling per attempt, with up to 50% jitter added so
/// contending claimers do not reconverge.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 100u64 << attempt.min(6);
    let jitter = rand::rng().random_range(0..=base_ms / 2);
    Duration::from_millis(base_ms + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_is_bounded() {
        for attempt in 0..3 {
            let d = backoff_delay(attempt);
            let base = 100u64 << attempt;
            assert!(d.as_millis() as u64 >= base);
            assert!(d.as_millis() as u64 <= base + base / 2);
        }
    }

    #[test]
    fn transient_classification() {
        let err = KernelError::Transient(anyhow::anyhow!("lock wait"));
        assert!(err.is_transient());
        assert!(!KernelError::validation("bad").is_transient());
    }

    #[test]
    fn not_found_display() {
        let err = KernelError::not_found("task", "abc");
        assert_eq!(err.to_string(), "task abc not found");
    }
}
