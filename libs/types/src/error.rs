//! Error kinds for agent operations
//!
//! Every fallible operation returns one of these variants; the runtime's
//! retry/surface policy keys off the classifier methods rather than matching
//! variants at call sites.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Main error type for agent operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Transient collaborator failure; retry with backoff before surfacing.
    #[error("transient failure in {operation}: {reason}")]
    Transient {
        /// Operation that failed
        operation: String,
        /// Underlying failure description
        reason: String,
    },

    /// Provider token bucket empty; skip the call this cycle, no retry.
    #[error("rate limited: {method}")]
    RateLimited {
        /// Gateway method whose bucket was empty
        method: &'static str,
    },

    /// Hard timeout on an external call.
    #[error("timeout after {timeout_ms}ms in {operation}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Configured deadline in milliseconds
        timeout_ms: u64,
    },

    /// Structural provider error (unknown pool, bad arguments); never retried.
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// What the provider rejected
        reason: String,
    },

    /// Core-logic invariant violated. Fatal: log, dump state, exit code 3.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Daily cost budget exhausted for a spend category.
    #[error("budget exceeded for {category}")]
    BudgetExceeded {
        /// Spend category that hit the ceiling
        category: String,
    },

    /// Executor refused the decision; recorded as a failed outcome, no retry.
    #[error("executor rejected decision {decision_id}: {reason}")]
    ExecutorRejected {
        /// Decision the executor refused
        decision_id: Uuid,
        /// Executor-supplied reason
        reason: String,
    },

    /// Gateway circuit breaker is open; fail fast until the cooldown passes.
    #[error("circuit breaker open for {operation}")]
    CircuitOpen {
        /// Operation group whose breaker tripped
        operation: String,
    },

    /// Startup configuration rejected; the process refuses to start.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization failure when persisting or restoring records.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentError {
    /// Whether the retry loop should attempt this call again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgentError::Transient { .. } | AgentError::Timeout { .. }
        )
    }

    /// Whether the error aborts the process (invariant violations only).
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::Invariant(_))
    }

    /// CLI exit code for a front-end surfacing this error.
    /// 0 clean stop, 2 emergency/config, 3 fatal unrecoverable.
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentError::Config(_) | AgentError::BudgetExceeded { .. } => 2,
            AgentError::Invariant(_) => 3,
            _ => 3,
        }
    }

    pub fn transient(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        AgentError::Transient {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        AgentError::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }
}
