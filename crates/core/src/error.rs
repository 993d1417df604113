//! Engine error taxonomy. Adapters convert their own errors into these kinds so
//! callers branch on the variant, never on message text.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngineError {
    /// Parent record, remote entity or secret key is absent.
    #[error("not_found: {0}")]
    NotFound(String),
    /// Remote system present but unhealthy, or a referenced record is not ready yet.
    #[error("not_ready: {0}")]
    NotReady(String),
    /// Optimistic-concurrency write race; re-fetch and retry.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Malformed desired configuration; only a change to the record fixes it.
    #[error("validation: {0}")]
    Validation(String),
    /// Network failure or 5xx from a remote system.
    #[error("transient: {0}")]
    Transient(String),
    /// Package apply failed; `rolled_back_to` is set when the rollback went through.
    #[error("apply failed: {message}{}", .rolled_back_to.map(|r| format!(" (rolled back to revision {})", r)).unwrap_or_default())]
    Apply { message: String, rolled_back_to: Option<u32> },
    /// Package apply failed and so did the rollback.
    #[error("apply failed: {apply}; rollback failed: {rollback}")]
    ApplyAndRollback { apply: String, rollback: String },
    #[error("internal: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Errors that require the desired record to change before a retry can succeed.
    pub fn is_permanent(&self) -> bool { matches!(self, EngineError::Validation(_)) }

    /// Waiting on something outside the engine: the dependency retry interval applies.
    pub fn is_waiting(&self) -> bool { matches!(self, EngineError::NotFound(_) | EngineError::NotReady(_)) }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::NotReady(_) => "not_ready",
            EngineError::Conflict(_) => "conflict",
            EngineError::Validation(_) => "validation",
            EngineError::Transient(_) => "transient",
            EngineError::Apply { .. } => "apply",
            EngineError::ApplyAndRollback { .. } => "apply_rollback",
            EngineError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_message_mentions_rollback() {
        let e = EngineError::Apply { message: "timed out".into(), rolled_back_to: Some(3) };
        assert_eq!(e.to_string(), "apply failed: timed out (rolled back to revision 3)");
        let e = EngineError::Apply { message: "timed out".into(), rolled_back_to: None };
        assert_eq!(e.to_string(), "apply failed: timed out");
    }

    #[test]
    fn classification() {
        assert!(EngineError::Validation("x".into()).is_permanent());
        assert!(EngineError::NotReady("x".into()).is_waiting());
        assert!(!EngineError::Transient("x".into()).is_waiting());
    }
}
