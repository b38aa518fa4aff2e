//! Fork-level and run-level error taxonomy.

use serde::{Deserialize, Serialize};

use super::task::ForkOrdinal;

/// Errors that terminate a single fork.
///
/// None of these escape the orchestrator: each one is folded into a
/// `ForkResult` with `success = false`. Policy violations and tool failures
/// are not represented here because they never terminate a fork; they are
/// surfaced to the model as turn content.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForkError {
    #[error("turn budget exceeded")]
    TurnBudgetExceeded { limit: u32 },

    #[error("time budget exceeded")]
    TimeBudgetExceeded { limit_secs: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("model service unavailable: {0}")]
    ModelUnavailable(String),

    #[error("sandbox service unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("sandbox provisioning failed: {0}")]
    Provisioning(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ForkError {
    /// Classification recorded on the `ForkResult`.
    pub fn kind(&self) -> FailureKind {
        match self {
            ForkError::TurnBudgetExceeded { .. } => FailureKind::TurnBudgetExceeded,
            ForkError::TimeBudgetExceeded { .. } => FailureKind::TimeBudgetExceeded,
            ForkError::Cancelled => FailureKind::Cancelled,
            ForkError::ModelUnavailable(_)
            | ForkError::SandboxUnavailable(_)
            | ForkError::Provisioning(_) => FailureKind::CollaboratorFault,
            ForkError::Internal(_) => FailureKind::Internal,
        }
    }

    /// Collaborator faults are the only failures eligible for a retry.
    pub fn is_collaborator_fault(&self) -> bool {
        self.kind() == FailureKind::CollaboratorFault
    }
}

/// Why a fork failed, in a form callers can filter on without parsing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TurnBudgetExceeded,
    TimeBudgetExceeded,
    CollaboratorFault,
    Cancelled,
    Internal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::TurnBudgetExceeded => "turn_budget_exceeded",
            FailureKind::TimeBudgetExceeded => "time_budget_exceeded",
            FailureKind::CollaboratorFault => "collaborator_fault",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// Errors that abort a whole run.
///
/// Reported distinctly from fork failures: when one of these is returned no
/// `RunSummary` exists.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid run request: {0}")]
    InvalidRequest(String),

    #[error("duplicate fork ordinal: {0}")]
    DuplicateOrdinal(ForkOrdinal),

    #[error("sandbox {sandbox_id} assigned to more than one fork")]
    SharedSandbox { sandbox_id: String },

    #[error("worker pool failure: {0}")]
    WorkerPool(String),
}

/// Result type for run-level operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_reasons_are_stable_strings() {
        assert_eq!(
            ForkError::TurnBudgetExceeded { limit: 5 }.to_string(),
            "turn budget exceeded"
        );
        assert_eq!(
            ForkError::TimeBudgetExceeded { limit_secs: 1 }.to_string(),
            "time budget exceeded"
        );
        assert_eq!(ForkError::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_collaborator_faults_classified() {
        assert!(ForkError::ModelUnavailable("down".into()).is_collaborator_fault());
        assert!(ForkError::SandboxUnavailable("down".into()).is_collaborator_fault());
        assert!(!ForkError::Cancelled.is_collaborator_fault());
        assert_eq!(
            ForkError::Internal("x".into()).kind(),
            FailureKind::Internal
        );
    }

    #[test]
    fn test_orchestrator_error_display() {
        let err = OrchestratorError::DuplicateOrdinal(4);
        assert!(err.to_string().contains("duplicate fork ordinal: 4"));
    }
}
