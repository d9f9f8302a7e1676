use thiserror::Error;

use crate::types::WorkStatus;

/// Error taxonomy of the lead pipeline.
///
/// Rate-limit denials, duplicate enqueues and slug collisions are outcomes,
/// not errors, and have no variant here.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Network failure or timeout talking to a source; retried with backoff.
    #[error("Transient source error: {0}")]
    TransientSource(String),

    /// The source rejected the target itself; never retried automatically.
    #[error("Permanent source error: {0}")]
    PermanentSource(String),

    #[error("Data validation error: {0}")]
    DataValidation(String),

    #[error("Invalid work item transition: {from} -> {to}")]
    InvalidTransition { from: WorkStatus, to: WorkStatus },

    #[error("Invalid lead transition: {0}")]
    InvalidLeadTransition(String),

    #[error("Stale completion report: item is on attempt {current}, report carried {reported}")]
    StaleCompletion { current: i32, reported: i32 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Lead not publishable: {0}")]
    NotPublishable(String),

    #[error("Profile already claimed")]
    AlreadyClaimed,

    /// Lost a compare-and-set race more times than the caller allows.
    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl PipelineError {
    /// Whether the work-item state machine should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::TransientSource(_) | PipelineError::Conflict(_))
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(PipelineError::TransientSource("timeout".into()).is_retryable());
        assert!(!PipelineError::PermanentSource("404".into()).is_retryable());
        assert!(!PipelineError::DataValidation("empty name".into()).is_retryable());
    }

    #[test]
    fn transition_error_names_both_states() {
        let err = PipelineError::InvalidTransition {
            from: WorkStatus::Completed,
            to: WorkStatus::Processing,
        };
        assert_eq!(
            err.to_string(),
            "Invalid work item transition: completed -> processing"
        );
    }
}
