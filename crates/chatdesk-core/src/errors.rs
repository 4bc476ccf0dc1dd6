use std::time::Duration;

use crate::chat::SessionStatus;

/// Failures the broker reports back to the originating caller.
/// Classifies errors as retryable (lock contention) or final.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session busy: append lock not acquired within {0:?}")]
    SessionBusy(Duration),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: SessionStatus, to: SessionStatus },
    #[error("survey rejected: {0}")]
    SurveyRejected(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
}

impl ChatError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SessionBusy(_))
    }

    /// Short classification string for logging and wire error codes.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionBusy(_) => "session_busy",
            Self::Persistence(_) => "persistence_failure",
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::SurveyRejected(_) => "survey_rejected",
            Self::Forbidden(_) => "forbidden",
        }
    }
}
