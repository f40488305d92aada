//! Typed error hierarchy for the task orchestration engine.
//!
//! Three top-level enums cover the three subsystems named in spec.md §7:
//! - `AdmissionError` — task-creation-time rejections (never reach the Executor)
//! - `PipelineError` — fatal Executor-stage failures
//! - `ProviderError` — Sandbox Provider Interface failures

use thiserror::Error;

/// Errors surfaced by the Admission Layer before a Task row exists.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("unauthorized: no authenticated principal")]
    Unauthorized,

    #[error("rate limit exceeded, resets at {reset_at}")]
    RateLimitExceeded { reset_at: chrono::DateTime<chrono::Utc> },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task store error: {0}")]
    Store(#[source] anyhow::Error),
}

/// Errors that abort the Executor pipeline (spec.md §7 "Pipeline fatal" rows).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("credential missing for user {user_id}, provider {provider}")]
    CredentialMissing { user_id: String, provider: String },

    #[error("sandbox create failed: {0}")]
    SandboxCreateFailed(String),

    #[error("sandbox create timed out after {0:?}")]
    SandboxCreateTimeout(std::time::Duration),

    #[error("git configuration failed: {0}")]
    GitConfigFailed(String),

    #[error("branch checkout failed: {0}")]
    BranchCheckoutFailed(String),

    #[error("agent exited non-zero: {0}")]
    AgentExitNonZero(i32),

    #[error("agent execution timed out after {0:?}")]
    AgentTimeout(std::time::Duration),

    #[error("git push failed: {0}")]
    PushFailed(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Whether this error kind was cancellation-triggered rather than a
    /// genuine fatal failure — callers use this to pick the terminal
    /// status (`stopped` vs `error`).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors from a Sandbox Provider Interface implementation.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("sandbox create failed: {0}")]
    CreateFailed(String),

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("agent process failed: {0}")]
    AgentFailed(String),

    #[error("destroy failed: {0}")]
    DestroyFailed(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_error_cancelled_is_detected() {
        let err = PipelineError::Cancelled;
        assert!(err.is_cancellation());
        let err = PipelineError::AgentExitNonZero(2);
        assert!(!err.is_cancellation());
    }

    #[test]
    fn admission_error_rate_limit_carries_reset_at() {
        let reset_at = chrono::Utc::now();
        let err = AdmissionError::RateLimitExceeded { reset_at };
        match err {
            AdmissionError::RateLimitExceeded { reset_at: r } => assert_eq!(r, reset_at),
            _ => panic!("expected RateLimitExceeded"),
        }
    }

    #[test]
    fn provider_error_messages_are_non_empty() {
        let err = ProviderError::CreateFailed("boom".into());
        assert!(err.to_string().contains("boom"));
    }
}
