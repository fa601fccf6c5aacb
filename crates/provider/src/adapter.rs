//! Provider adapter contract.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Status reported by a provider for a submitted generation.
///
/// `check` must be safe to call repeatedly; reporting the same terminal
/// outcome twice is expected and handled idempotently downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Still generating.
    Running,
    /// Finished; carries the generated content.
    Completed(String),
    /// The provider gave up on this generation.
    Failed(String),
    /// The remote job was cancelled.
    Cancelled,
}

/// What a provider did with a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// The provider accepted the work and runs it remotely; poll with the
    /// returned handle.
    Accepted(String),
    /// The provider ran the generation inline and the outcome is already
    /// final (synchronous providers).
    Finished(Outcome),
}

/// Submission-time rejection: invalid input, auth failure, rate limit, or a
/// transport fault. Adapters wrap every submit failure in this type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct SubmissionError {
    pub message: String,
    /// Whether a later attempt with the same inputs may succeed.
    pub retryable: bool,
}

impl SubmissionError {
    /// A transient fault (network, rate limit); worth retrying.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent rejection (malformed input, auth); retrying cannot help.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Transient failure while checking status.
///
/// A poll error never changes job state by itself; the staleness timeout
/// bounds how long a job may survive on poll errors alone.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("poll failed: {0}")]
pub struct PollError(pub String);

/// Capability set every generation provider implements.
///
/// One implementation per provider service. Synchronous providers (those
/// whose `submit` blocks until the final outcome) report `is_async() ==
/// false` and return `Submission::Finished`; the scheduler never polls them.
pub trait ProviderAdapter: Send + Sync {
    /// Whether `submit` returns a pollable handle (`true`) or blocks until
    /// the final outcome (`false`).
    fn is_async(&self) -> bool;

    /// Submit already-validated inputs to the remote service.
    fn submit(&self, inputs: &JsonValue) -> Result<Submission, SubmissionError>;

    /// Check the status of a previously submitted generation. Idempotent.
    fn check(&self, handle: &str) -> Result<Outcome, PollError>;

    /// Best-effort cancellation; returns whether the remote acknowledged.
    ///
    /// A provider that cannot cancel returns `false` without erroring; the
    /// scheduler's local state is authoritative either way.
    fn cancel(&self, handle: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_error_constructors_set_retryable() {
        assert!(SubmissionError::retryable("429").retryable);
        assert!(!SubmissionError::fatal("bad prompt").retryable);
    }

    #[test]
    fn outcome_serializes_snake_case() {
        let json = serde_json::to_string(&Outcome::Completed("hi".into())).unwrap();
        assert_eq!(json, "{\"completed\":\"hi\"}");
        assert_eq!(
            serde_json::to_string(&Outcome::Running).unwrap(),
            "\"running\""
        );
    }
}
