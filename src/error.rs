use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rate_limit::AcquireError;
use crate::retry::RetryError;

/// Errors returned by the source-control and analysis adapters.
///
/// Adapters translate their wire-level failures into one of these variants so
/// the retry layer can branch on data instead of on error types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// Network blip, timeout, 5xx.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Explicit 429 / quota signal, optionally with the server's suggested delay.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// 401/403 style failures. Non-retryable; fatal when hit by the first job of a run.
    #[error("authentication failed: {0}")]
    Unauthorized(String),

    /// Malformed request, missing resource, any other 4xx.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The analysis service answered, but the judgment carried nothing usable.
    #[error("invalid judgment: {0}")]
    InvalidJudgment(String),
}

/// Retry classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    RateLimited { retry_after: Option<Duration> },
    Permanent,
}

impl ServiceError {
    /// Default classifier used by [`RetryPolicy`](crate::retry::RetryPolicy).
    pub fn classify(&self) -> ErrorClass {
        match self {
            ServiceError::Transient(_) => ErrorClass::Transient,
            ServiceError::RateLimited { retry_after, .. } => ErrorClass::RateLimited {
                retry_after: *retry_after,
            },
            ServiceError::Unauthorized(_)
            | ServiceError::Permanent(_)
            | ServiceError::InvalidJudgment(_) => ErrorClass::Permanent,
        }
    }

    /// Classify an HTTP status code returned by either upstream service.
    pub fn from_status(status: u16, message: String, retry_after: Option<Duration>) -> Self {
        match status {
            429 => ServiceError::RateLimited {
                message,
                retry_after,
            },
            401 | 403 => ServiceError::Unauthorized(message),
            408 | 500..=599 => ServiceError::Transient(format!("status {status}: {message}")),
            _ => ServiceError::Permanent(format!("status {status}: {message}")),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ServiceError::Unauthorized(_))
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return ServiceError::Permanent(format!("undecodable response: {err}"));
        }
        if let Some(status) = err.status() {
            return ServiceError::from_status(status.as_u16(), err.to_string(), None);
        }
        ServiceError::Transient(err.to_string())
    }
}

impl From<AcquireError> for ServiceError {
    fn from(err: AcquireError) -> Self {
        match err {
            AcquireError::Timeout { .. } => ServiceError::Transient(err.to_string()),
            AcquireError::UnknownService(_) => ServiceError::Permanent(err.to_string()),
        }
    }
}

/// Classifies a job failure for the end-of-run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Transient,
    RateLimited,
    Permanent,
    Cancelled,
    JudgmentValidation,
}

impl From<&ServiceError> for FailureKind {
    fn from(err: &ServiceError) -> Self {
        match err {
            ServiceError::Transient(_) => FailureKind::Transient,
            ServiceError::RateLimited { .. } => FailureKind::RateLimited,
            ServiceError::Unauthorized(_) | ServiceError::Permanent(_) => FailureKind::Permanent,
            ServiceError::InvalidJudgment(_) => FailureKind::JudgmentValidation,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "Transient"),
            FailureKind::RateLimited => write!(f, "RateLimited"),
            FailureKind::Permanent => write!(f, "Permanent"),
            FailureKind::Cancelled => write!(f, "Cancelled"),
            FailureKind::JudgmentValidation => write!(f, "JudgmentValidation"),
        }
    }
}

/// Errors that end a whole run rather than a single job.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("authentication failed on first job ({repo}): {message}")]
    Authentication { repo: String, message: String },

    #[error("failed to enumerate repositories: {0}")]
    Enumeration(#[from] RetryError),

    #[error("repository {name} not found for {owner}")]
    RepositoryNotFound { owner: String, name: String },

    #[error("invalid job transition: {0}")]
    InvalidTransition(String),

    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}
