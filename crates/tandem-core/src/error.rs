//! Error taxonomy: validation, per-provider failures, exhausted chains, and
//! the heuristic classifier that turns raw provider text into user-facing phrasing.

use std::time::Duration;

use thiserror::Error;

use crate::providers::CONNECT_TIMEOUT;
use crate::types::{AttemptRecord, TaskType};

/// Caller input rejected before any provider is touched
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("'{0}' must not be empty")]
    Empty(&'static str),

    #[error("'{field}' is {len} characters, the limit is {max}")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("provider '{id}' is not registered for {task}")]
    UnsupportedProvider { task: TaskType, id: String },

    #[error("invalid '{field}': {reason}")]
    InvalidParameter { field: &'static str, reason: String },
}

/// A single backend failed. Recorded as an attempt; triggers fallback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("missing credential: {0}")]
    Credential(String),

    #[error("unsupported invocation: {0}")]
    Unsupported(String),
}

impl ProviderError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Bucket this error, using the status code when there is one
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout(_) => ErrorClass::Timeout,
            Self::Credential(_) | Self::Status { status: 401 | 403, .. } => ErrorClass::Credential,
            Self::Status { status: 429, .. } => ErrorClass::RateLimit,
            other => ErrorClass::of(&other.to_string()),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(CONNECT_TIMEOUT)
        } else if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// Every provider in a chain failed
#[derive(Debug, Clone, Error)]
#[error("all providers failed for {task}: {last_error_message}")]
pub struct AggregateFailure {
    pub task: TaskType,
    pub attempts: Vec<AttemptRecord>,
    pub last_error_message: String,
}

impl AggregateFailure {
    pub fn classify(&self) -> ErrorClass {
        ErrorClass::of(&self.last_error_message)
    }
}

/// Failure of a whole orchestration call
#[derive(Debug, Clone, Error)]
pub enum OrchestrationError {
    #[error(transparent)]
    Exhausted(#[from] AggregateFailure),

    #[error("request cancelled after {} attempt(s)", attempts.len())]
    Cancelled { attempts: Vec<AttemptRecord> },
}

impl OrchestrationError {
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            Self::Exhausted(failure) => &failure.attempts,
            Self::Cancelled { attempts } => attempts,
        }
    }
}

/// Errors surfaced by the request handler
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    #[error("provider '{provider}' returned {found} for a {task} request")]
    UnexpectedPayload {
        task: TaskType,
        provider: String,
        found: &'static str,
    },
}

/// Coarse bucket of a raw provider error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Credential,
    RateLimit,
    Timeout,
    Unclassified,
}

const CREDENTIAL_PATTERNS: &[&str] = &[
    "api key",
    "api_key",
    "invalid_api_key",
    "unauthorized",
    "authentication",
    "credential",
    "status 401",
];

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "too many requests",
    "quota",
    "status 429",
];

const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out", "deadline"];

impl ErrorClass {
    /// Case-insensitive substring match against known phrases
    pub fn of(raw: &str) -> Self {
        let lower = raw.to_lowercase();
        let matches = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

        if matches(CREDENTIAL_PATTERNS) {
            Self::Credential
        } else if matches(RATE_LIMIT_PATTERNS) {
            Self::RateLimit
        } else if matches(TIMEOUT_PATTERNS) {
            Self::Timeout
        } else {
            Self::Unclassified
        }
    }

    /// User-facing phrasing. Unclassified errors keep the raw text.
    pub fn user_message(&self, raw: &str) -> String {
        match self {
            Self::Credential => {
                "The provider rejected its credentials. Check the API key configuration.".to_string()
            }
            Self::RateLimit => {
                "The provider is rate limiting requests. Please wait a moment and try again."
                    .to_string()
            }
            Self::Timeout => "The provider took too long to respond. Please try again.".to_string(),
            Self::Unclassified => format!("The provider failed: {}", raw),
        }
    }
}

/// Classify and phrase a raw error in one step
pub fn classified_message(raw: &str) -> String {
    ErrorClass::of(raw).user_message(raw)
}
