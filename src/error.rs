//! Errors surfaced to callers of the execution service
//!
//! Execution failures (compile errors, timeouts, crashes) are not errors here:
//! they are ordinary outcomes carried inside a job's `ExecutionResult`.

use serde::Serialize;
use thiserror::Error;

use crate::jobs::JobId;

/// Why a submission was refused before any job was created
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    #[error("unsupported language: {language}")]
    UnsupportedLanguage { language: String },

    #[error("source code cannot be empty")]
    EmptySource,

    #[error("{what} is {size} bytes, the limit is {limit} bytes")]
    PayloadTooLarge {
        what: &'static str,
        size: usize,
        limit: usize,
    },

    #[error("source contains a disallowed construct ({reason})")]
    UnsafeConstruct { reason: String },

    #[error("source contains a loop with no visible exit")]
    PossibleInfiniteLoop,
}

impl RejectReason {
    /// Short machine-checkable name, e.g. `payload_too_large`
    pub fn kind(&self) -> &'static str {
        match self {
            RejectReason::UnsupportedLanguage { .. } => "unsupported_language",
            RejectReason::EmptySource => "empty_source",
            RejectReason::PayloadTooLarge { .. } => "payload_too_large",
            RejectReason::UnsafeConstruct { .. } => "unsafe_construct",
            RejectReason::PossibleInfiniteLoop => "possible_infinite_loop",
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("execution {0} not found")]
    NotFound(JobId),

    #[error("submission rejected: {0}")]
    Rejected(#[from] RejectReason),
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;
