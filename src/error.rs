//! Error taxonomy shared by every component (spec §7).
//!
//! Components never propagate errors across the bus. Every non-fatal error
//! is turned into an `audit.log` event with a structured code; only
//! `OpsError::Fatal` is allowed to escape to the process boundary (init
//! failures only).

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum OpsError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("idempotent duplicate: {0}")]
    IdempotentDuplicate(String),

    #[error("state missing: {0}")]
    StateMissing(String),

    #[error("policy violation ({kind}): {reason}")]
    PolicyViolation { kind: String, reason: String },

    #[error("backpressure: {0}")]
    Backpressure(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl OpsError {
    /// Structured error code recorded on `audit.log` entries (spec §7).
    pub fn code(&self) -> &'static str {
        match self {
            OpsError::Validation(_) => "validation",
            OpsError::IdempotentDuplicate(_) => "idempotent_duplicate",
            OpsError::StateMissing(_) => "state_missing",
            OpsError::PolicyViolation { .. } => "policy_violation",
            OpsError::Backpressure(_) => "backpressure",
            OpsError::ResourceExhausted(_) => "resource_exhausted",
            OpsError::Fatal(_) => "fatal",
        }
    }

    /// Whether this error is safe to retry per the handler's own policy.
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            OpsError::Backpressure(_) | OpsError::ResourceExhausted(_)
        )
    }
}

pub type OpsResult<T> = Result<T, OpsError>;
