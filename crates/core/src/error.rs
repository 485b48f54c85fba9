//! Error taxonomy shared by every speil crate.
//!
//! The work queue is the only place that decides retry vs. drop, and it does
//! so purely from the variant: `Conflict` and `Transient` are retryable,
//! everything else is terminal for the item that produced it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Misuse of the engine API (duplicate kind registration, bad kind key).
    #[error("configuration: {0}")]
    Configuration(String),

    /// Absent object surfacing from a store internals path. Read APIs return
    /// `Ok(None)` instead; this variant never classifies as a failure of a
    /// reconcile step.
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency write race. Retried with backoff.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Infrastructure trouble (API unavailability, unresolved mapping for a
    /// kind that requires one). Retried with backoff up to the configured
    /// bound.
    #[error("transient: {0}")]
    Transient(String),

    /// Malformed object or broken translation invariant. Never retried;
    /// retrying cannot change the outcome.
    #[error("validation: {0}")]
    Validation(String),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether another attempt can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(Error::conflict("stale write").is_retryable());
        assert!(Error::transient("api down").is_retryable());
        assert!(!Error::validation("missing metadata.name").is_retryable());
        assert!(!Error::configuration("duplicate kind").is_retryable());
        assert!(!Error::not_found("gone").is_retryable());
    }

    #[test]
    fn renderings_are_prefixed() {
        assert_eq!(Error::transient("x").to_string(), "transient: x");
        assert_eq!(Error::validation("y").to_string(), "validation: y");
    }
}
