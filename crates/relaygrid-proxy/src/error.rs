//! Gateway error types.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while routing or forwarding a request.
///
/// None of these reach the client as-is: the gateway turns each one
/// into a routing error, a fallback, or a retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    #[error("no route matches {0}")]
    NoMatch(String),

    #[error("no instance available for service {0}")]
    NoInstanceAvailable(String),

    #[error("forward to {endpoint} timed out after {timeout:?}")]
    ForwardTimeout { endpoint: String, timeout: Duration },

    #[error("forward to {endpoint} failed: {reason}")]
    ForwardConnectionFailure { endpoint: String, reason: String },

    #[error("circuit open for service {0}")]
    CircuitOpen(String),

    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProxyError {
    /// Whether the error counts as a failed backend attempt.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::ForwardTimeout { .. } | ProxyError::ForwardConnectionFailure { .. }
        )
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
