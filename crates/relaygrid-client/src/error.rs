//! Registry client errors.

use std::time::Duration;

use thiserror::Error;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The registry does not know the instance; register again.
    #[error("instance not found: {service}/{instance_id}")]
    NotFound { service: String, instance_id: String },

    #[error("invalid registry url {0}")]
    InvalidUrl(String),

    #[error("registry unreachable: {0}")]
    Transport(String),

    #[error("registry did not answer within {0:?}")]
    Timeout(Duration),

    #[error("registry returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("malformed registry response: {0}")]
    Decode(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound { .. })
    }
}
