//! Error types for the service directory.

use thiserror::Error;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors returned to registry callers. None of them are fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The instance was never registered or has been evicted; the
    /// caller should register again.
    #[error("instance not found: {service}/{instance_id}")]
    NotFound { service: String, instance_id: String },

    #[error("invalid instance: {0}")]
    InvalidInstance(String),
}

impl RegistryError {
    pub(crate) fn not_found(service: &str, instance_id: &str) -> Self {
        RegistryError::NotFound {
            service: service.to_string(),
            instance_id: instance_id.to_string(),
        }
    }
}
