//! Domain-specific error types following panic-free policy.

use crate::ZoneId;
use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Parameter id outside the fixed enumerated set
    #[error("Invalid parameter id: {id}")]
    InvalidParameter { id: u8 },

    /// Value outside the range accepted by a field
    #[error("Invalid {field}: {value} (expected {expected})")]
    InvalidValue {
        field: &'static str,
        value: i32,
        expected: &'static str,
    },

    /// Zone address does not exist
    #[error("Zone not found: {zone}")]
    ZoneNotFound { zone: ZoneId },

    /// Source id does not exist
    #[error("Source not found: {id}")]
    SourceNotFound { id: u8 },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
