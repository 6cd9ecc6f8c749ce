use crate::store::StoreError;
use thiserror::Error;

/// Back-office core errors.
///
/// Ambiguous outcomes must never advance a trust-sensitive state: a failed
/// rule evaluation surfaces as [`DeskError::Dependency`], not as "no flags".
#[derive(Debug, Error)]
pub enum DeskError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("dependency unavailable: {0}")]
    Dependency(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<StoreError> for DeskError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => DeskError::NotFound(msg),
            StoreError::Conflict(msg) => DeskError::Conflict(msg),
            StoreError::InvariantViolation(msg) => DeskError::Conflict(msg),
            StoreError::InvalidInput(msg) => DeskError::Validation(msg),
            StoreError::Serialization(msg) => DeskError::Serialization(msg),
            StoreError::Backend(msg) => DeskError::Storage(msg),
        }
    }
}

pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<(), DeskError> {
    if value.trim().is_empty() {
        return Err(DeskError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}
