use thiserror::Error;

use crate::conf::ConfError;

/// Main error type for the crate.
#[derive(Debug, Error)]
pub enum FlowLockError {
    /// Configuration validation errors
    #[error("configuration error: {0}")]
    Conf(#[from] ConfError),
}

/// Type alias for Result with FlowLockError
pub type Result<T> = std::result::Result<T, FlowLockError>;
