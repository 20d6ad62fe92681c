//! Common error types for Bouncer components.

use thiserror::Error;

use crate::types::UserId;

/// Common errors across Bouncer components
#[derive(Debug, Error)]
pub enum BouncerError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistence operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// A pending challenge already exists for this user
    #[error("User {0} already has a pending challenge")]
    DuplicatePending(UserId),

    /// Text-generation backend failed or returned nothing usable
    #[error("Generation error: {0}")]
    Generation(String),

    /// Chat platform call failed
    #[error("Platform error: {0}")]
    Platform(String),
}

impl BouncerError {
    /// Returns true if the failure came from a remote dependency and a
    /// later attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Generation(_) | Self::Platform(_))
    }
}
