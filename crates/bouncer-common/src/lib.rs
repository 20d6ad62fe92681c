//! # Bouncer Common
//!
//! Shared types, errors, and constants used across Bouncer components.
//!
//! ## Modules
//! - `types` - Domain records (PendingChallenge, VerificationRecord, etc.)
//! - `error` - Common error type
//! - `constants` - Defaults and storage key prefixes

pub mod constants;
pub mod error;
pub mod types;

pub use error::BouncerError;
pub use types::*;
