//! Persistence gateway.
//!
//! A narrow CRUD surface over the entities the join lifecycle needs. No
//! business logic lives here; the only guarantees are single-row atomicity
//! and the uniqueness of pending challenges per user.
//!
//! Backends:
//! - `sqlite` - on-disk relational store (default)
//! - `redis` - shared store for multi-process deployments
//! - `memory` - process-local maps (tests, throwaway runs)

mod memory;
mod redis_store;
mod sqlite;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bouncer_common::{
    AllowedGroup, BouncerError, ChatId, JoinAttempt, PendingChallenge, UserId,
    VerificationRecord, VerificationStats,
};
use thiserror::Error;

use crate::config::{StorageBackend, StorageConfig};

/// Errors raised by a [`Store`]
#[derive(Debug, Error)]
pub enum StorageError {
    /// Insert rejected: the user already has a pending challenge
    #[error("User {0} already has a pending challenge")]
    DuplicatePending(UserId),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored data could not be mapped back to a domain record
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// Blocking task or lock failure
    #[error("Storage task failed: {0}")]
    Task(String),
}

impl From<StorageError> for BouncerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::DuplicatePending(user_id) => BouncerError::DuplicatePending(user_id),
            other => BouncerError::Storage(other.to_string()),
        }
    }
}

/// Record store for groups, topics, pending challenges, and history
#[async_trait]
pub trait Store: Send + Sync {
    /// Cheap liveness check
    async fn ping(&self) -> Result<(), StorageError>;

    async fn is_group_allowed(&self, chat_id: ChatId) -> Result<bool, StorageError>;

    /// Add or rename an allowed group
    async fn allow_group(&self, group: &AllowedGroup) -> Result<(), StorageError>;

    /// Returns false if the group was not allowed
    async fn revoke_group(&self, chat_id: ChatId) -> Result<bool, StorageError>;

    async fn list_allowed_groups(&self) -> Result<Vec<AllowedGroup>, StorageError>;

    async fn get_group_topic(&self, chat_id: ChatId) -> Result<Option<String>, StorageError>;

    /// Create or replace a group's topic
    async fn set_group_topic(&self, chat_id: ChatId, topic: &str) -> Result<(), StorageError>;

    /// Store a new pending challenge.
    ///
    /// Fails with [`StorageError::DuplicatePending`] if the user already has
    /// one; an existing entry is never overwritten.
    async fn insert_pending(&self, pending: &PendingChallenge) -> Result<(), StorageError>;

    async fn get_pending(&self, user_id: UserId) -> Result<Option<PendingChallenge>, StorageError>;

    /// Delete the user's pending challenge only if its issuance fence matches.
    ///
    /// Returns true if this call removed the entry. Of several callers racing
    /// on the same entry, exactly one observes true.
    async fn remove_pending(&self, user_id: UserId, issued_at_ms: i64)
    -> Result<bool, StorageError>;

    async fn list_pending(&self) -> Result<Vec<PendingChallenge>, StorageError>;

    async fn record_join_attempt(&self, attempt: &JoinAttempt) -> Result<(), StorageError>;

    /// Timestamp (Unix seconds) of the user's most recent join attempt
    async fn last_join_attempt(&self, user_id: UserId) -> Result<Option<i64>, StorageError>;

    async fn record_verification(&self, record: &VerificationRecord) -> Result<(), StorageError>;

    /// Most recent audit rows, newest first
    async fn recent_verifications(
        &self,
        limit: usize,
    ) -> Result<Vec<VerificationRecord>, StorageError>;

    async fn verification_stats(&self) -> Result<VerificationStats, StorageError>;
}

/// Open the configured backend
pub async fn open(config: &StorageConfig) -> Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match config.backend {
        StorageBackend::Sqlite => Arc::new(
            SqliteStore::open(&config.path)
                .with_context(|| format!("Failed to open SQLite database at {}", config.path))?,
        ),
        StorageBackend::Redis => Arc::new(
            RedisStore::connect(&config.redis_url)
                .await
                .context("Failed to connect to Redis")?,
        ),
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage, state will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    Ok(store)
}
