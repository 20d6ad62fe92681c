//! Process-local store backed by mutex-guarded maps.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bouncer_common::{
    AllowedGroup, ChatId, JoinAttempt, PendingChallenge, UserId, Verdict, VerificationRecord,
    VerificationStats,
};

use super::{StorageError, Store};

#[derive(Default)]
struct Inner {
    allowed_groups: HashMap<ChatId, String>,
    topics: HashMap<ChatId, String>,
    pending: HashMap<UserId, PendingChallenge>,
    attempts: Vec<JoinAttempt>,
    verifications: Vec<VerificationRecord>,
}

/// In-memory [`Store`]
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StorageError> {
        self.inner
            .lock()
            .map_err(|e| StorageError::Task(format!("Lock poisoned: {}", e)))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StorageError> {
        self.lock().map(|_| ())
    }

    async fn is_group_allowed(&self, chat_id: ChatId) -> Result<bool, StorageError> {
        Ok(self.lock()?.allowed_groups.contains_key(&chat_id))
    }

    async fn allow_group(&self, group: &AllowedGroup) -> Result<(), StorageError> {
        self.lock()?
            .allowed_groups
            .insert(group.chat_id, group.display_name.clone());
        Ok(())
    }

    async fn revoke_group(&self, chat_id: ChatId) -> Result<bool, StorageError> {
        Ok(self.lock()?.allowed_groups.remove(&chat_id).is_some())
    }

    async fn list_allowed_groups(&self) -> Result<Vec<AllowedGroup>, StorageError> {
        let inner = self.lock()?;
        let mut groups: Vec<AllowedGroup> = inner
            .allowed_groups
            .iter()
            .map(|(chat_id, name)| AllowedGroup {
                chat_id: *chat_id,
                display_name: name.clone(),
            })
            .collect();
        groups.sort_by_key(|g| g.chat_id);
        Ok(groups)
    }

    async fn get_group_topic(&self, chat_id: ChatId) -> Result<Option<String>, StorageError> {
        Ok(self.lock()?.topics.get(&chat_id).cloned())
    }

    async fn set_group_topic(&self, chat_id: ChatId, topic: &str) -> Result<(), StorageError> {
        self.lock()?.topics.insert(chat_id, topic.to_string());
        Ok(())
    }

    async fn insert_pending(&self, pending: &PendingChallenge) -> Result<(), StorageError> {
        match self.lock()?.pending.entry(pending.user_id) {
            Entry::Occupied(_) => Err(StorageError::DuplicatePending(pending.user_id)),
            Entry::Vacant(slot) => {
                slot.insert(pending.clone());
                Ok(())
            }
        }
    }

    async fn get_pending(&self, user_id: UserId) -> Result<Option<PendingChallenge>, StorageError> {
        Ok(self.lock()?.pending.get(&user_id).cloned())
    }

    async fn remove_pending(
        &self,
        user_id: UserId,
        issued_at_ms: i64,
    ) -> Result<bool, StorageError> {
        let mut inner = self.lock()?;
        let fenced = inner
            .pending
            .get(&user_id)
            .is_some_and(|p| p.issued_at_ms == issued_at_ms);
        if fenced {
            inner.pending.remove(&user_id);
        }
        Ok(fenced)
    }

    async fn list_pending(&self) -> Result<Vec<PendingChallenge>, StorageError> {
        let mut pending: Vec<PendingChallenge> = self.lock()?.pending.values().cloned().collect();
        pending.sort_by_key(|p| p.issued_at_ms);
        Ok(pending)
    }

    async fn record_join_attempt(&self, attempt: &JoinAttempt) -> Result<(), StorageError> {
        self.lock()?.attempts.push(attempt.clone());
        Ok(())
    }

    async fn last_join_attempt(&self, user_id: UserId) -> Result<Option<i64>, StorageError> {
        Ok(self
            .lock()?
            .attempts
            .iter()
            .filter(|a| a.user_id == user_id)
            .map(|a| a.timestamp)
            .max())
    }

    async fn record_verification(&self, record: &VerificationRecord) -> Result<(), StorageError> {
        self.lock()?.verifications.push(record.clone());
        Ok(())
    }

    async fn recent_verifications(
        &self,
        limit: usize,
    ) -> Result<Vec<VerificationRecord>, StorageError> {
        Ok(self
            .lock()?
            .verifications
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn verification_stats(&self) -> Result<VerificationStats, StorageError> {
        let inner = self.lock()?;
        let accepted = inner
            .verifications
            .iter()
            .filter(|r| r.verdict == Verdict::Accepted)
            .count() as u64;

        Ok(VerificationStats {
            pending: inner.pending.len() as u64,
            accepted,
            declined: inner.verifications.len() as u64 - accepted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(user: i64, issued_at_ms: i64) -> PendingChallenge {
        PendingChallenge {
            user_id: UserId(user),
            chat_id: ChatId(-42),
            chat_title: "Chemistry".into(),
            display_name: "Marie".into(),
            issued_at_ms,
            challenge: "Name a noble gas".into(),
        }
    }

    #[tokio::test]
    async fn test_insert_pending_never_overwrites() {
        let store = MemoryStore::new();
        store.insert_pending(&pending(1, 100)).await.unwrap();

        let err = store.insert_pending(&pending(1, 200)).await.unwrap_err();
        assert!(matches!(err, StorageError::DuplicatePending(UserId(1))));

        let kept = store.get_pending(UserId(1)).await.unwrap().unwrap();
        assert_eq!(kept.issued_at_ms, 100);
    }

    #[tokio::test]
    async fn test_remove_pending_checks_fence() {
        let store = MemoryStore::new();
        store.insert_pending(&pending(1, 100)).await.unwrap();

        assert!(!store.remove_pending(UserId(1), 99).await.unwrap());
        assert!(store.remove_pending(UserId(1), 100).await.unwrap());
        assert!(!store.remove_pending(UserId(1), 100).await.unwrap());
        assert!(store.get_pending(UserId(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_last_join_attempt_is_latest() {
        let store = MemoryStore::new();
        for ts in [30, 10, 20] {
            store
                .record_join_attempt(&JoinAttempt {
                    timestamp: ts,
                    user_id: UserId(5),
                    display_name: "Bob".into(),
                })
                .await
                .unwrap();
        }

        assert_eq!(store.last_join_attempt(UserId(5)).await.unwrap(), Some(30));
        assert_eq!(store.last_join_attempt(UserId(6)).await.unwrap(), None);
    }
}
