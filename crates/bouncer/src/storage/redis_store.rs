//! Redis-backed store.
//!
//! Pending challenges live in a hash per user (`issued_at_ms` + JSON `data`)
//! plus an index set for listing. Creation and fenced removal are Lua
//! scripts so each is one atomic step on the server.

use std::collections::HashMap;

use async_trait::async_trait;
use bouncer_common::constants::redis_keys::{
    ALLOWED_GROUPS, ATTEMPTS_PREFIX, PENDING_INDEX, PENDING_PREFIX, STATS, TOPIC_PREFIX,
    VERIFICATIONS,
};
use bouncer_common::{
    AllowedGroup, ChatId, JoinAttempt, PendingChallenge, UserId, VerificationRecord,
    VerificationStats,
};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::{StorageError, Store};

/// KEYS[1] pending hash, KEYS[2] index set; ARGV: fence, json, user id
const INSERT_PENDING: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], 'issued_at_ms', ARGV[1], 'data', ARGV[2])
redis.call('SADD', KEYS[2], ARGV[3])
return 1
"#;

/// KEYS[1] pending hash, KEYS[2] index set; ARGV: fence, user id
const REMOVE_PENDING: &str = r#"
if redis.call('HGET', KEYS[1], 'issued_at_ms') == ARGV[1] then
    redis.call('DEL', KEYS[1])
    redis.call('SREM', KEYS[2], ARGV[2])
    return 1
end
return 0
"#;

fn pending_key(user_id: UserId) -> String {
    format!("{}{}", PENDING_PREFIX, user_id)
}

fn topic_key(chat_id: ChatId) -> String {
    format!("{}{}", TOPIC_PREFIX, chat_id)
}

fn attempts_key(user_id: UserId) -> String {
    format!("{}{}", ATTEMPTS_PREFIX, user_id)
}

/// Redis [`Store`]
pub struct RedisStore {
    /// Connection manager (auto-reconnecting)
    redis: ConnectionManager,
    insert_pending: Script,
    remove_pending: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let client = redis::Client::open(url)?;
        let redis = ConnectionManager::new(client).await?;

        tracing::info!(url = %url, "Redis connected");

        Ok(Self {
            redis,
            insert_pending: Script::new(INSERT_PENDING),
            remove_pending: Script::new(REMOVE_PENDING),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.redis.clone()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn is_group_allowed(&self, chat_id: ChatId) -> Result<bool, StorageError> {
        let mut conn = self.conn();
        let allowed: bool = conn.hexists(ALLOWED_GROUPS, chat_id.0).await?;
        Ok(allowed)
    }

    async fn allow_group(&self, group: &AllowedGroup) -> Result<(), StorageError> {
        let mut conn = self.conn();
        let _: () = conn
            .hset(ALLOWED_GROUPS, group.chat_id.0, &group.display_name)
            .await?;
        Ok(())
    }

    async fn revoke_group(&self, chat_id: ChatId) -> Result<bool, StorageError> {
        let mut conn = self.conn();
        let removed: i64 = conn.hdel(ALLOWED_GROUPS, chat_id.0).await?;
        Ok(removed > 0)
    }

    async fn list_allowed_groups(&self) -> Result<Vec<AllowedGroup>, StorageError> {
        let mut conn = self.conn();
        let raw: HashMap<i64, String> = conn.hgetall(ALLOWED_GROUPS).await?;

        let mut groups: Vec<AllowedGroup> = raw
            .into_iter()
            .map(|(chat_id, display_name)| AllowedGroup {
                chat_id: ChatId(chat_id),
                display_name,
            })
            .collect();
        groups.sort_by_key(|g| g.chat_id);
        Ok(groups)
    }

    async fn get_group_topic(&self, chat_id: ChatId) -> Result<Option<String>, StorageError> {
        let mut conn = self.conn();
        let topic: Option<String> = conn.get(topic_key(chat_id)).await?;
        Ok(topic)
    }

    async fn set_group_topic(&self, chat_id: ChatId, topic: &str) -> Result<(), StorageError> {
        let mut conn = self.conn();
        let _: () = conn.set(topic_key(chat_id), topic).await?;
        Ok(())
    }

    async fn insert_pending(&self, pending: &PendingChallenge) -> Result<(), StorageError> {
        let mut conn = self.conn();
        let data = serde_json::to_string(pending)?;

        let created: i64 = self
            .insert_pending
            .key(pending_key(pending.user_id))
            .key(PENDING_INDEX)
            .arg(pending.issued_at_ms)
            .arg(data)
            .arg(pending.user_id.0)
            .invoke_async(&mut conn)
            .await?;

        if created == 1 {
            Ok(())
        } else {
            Err(StorageError::DuplicatePending(pending.user_id))
        }
    }

    async fn get_pending(&self, user_id: UserId) -> Result<Option<PendingChallenge>, StorageError> {
        let mut conn = self.conn();
        let data: Option<String> = conn.hget(pending_key(user_id), "data").await?;

        match data {
            Some(d) => Ok(Some(serde_json::from_str(&d)?)),
            None => Ok(None),
        }
    }

    async fn remove_pending(
        &self,
        user_id: UserId,
        issued_at_ms: i64,
    ) -> Result<bool, StorageError> {
        let mut conn = self.conn();
        let removed: i64 = self
            .remove_pending
            .key(pending_key(user_id))
            .key(PENDING_INDEX)
            .arg(issued_at_ms)
            .arg(user_id.0)
            .invoke_async(&mut conn)
            .await?;

        Ok(removed == 1)
    }

    async fn list_pending(&self) -> Result<Vec<PendingChallenge>, StorageError> {
        let mut conn = self.conn();
        let user_ids: Vec<i64> = conn.smembers(PENDING_INDEX).await?;

        let mut pending = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            let data: Option<String> = conn.hget(pending_key(UserId(user_id)), "data").await?;
            if let Some(d) = data {
                pending.push(serde_json::from_str::<PendingChallenge>(&d)?);
            }
        }
        pending.sort_by_key(|p| p.issued_at_ms);
        Ok(pending)
    }

    async fn record_join_attempt(&self, attempt: &JoinAttempt) -> Result<(), StorageError> {
        let mut conn = self.conn();
        let data = serde_json::to_string(attempt)?;
        let _: () = conn.lpush(attempts_key(attempt.user_id), data).await?;
        Ok(())
    }

    async fn last_join_attempt(&self, user_id: UserId) -> Result<Option<i64>, StorageError> {
        let mut conn = self.conn();
        let data: Option<String> = conn.lindex(attempts_key(user_id), 0).await?;

        match data {
            Some(d) => Ok(Some(serde_json::from_str::<JoinAttempt>(&d)?.timestamp)),
            None => Ok(None),
        }
    }

    async fn record_verification(&self, record: &VerificationRecord) -> Result<(), StorageError> {
        let mut conn = self.conn();
        let data = serde_json::to_string(record)?;

        let _: () = redis::pipe()
            .atomic()
            .lpush(VERIFICATIONS, data)
            .ignore()
            .hincr(STATS, record.verdict.as_str(), 1)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn recent_verifications(
        &self,
        limit: usize,
    ) -> Result<Vec<VerificationRecord>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn();
        let rows: Vec<String> = conn.lrange(VERIFICATIONS, 0, limit as isize - 1).await?;

        rows.iter()
            .map(|r| serde_json::from_str(r).map_err(StorageError::from))
            .collect()
    }

    async fn verification_stats(&self) -> Result<VerificationStats, StorageError> {
        let mut conn = self.conn();
        let pending: u64 = conn.scard(PENDING_INDEX).await?;
        let accepted: Option<u64> = conn.hget(STATS, "accepted").await?;
        let declined: Option<u64> = conn.hget(STATS, "declined").await?;

        Ok(VerificationStats {
            pending,
            accepted: accepted.unwrap_or(0),
            declined: declined.unwrap_or(0),
        })
    }
}
