//! Core types shared across Bouncer components.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Telegram chat identifier (groups are negative, private chats equal the user id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Telegram user identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl UserId {
    /// The private chat with a user shares the user's id
    pub fn private_chat(self) -> ChatId {
        ChatId(self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A member's standing in a group, as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    Administrator,
    Member,
    Restricted,
    Left,
    Banned,
}

impl MemberRole {
    /// Owners and administrators may change group settings
    pub fn can_manage(&self) -> bool {
        matches!(self, Self::Owner | Self::Administrator)
    }
}

/// Outcome of a completed challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Accepted,
    Declined,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Declined => "declined",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(Self::Accepted),
            "declined" => Ok(Self::Declined),
            other => Err(format!("unknown verdict: {other}")),
        }
    }
}

/// A group the bot is allowed to moderate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedGroup {
    pub chat_id: ChatId,
    pub display_name: String,
}

/// An inbound request to join a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub chat_id: ChatId,
    pub chat_title: String,
    pub user_id: UserId,
    pub display_name: String,
}

/// An issued, unanswered challenge. At most one exists per user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChallenge {
    pub user_id: UserId,

    /// Group the user asked to join
    pub chat_id: ChatId,

    /// Group title at issuance, copied into the audit record
    pub chat_title: String,

    pub display_name: String,

    /// Issuance time in Unix milliseconds; doubles as the fencing token
    pub issued_at_ms: i64,

    /// The generated question
    pub challenge: String,
}

impl PendingChallenge {
    /// True once more than `answer_timeout` has passed since issuance
    pub fn is_expired(&self, now: DateTime<Utc>, answer_timeout: Duration) -> bool {
        now.timestamp_millis() - self.issued_at_ms > answer_timeout.as_millis() as i64
    }

    /// Time left in the answer window (zero once expired)
    pub fn remaining(&self, now: DateTime<Utc>, answer_timeout: Duration) -> Duration {
        let deadline = self.issued_at_ms + answer_timeout.as_millis() as i64;
        let left = deadline - now.timestamp_millis();
        Duration::from_millis(left.max(0) as u64)
    }
}

/// One row per issued challenge; drives the retry cooldown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinAttempt {
    /// Unix seconds
    pub timestamp: i64,
    pub user_id: UserId,
    pub display_name: String,
}

/// Append-only audit row written once per resolved challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    /// Unix seconds
    pub timestamp: i64,
    pub chat_id: ChatId,
    pub chat_title: String,
    pub user_id: UserId,
    pub display_name: String,
    pub challenge: String,
    pub answer: String,
    pub verdict: Verdict,
    pub reason: String,
}

impl VerificationRecord {
    /// Build an audit row for a resolved pending challenge
    pub fn resolve(
        pending: &PendingChallenge,
        answer: impl Into<String>,
        verdict: Verdict,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp: now.timestamp(),
            chat_id: pending.chat_id,
            chat_title: pending.chat_title.clone(),
            user_id: pending.user_id,
            display_name: pending.display_name.clone(),
            challenge: pending.challenge.clone(),
            answer: answer.into(),
            verdict,
            reason: reason.into(),
        }
    }
}

/// Aggregate counters for the status endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationStats {
    pub pending: u64,
    pub accepted: u64,
    pub declined: u64,
}
