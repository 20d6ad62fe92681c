//! Chat platform boundary.
//!
//! The lifecycle controller only sees [`ChatPlatform`]; the Bot API client
//! and the long-polling loop that feeds events in live below it.

mod client;
mod poller;

pub use client::TelegramClient;
pub use poller::Poller;

use async_trait::async_trait;
use bouncer_common::{BouncerError, ChatId, JoinRequest, MemberRole, UserId};
use thiserror::Error;

/// Errors from the chat platform
#[derive(Debug, Error)]
pub enum PlatformError {
    /// Recipient blocked the bot; expected and swallowed by callers
    #[error("Blocked by recipient: {0}")]
    Blocked(String),

    /// Bot API returned `ok: false`
    #[error("API error {code}: {description}")]
    Api { code: i64, description: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<PlatformError> for BouncerError {
    fn from(err: PlatformError) -> Self {
        BouncerError::Platform(err.to_string())
    }
}

/// Actions the bot takes on the chat platform
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn approve(&self, chat_id: ChatId, user_id: UserId) -> Result<(), PlatformError>;

    async fn decline(&self, chat_id: ChatId, user_id: UserId) -> Result<(), PlatformError>;

    /// Send a text message to a user's private chat or a group
    async fn send(&self, chat_id: ChatId, text: &str) -> Result<(), PlatformError>;

    async fn get_member_role(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<MemberRole, PlatformError>;
}

/// Event delivered by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    JoinRequested(JoinRequest),
    TextMessage {
        chat_id: ChatId,
        chat_title: String,
        user_id: UserId,
        display_name: String,
        text: String,
        /// Sent in the private chat with the bot
        private: bool,
    },
}
