//! Best-effort delivery of user-facing messages.
//!
//! Delivery failures are logged here and never reach the caller, so a user
//! who blocked the bot cannot stall a state transition.

use std::sync::Arc;

use bouncer_common::ChatId;

use crate::telegram::{ChatPlatform, PlatformError};

#[derive(Clone)]
pub struct Notifier {
    platform: Arc<dyn ChatPlatform>,
}

impl Notifier {
    pub fn new(platform: Arc<dyn ChatPlatform>) -> Self {
        Self { platform }
    }

    /// Send `text` to `chat_id`. Returns whether it was delivered.
    pub async fn send(&self, chat_id: ChatId, text: &str) -> bool {
        match self.platform.send(chat_id, text).await {
            Ok(()) => true,
            Err(PlatformError::Blocked(reason)) => {
                tracing::info!(chat_id = %chat_id, reason = %reason, "Recipient blocked the bot");
                false
            }
            Err(e) => {
                tracing::warn!(chat_id = %chat_id, error = %e, "Failed to deliver message");
                false
            }
        }
    }
}
