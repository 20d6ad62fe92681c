//! Long-polling update loop.
//!
//! Each event is handled on its own task so a slow generation call for one
//! user never holds up another.

use std::sync::Arc;
use std::time::Duration;

use bouncer_common::{ChatId, UserId};
use chrono::Utc;
use tokio::sync::broadcast;

use super::{ChatPlatform, InboundEvent, TelegramClient};
use crate::lifecycle::Controller;

/// Pause after a failed getUpdates call
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub struct Poller {
    client: Arc<TelegramClient>,
    controller: Arc<Controller>,
    /// Bot username without `@`, for `/topic@name`
    username: Option<String>,
}

impl Poller {
    pub fn new(
        client: Arc<TelegramClient>,
        controller: Arc<Controller>,
        username: Option<String>,
    ) -> Self {
        Self {
            client,
            controller,
            username,
        }
    }

    /// Poll until shutdown is signalled
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut offset = 0i64;
        tracing::info!("Polling for updates");

        loop {
            let failed = tokio::select! {
                result = self.client.get_updates(offset) => match result {
                    Ok(updates) => {
                        for update in updates {
                            offset = offset.max(update.update_id + 1);
                            if let Some(event) = update.into_event() {
                                self.dispatch(event);
                            }
                        }
                        false
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "getUpdates failed, backing off");
                        true
                    }
                },
                _ = shutdown.recv() => break,
            };

            if failed && backoff(&mut shutdown).await {
                break;
            }
        }

        tracing::info!("Poller shutting down");
    }

    fn dispatch(&self, event: InboundEvent) {
        let controller = self.controller.clone();

        match event {
            InboundEvent::JoinRequested(request) => {
                tracing::info!(
                    user_id = %request.user_id,
                    chat_id = %request.chat_id,
                    display_name = %request.display_name,
                    "Join request received"
                );
                tokio::spawn(async move {
                    controller.handle_join_request(&request, Utc::now()).await;
                });
            }
            InboundEvent::TextMessage {
                chat_id,
                chat_title,
                user_id,
                display_name,
                text,
                private,
            } => {
                if private {
                    if text.starts_with('/') {
                        return;
                    }
                    tokio::spawn(async move {
                        controller
                            .handle_answer(user_id, &display_name, &chat_title, text.trim(), Utc::now())
                            .await;
                    });
                } else if let Some(topic) = parse_topic_command(&text, self.username.as_deref()) {
                    let topic = topic.to_string();
                    let platform: Arc<dyn ChatPlatform> = self.client.clone();
                    tokio::spawn(async move {
                        topic_command(platform, controller, chat_id, user_id, topic).await;
                    });
                }
            }
        }
    }
}

/// Sleep out the error backoff. Returns true if shutdown arrived first.
async fn backoff(shutdown: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(ERROR_BACKOFF) => false,
        _ = shutdown.recv() => true,
    }
}

async fn topic_command(
    platform: Arc<dyn ChatPlatform>,
    controller: Arc<Controller>,
    chat_id: ChatId,
    user_id: UserId,
    topic: String,
) {
    match platform.get_member_role(chat_id, user_id).await {
        Ok(role) => controller.set_topic(chat_id, user_id, role, &topic).await,
        Err(e) => {
            tracing::warn!(chat_id = %chat_id, user_id = %user_id, error = %e, "Role lookup failed");
        }
    }
}

/// Argument of `/topic` or `/topic@<username>`, untrimmed. `None` if the
/// text is not a topic command for this bot.
fn parse_topic_command<'a>(text: &'a str, username: Option<&str>) -> Option<&'a str> {
    let (command, argument) = match text.split_once(char::is_whitespace) {
        Some((command, argument)) => (command, argument),
        None => (text, ""),
    };

    let target = match command.split_once('@') {
        Some(("/topic", target)) => Some(target),
        None if command == "/topic" => None,
        _ => return None,
    };

    match (target, username) {
        (Some(target), Some(name)) if !target.eq_ignore_ascii_case(name) => None,
        _ => Some(argument),
    }
}
