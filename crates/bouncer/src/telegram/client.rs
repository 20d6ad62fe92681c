//! Telegram Bot API client over `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use bouncer_common::constants::{TELEGRAM_API_URL, TELEGRAM_POLL_TIMEOUT_SECS};
use bouncer_common::{ChatId, JoinRequest, MemberRole, UserId};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{ChatPlatform, InboundEvent, PlatformError};

/// Bot API envelope: `{ok, result}` or `{ok: false, error_code, description}`
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    error_code: Option<i64>,
    description: Option<String>,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> Result<T, PlatformError> {
        if self.ok {
            return self
                .result
                .ok_or_else(|| PlatformError::Parse("Response missing result".into()));
        }

        let code = self.error_code.unwrap_or_default();
        let description = self.description.unwrap_or_default();
        if code == 403 || description.contains("blocked") {
            Err(PlatformError::Blocked(description))
        } else {
            Err(PlatformError::Api { code, description })
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    message: Option<Message>,
    chat_join_request: Option<ChatJoinRequest>,
}

#[derive(Debug, Clone, Deserialize)]
struct Message {
    chat: Chat,
    from: Option<User>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatJoinRequest {
    chat: Chat,
    from: User,
}

#[derive(Debug, Clone, Deserialize)]
struct Chat {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
    title: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct User {
    id: i64,
    first_name: String,
    last_name: Option<String>,
}

/// The bot's own account, from `getMe`
#[derive(Debug, Clone, Deserialize)]
pub struct BotUser {
    pub id: i64,
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMember {
    status: String,
}

fn full_name(first: &str, last: Option<&str>) -> String {
    match last {
        Some(last) if !last.is_empty() => format!("{} {}", first, last),
        _ => first.to_string(),
    }
}

impl Chat {
    /// Group title, or the other party's name for private chats
    fn display_title(&self) -> String {
        match (&self.title, &self.first_name) {
            (Some(title), _) => title.clone(),
            (None, Some(first)) => full_name(first, self.last_name.as_deref()),
            (None, None) => String::new(),
        }
    }
}

impl User {
    fn display_name(&self) -> String {
        full_name(&self.first_name, self.last_name.as_deref())
    }
}

impl Update {
    /// Map to an event the bot reacts to; other update kinds are dropped
    pub fn into_event(self) -> Option<InboundEvent> {
        if let Some(request) = self.chat_join_request {
            return Some(InboundEvent::JoinRequested(JoinRequest {
                chat_id: ChatId(request.chat.id),
                chat_title: request.chat.display_title(),
                user_id: UserId(request.from.id),
                display_name: request.from.display_name(),
            }));
        }

        let message = self.message?;
        let text = message.text?;
        let from = message.from?;

        Some(InboundEvent::TextMessage {
            chat_id: ChatId(message.chat.id),
            chat_title: message.chat.display_title(),
            user_id: UserId(from.id),
            display_name: from.display_name(),
            text,
            private: message.chat.kind == "private",
        })
    }
}

fn parse_role(status: &str) -> Result<MemberRole, PlatformError> {
    match status {
        "creator" => Ok(MemberRole::Owner),
        "administrator" => Ok(MemberRole::Administrator),
        "member" => Ok(MemberRole::Member),
        "restricted" => Ok(MemberRole::Restricted),
        "left" => Ok(MemberRole::Left),
        "kicked" => Ok(MemberRole::Banned),
        other => Err(PlatformError::Parse(format!("Unknown member status: {}", other))),
    }
}

/// Bot API client
pub struct TelegramClient {
    http: Client,
    /// `{api}/bot{token}`; never logged
    base_url: String,
}

impl TelegramClient {
    pub fn new(token: &str) -> Result<Self, PlatformError> {
        Self::with_api_url(TELEGRAM_API_URL, token)
    }

    pub fn with_api_url(api_url: &str, token: &str) -> Result<Self, PlatformError> {
        // Must outlive the getUpdates long poll
        let http = Client::builder()
            .timeout(Duration::from_secs(TELEGRAM_POLL_TIMEOUT_SECS + 15))
            .build()
            .map_err(|e| PlatformError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: format!("{}/bot{}", api_url.trim_end_matches('/'), token),
        })
    }

    async fn call<P, R>(&self, method: &str, params: &P) -> Result<R, PlatformError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self
            .http
            .post(format!("{}/{}", self.base_url, method))
            .json(params)
            .send()
            .await
            .map_err(|e| PlatformError::Network(e.without_url().to_string()))?;

        let envelope: ApiResponse<R> = response
            .json()
            .await
            .map_err(|e| PlatformError::Parse(e.without_url().to_string()))?;

        envelope.into_result()
    }

    /// Identify the bot; doubles as a token check at startup
    pub async fn get_me(&self) -> Result<BotUser, PlatformError> {
        self.call("getMe", &json!({})).await
    }

    /// Long-poll for updates after `offset`
    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, PlatformError> {
        let params = json!({
            "offset": offset,
            "timeout": TELEGRAM_POLL_TIMEOUT_SECS,
            "allowed_updates": ["message", "chat_join_request"],
        });
        self.call("getUpdates", &params).await
    }
}

#[async_trait]
impl ChatPlatform for TelegramClient {
    async fn approve(&self, chat_id: ChatId, user_id: UserId) -> Result<(), PlatformError> {
        let params = json!({ "chat_id": chat_id.0, "user_id": user_id.0 });
        let _: bool = self.call("approveChatJoinRequest", &params).await?;
        Ok(())
    }

    async fn decline(&self, chat_id: ChatId, user_id: UserId) -> Result<(), PlatformError> {
        let params = json!({ "chat_id": chat_id.0, "user_id": user_id.0 });
        let _: bool = self.call("declineChatJoinRequest", &params).await?;
        Ok(())
    }

    async fn send(&self, chat_id: ChatId, text: &str) -> Result<(), PlatformError> {
        let params = json!({ "chat_id": chat_id.0, "text": text });
        let _: serde_json::Value = self.call("sendMessage", &params).await?;
        Ok(())
    }

    async fn get_member_role(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<MemberRole, PlatformError> {
        let params = json!({ "chat_id": chat_id.0, "user_id": user_id.0 });
        let member: ChatMember = self.call("getChatMember", &params).await?;
        parse_role(&member.status)
    }
}
