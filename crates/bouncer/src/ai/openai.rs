//! OpenAI-compatible chat completions backend.
//!
//! Works with the OpenAI API and anything speaking the same protocol
//! (vLLM, LocalAI, Together.ai) via `base_url`.

use async_trait::async_trait;
use reqwest::{Client, header};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::{GenerationError, GenerativeAi, http_client, non_empty, send_json};
use crate::config::OpenAiConfig;

pub struct OpenAiBackend {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    options: Map<String, Value>,
}

impl OpenAiBackend {
    pub fn new(config: &OpenAiConfig) -> Result<Self, GenerationError> {
        Ok(Self {
            client: http_client()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            options: config.options.clone(),
        })
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Options first, so `model` and `messages` cannot be overridden
    fn request_body(&self, prompt: &str) -> Value {
        let mut body = self.options.clone();
        body.insert("model".into(), json!(self.model));
        body.insert(
            "messages".into(),
            json!([{ "role": "user", "content": prompt }]),
        );
        Value::Object(body)
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageResponse,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Option<String>,
}

fn extract_text(response: ChatResponse) -> Result<String, GenerationError> {
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content);
    non_empty("OpenAI", content)
}

#[async_trait]
impl GenerativeAi for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let request = self
            .client
            .post(self.chat_completions_url())
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(&self.request_body(prompt));

        let response: ChatResponse = send_json(request).await?;
        extract_text(response)
    }
}
