//! Ollama native chat backend.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::{GenerationError, GenerativeAi, http_client, non_empty, send_json};
use crate::config::OllamaConfig;

pub struct OllamaBackend {
    client: Client,
    host: String,
    model: String,
    options: Map<String, Value>,
}

impl OllamaBackend {
    pub fn new(config: &OllamaConfig) -> Result<Self, GenerationError> {
        Ok(Self {
            client: http_client()?,
            host: config.host.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            options: config.options.clone(),
        })
    }

    fn request_body(&self, prompt: &str) -> Value {
        json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "options": self.options,
            "stream": false,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<MessageResponse>,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Option<String>,
}

#[async_trait]
impl GenerativeAi for OllamaBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let request = self
            .client
            .post(format!("{}/api/chat", self.host))
            .json(&self.request_body(prompt));

        let response: ChatResponse = send_json(request).await?;
        non_empty("Ollama", response.message.and_then(|m| m.content))
    }
}
