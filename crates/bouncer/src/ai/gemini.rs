//! Google Gemini `generateContent` backend.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::{GenerationError, GenerativeAi, http_client, non_empty, send_json};
use crate::config::GeminiConfig;

pub struct GeminiBackend {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    options: Map<String, Value>,
}

impl GeminiBackend {
    pub fn new(config: &GeminiConfig) -> Result<Self, GenerationError> {
        Ok(Self {
            client: http_client()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            options: config.options.clone(),
        })
    }

    fn generate_url(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }

    fn request_body(&self, prompt: &str) -> Value {
        let mut body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
        });
        if !self.options.is_empty() {
            body["generationConfig"] = Value::Object(self.options.clone());
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

/// Concatenate the text parts of the first candidate
fn extract_text(response: GenerateResponse) -> Result<String, GenerationError> {
    let text = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<String>()
        });
    non_empty("Gemini", text)
}

#[async_trait]
impl GenerativeAi for GeminiBackend {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let request = self
            .client
            .post(self.generate_url())
            .header("x-goog-api-key", &self.api_key)
            .json(&self.request_body(prompt));

        let response: GenerateResponse = send_json(request).await?;
        extract_text(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(options: Map<String, Value>) -> GeminiBackend {
        GeminiBackend::new(&GeminiConfig {
            api_key: "key".into(),
            model: "gemini-2.0-flash".into(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".into(),
            options,
        })
        .unwrap()
    }

    #[test]
    fn test_url_and_body() {
        let b = backend(json!({ "temperature": 0.5 }).as_object().cloned().unwrap());
        assert_eq!(
            b.generate_url(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );

        let body = b.request_body("Quiz me");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "Quiz me");
        assert_eq!(body["generationConfig"]["temperature"], 0.5);

        let bare = backend(Map::new()).request_body("Quiz me");
        assert!(bare.get("generationConfig").is_none());
    }

    #[test]
    fn test_extract_joins_parts() {
        let response: GenerateResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": { "parts": [{ "text": "What is " }, { "text": "Rust?" }] }
            }]
        }))
        .unwrap();
        assert_eq!(extract_text(response).unwrap(), "What is Rust?");

        let blocked: GenerateResponse =
            serde_json::from_value(json!({ "candidates": [{ "finishReason": "SAFETY" }] })).unwrap();
        assert!(matches!(extract_text(blocked), Err(GenerationError::Empty("Gemini"))));
    }
}
