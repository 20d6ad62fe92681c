//! Text-generation backends.
//!
//! Every provider satisfies the single-method [`GenerativeAi`] contract:
//! prompt in, text out. Provider-specific settings (model, sampling
//! options) are fixed at construction time.

mod gemini;
mod ollama;
mod openai;

pub use gemini::GeminiBackend;
pub use ollama::OllamaBackend;
pub use openai::OpenAiBackend;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bouncer_common::BouncerError;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::config::BackendConfig;

/// Per-request timeout for generation calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors from a generation backend
#[derive(Debug, Error)]
pub enum GenerationError {
    /// Backend answered but produced no text
    #[error("{0} returned empty text")]
    Empty(&'static str),

    /// Request could not be sent or the connection failed
    #[error("Request failed: {0}")]
    Request(String),

    /// Non-success HTTP status
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Response body did not match the provider's schema
    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<GenerationError> for BouncerError {
    fn from(err: GenerationError) -> Self {
        BouncerError::Generation(err.to_string())
    }
}

/// Prompt-in, text-out generation capability
#[async_trait]
pub trait GenerativeAi: Send + Sync {
    /// Provider name, for logs
    fn name(&self) -> &'static str;

    /// Generate a completion for `prompt`. The result is trimmed.
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

/// Build the configured backend
pub fn build(config: &BackendConfig) -> Result<Arc<dyn GenerativeAi>, GenerationError> {
    let backend: Arc<dyn GenerativeAi> = match config {
        BackendConfig::OpenAi(c) => Arc::new(OpenAiBackend::new(c)?),
        BackendConfig::Ollama(c) => Arc::new(OllamaBackend::new(c)?),
        BackendConfig::Gemini(c) => Arc::new(GeminiBackend::new(c)?),
    };

    tracing::debug!(backend = backend.name(), "Generative AI backend ready");
    Ok(backend)
}

fn http_client() -> Result<reqwest::Client, GenerationError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| GenerationError::Request(format!("Failed to create HTTP client: {}", e)))
}

/// Send a prepared request and decode a JSON body, mapping failures
async fn send_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
) -> Result<T, GenerationError> {
    let response = request
        .send()
        .await
        .map_err(|e| GenerationError::Request(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(GenerationError::Http {
            status: status.as_u16(),
            body,
        });
    }

    response
        .json()
        .await
        .map_err(|e| GenerationError::Parse(e.to_string()))
}

/// Trim backend output; whitespace-only counts as empty
fn non_empty(provider: &'static str, text: Option<String>) -> Result<String, GenerationError> {
    match text.map(|t| t.trim().to_string()) {
        Some(t) if !t.is_empty() => Ok(t),
        _ => Err(GenerationError::Empty(provider)),
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted backend for driving the challenge flow in tests.

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    type Responder = Box<dyn Fn(&str) -> Result<String, GenerationError> + Send + Sync>;

    /// Backend whose reply is computed from the prompt
    pub struct ScriptedAi {
        responder: Responder,
        prompts: Mutex<Vec<String>>,
        call_count: AtomicU32,
        yields: bool,
    }

    impl ScriptedAi {
        pub fn new(
            responder: impl Fn(&str) -> Result<String, GenerationError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                responder: Box::new(responder),
                prompts: Mutex::new(Vec::new()),
                call_count: AtomicU32::new(0),
                yields: false,
            }
        }

        /// Yield to the scheduler before replying, so concurrent callers
        /// interleave at the generation call
        pub fn yielding(mut self) -> Self {
            self.yields = true;
            self
        }

        /// Always reply with `text`
        pub fn fixed(text: &str) -> Self {
            let text = text.to_string();
            Self::new(move |_| Ok(text.clone()))
        }

        /// Always fail
        pub fn failing() -> Self {
            Self::new(|_| Err(GenerationError::Empty("scripted")))
        }

        pub fn call_count(&self) -> u32 {
            self.call_count.load(Ordering::SeqCst)
        }

        pub fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GenerativeAi for ScriptedAi {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(prompt.to_string());
            if self.yields {
                tokio::task::yield_now().await;
            }
            (self.responder)(prompt).map(|t| t.trim().to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_empty_trims() {
        assert_eq!(non_empty("x", Some("  hi \n".into())).unwrap(), "hi");
        assert!(matches!(non_empty("x", Some("   ".into())), Err(GenerationError::Empty("x"))));
        assert!(matches!(non_empty("x", None), Err(GenerationError::Empty("x"))));
    }

    #[test]
    fn test_error_converts_to_common() {
        let err: BouncerError = GenerationError::Http {
            status: 429,
            body: "slow down".into(),
        }
        .into();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Generation error: HTTP 429: slow down");
    }
}
