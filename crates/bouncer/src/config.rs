//! Configuration management for Bouncer.
//!
//! The YAML file is deserialized into a loose [`RawConfig`] first, then
//! validated into an [`AppConfig`] so every missing key is reported by name
//! before any network activity starts.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use bouncer_common::BouncerError;
use bouncer_common::constants::{
    DEFAULT_ANSWER_TIMEOUT_SECS, DEFAULT_DATABASE_PATH, DEFAULT_GEMINI_BASE_URL,
    DEFAULT_OLLAMA_HOST, DEFAULT_OPENAI_BASE_URL, DEFAULT_REDIS_URL, DEFAULT_RETRY_TIMEOUT_SECS,
};
use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Environment override prefix (`BOUNCER__STORAGE__BACKEND=redis`)
const ENV_PREFIX: &str = "BOUNCER";

/// Validated application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub telegram_bot_token: String,
    pub backend: BackendConfig,
    pub messages: BotMessages,
    pub prompts: PromptTemplates,
    pub answer_timeout: Duration,
    pub retry_timeout: Duration,
    pub storage: StorageConfig,
    pub status: StatusConfig,
}

/// Selected generation backend and its settings
#[derive(Debug, Clone)]
pub enum BackendConfig {
    OpenAi(OpenAiConfig),
    Ollama(OllamaConfig),
    Gemini(GeminiConfig),
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    /// Passed through into the request body
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub host: String,
    pub model: String,
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    /// Sent as `generationConfig`
    pub options: Map<String, Value>,
}

/// User-facing message templates
#[derive(Debug, Clone)]
pub struct BotMessages {
    pub internal_error: String,
    pub join_requested: String,
    pub correct_answer: String,
    pub wrong_answer: String,
    pub timed_out: String,
    pub ongoing_challenge: String,
    pub no_challenge: String,
    pub retry_timer: String,
    pub topic_usage: String,
    pub topic_updated: String,
}

/// Prompt templates sent to the generation backend
#[derive(Debug, Clone)]
pub struct PromptTemplates {
    pub generate_challenge: String,
    pub verify_answer: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Redis,
    Memory,
}

/// Persistence settings
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub path: String,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_database_path(),
            redis_url: default_redis_url(),
        }
    }
}

/// Status HTTP server; disabled when `listen_addr` is unset
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusConfig {
    #[serde(default)]
    pub listen_addr: Option<String>,
}

/// Backend section as written in the file. Which keys are required
/// depends on the provider.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawBackendSection {
    api_key: Option<String>,
    model: Option<String>,
    base_url: Option<String>,
    host: Option<String>,
    #[serde(default)]
    options: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    telegram_bot_token: Option<String>,
    generative_ai_backend: Option<String>,
    openai: Option<RawBackendSection>,
    ollama: Option<RawBackendSection>,
    gemini: Option<RawBackendSection>,

    #[serde(default)]
    messages: HashMap<String, String>,

    #[serde(default)]
    prompts: HashMap<String, String>,

    #[serde(default = "default_answer_timeout")]
    answer_timeout: u64,

    #[serde(default = "default_retry_timeout")]
    retry_timeout: u64,

    #[serde(default)]
    storage: StorageConfig,

    #[serde(default)]
    status: StatusConfig,
}

fn default_database_path() -> String { DEFAULT_DATABASE_PATH.to_string() }
fn default_redis_url() -> String { DEFAULT_REDIS_URL.to_string() }
fn default_answer_timeout() -> u64 { DEFAULT_ANSWER_TIMEOUT_SECS }
fn default_retry_timeout() -> u64 { DEFAULT_RETRY_TIMEOUT_SECS }

const DEFAULT_TOPIC_USAGE: &str = "Usage: /topic <text>";
const DEFAULT_TOPIC_UPDATED: &str = "Topic updated: {}";

impl AppConfig {
    /// Load and validate the configuration file. `token_override` (from the
    /// CLI or `TELEGRAM_BOT_TOKEN`) wins over the file.
    pub fn load(path: &str, token_override: Option<String>) -> Result<Self, BouncerError> {
        let raw = read_raw(file_builder(path)?)?;
        raw.validate(token_override)
    }
}

/// Load only the storage section, for provisioning commands that must work
/// without bot credentials
pub fn load_storage(path: &str) -> Result<StorageConfig, BouncerError> {
    Ok(read_raw(file_builder(path)?)?.storage)
}

fn file_builder(path: &str) -> Result<ConfigBuilder<DefaultState>, BouncerError> {
    if !Path::new(path).exists() {
        return Err(BouncerError::Config(format!("Config file not found: {}", path)));
    }

    Ok(config::Config::builder()
        .add_source(config::File::with_name(path))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        ))
}

fn read_raw(builder: ConfigBuilder<DefaultState>) -> Result<RawConfig, BouncerError> {
    builder
        .build()
        .and_then(|settings| settings.try_deserialize())
        .map_err(|e| BouncerError::Config(format!("Failed to parse config: {}", e)))
}

fn missing(key: &str) -> BouncerError {
    BouncerError::Config(format!("Missing required key: {}", key))
}

/// Treat blank strings like absent keys
fn required(value: Option<String>, key: &str) -> Result<String, BouncerError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| missing(key))
}

fn take(map: &mut HashMap<String, String>, section: &str, key: &str) -> Result<String, BouncerError> {
    required(map.remove(key), &format!("{}.{}", section, key))
}

impl RawConfig {
    fn validate(self, token_override: Option<String>) -> Result<AppConfig, BouncerError> {
        let telegram_bot_token = required(
            token_override.or(self.telegram_bot_token),
            "telegram_bot_token",
        )?;

        let backend = match self.generative_ai_backend.as_deref().map(str::trim) {
            None | Some("") => return Err(missing("generative_ai_backend")),
            Some("openai") => {
                let s = self.openai.ok_or_else(|| missing("openai"))?;
                BackendConfig::OpenAi(OpenAiConfig {
                    api_key: required(s.api_key, "openai.api_key")?,
                    model: required(s.model, "openai.model")?,
                    base_url: s.base_url.unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
                    options: s.options,
                })
            }
            Some("ollama") => {
                let s = self.ollama.ok_or_else(|| missing("ollama"))?;
                BackendConfig::Ollama(OllamaConfig {
                    model: required(s.model, "ollama.model")?,
                    host: s.host.unwrap_or_else(|| DEFAULT_OLLAMA_HOST.to_string()),
                    options: s.options,
                })
            }
            Some("gemini") => {
                let s = self.gemini.ok_or_else(|| missing("gemini"))?;
                BackendConfig::Gemini(GeminiConfig {
                    api_key: required(s.api_key, "gemini.api_key")?,
                    model: required(s.model, "gemini.model")?,
                    base_url: s.base_url.unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string()),
                    options: s.options,
                })
            }
            Some(other) => {
                return Err(BouncerError::Config(format!(
                    "Unsupported generative_ai_backend: {}",
                    other
                )));
            }
        };

        let mut m = self.messages;
        let messages = BotMessages {
            internal_error: take(&mut m, "messages", "internal_error")?,
            join_requested: take(&mut m, "messages", "join_requested")?,
            correct_answer: take(&mut m, "messages", "correct_answer")?,
            wrong_answer: take(&mut m, "messages", "wrong_answer")?,
            timed_out: take(&mut m, "messages", "timed_out")?,
            ongoing_challenge: take(&mut m, "messages", "ongoing_challenge")?,
            no_challenge: take(&mut m, "messages", "no_challenge")?,
            retry_timer: take(&mut m, "messages", "retry_timer")?,
            topic_usage: m
                .remove("topic_usage")
                .unwrap_or_else(|| DEFAULT_TOPIC_USAGE.to_string()),
            topic_updated: m
                .remove("topic_updated")
                .unwrap_or_else(|| DEFAULT_TOPIC_UPDATED.to_string()),
        };

        let mut p = self.prompts;
        let prompts = PromptTemplates {
            generate_challenge: take(&mut p, "prompts", "generate_challenge")?,
            verify_answer: take(&mut p, "prompts", "verify_answer")?,
        };

        // Challenge, answer, then the token the backend must echo on success
        let slots = prompts.verify_answer.matches("{}").count();
        if slots < 3 {
            return Err(BouncerError::Config(format!(
                "prompts.verify_answer needs 3 {{}} placeholders (challenge, answer, token), found {}",
                slots
            )));
        }

        if self.answer_timeout == 0 {
            return Err(BouncerError::Config("answer_timeout must be positive".into()));
        }

        Ok(AppConfig {
            telegram_bot_token,
            backend,
            messages,
            prompts,
            answer_timeout: Duration::from_secs(self.answer_timeout),
            retry_timeout: Duration::from_secs(self.retry_timeout),
            storage: self.storage,
            status: self.status,
        })
    }
}
