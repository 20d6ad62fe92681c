//! Shared constants for Bouncer components.

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "bouncer.yaml";

/// Default SQLite database file
pub const DEFAULT_DATABASE_PATH: &str = "bouncer.db";

/// Default Redis connection URL
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Seconds a user has to answer a challenge (2 minutes)
pub const DEFAULT_ANSWER_TIMEOUT_SECS: u64 = 120;

/// Seconds a user must wait between join attempts (10 minutes)
pub const DEFAULT_RETRY_TIMEOUT_SECS: u64 = 600;

/// Telegram Bot API base URL
pub const TELEGRAM_API_URL: &str = "https://api.telegram.org";

/// Long-poll timeout for getUpdates (seconds)
pub const TELEGRAM_POLL_TIMEOUT_SECS: u64 = 30;

/// Default OpenAI-compatible endpoint
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Default Ollama host
pub const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";

/// Default Gemini endpoint
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Audit reason written when a challenge expires unanswered
pub const REASON_TIMED_OUT: &str = "Timed out";

/// Audit reason written when the verifier itself failed
pub const REASON_VERIFICATION_ERROR: &str = "Verification error";

/// Redis key prefixes
pub mod redis_keys {
    /// Allowed groups hash: chat_id -> display name
    pub const ALLOWED_GROUPS: &str = "bouncer:allowed_groups";

    /// Group topic: bouncer:topic:{chat_id}
    pub const TOPIC_PREFIX: &str = "bouncer:topic:";

    /// Pending challenge hash: bouncer:pending:{user_id}
    pub const PENDING_PREFIX: &str = "bouncer:pending:";

    /// Set of user ids with a pending challenge
    pub const PENDING_INDEX: &str = "bouncer:pending_users";

    /// Join attempt list (newest first): bouncer:attempts:{user_id}
    pub const ATTEMPTS_PREFIX: &str = "bouncer:attempts:";

    /// Verification audit list (newest first)
    pub const VERIFICATIONS: &str = "bouncer:verifications";

    /// Verdict counters hash
    pub const STATS: &str = "bouncer:stats";
}
