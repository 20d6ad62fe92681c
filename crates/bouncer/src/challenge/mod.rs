//! Challenge generation and answer verification.
//!
//! Both operations are single calls to the generative backend. Verification
//! embeds a fresh random token in the prompt and passes only when the
//! backend echoes that exact token back, so a backend cannot be primed to
//! always answer with a fixed sentinel.

pub mod templates;

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;

use crate::ai::{GenerationError, GenerativeAi};
use crate::config::PromptTemplates;
use templates::render;

/// Random bytes per verification token
const TOKEN_BYTES: usize = 18;

/// Outcome of checking an answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub passed: bool,

    /// Backend output on failure, empty on success. Audit only.
    pub reason: String,
}

/// Turns topics into questions and answers into verdicts
pub struct ChallengeGenerator {
    ai: Arc<dyn GenerativeAi>,
    prompts: PromptTemplates,
}

impl ChallengeGenerator {
    pub fn new(ai: Arc<dyn GenerativeAi>, prompts: PromptTemplates) -> Self {
        Self { ai, prompts }
    }

    /// Produce a challenge question for `topic`
    pub async fn generate_challenge(&self, topic: &str) -> Result<String, GenerationError> {
        let prompt = render(&self.prompts.generate_challenge, &[&topic]);
        tracing::debug!(backend = self.ai.name(), prompt = %prompt, "Generating challenge");

        let challenge = self.ai.generate(&prompt).await?.trim().to_string();
        if challenge.is_empty() {
            return Err(GenerationError::Empty(self.ai.name()));
        }

        tracing::debug!(challenge = %challenge, "Challenge generated");
        Ok(challenge)
    }

    /// Ask the backend whether `answer` solves `challenge`
    pub async fn verify_answer(
        &self,
        challenge: &str,
        answer: &str,
    ) -> Result<Verification, GenerationError> {
        let token = generate_token();
        let prompt = render(&self.prompts.verify_answer, &[&challenge, &answer, &token]);

        let output = self.ai.generate(&prompt).await?;
        let output = output.trim();
        tracing::debug!(output = %output, "Verification response");

        if output == token {
            Ok(Verification {
                passed: true,
                reason: String::new(),
            })
        } else {
            Ok(Verification {
                passed: false,
                reason: output.to_string(),
            })
        }
    }
}

/// Fresh opaque token, URL-safe base64
fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
