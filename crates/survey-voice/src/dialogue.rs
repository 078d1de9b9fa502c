//! **DialogueEngine**: Conversation turns and agent utterance generation.
//!
//! The engine never mutates history itself. The orchestrator appends the user turn
//! before asking for the next agent turn and appends the agent turn only after a
//! successful response, so a failed generation cannot corrupt the log.

use crate::config::BackendConfig;
use crate::error::{is_quota_failure, GenerationError};
use crate::survey::Survey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Agent,
}

impl Role {
    /// Role name on OpenAI-compatible chat APIs.
    pub fn as_chat_role(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Agent => "assistant",
        }
    }
}

/// One unit of dialogue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// The first turn of every call: survey instructions plus the language directive.
pub fn system_turn(survey: &Survey) -> ConversationTurn {
    ConversationTurn::new(
        Role::System,
        format!("{}\n\n{}", survey.system_prompt, survey.lang().directive()),
    )
}

/// Text-generation capability. Implement for any chat-completion backend.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Produce the next agent utterance for the given turns.
    async fn generate(
        &self,
        turns: &[ConversationTurn],
        max_tokens: u32,
    ) -> Result<String, GenerationError>;
}

/// Requests agent turns from a `TextGenerator`
#[derive(Clone)]
pub struct DialogueEngine {
    generator: Arc<dyn TextGenerator>,
    max_tokens: u32,
}

impl DialogueEngine {
    pub fn new(generator: Arc<dyn TextGenerator>, max_tokens: u32) -> Self {
        Self {
            generator,
            max_tokens,
        }
    }

    /// Ask for the agent's reply to `user_text` given the turns so far.
    ///
    /// `history` must not already contain `user_text`; the request is
    /// `history ++ [user(user_text)]`.
    pub async fn next_turn(
        &self,
        history: &[ConversationTurn],
        user_text: &str,
    ) -> Result<String, GenerationError> {
        let mut request = Vec::with_capacity(history.len() + 1);
        request.extend_from_slice(history);
        request.push(ConversationTurn::new(Role::User, user_text));

        debug!(turns = request.len(), "requesting agent turn");
        let text = self.generator.generate(&request, self.max_tokens).await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(GenerationError::Transient("empty completion".to_string()));
        }
        Ok(text.to_string())
    }
}

/// Canned generator used when no chat API is configured.
#[derive(Debug, Default)]
pub struct PlaceholderGenerator {
    /// If set, return this instead of the default line.
    pub response: Option<String>,
}

#[async_trait]
impl TextGenerator for PlaceholderGenerator {
    async fn generate(
        &self,
        turns: &[ConversationTurn],
        _max_tokens: u32,
    ) -> Result<String, GenerationError> {
        if let Some(ref r) = self.response {
            return Ok(r.clone());
        }
        let answered = turns.iter().filter(|t| t.role == Role::User).count();
        Ok(format!(
            "[generation placeholder: question {}, connect a chat API to continue]",
            answered
        ))
    }
}

// OpenAI-compatible request/response for chat completions
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

/// Production generator: OpenAI-compatible `/chat/completions` (OpenAI, OpenRouter, etc.).
#[derive(Debug, Clone)]
pub struct ChatCompletionsGenerator {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    client: reqwest::Client,
}

impl ChatCompletionsGenerator {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| GenerationError::Transient(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into().trim().to_string(),
            model: model.into(),
            client,
        })
    }
}

#[async_trait]
impl TextGenerator for ChatCompletionsGenerator {
    async fn generate(
        &self,
        turns: &[ConversationTurn],
        max_tokens: u32,
    ) -> Result<String, GenerationError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: &self.model,
            messages: turns
                .iter()
                .map(|t| ChatMessage {
                    role: t.role.as_chat_role(),
                    content: &t.content,
                })
                .collect(),
            max_tokens,
        };

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Transient(e.to_string()))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            let message = format!("chat API error {}: {}", status, body);
            return Err(if is_quota_failure(status.as_u16(), &body) {
                GenerationError::QuotaExceeded(message)
            } else {
                GenerationError::Transient(message)
            });
        }

        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| GenerationError::Transient(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| GenerationError::Transient("response had no choices".to_string()))
    }
}

/// HTTP chat completions if a key is configured, otherwise the placeholder.
pub fn create_best_generator(backend: &BackendConfig) -> Arc<dyn TextGenerator> {
    if let Some(key) = backend.resolved_api_key() {
        match ChatCompletionsGenerator::new(&backend.api_base, key, &backend.chat_model) {
            Ok(generator) => {
                info!(model = %backend.chat_model, "using HTTP chat completions");
                return Arc::new(generator);
            }
            Err(e) => warn!(error = %e, "HTTP chat completions unavailable"),
        }
    }
    Arc::new(PlaceholderGenerator::default())
}
