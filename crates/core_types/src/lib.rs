use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type ProfileId = Uuid;
pub type ConversationId = Uuid;
pub type MessageId = Uuid;

/// Stream of text deltas produced by an adapter. Dropping it releases the
/// underlying connection.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, GatewayError>> + Send + 'static>>;

pub const OLLAMA_MODEL_PREFIX: &str = "ollama:";
pub const NEW_CONVERSATION_TITLE: &str = "New Conversation";
const TITLE_PREVIEW_CHARS: usize = 30;

/// Current time truncated to the precision the store keeps.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UiLanguage {
    ZhCn,
    EnUs,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    System,
    User,
    Assistant,
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Other(raw) => raw,
        }
    }
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        match value.as_str() {
            "system" => Role::System,
            "user" => Role::User,
            "assistant" => Role::Assistant,
            _ => Role::Other(value),
        }
    }
}

impl From<&str> for Role {
    fn from(value: &str) -> Self {
        Role::from(value.to_string())
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        match value {
            Role::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new_v4(),
            role,
            content: content.into(),
            timestamp: now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub profile_id: Option<ProfileId>,
    /// Only populated by lookups that load the full transcript.
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    /// Title shown for a conversation: the first user message, cut to 30
    /// characters with an ellipsis, or the placeholder title.
    pub fn derive_title(messages: &[Message]) -> String {
        let Some(first) = messages.iter().find(|m| m.role == Role::User) else {
            return NEW_CONVERSATION_TITLE.to_string();
        };
        let text = first.content.trim();
        if text.is_empty() {
            return NEW_CONVERSATION_TITLE.to_string();
        }
        if text.chars().count() > TITLE_PREVIEW_CHARS {
            let head: String = text.chars().take(TITLE_PREVIEW_CHARS).collect();
            format!("{head}…")
        } else {
            text.to_string()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelParameters {
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2048,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: ProfileId,
    pub name: String,
    pub model_name: String,
    pub api_endpoint: String,
    pub is_default: bool,
    pub parameters: ModelParameters,
}

impl Profile {
    pub fn route(&self) -> ModelRoute {
        ModelRoute::parse(&self.model_name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAiCompatible,
    Ollama,
}

/// A model name resolved to the protocol that serves it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelRoute {
    pub provider: ProviderKind,
    pub model: String,
}

impl ModelRoute {
    pub fn parse(model_name: &str) -> Self {
        match model_name.strip_prefix(OLLAMA_MODEL_PREFIX) {
            Some(model) => Self {
                provider: ProviderKind::Ollama,
                model: model.to_string(),
            },
            None => Self {
                provider: ProviderKind::OpenAiCompatible,
                model: model_name.to_string(),
            },
        }
    }

    /// Model name as stored on a profile.
    pub fn qualified_name(&self) -> String {
        match self.provider {
            ProviderKind::Ollama => format!("{OLLAMA_MODEL_PREFIX}{}", self.model),
            ProviderKind::OpenAiCompatible => self.model.clone(),
        }
    }
}

/// Outcome of a reachability probe. A backend that answered but refused the
/// credentials is still reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub status: u16,
    pub auth_rejected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("invalid endpoint url")]
    InvalidUrl,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("rate limited")]
    RateLimited,
    #[error("server error: {0}")]
    ServerError(u16),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("{0}")]
    Unknown(String),
}

impl GatewayError {
    /// Maps a non-success HTTP status to the shared taxonomy.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 => GatewayError::AuthenticationFailed,
            429 => GatewayError::RateLimited,
            500..=599 => GatewayError::ServerError(status),
            _ => GatewayError::Unknown(format!("unexpected status {status}: {}", body.trim())),
        }
    }

    /// Whether retrying without reconfiguring can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Transport(_) | GatewayError::RateLimited | GatewayError::ServerError(_)
        )
    }

    /// Stable identifier used for user-visible hint lookup.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidUrl => "invalid_url",
            GatewayError::InvalidResponse(_) => "invalid_response",
            GatewayError::AuthenticationFailed => "authentication_failed",
            GatewayError::RateLimited => "rate_limited",
            GatewayError::ServerError(_) => "server_error",
            GatewayError::Transport(_) => "transport_failure",
            GatewayError::Unknown(_) => "unknown",
        }
    }
}

#[async_trait]
pub trait ChatAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn send(
        &self,
        messages: &[Message],
        parameters: &ModelParameters,
    ) -> Result<Message, GatewayError>;

    async fn stream(
        &self,
        messages: &[Message],
        parameters: &ModelParameters,
    ) -> Result<ChunkStream, GatewayError>;

    async fn probe(&self) -> Result<ProbeReport, GatewayError>;

    async fn list_models(&self) -> Result<Vec<String>, GatewayError> {
        Ok(Vec::new())
    }
}
