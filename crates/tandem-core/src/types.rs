//! Shared types for tandem-core

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who authored a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// One turn of a conversation. Immutable once created; callers append to a history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producing_provider_id: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            producing_provider_id: None,
        }
    }

    /// Tag the message with the provider that produced it
    pub fn with_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.producing_provider_id = Some(provider_id.into());
        self
    }
}

/// Kind of work a provider chain is asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Chat,
    Image,
    Video,
    Optimize,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [Self::Chat, Self::Image, Self::Video, Self::Optimize];

    /// Whether this task produces text (as opposed to media bytes)
    pub fn is_textual(&self) -> bool {
        matches!(self, Self::Chat | Self::Optimize)
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chat => write!(f, "chat"),
            Self::Image => write!(f, "image"),
            Self::Video => write!(f, "video"),
            Self::Optimize => write!(f, "optimize"),
        }
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chat" => Ok(Self::Chat),
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "optimize" => Ok(Self::Optimize),
            other => Err(format!("unknown task type '{}'", other)),
        }
    }
}

/// Outcome of a single provider call within a fallback chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Timeout,
}

/// Audit entry for one provider call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub provider_id: String,
    pub started_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AttemptRecord {
    pub fn success(provider_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            provider_id: provider_id.into(),
            started_at,
            outcome: AttemptOutcome::Success,
            error_message: None,
        }
    }

    pub fn failed(
        provider_id: impl Into<String>,
        started_at: DateTime<Utc>,
        outcome: AttemptOutcome,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            started_at,
            outcome,
            error_message: Some(error_message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}

/// Generated media bytes plus their MIME type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPayload {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl MediaPayload {
    pub fn new(mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Build from base64 text as returned by most image APIs
    pub fn from_base64(mime_type: impl Into<String>, encoded: &str) -> Result<Self, base64::DecodeError> {
        Ok(Self::new(mime_type, BASE64.decode(encoded.trim())?))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    /// `data:<mime>;base64,<bytes>` form handed to callers
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.to_base64())
    }
}

/// What a successful provider call returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Media(MediaPayload),
}

impl Payload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Media(_) => None,
        }
    }

    pub fn as_media(&self) -> Option<&MediaPayload> {
        match self {
            Self::Media(media) => Some(media),
            Self::Text(_) => None,
        }
    }
}

/// Result of a successful orchestration call
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub payload: Payload,
    pub provider_used: String,
    /// Audit trail in call order; the last entry is the success
    pub attempts: Vec<AttemptRecord>,
}
