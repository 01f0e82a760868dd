//! Request handler: validates one incoming turn, bounds its history, and runs it
//! through the fallback chain for its task.
//!
//! Validation happens before anything else, so a rejected request never reaches
//! a provider.

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::context::{self, ContextPolicy, ContextStats};
use crate::error::{HandlerError, ValidationError};
use crate::fallback::FallbackOrchestrator;
use crate::providers::{ChatArgs, InvokeArgs, MediaArgs};
use crate::registry::ProviderRegistry;
use crate::relay::relay;
use crate::tokens::estimate_history;
use crate::types::{AttemptRecord, GenerationResult, MediaPayload, Message, Payload, TaskType};
use crate::wire::Envelope;

const OPTIMIZE_SYSTEM_PROMPT: &str = "Rewrite the user's text so it is clear, concise and \
well structured. Keep the original meaning and language. Reply with the rewritten text only.";

const MIN_DIMENSION: u32 = 64;
const MAX_DIMENSION: u32 = 4096;

/// Input size ceilings checked before any provider call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputLimits {
    pub max_message_chars: usize,
    pub max_prompt_chars: usize,
    pub max_history_messages: usize,
}

impl Default for InputLimits {
    fn default() -> Self {
        Self {
            max_message_chars: 10_000,
            max_prompt_chars: 1_000,
            max_history_messages: 200,
        }
    }
}

/// One chat turn: the new message plus the caller's history
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub message: String,
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub history: Vec<Message>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Image or video request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationTurn {
    pub prompt: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub provider_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeTurn {
    pub text: String,
    #[serde(default)]
    pub provider_id: Option<String>,
}

/// Live chat response. Fallback is already over when this exists.
pub struct ChatStream {
    pub provider_used: String,
    pub attempts: Vec<AttemptRecord>,
    pub context: ContextStats,
    pub envelopes: BoxStream<'static, Envelope>,
}

impl std::fmt::Debug for ChatStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatStream")
            .field("provider_used", &self.provider_used)
            .field("attempts", &self.attempts)
            .field("context", &self.context)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ChatCompletion {
    /// Assistant reply tagged with the provider that produced it
    pub message: Message,
    pub provider_used: String,
    pub attempts: Vec<AttemptRecord>,
    pub context: ContextStats,
}

#[derive(Debug, Clone)]
pub struct TextResult {
    pub content: String,
    pub provider_used: String,
    pub attempts: Vec<AttemptRecord>,
}

#[derive(Debug, Clone)]
pub struct MediaResult {
    pub media: MediaPayload,
    pub provider_used: String,
    pub attempts: Vec<AttemptRecord>,
}

/// Composition root shared by the gateway and the CLI
#[derive(Clone)]
pub struct RequestHandler {
    orchestrator: FallbackOrchestrator,
    policy: ContextPolicy,
    limits: InputLimits,
}

impl RequestHandler {
    pub fn new(orchestrator: FallbackOrchestrator, policy: ContextPolicy, limits: InputLimits) -> Self {
        Self {
            orchestrator,
            policy,
            limits,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        self.orchestrator.registry()
    }

    pub fn limits(&self) -> &InputLimits {
        &self.limits
    }

    /// Open a streaming chat reply.
    ///
    /// The returned envelopes end with exactly one `end` or `error`, unless
    /// `cancel` fires first.
    pub async fn stream_chat(
        &self,
        turn: &ChatTurn,
        cancel: CancellationToken,
    ) -> Result<ChatStream, HandlerError> {
        let (args, context) = self.prepare_chat(turn)?;
        info!(
            "Streaming chat: {} message(s), ~{} tokens{}",
            context.message_count,
            context.estimated_tokens,
            if context.truncated { " (truncated)" } else { "" }
        );

        let result = self
            .orchestrator
            .execute_streaming(TaskType::Chat, turn.provider_id.as_deref(), &args, &cancel)
            .await?;

        Ok(ChatStream {
            provider_used: result.provider_used,
            attempts: result.attempts,
            context,
            envelopes: relay(result.stream, cancel, self.orchestrator.config().idle_timeout).boxed(),
        })
    }

    /// Chat reply collected in full
    pub async fn complete_chat(
        &self,
        turn: &ChatTurn,
        cancel: &CancellationToken,
    ) -> Result<ChatCompletion, HandlerError> {
        let (args, context) = self.prepare_chat(turn)?;
        let result = self
            .orchestrator
            .execute(TaskType::Chat, turn.provider_id.as_deref(), &args, cancel)
            .await?;
        let content = expect_text(TaskType::Chat, result.payload, &result.provider_used)?;

        Ok(ChatCompletion {
            message: Message::assistant(content).with_provider(result.provider_used.clone()),
            provider_used: result.provider_used,
            attempts: result.attempts,
            context,
        })
    }

    pub async fn generate_image(
        &self,
        turn: &GenerationTurn,
        cancel: &CancellationToken,
    ) -> Result<MediaResult, HandlerError> {
        self.generate_media(TaskType::Image, turn, cancel).await
    }

    pub async fn generate_video(
        &self,
        turn: &GenerationTurn,
        cancel: &CancellationToken,
    ) -> Result<MediaResult, HandlerError> {
        self.generate_media(TaskType::Video, turn, cancel).await
    }

    /// Rewrite `turn.text` through the optimize chain
    pub async fn optimize_text(
        &self,
        turn: &OptimizeTurn,
        cancel: &CancellationToken,
    ) -> Result<TextResult, HandlerError> {
        check_text("text", &turn.text, self.limits.max_message_chars)?;
        self.check_provider(TaskType::Optimize, turn.provider_id.as_deref())?;

        let args = InvokeArgs::Chat(ChatArgs {
            messages: vec![Message::user(turn.text.clone())],
            system: Some(OPTIMIZE_SYSTEM_PROMPT.to_string()),
            temperature: None,
            max_tokens: None,
        });
        let result = self
            .orchestrator
            .execute(TaskType::Optimize, turn.provider_id.as_deref(), &args, cancel)
            .await?;
        let content = expect_text(TaskType::Optimize, result.payload, &result.provider_used)?;

        Ok(TextResult {
            content,
            provider_used: result.provider_used,
            attempts: result.attempts,
        })
    }

    async fn generate_media(
        &self,
        task: TaskType,
        turn: &GenerationTurn,
        cancel: &CancellationToken,
    ) -> Result<MediaResult, HandlerError> {
        check_text("prompt", &turn.prompt, self.limits.max_prompt_chars)?;
        check_dimension("width", turn.width)?;
        check_dimension("height", turn.height)?;
        self.check_provider(task, turn.provider_id.as_deref())?;

        let args = InvokeArgs::Media(MediaArgs {
            prompt: turn.prompt.clone(),
            width: turn.width,
            height: turn.height,
        });
        let GenerationResult {
            payload,
            provider_used,
            attempts,
        } = self
            .orchestrator
            .execute(task, turn.provider_id.as_deref(), &args, cancel)
            .await?;

        match payload {
            Payload::Media(media) => {
                debug!("{} from {}: {} bytes of {}", task, provider_used, media.bytes.len(), media.mime_type);
                Ok(MediaResult {
                    media,
                    provider_used,
                    attempts,
                })
            }
            Payload::Text(_) => Err(HandlerError::UnexpectedPayload {
                task,
                provider: provider_used,
                found: "text",
            }),
        }
    }

    /// Validate, append the new user message, and bound the history
    fn prepare_chat(&self, turn: &ChatTurn) -> Result<(InvokeArgs, ContextStats), ValidationError> {
        check_text("message", &turn.message, self.limits.max_message_chars)?;
        if turn.history.len() > self.limits.max_history_messages {
            return Err(ValidationError::InvalidParameter {
                field: "history",
                reason: format!(
                    "{} messages, the limit is {}",
                    turn.history.len(),
                    self.limits.max_history_messages
                ),
            });
        }
        if let Some(t) = turn.temperature.filter(|t| !(0.0..=2.0).contains(t)) {
            return Err(ValidationError::InvalidParameter {
                field: "temperature",
                reason: format!("{} is outside 0.0..=2.0", t),
            });
        }
        if turn.max_tokens == Some(0) {
            return Err(ValidationError::InvalidParameter {
                field: "maxTokens",
                reason: "must be at least 1".to_string(),
            });
        }
        self.check_provider(TaskType::Chat, turn.provider_id.as_deref())?;

        let mut history = Vec::with_capacity(turn.history.len() + 1);
        history.extend(turn.history.iter().cloned());
        history.push(Message::user(turn.message.clone()));

        // Bounds come from the provider expected to answer first
        let config = match self.first_in_chain(TaskType::Chat, turn.provider_id.as_deref()) {
            Some(id) => self.policy.config_for(TaskType::Chat, &id),
            None => self.policy.config_for(TaskType::Chat, ""),
        };
        let messages = context::truncate(&history, &config);
        let stats = ContextStats {
            message_count: messages.len(),
            estimated_tokens: estimate_history(&messages),
            truncated: messages.len() < history.len(),
        };

        let args = InvokeArgs::Chat(ChatArgs {
            messages,
            system: None,
            temperature: turn.temperature,
            max_tokens: turn.max_tokens,
        });
        Ok((args, stats))
    }

    fn first_in_chain(&self, task: TaskType, preferred: Option<&str>) -> Option<String> {
        self.registry()
            .get_order(task, preferred)
            .first()
            .map(|d| d.id.clone())
    }

    fn check_provider(&self, task: TaskType, provider_id: Option<&str>) -> Result<(), ValidationError> {
        match provider_id {
            Some(id) if !self.registry().contains(task, id) => Err(ValidationError::UnsupportedProvider {
                task,
                id: id.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

fn check_text(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty(field));
    }
    let len = value.chars().count();
    if len > max {
        return Err(ValidationError::TooLong { field, len, max });
    }
    Ok(())
}

fn check_dimension(field: &'static str, value: Option<u32>) -> Result<(), ValidationError> {
    match value {
        Some(v) if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&v) => Err(ValidationError::InvalidParameter {
            field,
            reason: format!("{} is outside {}..={}", v, MIN_DIMENSION, MAX_DIMENSION),
        }),
        _ => Ok(()),
    }
}

fn expect_text(task: TaskType, payload: Payload, provider: &str) -> Result<String, HandlerError> {
    match payload {
        Payload::Text(text) => Ok(text),
        Payload::Media(_) => Err(HandlerError::UnexpectedPayload {
            task,
            provider: provider.to_string(),
            found: "media",
        }),
    }
}
