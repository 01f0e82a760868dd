//! OpenAI chat completions provider
//!
//! Also serves any endpoint speaking the same wire format (Ollama, Groq,
//! Together, LM Studio) through a custom base URL.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProviderError;
use crate::types::Payload;

use super::types::{ChatArgs, ChunkStream, InvokeArgs, Provider};
use super::{ensure_success, http_client, normalize_base_url};

const DONE_SENTINEL: &str = "[DONE]";

/// OpenAI-compatible chat provider
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl OpenAiProvider {
    pub fn new(
        api_key: String,
        model: String,
        base_url: String,
        max_tokens: u32,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client()?,
            api_key,
            base_url: normalize_base_url(&base_url),
            model,
            max_tokens,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Convert a history into OpenAI wire messages, system prompt first
    fn to_openai_messages(args: &ChatArgs) -> Vec<OpenAiMessage> {
        let system = args.system.iter().map(|s| OpenAiMessage {
            role: "system".to_string(),
            content: s.clone(),
        });
        let turns = args.messages.iter().map(|m| OpenAiMessage {
            role: m.role.to_string(),
            content: m.content.clone(),
        });
        system.chain(turns).collect()
    }

    fn request_body(&self, args: &ChatArgs, stream: bool) -> OpenAiRequest {
        OpenAiRequest {
            model: self.model.clone(),
            messages: Self::to_openai_messages(args),
            max_tokens: args.max_tokens.unwrap_or(self.max_tokens),
            temperature: args.temperature,
            stream,
        }
    }

    async fn send(&self, body: &OpenAiRequest) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        debug!(
            "OpenAI request: model={}, messages={}, stream={}",
            self.model,
            body.messages.len(),
            body.stream
        );

        let mut request = self.client.post(&url).json(body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        ensure_success(request.send().await?).await
    }

    /// Extract the assistant text from a complete response
    fn from_openai_response(resp: OpenAiApiResponse) -> Result<String, ProviderError> {
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Malformed("OpenAI response had no choices".to_string()))?;
        Ok(choice.message.content.unwrap_or_default())
    }

    /// Parse one SSE `data:` payload into an optional text delta
    fn parse_delta(data: &str) -> Result<Option<String>, ProviderError> {
        let chunk: OpenAiStreamChunk = serde_json::from_str(data)?;
        if let Some(error) = chunk.error {
            return Err(ProviderError::Request(error.message));
        }
        Ok(chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|text| !text.is_empty()))
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn invoke(&self, args: &InvokeArgs) -> Result<Payload, ProviderError> {
        let body = self.request_body(args.as_chat()?, false);
        let response = self.send(&body).await?;
        let api_response: OpenAiApiResponse = response.json().await?;
        debug!(
            "OpenAI response: choices={}, finish_reason={:?}",
            api_response.choices.len(),
            api_response.choices.first().map(|c| &c.finish_reason)
        );
        Ok(Payload::Text(Self::from_openai_response(api_response)?))
    }

    async fn invoke_streaming(&self, args: &InvokeArgs) -> Result<ChunkStream, ProviderError> {
        let body = self.request_body(args.as_chat()?, true);
        let response = self.send(&body).await?;

        let stream = response
            .bytes_stream()
            .eventsource()
            .take_while(|event| {
                let done = matches!(event, Ok(e) if e.data.trim() == DONE_SENTINEL);
                futures_util::future::ready(!done)
            })
            .filter_map(|event| async move {
                match event {
                    Ok(event) => Self::parse_delta(&event.data).transpose(),
                    Err(e) => Some(Err(ProviderError::Request(e.to_string()))),
                }
            });

        Ok(Box::pin(stream))
    }
}

// ── OpenAI wire types ──

#[derive(Debug, Clone, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiApiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    error: Option<OpenAiErrorBody>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiErrorBody {
    message: String,
}
