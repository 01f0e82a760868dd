//! Anthropic Messages API provider

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProviderError;
use crate::types::{Message, Payload, Role};

use super::types::{ChatArgs, ChunkStream, InvokeArgs, Provider};
use super::{ensure_success, http_client, normalize_base_url};

const API_VERSION: &str = "2023-06-01";

/// Anthropic Claude provider
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl AnthropicProvider {
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

    fn request_body(&self, args: &ChatArgs, stream: bool) -> AnthropicRequest {
        AnthropicRequest {
            model: self.model.clone(),
            max_tokens: args.max_tokens.unwrap_or(self.max_tokens),
            system: args.system.clone(),
            messages: alternating_turns(&args.messages),
            temperature: args.temperature,
            stream,
        }
    }

    async fn send(&self, body: &AnthropicRequest) -> Result<reqwest::Response, ProviderError> {
        if self.api_key.is_empty() {
            return Err(ProviderError::Credential("Anthropic API key is not set".to_string()));
        }

        let url = format!("{}/v1/messages", self.base_url);
        debug!(
            "Anthropic request: model={}, messages={}, stream={}",
            self.model,
            body.messages.len(),
            body.stream
        );

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await?;
        ensure_success(response).await
    }

    /// Concatenate the text blocks of a complete response
    fn from_anthropic_response(resp: AnthropicApiResponse) -> String {
        resp.content
            .into_iter()
            .filter_map(|block| match block {
                AnthropicBlock::Text { text } => Some(text),
                AnthropicBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Map one SSE event to an optional text delta
    fn parse_event(event: &str, data: &str) -> Result<Option<String>, ProviderError> {
        match event {
            "content_block_delta" => {
                let delta: AnthropicDeltaEvent = serde_json::from_str(data)?;
                Ok(delta.delta.text.filter(|t| !t.is_empty()))
            }
            "error" => {
                let error: AnthropicErrorEvent = serde_json::from_str(data)?;
                Err(ProviderError::Request(format!(
                    "{}: {}",
                    error.error.kind, error.error.message
                )))
            }
            // message_start, content_block_start/stop, message_delta, ping
            _ => Ok(None),
        }
    }
}

/// The Messages API wants a conversation that opens with a user turn and
/// alternates roles. Truncation may cut a pair in half, so leading assistant
/// turns are dropped and runs of one role are merged.
fn alternating_turns(messages: &[Message]) -> Vec<AnthropicMessage> {
    let mut turns: Vec<AnthropicMessage> = Vec::with_capacity(messages.len());
    for m in messages.iter().skip_while(|m| m.role == Role::Assistant) {
        let role = m.role.to_string();
        match turns.last_mut() {
            Some(last) if last.role == role => {
                last.content.push_str("\n\n");
                last.content.push_str(&m.content);
            }
            _ => turns.push(AnthropicMessage {
                role,
                content: m.content.clone(),
            }),
        }
    }
    turns
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn invoke(&self, args: &InvokeArgs) -> Result<Payload, ProviderError> {
        let body = self.request_body(args.as_chat()?, false);
        let api_response: AnthropicApiResponse = self.send(&body).await?.json().await?;
        debug!(
            "Anthropic response: blocks={}, stop_reason={:?}",
            api_response.content.len(),
            api_response.stop_reason
        );
        Ok(Payload::Text(Self::from_anthropic_response(api_response)))
    }

    async fn invoke_streaming(&self, args: &InvokeArgs) -> Result<ChunkStream, ProviderError> {
        let body = self.request_body(args.as_chat()?, true);
        let response = self.send(&body).await?;

        let stream = response
            .bytes_stream()
            .eventsource()
            .take_while(|event| {
                let stopped = matches!(event, Ok(e) if e.event == "message_stop");
                futures_util::future::ready(!stopped)
            })
            .filter_map(|event| async move {
                match event {
                    Ok(event) => Self::parse_event(&event.event, &event.data).transpose(),
                    Err(e) => Some(Err(ProviderError::Request(e.to_string()))),
                }
            });

        Ok(Box::pin(stream))
    }
}

// ── Anthropic wire types ──

#[derive(Debug, Clone, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Clone, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
struct AnthropicApiResponse {
    content: Vec<AnthropicBlock>,
    stop_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AnthropicDeltaEvent {
    delta: AnthropicDelta,
}

#[derive(Debug, Clone, Deserialize)]
struct AnthropicDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AnthropicErrorEvent {
    error: AnthropicErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
struct AnthropicErrorBody {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextConfig, ContextStrategy, truncate};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chat() -> InvokeArgs {
        InvokeArgs::Chat(ChatArgs {
            messages: vec![Message::user("hello")],
            system: Some("Be brief.".to_string()),
            temperature: None,
            max_tokens: Some(64),
        })
    }

    #[test]
    fn test_request_body_carries_system_separately() {
        let provider =
            AnthropicProvider::new("k".to_string(), "claude".to_string(), "http://x".to_string(), 4096).unwrap();
        let InvokeArgs::Chat(args) = chat() else { unreachable!() };
        let json = serde_json::to_value(provider.request_body(&args, false)).unwrap();
        assert_eq!(json["system"], "Be brief.");
        assert_eq!(json["max_tokens"], 64);
        assert_eq!(json["messages"][0]["role"], "user");
        assert!(json.get("temperature").is_none());
    }

    #[test]
    fn test_truncated_history_opens_with_user_turn() {
        let mut history = Vec::new();
        for i in 0..5 {
            history.push(Message::user(format!("question {}", i)));
            history.push(Message::assistant(format!("answer {}", i)));
        }
        history.push(Message::user("question 5"));
        let config = ContextConfig::new(4, 10_000, ContextStrategy::Recent).unwrap();
        let kept = truncate(&history, &config);
        assert_eq!(kept[0].role, Role::Assistant);

        let provider =
            AnthropicProvider::new("k".to_string(), "claude".to_string(), "http://x".to_string(), 4096).unwrap();
        let args = ChatArgs {
            messages: kept,
            system: None,
            temperature: None,
            max_tokens: None,
        };
        let json = serde_json::to_value(provider.request_body(&args, false)).unwrap();
        let roles: Vec<_> = json["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);
        assert_eq!(json["messages"][0]["content"], "question 4");
    }

    #[test]
    fn test_consecutive_same_role_turns_merge() {
        let turns = alternating_turns(&[
            Message::assistant("stale"),
            Message::user("first"),
            Message::user("second"),
            Message::assistant("reply"),
        ]);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, "user");
        assert_eq!(turns[0].content, "first\n\nsecond");
        assert_eq!(turns[1].content, "reply");
    }

    #[test]
    fn test_from_anthropic_response_skips_non_text() {
        let resp: AnthropicApiResponse = serde_json::from_value(serde_json::json!({
            "content": [
                {"type": "text", "text": "Hello"},
                {"type": "tool_use", "id": "t", "name": "x", "input": {}},
                {"type": "text", "text": " world"}
            ],
            "stop_reason": "end_turn"
        }))
        .unwrap();
        assert_eq!(AnthropicProvider::from_anthropic_response(resp), "Hello world");
    }

    #[test]
    fn test_parse_event() {
        let delta = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#;
        assert_eq!(AnthropicProvider::parse_event("content_block_delta", delta).unwrap(), Some("Hi".to_string()));
        assert_eq!(AnthropicProvider::parse_event("ping", "{}").unwrap(), None);
        let err = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        let e = AnthropicProvider::parse_event("error", err).unwrap_err();
        assert!(e.to_string().contains("Overloaded"));
    }

    #[tokio::test]
    async fn test_missing_key_is_credential_error() {
        let provider =
            AnthropicProvider::new(String::new(), "claude".to_string(), "http://127.0.0.1:9".to_string(), 64).unwrap();
        let err = provider.invoke(&chat()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Credential(_)));
    }

    #[tokio::test]
    async fn test_invoke_returns_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant-test"))
            .and(header("anthropic-version", API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg_1",
                "content": [{"type": "text", "text": "Hello!"}],
                "stop_reason": "end_turn"
            })))
            .mount(&server)
            .await;

        let provider =
            AnthropicProvider::new("sk-ant-test".to_string(), "claude".to_string(), server.uri(), 64).unwrap();
        assert_eq!(provider.invoke(&chat()).await.unwrap(), Payload::Text("Hello!".to_string()));
    }

    #[tokio::test]
    async fn test_streaming_text_deltas() {
        let server = MockServer::start().await;
        let body = concat!(
            "event: message_start\ndata: {\"type\":\"message_start\"}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
            "event: ping\ndata: {\"type\":\"ping\"}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new("k".to_string(), "claude".to_string(), server.uri(), 64).unwrap();
        let chunks: Vec<_> = provider.invoke_streaming(&chat()).await.unwrap().collect().await;
        assert_eq!(chunks, vec![Ok("Hel".to_string()), Ok("lo".to_string())]);
    }
}
