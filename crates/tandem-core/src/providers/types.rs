//! Provider-agnostic invocation types and the [`Provider`] trait

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::error::ProviderError;
use crate::types::{Message, Payload};

/// Ordered, possibly unbounded sequence of partial-text chunks
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// Arguments for a chat-style invocation
#[derive(Debug, Clone, Default)]
pub struct ChatArgs {
    /// Already truncated history, oldest first, ending with the new user turn
    pub messages: Vec<Message>,
    pub system: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Arguments for media generation
#[derive(Debug, Clone, Default)]
pub struct MediaArgs {
    pub prompt: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// What a provider is asked to do
#[derive(Debug, Clone)]
pub enum InvokeArgs {
    Chat(ChatArgs),
    Media(MediaArgs),
}

impl InvokeArgs {
    pub fn as_chat(&self) -> Result<&ChatArgs, ProviderError> {
        match self {
            Self::Chat(args) => Ok(args),
            Self::Media(_) => Err(ProviderError::Unsupported(
                "chat provider received a media request".to_string(),
            )),
        }
    }

    pub fn as_media(&self) -> Result<&MediaArgs, ProviderError> {
        match self {
            Self::Media(args) => Ok(args),
            Self::Chat(_) => Err(ProviderError::Unsupported(
                "media provider received a chat request".to_string(),
            )),
        }
    }
}

/// A backend capable of serving one or more task types.
///
/// Adapters that need to poll a remote job do so inside `invoke`; the
/// orchestrator only ever sees one call per provider.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Produce a complete payload
    async fn invoke(&self, args: &InvokeArgs) -> Result<Payload, ProviderError>;

    /// Open a live chunk stream. Providers without native streaming emit their
    /// complete text as a single chunk.
    async fn invoke_streaming(&self, args: &InvokeArgs) -> Result<ChunkStream, ProviderError> {
        match self.invoke(args).await? {
            Payload::Text(text) => Ok(Box::pin(futures_util::stream::once(async move { Ok(text) }))),
            Payload::Media(_) => Err(ProviderError::Unsupported(
                "media payloads cannot be streamed".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    struct Fixed(Payload);

    #[async_trait]
    impl Provider for Fixed {
        async fn invoke(&self, _args: &InvokeArgs) -> Result<Payload, ProviderError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_default_streaming_emits_single_chunk() {
        let provider = Fixed(Payload::Text("whole answer".to_string()));
        let args = InvokeArgs::Chat(ChatArgs::default());
        let chunks: Vec<_> = provider.invoke_streaming(&args).await.unwrap().collect().await;
        assert_eq!(chunks, vec![Ok("whole answer".to_string())]);
    }

    #[tokio::test]
    async fn test_default_streaming_rejects_media() {
        let provider = Fixed(Payload::Media(crate::types::MediaPayload::new("image/png", vec![0])));
        let args = InvokeArgs::Media(MediaArgs::default());
        let result = provider.invoke_streaming(&args).await;
        assert!(matches!(result, Err(ProviderError::Unsupported(_))));
    }

    #[test]
    fn test_args_accessors() {
        let chat = InvokeArgs::Chat(ChatArgs::default());
        assert!(chat.as_chat().is_ok());
        assert!(chat.as_media().is_err());
        let media = InvokeArgs::Media(MediaArgs::default());
        assert!(media.as_media().is_ok());
        assert!(media.as_chat().is_err());
    }
}
