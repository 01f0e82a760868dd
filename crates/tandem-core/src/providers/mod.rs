//! Provider adapters
//!
//! Every backend implements the [`Provider`] trait. Chat backends (OpenAI-compatible,
//! Anthropic) support native streaming; media backends return base64 bytes.
//! Backends that run asynchronous jobs poll inside their adapter.

pub mod anthropic;
pub mod images;
pub mod jobs;
pub mod openai;
pub mod types;

use std::time::Duration;

use reqwest::{Client, Response};

use crate::error::ProviderError;

pub use anthropic::AnthropicProvider;
pub use images::OpenAiImageProvider;
pub use jobs::{PollSettings, PredictionJobProvider};
pub use openai::OpenAiProvider;
pub use types::{ChatArgs, ChunkStream, InvokeArgs, MediaArgs, Provider};

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client shared by adapters. No overall timeout: the orchestrator owns
/// call deadlines and streams may run long.
pub(crate) fn http_client() -> Result<Client, ProviderError> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| ProviderError::Request(format!("failed to build HTTP client: {}", e)))
}

/// Turn a non-2xx response into [`ProviderError::Status`] carrying the body text
pub(crate) async fn ensure_success(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(ProviderError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Trim a trailing slash so `{base}/v1/...` joins cleanly
pub(crate) fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}
