//! OpenAI-style image generation (`/v1/images/generations`, base64 response)

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProviderError;
use crate::types::{MediaPayload, Payload};

use super::types::{InvokeArgs, MediaArgs, Provider};
use super::{ensure_success, http_client, normalize_base_url};

const DEFAULT_SIZE: u32 = 1024;
const IMAGE_MIME: &str = "image/png";

pub struct OpenAiImageProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl std::fmt::Debug for OpenAiImageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiImageProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiImageProvider {
    pub fn new(api_key: String, model: String, base_url: String) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client()?,
            api_key,
            base_url: normalize_base_url(&base_url),
            model,
        })
    }

    fn request_body(&self, args: &MediaArgs) -> ImageRequest {
        let width = args.width.unwrap_or(DEFAULT_SIZE);
        let height = args.height.unwrap_or(DEFAULT_SIZE);
        ImageRequest {
            model: self.model.clone(),
            prompt: args.prompt.clone(),
            n: 1,
            size: format!("{}x{}", width, height),
            response_format: "b64_json".to_string(),
        }
    }
}

#[async_trait]
impl Provider for OpenAiImageProvider {
    async fn invoke(&self, args: &InvokeArgs) -> Result<Payload, ProviderError> {
        if self.api_key.is_empty() {
            return Err(ProviderError::Credential("image API key is not set".to_string()));
        }

        let body = self.request_body(args.as_media()?);
        debug!("Image request: model={}, size={}", self.model, body.size);

        let response = self
            .client
            .post(format!("{}/v1/images/generations", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let parsed: ImageResponse = ensure_success(response).await?.json().await?;

        let encoded = parsed
            .data
            .into_iter()
            .find_map(|d| d.b64_json)
            .ok_or_else(|| ProviderError::Malformed("image response had no b64_json data".to_string()))?;
        let media = MediaPayload::from_base64(IMAGE_MIME, &encoded)
            .map_err(|e| ProviderError::Malformed(format!("invalid base64 image: {}", e)))?;

        debug!("Image generated: {} bytes", media.bytes.len());
        Ok(Payload::Media(media))
    }
}

#[derive(Debug, Serialize)]
struct ImageRequest {
    model: String,
    prompt: String,
    n: u32,
    size: String,
    response_format: String,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    b64_json: Option<String>,
}
