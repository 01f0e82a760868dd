//! Prediction-job provider for asynchronous media backends
//!
//! The backend accepts a job, then reports progress until the job reaches a
//! terminal state. All polling happens here, bounded by [`PollSettings`]; the
//! orchestrator sees one call that either returns media or fails. Running out
//! of polls is reported as [`ProviderError::Timeout`].
//!
//! A job that is still running when we stop waiting for it is cancelled
//! remotely, whether we gave up ourselves or the call future was dropped by a
//! deadline or a disconnect.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::types::{MediaPayload, Payload};

use super::types::{InvokeArgs, MediaArgs, Provider};
use super::{ensure_success, http_client, normalize_base_url};

/// Poll ceiling and spacing for one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub max_polls: u32,
    pub interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_polls: 30,
            interval: Duration::from_millis(2000),
        }
    }
}

impl PollSettings {
    /// Longest time a job may spend polling
    pub fn budget(&self) -> Duration {
        self.interval * self.max_polls
    }
}

pub struct PredictionJobProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    /// MIME type assumed when the output does not state one
    default_mime: String,
    poll: PollSettings,
}

impl std::fmt::Debug for PredictionJobProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictionJobProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("default_mime", &self.default_mime)
            .field("poll", &self.poll)
            .finish()
    }
}

impl PredictionJobProvider {
    pub fn new(
        api_key: String,
        model: String,
        base_url: String,
        default_mime: String,
        poll: PollSettings,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client()?,
            api_key,
            base_url: normalize_base_url(&base_url),
            model,
            default_mime,
            poll,
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        authorize(request, &self.api_key)
    }

    fn cancel_guard(&self, id: &str) -> CancelOnDrop {
        CancelOnDrop {
            client: self.client.clone(),
            api_key: self.api_key.clone(),
            url: format!("{}/v1/predictions/{}/cancel", self.base_url, id),
            armed: true,
        }
    }

    async fn submit(&self, args: &MediaArgs) -> Result<Job, ProviderError> {
        let body = JobRequest {
            model: self.model.clone(),
            input: JobInput {
                prompt: args.prompt.clone(),
                width: args.width,
                height: args.height,
            },
        };
        let request = self
            .client
            .post(format!("{}/v1/predictions", self.base_url))
            .json(&body);
        let job: Job = ensure_success(self.authorized(request).send().await?)
            .await?
            .json()
            .await?;
        debug!("Submitted job {} to {} ({})", job.id, self.base_url, self.model);
        Ok(job)
    }

    async fn fetch(&self, id: &str) -> Result<Job, ProviderError> {
        let request = self
            .client
            .get(format!("{}/v1/predictions/{}", self.base_url, id));
        Ok(ensure_success(self.authorized(request).send().await?)
            .await?
            .json()
            .await?)
    }

    /// Poll until the job is terminal or the ceiling is reached
    async fn wait(&self, mut job: Job) -> Result<Job, ProviderError> {
        let mut polls = 0;
        loop {
            if job.state() != JobState::Pending {
                return Ok(job);
            }

            if polls >= self.poll.max_polls {
                warn!("Job {} still {} after {} polls", job.id, job.status, polls);
                return Err(ProviderError::Timeout(self.poll.budget()));
            }

            tokio::time::sleep(self.poll.interval).await;
            polls += 1;
            job = self.fetch(&job.id).await?;
            debug!("Job {} poll {}/{}: {}", job.id, polls, self.poll.max_polls, job.status);
        }
    }

    /// Resolve the job output into bytes: inline data URL or a download
    async fn download(&self, output: &str) -> Result<MediaPayload, ProviderError> {
        if let Some(media) = parse_data_url(output) {
            return media;
        }

        let response = ensure_success(self.client.get(output).send().await?).await?;
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.starts_with("application/octet-stream"))
            .map(str::to_string)
            .unwrap_or_else(|| self.default_mime.clone());
        let bytes = response.bytes().await?;
        Ok(MediaPayload::new(mime, bytes.to_vec()))
    }
}

#[async_trait]
impl Provider for PredictionJobProvider {
    async fn invoke(&self, args: &InvokeArgs) -> Result<Payload, ProviderError> {
        let args = args.as_media()?;
        let job = self.submit(args).await?;

        // Armed until the job reaches a terminal state
        let mut guard = self.cancel_guard(&job.id);
        let job = match self.wait(job).await {
            Ok(job) => {
                guard.disarm();
                job
            }
            Err(e) if e.is_timeout() => {
                guard.cancel().await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if job.state() == JobState::Failed {
            return Err(ProviderError::Request(format!(
                "job {} {}: {}",
                job.id,
                job.status,
                job.error_text().unwrap_or_else(|| "no error detail".to_string())
            )));
        }
        let output = job
            .first_output()
            .ok_or_else(|| ProviderError::Malformed(format!("job {} succeeded without output", job.id)))?;
        Ok(Payload::Media(self.download(&output).await?))
    }
}

fn authorize(request: reqwest::RequestBuilder, api_key: &str) -> reqwest::RequestBuilder {
    if api_key.is_empty() {
        request
    } else {
        request.bearer_auth(api_key)
    }
}

/// Best effort: a job we stopped waiting for should not keep running
async fn send_cancel(client: &Client, url: &str, api_key: &str) {
    match authorize(client.post(url), api_key).send().await {
        Ok(response) if response.status().is_success() => debug!("Cancelled job via {}", url),
        Ok(response) => warn!("Cancelling job via {} returned status {}", url, response.status()),
        Err(e) => warn!("Failed to cancel job via {}: {}", url, e),
    }
}

/// Cancels a remote job unless disarmed first. Dropping it while armed
/// spawns the cancel request onto the current runtime.
struct CancelOnDrop {
    client: Client,
    api_key: String,
    url: String,
    armed: bool,
}

impl CancelOnDrop {
    fn disarm(&mut self) {
        self.armed = false;
    }

    async fn cancel(mut self) {
        self.armed = false;
        send_cancel(&self.client, &self.url, &self.api_key).await;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime left to cancel job via {}", self.url);
            return;
        };
        let client = self.client.clone();
        let api_key = std::mem::take(&mut self.api_key);
        let url = std::mem::take(&mut self.url);
        debug!("Abandoned job, cancelling via {}", url);
        handle.spawn(async move {
            send_cancel(&client, &url, &api_key).await;
        });
    }
}

fn parse_data_url(value: &str) -> Option<Result<MediaPayload, ProviderError>> {
    let rest = value.strip_prefix("data:")?;
    let (mime, encoded) = rest.split_once(";base64,")?;
    Some(
        MediaPayload::from_base64(mime, encoded)
            .map_err(|e| ProviderError::Malformed(format!("invalid inline output: {}", e))),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Serialize)]
struct JobRequest {
    model: String,
    input: JobInput,
}

#[derive(Debug, Serialize)]
struct JobInput {
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    height: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct Job {
    id: String,
    status: String,
    #[serde(default)]
    output: Value,
    #[serde(default)]
    error: Value,
}

impl Job {
    fn state(&self) -> JobState {
        match self.status.as_str() {
            "succeeded" | "completed" => JobState::Succeeded,
            "failed" | "canceled" | "cancelled" => JobState::Failed,
            _ => JobState::Pending,
        }
    }

    /// Output is a single string or a list whose first entry is used
    fn first_output(&self) -> Option<String> {
        match &self.output {
            Value::String(s) => Some(s.clone()),
            Value::Array(items) => items.iter().find_map(|v| v.as_str().map(str::to_string)),
            _ => None,
        }
    }

    fn error_text(&self) -> Option<String> {
        match &self.error {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::{FallbackOrchestrator, OrchestratorConfig};
    use crate::registry::{ProviderDescriptor, ProviderRegistry};
    use crate::types::{AttemptOutcome, TaskType};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_poll(max_polls: u32) -> PollSettings {
        PollSettings {
            max_polls,
            interval: Duration::from_millis(1),
        }
    }

    fn provider(server: &MockServer, poll: PollSettings) -> PredictionJobProvider {
        PredictionJobProvider::new(
            "token".to_string(),
            "video-model".to_string(),
            server.uri(),
            "video/mp4".to_string(),
            poll,
        )
        .unwrap()
    }

    fn args() -> InvokeArgs {
        InvokeArgs::Media(MediaArgs {
            prompt: "waves at sunset".to_string(),
            width: Some(640),
            height: Some(360),
        })
    }

    /// A job that never leaves "processing", with a cancel endpoint
    async fn stuck_job(server: &MockServer, id: &str) {
        Mock::given(method("POST"))
            .and(path("/v1/predictions"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "id": id, "status": "starting"
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/v1/predictions/{}", id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": id, "status": "processing"
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/v1/predictions/{}/cancel", id)))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
    }

    /// Cancel requests seen so far, waiting briefly for spawned ones to land
    async fn cancel_requests(server: &MockServer) -> usize {
        let mut seen = 0;
        for _ in 0..50 {
            seen = server
                .received_requests()
                .await
                .unwrap_or_default()
                .iter()
                .filter(|r| r.url.path().ends_with("/cancel"))
                .count();
            if seen > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        seen
    }

    fn video_orchestrator(provider: PredictionJobProvider, deadline: Duration) -> FallbackOrchestrator {
        let registry = ProviderRegistry::builder()
            .register(
                TaskType::Video,
                ProviderDescriptor::new("jobs", "Jobs", 0, Arc::new(provider)),
            )
            .build();
        FallbackOrchestrator::new(
            Arc::new(registry),
            OrchestratorConfig::default().with_task_timeout(TaskType::Video, deadline),
        )
    }

    #[test]
    fn test_default_poll_settings() {
        let poll = PollSettings::default();
        assert_eq!(poll.max_polls, 30);
        assert_eq!(poll.interval, Duration::from_millis(2000));
        assert_eq!(poll.budget(), Duration::from_secs(60));
    }

    #[test]
    fn test_parse_data_url() {
        let media = parse_data_url("data:video/mp4;base64,AQID").unwrap().unwrap();
        assert_eq!(media.mime_type, "video/mp4");
        assert_eq!(media.bytes, vec![1, 2, 3]);
        assert!(parse_data_url("https://cdn.example/out.mp4").is_none());
    }

    #[test]
    fn test_job_output_shapes() {
        let job: Job = serde_json::from_value(serde_json::json!({
            "id": "j", "status": "succeeded", "output": ["https://a", "https://b"]
        }))
        .unwrap();
        assert_eq!(job.first_output().as_deref(), Some("https://a"));
        assert_eq!(job.state(), JobState::Succeeded);

        let job: Job = serde_json::from_value(serde_json::json!({"id": "j", "status": "processing"})).unwrap();
        assert_eq!(job.first_output(), None);
        assert_eq!(job.state(), JobState::Pending);
    }

    #[tokio::test]
    async fn test_submit_poll_download() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/predictions"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "id": "job-1", "status": "starting"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/predictions/job-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "job-1",
                "status": "succeeded",
                "output": format!("{}/files/out.mp4", server.uri())
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/out.mp4"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "video/mp4")
                    .set_body_bytes(vec![0u8, 0, 0, 24]),
            )
            .mount(&server)
            .await;

        let payload = provider(&server, fast_poll(5)).invoke(&args()).await.unwrap();
        let media = payload.as_media().unwrap();
        assert_eq!(media.mime_type, "video/mp4");
        assert_eq!(media.bytes, vec![0, 0, 0, 24]);
    }

    #[tokio::test]
    async fn test_failed_job_reports_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/predictions"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "id": "job-2", "status": "failed", "error": "NSFW content detected"
            })))
            .mount(&server)
            .await;

        let err = provider(&server, fast_poll(5)).invoke(&args()).await.unwrap_err();
        assert!(err.to_string().contains("NSFW content detected"));
        assert!(!err.is_timeout());
    }

    #[tokio::test]
    async fn test_poll_ceiling_is_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/predictions"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "id": "job-3", "status": "starting"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/predictions/job-3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "job-3", "status": "processing"
            })))
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/predictions/job-3/cancel"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let err = provider(&server, fast_poll(3)).invoke(&args()).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_orchestrator_deadline_cancels_running_job() {
        let server = MockServer::start().await;
        stuck_job(&server, "job-4").await;
        let poll = PollSettings {
            max_polls: 30,
            interval: Duration::from_millis(20),
        };
        let orchestrator = video_orchestrator(provider(&server, poll), poll.budget());

        let err = orchestrator
            .execute(TaskType::Video, None, &args(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.attempts()[0].outcome, AttemptOutcome::Timeout);
        assert_eq!(cancel_requests(&server).await, 1);
    }

    #[tokio::test]
    async fn test_request_cancellation_cancels_running_job() {
        let server = MockServer::start().await;
        stuck_job(&server, "job-5").await;
        let poll = PollSettings {
            max_polls: 1000,
            interval: Duration::from_millis(10),
        };
        let orchestrator = video_orchestrator(provider(&server, poll), Duration::from_secs(60));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = orchestrator
            .execute(TaskType::Video, None, &args(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, crate::error::OrchestrationError::Cancelled { .. }));
        assert_eq!(cancel_requests(&server).await, 1);
    }

    #[tokio::test]
    async fn test_finished_job_is_not_cancelled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/predictions"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "id": "job-6", "status": "succeeded", "output": "data:video/mp4;base64,AQID"
            })))
            .mount(&server)
            .await;

        provider(&server, fast_poll(5)).invoke(&args()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cancel_requests(&server).await, 0);
    }
}
