//! Gateway HTTP protocol: JSON bodies exchanged with clients

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tandem_core::{AttemptOutcome, AttemptRecord, ContextStats, ProviderRegistry, TaskType};

/// One entry of the fallback chain as shown to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptSummary {
    pub provider_id: String,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&AttemptRecord> for AttemptSummary {
    fn from(record: &AttemptRecord) -> Self {
        Self {
            provider_id: record.provider_id.clone(),
            outcome: record.outcome,
            error: record.error_message.clone(),
        }
    }
}

pub fn summarize(attempts: &[AttemptRecord]) -> Vec<AttemptSummary> {
    attempts.iter().map(AttemptSummary::from).collect()
}

/// `POST /api/chat/complete`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatCompleteResponse {
    pub content: String,
    pub provider_used: String,
    pub attempts: Vec<AttemptSummary>,
    pub context: ContextStats,
    pub timestamp: DateTime<Utc>,
}

/// `POST /api/images` and `POST /api/videos`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaResponse {
    /// `data:<mime>;base64,<bytes>`
    pub media_payload: String,
    pub provider_used: String,
    pub attempts: Vec<AttemptSummary>,
    pub timestamp: DateTime<Utc>,
}

/// `POST /api/optimize`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextResponse {
    pub content: String,
    pub provider_used: String,
    pub attempts: Vec<AttemptSummary>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub id: String,
    pub display_name: String,
    pub priority: u32,
}

/// `GET /api/providers`: each task's chain in fallback order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersResponse {
    pub tasks: BTreeMap<TaskType, Vec<ProviderInfo>>,
}

impl ProvidersResponse {
    pub fn from_registry(registry: &ProviderRegistry) -> Self {
        let tasks = TaskType::ALL
            .into_iter()
            .map(|task| {
                let chain = registry
                    .providers(task)
                    .iter()
                    .map(|d| ProviderInfo {
                        id: d.id.clone(),
                        display_name: d.display_name.clone(),
                        priority: d.priority,
                    })
                    .collect();
                (task, chain)
            })
            .collect();
        Self { tasks }
    }
}

/// `GET /api/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub uptime_secs: u64,
    /// Registered providers per task
    pub providers: BTreeMap<TaskType, usize>,
}

/// Body of every non-2xx response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<Vec<AttemptSummary>>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            attempts: None,
        }
    }

    pub fn with_attempts(mut self, attempts: &[AttemptRecord]) -> Self {
        self.attempts = Some(summarize(attempts));
        self
    }
}
