//! Fallback orchestration across the providers registered for a task
//!
//! Providers are tried strictly one after another in registry order. Each gets
//! a single call bounded by a deadline; the first success ends the chain.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AggregateFailure, OrchestrationError, ProviderError};
use crate::providers::{ChunkStream, InvokeArgs, Provider};
use crate::registry::ProviderRegistry;
use crate::types::{AttemptOutcome, AttemptRecord, GenerationResult, TaskType};

const CANCELLED: &str = "cancelled";

/// Per-attempt deadlines
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub attempt_timeout: Duration,
    pub task_timeouts: HashMap<TaskType, Duration>,
    /// Longest silence allowed between chunks of an open stream
    pub idle_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(60),
            task_timeouts: HashMap::new(),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_task_timeout(mut self, task: TaskType, timeout: Duration) -> Self {
        self.task_timeouts.insert(task, timeout);
        self
    }

    pub fn timeout_for(&self, task: TaskType) -> Duration {
        self.task_timeouts
            .get(&task)
            .copied()
            .unwrap_or(self.attempt_timeout)
    }
}

/// A stream that opened successfully, with the chain that led to it
pub struct StreamingResult {
    pub stream: ChunkStream,
    pub provider_used: String,
    pub attempts: Vec<AttemptRecord>,
}

impl std::fmt::Debug for StreamingResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingResult")
            .field("provider_used", &self.provider_used)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Sequential try-next-on-failure driver over a [`ProviderRegistry`]
#[derive(Clone)]
pub struct FallbackOrchestrator {
    registry: Arc<ProviderRegistry>,
    config: OrchestratorConfig,
}

impl FallbackOrchestrator {
    pub fn new(registry: Arc<ProviderRegistry>, config: OrchestratorConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run `args` through the chain for `task` and return the first complete payload
    pub async fn execute(
        &self,
        task: TaskType,
        preferred: Option<&str>,
        args: &InvokeArgs,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult, OrchestrationError> {
        let (payload, provider_used, attempts) = self
            .run_chain(task, preferred, cancel, |provider| async move {
                provider.invoke(args).await
            })
            .await?;
        Ok(GenerationResult {
            payload,
            provider_used,
            attempts,
        })
    }

    /// Like [`execute`](Self::execute), but an attempt is opening a live stream.
    /// Once a stream opens the chain is over; later failures are the caller's.
    pub async fn execute_streaming(
        &self,
        task: TaskType,
        preferred: Option<&str>,
        args: &InvokeArgs,
        cancel: &CancellationToken,
    ) -> Result<StreamingResult, OrchestrationError> {
        let (stream, provider_used, attempts) = self
            .run_chain(task, preferred, cancel, |provider| async move {
                provider.invoke_streaming(args).await
            })
            .await?;
        Ok(StreamingResult {
            stream,
            provider_used,
            attempts,
        })
    }

    async fn run_chain<T, F, Fut>(
        &self,
        task: TaskType,
        preferred: Option<&str>,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<(T, String, Vec<AttemptRecord>), OrchestrationError>
    where
        F: FnMut(Arc<dyn Provider>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let order = self.registry.get_order(task, preferred);
        let deadline = self.config.timeout_for(task);
        let mut attempts: Vec<AttemptRecord> = Vec::with_capacity(order.len());
        let mut last_error: Option<String> = None;

        for (idx, descriptor) in order.iter().enumerate() {
            if cancel.is_cancelled() {
                debug!("{} chain cancelled before trying {}", task, descriptor.id);
                return Err(OrchestrationError::Cancelled { attempts });
            }

            debug!(
                "Trying {} provider {} ({}/{})",
                task,
                descriptor.id,
                idx + 1,
                order.len()
            );
            let started_at = Utc::now();

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = tokio::time::timeout(deadline, call(descriptor.provider.clone())) => Some(result),
            };

            let result = match outcome {
                None => {
                    info!("{} request cancelled while {} was in flight", task, descriptor.id);
                    attempts.push(AttemptRecord::failed(
                        &descriptor.id,
                        started_at,
                        AttemptOutcome::Failure,
                        CANCELLED,
                    ));
                    return Err(OrchestrationError::Cancelled { attempts });
                }
                Some(Ok(result)) => result,
                Some(Err(_)) => Err(ProviderError::Timeout(deadline)),
            };

            match result {
                Ok(value) => {
                    attempts.push(AttemptRecord::success(&descriptor.id, started_at));
                    if idx > 0 {
                        info!(
                            "{} request succeeded on fallback provider {} after {} failure(s)",
                            task, descriptor.id, idx
                        );
                    }
                    return Ok((value, descriptor.id.clone(), attempts));
                }
                Err(e) => {
                    let outcome = if e.is_timeout() {
                        AttemptOutcome::Timeout
                    } else {
                        AttemptOutcome::Failure
                    };
                    let message = e.to_string();
                    warn!("{} provider {} failed ({:?}): {}", task, descriptor.id, outcome, message);
                    attempts.push(AttemptRecord::failed(
                        &descriptor.id,
                        started_at,
                        outcome,
                        message.clone(),
                    ));
                    last_error = Some(message);
                }
            }
        }

        Err(AggregateFailure {
            task,
            attempts,
            last_error_message: last_error
                .unwrap_or_else(|| format!("no providers configured for {}", task)),
        }
        .into())
    }
}
