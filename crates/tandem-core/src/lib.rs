//! tandem-core - Multi-provider generation pipeline
//!
//! This crate provides:
//! - Token estimation and context truncation for chat histories
//! - A read-only provider registry keyed by task type
//! - Sequential fallback orchestration with per-attempt deadlines and cancellation
//! - A pull-based stream relay and the `data: <json>` envelope codec
//! - Provider adapters for OpenAI-compatible, Anthropic, image and prediction-job backends
//! - The request handler that ties them together per incoming turn

pub mod context;
pub mod error;
pub mod fallback;
pub mod handler;
pub mod providers;
pub mod registry;
pub mod relay;
pub mod tokens;
pub mod types;
pub mod wire;

// Re-export main types for convenience
pub use context::{ContextConfig, ContextPolicy, ContextStats, ContextStrategy};
pub use error::{
    AggregateFailure, ErrorClass, HandlerError, OrchestrationError, ProviderError, ValidationError,
};
pub use fallback::{FallbackOrchestrator, OrchestratorConfig, StreamingResult};
pub use handler::{
    ChatCompletion, ChatStream, ChatTurn, GenerationTurn, InputLimits, MediaResult, OptimizeTurn,
    RequestHandler, TextResult,
};
pub use providers::{ChatArgs, ChunkStream, InvokeArgs, MediaArgs, Provider};
pub use registry::{ProviderDescriptor, ProviderRegistry, RegistryBuilder};
pub use types::{
    AttemptOutcome, AttemptRecord, GenerationResult, MediaPayload, Message, Payload, Role, TaskType,
};
pub use wire::{Envelope, EnvelopeKind, FrameDecoder};
