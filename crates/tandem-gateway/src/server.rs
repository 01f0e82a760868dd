//! Gateway HTTP server: Axum routes over a shared [`RequestHandler`]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use tandem_core::error::ErrorClass;
use tandem_core::wire::encode_frame;
use tandem_core::{
    ChatTurn, GenerationTurn, HandlerError, MediaResult, OptimizeTurn, OrchestrationError,
    RequestHandler, TaskType,
};

use crate::protocol::{
    ChatCompleteResponse, ErrorBody, MediaResponse, ProvidersResponse, StatusResponse,
    TextResponse, summarize,
};

pub const PROVIDER_USED_HEADER: &str = "x-provider-used";

/// Shared state for all requests
#[derive(Clone)]
pub struct GatewayState {
    pub handler: Arc<RequestHandler>,
    pub start_time: Instant,
}

/// The gateway server
pub struct GatewayServer {
    state: GatewayState,
    bind: SocketAddr,
}

impl GatewayServer {
    pub fn new(bind: SocketAddr, handler: RequestHandler) -> Self {
        let state = GatewayState {
            handler: Arc::new(handler),
            start_time: Instant::now(),
        };
        Self { state, bind }
    }

    pub fn handler(&self) -> &Arc<RequestHandler> {
        &self.state.handler
    }

    /// Build the Axum router
    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(self.bind).await?;
        info!("Gateway listening on {}", self.bind);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("Gateway shutting down");
            })
            .await?;

        Ok(())
    }

    /// Start the server in the background, returning a handle
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/api/chat", post(chat_stream_handler))
        .route("/api/chat/complete", post(chat_complete_handler))
        .route("/api/images", post(image_handler))
        .route("/api/videos", post(video_handler))
        .route("/api/optimize", post(optimize_handler))
        .route("/api/providers", get(providers_handler))
        .route("/api/status", get(status_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Errors ──

/// Anything a route can fail with, rendered as `{error, attempts?}`
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Handler(HandlerError),
}

impl From<HandlerError> for ApiError {
    fn from(err: HandlerError) -> Self {
        Self::Handler(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    fn status_and_body(&self) -> (StatusCode, ErrorBody) {
        match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, ErrorBody::new(message.clone())),
            Self::Handler(HandlerError::Validation(e)) => (StatusCode::BAD_REQUEST, ErrorBody::new(e.to_string())),
            Self::Handler(HandlerError::Orchestration(OrchestrationError::Exhausted(failure))) => {
                if failure.attempts.is_empty() {
                    return (
                        StatusCode::SERVICE_UNAVAILABLE,
                        ErrorBody::new(format!("No providers are configured for {}", failure.task)),
                    );
                }
                let class = failure.classify();
                let status = match class {
                    ErrorClass::Credential => StatusCode::SERVICE_UNAVAILABLE,
                    ErrorClass::RateLimit => StatusCode::TOO_MANY_REQUESTS,
                    ErrorClass::Timeout | ErrorClass::Unclassified => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let body = ErrorBody::new(class.user_message(&failure.last_error_message))
                    .with_attempts(&failure.attempts);
                (status, body)
            }
            Self::Handler(HandlerError::Orchestration(OrchestrationError::Cancelled { attempts })) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody::new("Request cancelled").with_attempts(attempts),
            ),
            Self::Handler(e @ HandlerError::UnexpectedPayload { .. }) => {
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorBody::new(e.to_string()))
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = self.status_and_body();
        if status.is_server_error() {
            warn!("Request failed ({}): {}", status, body.error);
        } else {
            debug!("Request rejected ({}): {}", status, body.error);
        }
        (status, Json(body)).into_response()
    }
}

// ── Handlers ──

async fn chat_stream_handler(
    State(state): State<GatewayState>,
    payload: Result<Json<ChatTurn>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(turn) = payload?;
    let cancel = CancellationToken::new();
    // Dropped with the response body, i.e. when the client goes away
    let guard = cancel.clone().drop_guard();

    let chat = state.handler.stream_chat(&turn, cancel).await?;
    info!(
        "Streaming chat from {} after {} attempt(s)",
        chat.provider_used,
        chat.attempts.len()
    );

    let frames = chat.envelopes.map(move |envelope| {
        let _guard = &guard;
        Ok::<_, Infallible>(encode_frame(&envelope))
    });

    let mut response = (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Body::from_stream(frames),
    )
        .into_response();

    match HeaderValue::from_str(&chat.provider_used) {
        Ok(value) => {
            response.headers_mut().insert(PROVIDER_USED_HEADER, value);
        }
        Err(_) => warn!("Provider id {:?} is not a valid header value", chat.provider_used),
    }
    Ok(response)
}

async fn chat_complete_handler(
    State(state): State<GatewayState>,
    payload: Result<Json<ChatTurn>, JsonRejection>,
) -> Result<Json<ChatCompleteResponse>, ApiError> {
    let Json(turn) = payload?;
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let done = state.handler.complete_chat(&turn, &cancel).await?;
    Ok(Json(ChatCompleteResponse {
        content: done.message.content,
        provider_used: done.provider_used,
        attempts: summarize(&done.attempts),
        context: done.context,
        timestamp: done.message.timestamp,
    }))
}

async fn image_handler(
    State(state): State<GatewayState>,
    payload: Result<Json<GenerationTurn>, JsonRejection>,
) -> Result<Json<MediaResponse>, ApiError> {
    media(state, TaskType::Image, payload).await
}

async fn video_handler(
    State(state): State<GatewayState>,
    payload: Result<Json<GenerationTurn>, JsonRejection>,
) -> Result<Json<MediaResponse>, ApiError> {
    media(state, TaskType::Video, payload).await
}

async fn media(
    state: GatewayState,
    task: TaskType,
    payload: Result<Json<GenerationTurn>, JsonRejection>,
) -> Result<Json<MediaResponse>, ApiError> {
    let Json(turn) = payload?;
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let MediaResult {
        media,
        provider_used,
        attempts,
    } = match task {
        TaskType::Video => state.handler.generate_video(&turn, &cancel).await?,
        _ => state.handler.generate_image(&turn, &cancel).await?,
    };
    Ok(Json(MediaResponse {
        media_payload: media.to_data_url(),
        provider_used,
        attempts: summarize(&attempts),
        timestamp: Utc::now(),
    }))
}

async fn optimize_handler(
    State(state): State<GatewayState>,
    payload: Result<Json<OptimizeTurn>, JsonRejection>,
) -> Result<Json<TextResponse>, ApiError> {
    let Json(turn) = payload?;
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let result = state.handler.optimize_text(&turn, &cancel).await?;
    Ok(Json(TextResponse {
        content: result.content,
        provider_used: result.provider_used,
        attempts: summarize(&result.attempts),
        timestamp: Utc::now(),
    }))
}

async fn providers_handler(State(state): State<GatewayState>) -> Json<ProvidersResponse> {
    Json(ProvidersResponse::from_registry(state.handler.registry()))
}

async fn status_handler(State(state): State<GatewayState>) -> Json<StatusResponse> {
    let registry = state.handler.registry();
    Json(StatusResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        providers: TaskType::ALL
            .into_iter()
            .map(|task| (task, registry.len(task)))
            .collect(),
    })
}
