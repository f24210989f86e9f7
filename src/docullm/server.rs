//! HTTP surface for the orchestrator (requires the `http-server` feature).
//!
//! Routes:
//!
//! - `POST /llm/query`: run a turn, return the [`LLMResponse`] as JSON
//! - `POST /llm/stream`: run a turn as an SSE session
//! - `GET /llm/templates`: template catalog metadata
//! - `GET /llm/capabilities`: the active provider's capability record
//!
//! Non-2xx bodies carry `{"error_kind": ..., "message": ...}`. When a bearer
//! token is configured every route requires `Authorization: Bearer <token>`,
//! compared in constant time. Request-level concurrency is bounded by a
//! global limit layer; within a turn the orchestrator is cooperative.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::Stream;
use futures_util::StreamExt;
use subtle::ConstantTimeEq;
use tower::limit::GlobalConcurrencyLimitLayer;

use crate::docullm::error::{CoreError, ErrorKind};
use crate::docullm::orchestrator::{validate_request, QueryOrchestrator, QueryRequest};
use crate::docullm::streaming::{event_channel, StreamEvent};

/// Default bound on concurrently executing requests.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 64;

/// Shared state behind the routes.
pub struct AppState {
    /// The per-process orchestrator.
    pub orchestrator: Arc<QueryOrchestrator>,
    /// Optional shared-secret bearer token protecting the surface.
    pub bearer_token: Option<String>,
}

/// Build the router for the `/llm` surface.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/llm/query", post(query_handler))
        .route("/llm/stream", post(stream_handler))
        .route("/llm/templates", get(templates_handler))
        .route("/llm/capabilities", get(capabilities_handler))
        .layer(GlobalConcurrencyLimitLayer::new(
            DEFAULT_MAX_CONCURRENT_REQUESTS,
        ))
        .with_state(state)
}

/// Serve the router until the process exits.
pub async fn serve(addr: std::net::SocketAddr, state: Arc<AppState>) -> Result<(), CoreError> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        CoreError::new(ErrorKind::Unknown, format!("failed to bind {}", addr)).with_source(e)
    })?;
    log::info!("llm surface listening on {}", addr);
    axum::serve(listener, router(state))
        .await
        .map_err(|e| CoreError::new(ErrorKind::Unknown, "server terminated").with_source(e))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn query_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let turn_id = uuid::Uuid::new_v4();
    if log::log_enabled!(log::Level::Debug) {
        log::debug!("turn {} started (prompt {} chars)", turn_id, request.prompt.len());
    }
    match state.orchestrator.query(&request).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => {
            log::warn!("turn {} failed: {}", turn_id, err);
            error_response(&err)
        }
    }
}

async fn stream_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    // Shape errors are reported with a proper status; anything that fails
    // once the stream is open becomes an error frame instead.
    if let Err(err) = validate_request(&request) {
        return error_response(&err);
    }

    let (events, event_stream) = event_channel();
    let orchestrator = state.orchestrator.clone();
    let turn_id = uuid::Uuid::new_v4();
    tokio::spawn(async move {
        if let Err(err) = orchestrator.stream(&request, events).await {
            if log::log_enabled!(log::Level::Debug) {
                log::debug!("streamed turn {} ended with error: {}", turn_id, err);
            }
        }
    });

    Sse::new(sse_frames(event_stream))
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn templates_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    Json(state.orchestrator.templates().catalog()).into_response()
}

async fn capabilities_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    Json(state.orchestrator.capabilities()).into_response()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn sse_frames(
    events: impl Stream<Item = StreamEvent> + Send + 'static,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    events.map(|event| Ok(Event::default().data(event.to_json().to_string())))
}

/// Constant-time bearer check; a missing configured token means open access.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let expected = match &state.bearer_token {
        Some(token) => token,
        None => return Ok(()),
    };
    let supplied = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    if supplied.as_bytes().ct_eq(expected.as_bytes()).into() {
        Ok(())
    } else {
        Err(error_response(&CoreError::new(
            ErrorKind::Auth,
            "missing or invalid bearer token",
        )))
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidRequest
        | ErrorKind::TemplateError
        | ErrorKind::InvalidArguments
        | ErrorKind::ContextOverflow => StatusCode::BAD_REQUEST,
        ErrorKind::Auth => StatusCode::UNAUTHORIZED,
        ErrorKind::NotFound | ErrorKind::ToolNotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::RateLimited | ErrorKind::ProviderRateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::ProviderTimeout | ErrorKind::ToolTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::ProviderUnavailable | ErrorKind::ProviderProtocol | ErrorKind::Network => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &CoreError) -> Response {
    let body = serde_json::json!({
        "error_kind": err.kind.as_str(),
        "message": err.message,
    });
    (status_for(err.kind), Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_covers_the_caller_facing_kinds() {
        assert_eq!(status_for(ErrorKind::InvalidRequest), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::TemplateError), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::Auth), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_for(ErrorKind::ProviderRateLimited),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(ErrorKind::ProviderTimeout),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(status_for(ErrorKind::Unknown), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn bearer_check_is_exact() {
        let state = AppState {
            orchestrator: Arc::new(
                crate::docullm::config::CoreConfig::default()
                    .build_orchestrator()
                    .unwrap(),
            ),
            bearer_token: Some("secret".to_string()),
        };

        let mut headers = HeaderMap::new();
        assert!(authorize(&state, &headers).is_err());

        headers.insert("authorization", "Bearer secret".parse().unwrap());
        assert!(authorize(&state, &headers).is_ok());

        headers.insert("authorization", "Bearer secreX".parse().unwrap());
        assert!(authorize(&state, &headers).is_err());
    }

    #[test]
    fn open_access_without_configured_token() {
        let state = AppState {
            orchestrator: Arc::new(
                crate::docullm::config::CoreConfig::default()
                    .build_orchestrator()
                    .unwrap(),
            ),
            bearer_token: None,
        };
        assert!(authorize(&state, &HeaderMap::new()).is_ok());
    }
}
