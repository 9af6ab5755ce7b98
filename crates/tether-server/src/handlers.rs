//! HTTP handlers for the OpenAI-compatible surface.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde_json::json;
use tether_core::completion::ChatCompletionRequest;
use tether_core::ids::{CorrelationId, HistoryId, MessageId};
use tether_core::wire::OutboundFrame;
use tether_upstream::ConnectionState;

use crate::auth::mask_wallet;
use crate::error::ApiError;
use crate::server::AppState;

pub const COMPLETION_METHOD: &str = "completion/getCompletion";

/// Extract the wallet address from `Authorization: Bearer <wallet>`.
pub fn bearer_token(headers: &HeaderMap) -> Result<String, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("Invalid or missing Authorization header".into()))?;
    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::Unauthorized("Invalid or missing Authorization header".into()))?
        .trim();
    if token.is_empty() {
        return Err(ApiError::Unauthorized(
            "Missing wallet address in Authorization header".into(),
        ));
    }
    Ok(token.to_string())
}

/// Upstream frame for one chat completion request.
pub fn completion_frame(
    id: &CorrelationId,
    history_id: &HistoryId,
    provider: &str,
    request: &ChatCompletionRequest,
) -> OutboundFrame {
    let messages: Vec<_> = request
        .messages
        .iter()
        .map(|msg| {
            json!({
                "id": MessageId::new(),
                "role": msg.role,
                "content": msg.content,
                "model": request.model,
            })
        })
        .collect();

    OutboundFrame::new(
        COMPLETION_METHOD,
        json!({
            "provider": provider,
            "messages": messages,
            "model": request.model,
            "history_id": history_id,
            "stream": request.stream,
        }),
        id.clone(),
    )
}

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    let id = CorrelationId::new();
    tracing::info!(parent: &state.span, correlation_id = %id, model = %request.model, stream = request.stream, "Received chat completion request");
    tracing::debug!(parent: &state.span, correlation_id = %id, messages = request.messages.len(), "Request details");

    let wallet = bearer_token(&headers)?;
    if !state.auth.authenticate(&wallet).await {
        tracing::warn!(parent: &state.span, correlation_id = %id, wallet = %mask_wallet(&wallet), "Rejected unauthenticated wallet");
        return Err(ApiError::Forbidden("Wallet authentication failed".into()));
    }

    let provider = state
        .catalog
        .provider_for(&request.model)
        .ok_or_else(|| ApiError::BadRequest("Unsupported model".into()))?;

    let frame = completion_frame(&id, &HistoryId::new(), provider, &request);

    if request.stream {
        let events = state.gateway.handle_stream(&id, &frame).await?;
        let body = events.map(|event| Ok::<_, Infallible>(Event::default().data(event.sse_data())));
        Ok(Sse::new(body)
            .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
            .into_response())
    } else {
        let completion = state.gateway.handle_unary(&id, &frame).await.map_err(|e| {
            tracing::error!(parent: &state.span, correlation_id = %id, error = %e, kind = e.error_kind(), "Chat completion failed");
            e
        })?;
        Ok(Json(completion).into_response())
    }
}

/// `GET /v1/models`
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.catalog.models())
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let supervisor = state.gateway.supervisor();
    let upstream = supervisor.state();
    let healthy = upstream == ConnectionState::Connected;

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "upstream": upstream.as_str(),
        "retries": supervisor.retry_count(),
        "pending": state.gateway.registry().len(),
    });
    (status, Json(body))
}
