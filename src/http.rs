//! HTTP surface: the messages endpoint plus a health probe. Admission runs
//! detached from the handler so waits can stream keep-alive pings; the
//! handler just waits for the pipeline's decision.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::entities::EntityStore;
use crate::pipeline::AdmissionPipeline;
use crate::sse::{Decision, PingFormat, ReplyChannel};
use crate::store::SlotStore;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<AdmissionPipeline>,
    pub entities: Arc<dyn EntityStore>,
    pub store: SlotStore,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(messages))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> Response {
    match state.store.ping().await {
        Ok(()) => Json(json!({"status": "ok"})).into_response(),
        Err(err) => {
            tracing::warn!(%err, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "degraded", "store": err.to_string()})),
            )
                .into_response()
        }
    }
}

async fn messages(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return error_response(StatusCode::UNAUTHORIZED, "authentication_error", "Invalid API key");
    };
    let auth = match state.entities.resolve_key(&token).await {
        Ok(Some(auth)) => auth,
        Ok(None) => {
            return error_response(
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "Invalid API key",
            );
        }
        Err(err) => {
            tracing::error!(%err, "api key lookup failed");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "api_error",
                "User context not found",
            );
        }
    };

    // The reply channel needs the stream flag before the pipeline parses the
    // body in earnest.
    let is_stream = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|value| value.get("stream").and_then(serde_json::Value::as_bool))
        .unwrap_or(false);

    let (reply, receiver) = ReplyChannel::pair(is_stream, PingFormat::Claude);

    // Client disconnect cancels every wait in the pipeline.
    let cancel = CancellationToken::new();
    let watch = reply.disconnect_signal();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            watch.closed().await;
            cancel.cancel();
        });
    }

    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        pipeline.handle_messages(auth, headers, body, reply, cancel).await;
    });

    match receiver.decision.await {
        Ok(Decision::Json { status, body }) => (status, Json(body)).into_response(),
        Ok(Decision::Stream { status, headers }) => {
            let stream = futures_util::stream::unfold(receiver.body, |mut rx| async move {
                rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
            });
            let mut response = Response::new(Body::from_stream(stream));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            response
        }
        Err(_) => {
            tracing::error!("pipeline dropped without a decision");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "api_error", "Internal error")
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers.get("x-api-key").and_then(|value| value.to_str().ok()) {
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .map(|token| token.to_string())
}

fn error_response(status: StatusCode, error_type: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "type": "error",
            "error": {"type": error_type, "message": message},
        })),
    )
        .into_response()
}
