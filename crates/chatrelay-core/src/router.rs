use std::sync::Arc;

use axum::body::Body;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::handler;
use crate::state::Runtime;

pub fn build_router(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handler::chat_completions))
        .route("/v1/images/generations", post(handler::image_generations))
        .route("/v1/videos/generations", post(handler::video_generations))
        .route("/v1/models", get(handler::list_models))
        .layer(middleware::from_fn_with_state(runtime.clone(), require_api_key))
        .with_state(runtime)
}

async fn require_api_key(
    axum::extract::State(runtime): axum::extract::State<Arc<Runtime>>,
    headers: axum::http::HeaderMap,
    req: axum::http::Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    runtime.auth.authenticate(&headers).map_err(|_| StatusCode::UNAUTHORIZED)?;
    Ok(next.run(req).await)
}

/// Wraps a stream of already-framed SSE bytes into an axum response body, so
/// the engine never needs to know it's being driven from behind an HTTP
/// layer. The caller drives production concurrently with this body being
/// read (see `handler::chat_completions`) rather than buffering a full turn
/// first.
pub fn stream_body(frames: impl Stream<Item = Bytes> + Send + 'static) -> Response {
    let stream = frames.map(Ok::<_, std::convert::Infallible>);
    let body = Body::from_stream(stream);
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(body)
        .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "failed to build stream response").into_response())
}

pub fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response {
    (status, Json(serde_json::to_value(value).unwrap_or_default())).into_response()
}
