//! Axum route handlers for the OpenAI-compatible surface. Each handler
//! builds the right `ResponseSink`, drives the matching engine function, and
//! turns the result into an HTTP response.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chat_engine::handle_chat;
use crate::error::CoreError;
use crate::image_engine::{handle_image_generation, handle_video_generation};
use crate::models::{is_image_model, is_text_model, is_video_model, list_models as model_listing};
use crate::router::stream_body;
use crate::sink::{JsonSink, SseSink};
use crate::state::Runtime;
use chatrelay_protocol::openai::chat::CreateChatCompletionRequestBody;
use chatrelay_protocol::openai::images::CreateImageRequestBody;
use chatrelay_protocol::openai::videos::CreateVideoRequestBody;

pub async fn chat_completions(
    State(runtime): State<Arc<Runtime>>,
    Json(request): Json<CreateChatCompletionRequestBody>,
) -> Response {
    let started = Instant::now();
    let model = request.model.clone();
    if !is_text_model_or_variant(&model) {
        return CoreError::BadRequest(format!("unknown model \"{model}\"")).into_response();
    }

    let id = format!("chatcmpl-{}", Uuid::new_v4());
    let created = current_unix_timestamp();

    if request.stream.unwrap_or(false) {
        return stream_chat_completion(request, model, id, created, started, runtime).await;
    }

    let mut sink = JsonSink::new(id, model.clone(), created);
    let result = handle_chat(request, &mut sink, &runtime).await.map(|()| sink.into_response());

    match result {
        Ok(response) => {
            info!(event = "request_complete", op = "chat", model = %model, elapsed_ms = started.elapsed().as_millis() as u64);
            Json(response).into_response()
        }
        Err(err) => {
            warn!(event = "request_failed", op = "chat", model = %model, error = %err, elapsed_ms = started.elapsed().as_millis() as u64);
            err.into_response()
        }
    }
}

/// Runs `handle_chat` on its own task feeding `sink`'s channel, and drains
/// only the first frame here before committing to a response: a turn that
/// fails before ever emitting anything still gets a plain JSON error with
/// the right status, while one that has already streamed content closes as
/// the spec requires (stream kept open, error surfaced as a final chunk by
/// the engine itself). Producer and HTTP body consumer run concurrently
/// from this point on, so a long turn can never fill the bounded channel
/// and deadlock waiting for a reader that only shows up after completion.
async fn stream_chat_completion(
    request: CreateChatCompletionRequestBody,
    model: String,
    id: String,
    created: i64,
    started: Instant,
    runtime: Arc<Runtime>,
) -> Response {
    let (sender, mut receiver) = tokio::sync::mpsc::channel(64);
    let (result_tx, result_rx) = tokio::sync::oneshot::channel();
    let task_model = model.clone();
    tokio::spawn(async move {
        let mut sink = SseSink::new(id, task_model, created, sender);
        let outcome = handle_chat(request, &mut sink, &runtime).await;
        let _ = result_tx.send(outcome);
    });

    match receiver.recv().await {
        Some(first) => {
            info!(event = "request_stream_started", op = "chat", model = %model, elapsed_ms = started.elapsed().as_millis() as u64);
            let rest = tokio_stream::wrappers::ReceiverStream::new(receiver);
            stream_body(futures_util::stream::once(async move { first }).chain(rest))
        }
        None => {
            let err = match result_rx.await {
                Ok(Err(err)) => err,
                _ => CoreError::ServerError,
            };
            warn!(event = "request_failed", op = "chat", model = %model, error = %err, elapsed_ms = started.elapsed().as_millis() as u64);
            err.into_response()
        }
    }
}

pub async fn image_generations(
    State(runtime): State<Arc<Runtime>>,
    Json(request): Json<CreateImageRequestBody>,
) -> Response {
    let model = request.model.clone();
    if !is_image_model(&model) {
        return CoreError::BadRequest(format!("unknown image model \"{model}\"")).into_response();
    }
    match handle_image_generation(request, &runtime).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn video_generations(
    State(runtime): State<Arc<Runtime>>,
    Json(request): Json<CreateVideoRequestBody>,
) -> Response {
    let model = request.model.clone();
    if !is_video_model(&model) {
        return CoreError::BadRequest(format!("unknown video model \"{model}\"")).into_response();
    }
    match handle_video_generation(request, &runtime).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn list_models() -> Response {
    Json(model_listing()).into_response()
}

fn is_text_model_or_variant(model: &str) -> bool {
    is_text_model(model) || model.strip_suffix("-search").is_some_and(is_text_model)
}

fn current_unix_timestamp() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_suffixed_models_are_accepted_when_the_base_model_is_a_text_model() {
        let text_model = crate::models::TEXT_MODELS[0];
        assert!(is_text_model_or_variant(text_model));
        assert!(is_text_model_or_variant(&format!("{text_model}-search")));
        assert!(!is_text_model_or_variant("not-a-real-model"));
        assert!(!is_text_model_or_variant("not-a-real-model-search"));
    }
}
