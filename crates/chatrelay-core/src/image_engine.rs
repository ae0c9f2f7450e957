//! C9: two-phase image/video generation. A job is submitted the same way a
//! chat turn is, then polled on a separate status endpoint until every task
//! id the submission produced has resolved.

use std::time::Duration;

use base64::Engine;
use chatrelay_protocol::openai::images::{CreateImageRequestBody, CreateImageResponse, ImageData, ImageResponseFormat};
use chatrelay_protocol::openai::videos::{CreateVideoRequestBody, CreateVideoResponse, VideoData};
use chatrelay_upstream::{classify, SseStream, TaskStatus, UnavailableReason, UpstreamError, UpstreamEvent, UpstreamHttpClient};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;
use wreq::Method;

use crate::error::CoreError;
use crate::janitor::{schedule_cleanup, JanitorContext};
use crate::preprocessor::sniff_mime;
use crate::state::Runtime;
use crate::wire::{query_string, UpstreamChatBody, UpstreamExtraData, UpstreamMessage, UpstreamTaskStatusBody};

const UPSTREAM_ASK_PATH: &str = "/api/copilot/ask";
const UPSTREAM_TASK_STATUS_PATH: &str = "/api/ig_tasks_status";
const POLL_ATTEMPTS: u32 = 60;
const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Image,
    Video,
}

impl JobKind {
    fn wire_kind(self) -> &'static str {
        match self {
            JobKind::Image => "generate_image",
            JobKind::Video => "generate_video",
        }
    }
}

pub async fn handle_image_generation(
    request: CreateImageRequestBody,
    runtime: &Runtime,
) -> Result<CreateImageResponse, CoreError> {
    let action_params = json!({});
    let urls = run_generation_job(runtime, JobKind::Image, &request.model, &request.prompt, request.image.as_deref(), action_params).await?;
    let wants_b64 = matches!(request.response_format, Some(ImageResponseFormat::B64Json));
    let mut data = Vec::with_capacity(urls.len());
    for url in urls {
        data.push(if wants_b64 {
            let (mime, encoded) = fetch_and_encode(runtime, &url).await?;
            ImageData { url: None, b64_json: Some(encoded), revised_prompt: None }.with_mime_hint(mime)
        } else {
            ImageData { url: Some(url), b64_json: None, revised_prompt: None }
        });
    }
    Ok(CreateImageResponse { created: current_unix_timestamp(), data })
}

pub async fn handle_video_generation(
    request: CreateVideoRequestBody,
    runtime: &Runtime,
) -> Result<CreateVideoResponse, CoreError> {
    let action_params = json!({
        "aspect_ratio": request.aspect_ratio,
        "duration": request.duration,
        "auto_prompt": request.auto_prompt,
    });
    let urls = run_generation_job(runtime, JobKind::Video, &request.model, &request.prompt, request.image.as_deref(), action_params).await?;
    let data = urls.into_iter().map(|url| VideoData { url: Some(url), b64_json: None }).collect();
    Ok(CreateVideoResponse { created: current_unix_timestamp(), data })
}

/// Submits one generation job and polls until every task id it produced has
/// resolved, returning the `SUCCESS` urls in submission order. Bounded by
/// the pool's size at entry, exactly like the chat engine's retry loop.
async fn run_generation_job(
    runtime: &Runtime,
    kind: JobKind,
    model: &str,
    prompt: &str,
    source_image: Option<&str>,
    action_params: serde_json::Value,
) -> Result<Vec<String>, CoreError> {
    let trace_id = Uuid::new_v4();
    let total_credentials = runtime.pool.total_size().await;
    if total_credentials == 0 {
        return Err(CoreError::NoCredentials);
    }

    let mut picked_first = false;
    for attempt in 0..total_credentials {
        let selection = if !picked_first {
            picked_first = true;
            runtime.pool.random().await
        } else {
            runtime.pool.next().await
        };
        let Ok((credential_id, credential)) = selection else { break };

        info!(event = "generation_attempt", trace_id = %trace_id, op = ?kind, model, credential_id, attempt, "submitting generation job");

        let content = match source_image {
            Some(image) => json!([{ "type": "text", "text": prompt }, { "type": "image_url", "image_url": { "url": image } }]),
            None => serde_json::Value::String(prompt.to_string()),
        };
        let body = UpstreamChatBody {
            kind: kind.wire_kind().to_string(),
            current_query_string: query_string(None, kind.wire_kind()),
            messages: vec![UpstreamMessage { role: "user".to_string(), content }],
            action_params: action_params.clone(),
            extra_data: UpstreamExtraData {
                models: vec![model.to_string()],
                run_with_another_model: false,
                request_web_knowledge: None,
            },
            g_recaptcha_token: None,
        };
        let body_bytes = serde_json::to_vec(&body).map_err(|err| CoreError::BadRequest(err.to_string()))?;
        let url = format!("https://www.genspark.ai{UPSTREAM_ASK_PATH}");

        let mut stream = match dial_sse_retrying_transport_error(&runtime.http, &url, &credential.value, body_bytes).await {
            Ok(stream) => stream,
            Err(_) => continue,
        };

        let mut project_id: Option<String> = None;
        let mut task_ids: Vec<String> = Vec::new();
        let mut credential_fault = false;

        'submit: loop {
            let Some(event_result) = stream.next_event().await else { break 'submit };
            let event = match event_result {
                Ok(event) => event,
                Err(_) => break 'submit,
            };
            match classify(&event.data) {
                UpstreamEvent::RateLimited => {
                    runtime.pool.cooldown(credential_id, runtime.rate_limit_cooldown, UnavailableReason::RateLimit).await;
                    credential_fault = true;
                    break 'submit;
                }
                UpstreamEvent::FreeQuotaExhausted => {
                    runtime.pool.cooldown(credential_id, Duration::from_secs(86_400), UnavailableReason::FreeQuotaExhausted).await;
                    credential_fault = true;
                    break 'submit;
                }
                UpstreamEvent::NotLoggedIn => {
                    runtime.pool.remove(credential_id).await;
                    credential_fault = true;
                    break 'submit;
                }
                UpstreamEvent::CloudflareChallenge => return Err(CoreError::CloudflareChallenge),
                UpstreamEvent::CloudflareBlock => return Err(CoreError::CloudflareBlock),
                UpstreamEvent::ServiceUnavailable => return Err(CoreError::ServiceUnavailable),
                UpstreamEvent::ServerError => return Err(CoreError::ServerError),
                UpstreamEvent::ServerOverloaded => return Err(CoreError::ServerOverloaded),
                UpstreamEvent::ProjectStart { id } => project_id = Some(id),
                UpstreamEvent::GeneratedImages { task_ids: ids } => {
                    task_ids = ids;
                    break 'submit;
                }
                _ => {}
            }
        }

        if credential_fault {
            continue;
        }
        if task_ids.is_empty() {
            continue;
        }

        let urls = match poll_task_status(runtime, credential_id, &credential.value, &task_ids).await? {
            PollOutcome::Success(urls) => urls,
            PollOutcome::CredentialFault => continue,
        };

        if let Some(project_id) = project_id {
            schedule_cleanup(JanitorContext {
                http: runtime.http.clone(),
                sessions: runtime.sessions.clone(),
                mode: runtime.janitor_mode(),
                cookie: credential.value.clone(),
                credential_id,
                model: model.to_string(),
                project_id,
                image_session_ids: runtime.image_session_ids.clone(),
            });
        }

        return Ok(urls);
    }

    Err(CoreError::AllCredentialsUnavailable)
}

/// The outcome of draining the poll loop: either the tasks resolved, or a
/// credential fault was seen and already handled (cooldown/removal applied)
/// so the caller should rotate and resubmit rather than keep polling.
enum PollOutcome {
    Success(Vec<String>),
    CredentialFault,
}

async fn poll_task_status(
    runtime: &Runtime,
    credential_id: chatrelay_upstream::CredentialId,
    cookie: &str,
    task_ids: &[String],
) -> Result<PollOutcome, CoreError> {
    let body = UpstreamTaskStatusBody { task_ids: task_ids.to_vec() };
    let body_bytes = serde_json::to_vec(&body).map_err(|err| CoreError::BadRequest(err.to_string()))?;
    let url = format!("https://www.genspark.ai{UPSTREAM_TASK_STATUS_PATH}");

    for _ in 0..POLL_ATTEMPTS {
        let mut stream = match dial_sse_retrying_transport_error(&runtime.http, &url, cookie, body_bytes.clone()).await {
            Ok(stream) => stream,
            Err(_) => return Err(CoreError::ServiceUnavailable),
        };

        while let Some(event_result) = stream.next_event().await {
            let Ok(event) = event_result else { break };
            match classify(&event.data) {
                UpstreamEvent::TasksStatusComplete { per_task } => {
                    if task_ids.iter().all(|id| per_task.contains_key(id)) {
                        return Ok(PollOutcome::Success(collect_success_urls(task_ids, &per_task)));
                    }
                }
                UpstreamEvent::RateLimited => {
                    runtime.pool.cooldown(credential_id, runtime.rate_limit_cooldown, UnavailableReason::RateLimit).await;
                    warn!(event = "credential_cooldown", credential_id, reason = "rate_limit", "credential fault during task status polling");
                    return Ok(PollOutcome::CredentialFault);
                }
                UpstreamEvent::FreeQuotaExhausted => {
                    runtime.pool.cooldown(credential_id, Duration::from_secs(86_400), UnavailableReason::FreeQuotaExhausted).await;
                    warn!(event = "credential_cooldown", credential_id, reason = "free_quota_exhausted", "credential fault during task status polling");
                    return Ok(PollOutcome::CredentialFault);
                }
                UpstreamEvent::NotLoggedIn => {
                    runtime.pool.remove(credential_id).await;
                    warn!(event = "credential_removed", credential_id, reason = "not_logged_in", "credential fault during task status polling");
                    return Ok(PollOutcome::CredentialFault);
                }
                _ => {}
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    warn!(event = "generation_poll_timeout", task_count = task_ids.len(), "image/video task polling exceeded its attempt budget");
    Err(CoreError::ServiceUnavailable)
}

fn collect_success_urls(task_ids: &[String], per_task: &std::collections::HashMap<String, TaskStatus>) -> Vec<String> {
    task_ids
        .iter()
        .filter_map(|id| per_task.get(id))
        .filter(|status| status.status == "SUCCESS")
        .flat_map(|status| status.urls.clone().unwrap_or_default())
        .collect()
}

/// A dial failure never reaches the upstream at all, so it says nothing
/// about the credential; retry the same one once before letting the caller
/// treat it as a rotation-worthy fault.
async fn dial_sse_retrying_transport_error(
    http: &UpstreamHttpClient,
    url: &str,
    cookie: &str,
    body: Vec<u8>,
) -> Result<SseStream, UpstreamError> {
    match http.do_sse(Method::POST, url, cookie, body.clone()).await {
        Ok(stream) => Ok(stream),
        Err(_) => http.do_sse(Method::POST, url, cookie, body).await,
    }
}

async fn fetch_and_encode(runtime: &Runtime, url: &str) -> Result<(&'static str, String), CoreError> {
    let (status, body) = runtime
        .http
        .do_request(Method::GET, url, "", &[], None)
        .await
        .map_err(|_| CoreError::BadRequest("failed to fetch generated asset for base64 encoding".to_string()))?;
    if status >= 400 {
        return Err(CoreError::BadRequest(format!("asset fetch returned status {status}")));
    }
    let mime = sniff_mime(&body);
    let encoded = base64::engine::general_purpose::STANDARD.encode(&body);
    Ok((mime, encoded))
}

fn current_unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

trait ImageDataMimeHint {
    fn with_mime_hint(self, mime: &str) -> ImageData;
}

impl ImageDataMimeHint for ImageData {
    fn with_mime_hint(self, mime: &str) -> ImageData {
        let Some(b64) = self.b64_json else { return self };
        ImageData { url: None, b64_json: Some(format!("data:{mime};base64,{b64}")), revised_prompt: self.revised_prompt }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn job_kind_selects_the_right_wire_type() {
        assert_eq!(JobKind::Image.wire_kind(), "generate_image");
        assert_eq!(JobKind::Video.wire_kind(), "generate_video");
    }

    #[test]
    fn collect_success_urls_preserves_task_id_order_and_skips_failures() {
        let mut per_task = HashMap::new();
        per_task.insert("t1".to_string(), TaskStatus { status: "SUCCESS".to_string(), urls: Some(vec!["u1".to_string()]) });
        per_task.insert("t2".to_string(), TaskStatus { status: "FAILED".to_string(), urls: None });
        per_task.insert("t3".to_string(), TaskStatus { status: "SUCCESS".to_string(), urls: Some(vec!["u3".to_string()]) });

        let urls = collect_success_urls(&["t1".to_string(), "t2".to_string(), "t3".to_string()], &per_task);
        assert_eq!(urls, vec!["u1".to_string(), "u3".to_string()]);
    }

    #[test]
    fn collect_success_urls_ignores_task_ids_missing_from_the_status_map() {
        let per_task = HashMap::new();
        let urls = collect_success_urls(&["missing".to_string()], &per_task);
        assert!(urls.is_empty());
    }

    #[test]
    fn mime_hint_rewrites_b64_as_a_data_url_and_leaves_plain_urls_untouched() {
        let with_b64 = ImageData { url: None, b64_json: Some("QUJD".to_string()), revised_prompt: None }.with_mime_hint("image/png");
        assert_eq!(with_b64.b64_json.as_deref(), Some("data:image/png;base64,QUJD"));
        assert!(with_b64.url.is_none());

        let with_url = ImageData { url: Some("https://example.test/u.png".to_string()), b64_json: None, revised_prompt: None }
            .with_mime_hint("image/png");
        assert!(with_url.b64_json.is_none());
    }
}
