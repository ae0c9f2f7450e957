//! C6: the chat execution engine. Turns a client's
//! `CreateChatCompletionRequestBody` into zero or more upstream SSE calls,
//! routing every event through the translator/tool-call adapter and into a
//! `ResponseSink`, retrying across credentials on a credential-scoped fault.

use std::time::{Duration, Instant};

use chatrelay_common::estimate_tokens;
use chatrelay_protocol::openai::chat::{
    ChatCompletionFinishReason, ChatCompletionRequestMessage, ChatCompletionToolDefinition, CompletionTokensDetails,
    CompletionUsage, CreateChatCompletionRequestBody,
};
use chatrelay_upstream::{classify, SseStream, UnavailableReason, UpstreamError, UpstreamEvent, UpstreamHttpClient};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;
use wreq::Method;

use crate::error::CoreError;
use crate::janitor::{schedule_cleanup, JanitorContext};
use crate::models::resolve_model_list;
use crate::preprocessor::preprocess_messages;
use crate::sink::{ResponseSink, TurnEvent};
use crate::state::Runtime;
use crate::toolcall::{
    extract_tool_call, generate_tool_call_id, inject_tool_system_prompt, shim_tool_history, ExtractedReply,
    IncrementalToolCallParser, ParsedKind, ToolCallEvent,
};
use crate::translator::Translator;
use crate::wire::{query_string, UpstreamChatBody, UpstreamExtraData, UpstreamMessage};

const UPSTREAM_ASK_PATH: &str = "/api/copilot/ask";

/// Drives one client chat turn to completion, writing every piece of
/// progress through `sink` as it arrives. Returns once the turn is finished
/// or has exhausted every credential without ever producing output.
pub async fn handle_chat(
    request: CreateChatCompletionRequestBody,
    sink: &mut dyn ResponseSink,
    runtime: &Runtime,
) -> Result<(), CoreError> {
    let trace_id = Uuid::new_v4();
    let start = Instant::now();

    let total_credentials = runtime.pool.total_size().await;
    if total_credentials == 0 {
        return Err(CoreError::NoCredentials);
    }

    let (base_model, web_knowledge) = strip_search_suffix(&request.model);
    let tools = request.tools.unwrap_or_default();
    let tools_requested = !tools.is_empty();
    let tool_names: Vec<String> = tools
        .iter()
        .map(|ChatCompletionToolDefinition::Function { function }| function.name.clone())
        .collect();

    let mut messages = request.messages;
    if tools_requested {
        messages = shim_tool_history(messages);
        inject_tool_system_prompt(&mut messages, &tools);
    }
    let mut outbound: Vec<ChatCompletionRequestMessage> = runtime
        .prepended_messages
        .iter()
        .filter_map(|value| serde_json::from_value(value.clone()).ok())
        .collect();
    outbound.extend(messages);
    let messages = outbound;

    let prompt_tokens = estimate_tokens(
        &messages.iter().filter_map(|m| serde_json::to_string(m).ok()).collect::<Vec<_>>().join("\n"),
    );

    // max_retries is bound to the pool's size at entry (spec'd "retry loop
    // bounds"): credentials freed mid-loop by an unrelated cooldown expiry
    // are never re-probed within this turn.
    let mut picked_first = false;
    for attempt in 0..total_credentials {
        let selection = if !picked_first {
            picked_first = true;
            runtime.pool.random().await
        } else {
            runtime.pool.next().await
        };
        let Ok((credential_id, credential)) = selection else {
            break;
        };

        info!(
            event = "chat_attempt",
            trace_id = %trace_id,
            provider = "genspark",
            op = "chat",
            model = %base_model,
            credential_id,
            attempt,
            "issuing upstream chat request"
        );

        let session_id = runtime.sessions.get(credential_id, &base_model).await;
        let turn_messages = if session_id.is_none() && !tools_requested {
            last_user_message_only(&messages)
        } else {
            messages.clone()
        };

        let wire_messages = match preprocess_messages(&runtime.http, &credential.value, &base_model, turn_messages).await {
            Ok(wire_messages) => wire_messages,
            Err(err) => return Err(err),
        };

        let antibot_token = fetch_antibot(runtime, &credential.value).await;

        let body = UpstreamChatBody {
            kind: "chat".to_string(),
            current_query_string: query_string(session_id.as_deref(), "chat"),
            messages: wire_messages.into_iter().map(value_to_upstream_message).collect(),
            action_params: serde_json::json!({}),
            extra_data: UpstreamExtraData {
                models: resolve_model_list(&base_model),
                run_with_another_model: false,
                request_web_knowledge: web_knowledge.then_some(true),
            },
            g_recaptcha_token: antibot_token,
        };
        let body_bytes = serde_json::to_vec(&body).map_err(|err| CoreError::BadRequest(err.to_string()))?;
        let url = format!("https://www.genspark.ai{UPSTREAM_ASK_PATH}");

        let mut stream = match dial_sse_retrying_transport_error(&runtime.http, &url, &credential.value, body_bytes).await {
            Ok(stream) => stream,
            Err(_) => {
                // Transport error survived the same-credential retry; only
                // now does it count against the credential-rotation budget.
                continue;
            }
        };

        let mut translator = Translator::new(runtime.reasoning_visible);
        let mut tool_parser = tools_requested.then(IncrementalToolCallParser::new);
        let mut project_id: Option<String> = None;
        let mut credential_fault = false;

        'events: loop {
            let Some(event_result) = stream.next_event().await else { break 'events };
            let event = match event_result {
                Ok(event) => event,
                Err(err) => {
                    warn!(event = "sse_read_error", trace_id = %trace_id, credential_id, error = %err, "stream read failed");
                    break 'events;
                }
            };

            match classify(&event.data) {
                UpstreamEvent::RateLimited => {
                    runtime.pool.cooldown(credential_id, runtime.rate_limit_cooldown, UnavailableReason::RateLimit).await;
                    warn!(event = "credential_cooldown", trace_id = %trace_id, credential_id, reason = "rate_limit");
                    credential_fault = true;
                    break 'events;
                }
                UpstreamEvent::FreeQuotaExhausted => {
                    runtime.pool.cooldown(credential_id, Duration::from_secs(86_400), UnavailableReason::FreeQuotaExhausted).await;
                    warn!(event = "credential_cooldown", trace_id = %trace_id, credential_id, reason = "free_quota_exhausted");
                    credential_fault = true;
                    break 'events;
                }
                UpstreamEvent::NotLoggedIn => {
                    runtime.pool.remove(credential_id).await;
                    warn!(event = "credential_removed", trace_id = %trace_id, credential_id, reason = "not_logged_in");
                    credential_fault = true;
                    break 'events;
                }
                UpstreamEvent::CloudflareChallenge => return Err(CoreError::CloudflareChallenge),
                UpstreamEvent::CloudflareBlock => return Err(CoreError::CloudflareBlock),
                UpstreamEvent::ServiceUnavailable => return Err(CoreError::ServiceUnavailable),
                UpstreamEvent::ServerError => return Err(CoreError::ServerError),
                UpstreamEvent::ServerOverloaded => return Err(CoreError::ServerOverloaded),
                UpstreamEvent::ProjectStart { id } => project_id = Some(id),
                UpstreamEvent::MessageFieldDelta { field_name, delta } => {
                    dispatch_field(sink, &mut translator, &mut tool_parser, &tool_names, &field_name, delta).await?;
                }
                UpstreamEvent::MessageField { field_name, value } => {
                    dispatch_field(sink, &mut translator, &mut tool_parser, &tool_names, &field_name, field_value_text(&value)).await?;
                }
                UpstreamEvent::MessageResult { content } => {
                    let finish_reason = finalize_turn(sink, &translator, &mut tool_parser, &tool_names, runtime, &base_model, content.as_ref()).await?;
                    let usage = build_usage(prompt_tokens, &translator);
                    sink.on_usage(usage).await;
                    sink.on_event(TurnEvent::Finish { finish_reason }).await;
                    sink.close().await;

                    if let Some(project_id) = project_id {
                        schedule_cleanup(JanitorContext {
                            http: runtime.http.clone(),
                            sessions: runtime.sessions.clone(),
                            mode: runtime.janitor_mode(),
                            cookie: credential.value.clone(),
                            credential_id,
                            model: base_model.clone(),
                            project_id,
                            image_session_ids: runtime.image_session_ids.clone(),
                        });
                    }
                    info!(
                        event = "chat_complete",
                        trace_id = %trace_id,
                        credential_id,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "chat turn complete"
                    );
                    return Ok(());
                }
                UpstreamEvent::TasksStatusComplete { .. }
                | UpstreamEvent::GeneratedImages { .. }
                | UpstreamEvent::Unknown => {}
            }
        }

        if credential_fault {
            continue;
        }

        // The stream closed without a terminal event but without any fault
        // either: surface whatever was accumulated as a successful turn
        // rather than retrying (the upstream simply stopped sending).
        let finish_reason = finalize_turn(sink, &translator, &mut tool_parser, &tool_names, runtime, &base_model, None).await?;
        let usage = build_usage(prompt_tokens, &translator);
        sink.on_usage(usage).await;
        sink.on_event(TurnEvent::Finish { finish_reason }).await;
        sink.close().await;
        return Ok(());
    }

    Err(CoreError::AllCredentialsUnavailable)
}

async fn fetch_antibot(runtime: &Runtime, cookie: &str) -> Option<String> {
    let base_url = runtime.antibot_base_url.as_deref()?;
    let client = raw_client(&runtime.http).ok()?;
    chatrelay_upstream::antibot::fetch_antibot_token(&client, base_url, cookie).await
}

fn raw_client(http: &UpstreamHttpClient) -> Result<wreq::Client, chatrelay_upstream::UpstreamError> {
    http.raw_client()
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

async fn dispatch_field(
    sink: &mut dyn ResponseSink,
    translator: &mut Translator,
    tool_parser: &mut Option<IncrementalToolCallParser>,
    tool_names: &[String],
    field_name: &str,
    text: String,
) -> Result<(), CoreError> {
    if is_answer_field(field_name) {
        if let Some(parser) = tool_parser.as_mut() {
            for event in parser.push_str(&text) {
                match event {
                    ToolCallEvent::Content(ch) => {
                        translator_content_passthrough(sink, translator, ch).await;
                    }
                    ToolCallEvent::ToolCallStart { tool } => {
                        if !tool_names.iter().any(|name| name == &tool) {
                            return Err(CoreError::InvalidToolCall(format!("model called unknown tool \"{tool}\"")));
                        }
                        let id = generate_tool_call_id();
                        sink.on_event(TurnEvent::ToolCallStart { id, name: tool }).await;
                    }
                    ToolCallEvent::ToolCallInc(ch) => {
                        sink.on_event(TurnEvent::ToolCallArgDelta(ch.to_string())).await;
                    }
                }
            }
            return Ok(());
        }
    }
    if let Some(turn_event) = translator.handle_event(&UpstreamEvent::MessageFieldDelta {
        field_name: field_name.to_string(),
        delta: text,
    }) {
        sink.on_event(turn_event).await;
    }
    Ok(())
}

async fn translator_content_passthrough(sink: &mut dyn ResponseSink, translator: &mut Translator, ch: char) {
    // Content emitted by the tool-call adapter (the `{"type":"response",...}`
    // shape) still needs to land in the translator's running buffer so
    // `finalize_content`'s detail-answer unwrap has the right base text.
    if let Some(event) = translator.handle_event(&UpstreamEvent::MessageFieldDelta {
        field_name: "session_state.answer".to_string(),
        delta: ch.to_string(),
    }) {
        sink.on_event(event).await;
    }
}

/// Resolves the terminal state of the turn. Most models stream their answer
/// field-delta by field-delta as it is generated, in which case the tool
/// parser (if any) has already seen the whole reply by the time
/// `message_result` arrives. A model that instead sends its full answer in
/// one shot inside `message_result.content` leaves the tool parser in
/// `ParsedKind::Unset`; that text is scanned once with the non-streaming
/// extractor instead.
async fn finalize_turn(
    sink: &mut dyn ResponseSink,
    translator: &Translator,
    tool_parser: &mut Option<IncrementalToolCallParser>,
    tool_names: &[String],
    runtime: &Runtime,
    base_model: &str,
    message_result_content: Option<&Value>,
) -> Result<ChatCompletionFinishReason, CoreError> {
    if let Some(parser) = tool_parser.as_mut() {
        match parser.kind() {
            ParsedKind::ToolCall => return Ok(ChatCompletionFinishReason::ToolCalls),
            ParsedKind::Unset => {
                if let Some(text) = message_result_content.and_then(Value::as_str) {
                    return Ok(emit_one_shot_tool_result(sink, tool_names, text).await?);
                }
            }
            ParsedKind::Content => {}
        }
    }

    let unwrap = runtime.detail_answer_models.iter().any(|model| model == base_model);
    if unwrap {
        let final_content = translator.finalize_content(true, message_result_content);
        if final_content != translator.content() {
            sink.on_event(TurnEvent::ContentReplace(final_content)).await;
        }
    }
    Ok(ChatCompletionFinishReason::Stop)
}

async fn emit_one_shot_tool_result(
    sink: &mut dyn ResponseSink,
    tool_names: &[String],
    text: &str,
) -> Result<ChatCompletionFinishReason, CoreError> {
    match extract_tool_call(text) {
        ExtractedReply::Content(content) => {
            if !content.is_empty() {
                sink.on_event(TurnEvent::ContentDelta(content)).await;
            }
            Ok(ChatCompletionFinishReason::Stop)
        }
        ExtractedReply::ToolCall { name, arguments } => {
            if !tool_names.iter().any(|known| known == &name) {
                return Err(CoreError::InvalidToolCall(format!("model called unknown tool \"{name}\"")));
            }
            let id = generate_tool_call_id();
            sink.on_event(TurnEvent::ToolCallStart { id, name }).await;
            sink.on_event(TurnEvent::ToolCallArgDelta(arguments.to_string())).await;
            Ok(ChatCompletionFinishReason::ToolCalls)
        }
    }
}

fn build_usage(prompt_tokens: u32, translator: &Translator) -> CompletionUsage {
    let reasoning_tokens = estimate_tokens(translator.reasoning());
    let content_tokens = estimate_tokens(translator.content());
    let completion_tokens = content_tokens + reasoning_tokens;
    CompletionUsage {
        prompt_tokens: prompt_tokens as i64,
        completion_tokens: completion_tokens as i64,
        total_tokens: (prompt_tokens + completion_tokens) as i64,
        completion_tokens_details: if reasoning_tokens > 0 {
            Some(CompletionTokensDetails { reasoning_tokens: Some(reasoning_tokens as i64) })
        } else {
            None
        },
    }
}

fn strip_search_suffix(model: &str) -> (String, bool) {
    match model.strip_suffix("-search") {
        Some(base) => (base.to_string(), true),
        None => (model.to_string(), false),
    }
}

fn is_answer_field(field_name: &str) -> bool {
    field_name == "session_state.answer" || field_name.starts_with("session_state.streaming_detail_answer")
}

fn last_user_message_only(messages: &[ChatCompletionRequestMessage]) -> Vec<ChatCompletionRequestMessage> {
    messages
        .iter()
        .rev()
        .find(|message| matches!(message, ChatCompletionRequestMessage::User(_)))
        .cloned()
        .into_iter()
        .collect()
}

fn field_value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn value_to_upstream_message(value: Value) -> UpstreamMessage {
    let role = value.get("role").and_then(Value::as_str).unwrap_or("user").to_string();
    let content = value.get("content").cloned().unwrap_or(Value::Null);
    UpstreamMessage { role, content }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_protocol::openai::chat::ChatCompletionRequestUserMessage;
    use chatrelay_protocol::openai::chat::ChatCompletionUserContent;

    #[test]
    fn strip_search_suffix_splits_model_and_flag() {
        assert_eq!(strip_search_suffix("gpt-5-search"), ("gpt-5".to_string(), true));
        assert_eq!(strip_search_suffix("gpt-5"), ("gpt-5".to_string(), false));
    }

    #[test]
    fn is_answer_field_matches_plain_and_detail_streaming_variants() {
        assert!(is_answer_field("session_state.answer"));
        assert!(is_answer_field("session_state.streaming_detail_answer_123"));
        assert!(!is_answer_field("session_state.reasoning"));
    }

    #[test]
    fn last_user_message_only_keeps_the_most_recent_user_turn() {
        let messages = vec![
            ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: ChatCompletionUserContent::Text("first".to_string()),
                name: None,
            }),
            ChatCompletionRequestMessage::Assistant(chatrelay_protocol::openai::chat::ChatCompletionRequestAssistantMessage {
                content: Some(chatrelay_protocol::openai::chat::ChatCompletionAssistantContent::Text("reply".to_string())),
                name: None,
                tool_calls: None,
            }),
            ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: ChatCompletionUserContent::Text("second".to_string()),
                name: None,
            }),
        ];
        let trimmed = last_user_message_only(&messages);
        assert_eq!(trimmed.len(), 1);
        match &trimmed[0] {
            ChatCompletionRequestMessage::User(user) => {
                assert_eq!(user.content, ChatCompletionUserContent::Text("second".to_string()));
            }
            _ => panic!("expected a user message"),
        }
    }

    #[test]
    fn field_value_text_stringifies_non_string_values() {
        assert_eq!(field_value_text(&Value::String("hi".to_string())), "hi");
        assert_eq!(field_value_text(&Value::Null), "");
        assert_eq!(field_value_text(&Value::Bool(true)), "true");
    }

    #[test]
    fn value_to_upstream_message_defaults_role_to_user() {
        let message = value_to_upstream_message(serde_json::json!({"content": "hi"}));
        assert_eq!(message.role, "user");
        assert_eq!(message.content, Value::String("hi".to_string()));
    }

    #[test]
    fn build_usage_reports_reasoning_tokens_only_when_present() {
        let translator = Translator::new(true);
        let usage = build_usage(10, &translator);
        assert_eq!(usage.prompt_tokens, 10);
        assert!(usage.completion_tokens_details.is_none());
    }
}
