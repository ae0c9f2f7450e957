use std::collections::HashMap;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatus {
    pub status: String,
    pub urls: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    ProjectStart { id: String },
    MessageFieldDelta { field_name: String, delta: String },
    MessageField { field_name: String, value: Value },
    MessageResult { content: Option<Value> },
    GeneratedImages { task_ids: Vec<String> },
    TasksStatusComplete { per_task: HashMap<String, TaskStatus> },
    RateLimited,
    FreeQuotaExhausted,
    NotLoggedIn,
    CloudflareChallenge,
    CloudflareBlock,
    ServiceUnavailable,
    ServerError,
    ServerOverloaded,
    Unknown,
}

/// Pure, total, and idempotent: the same input always yields the same
/// event, and the classifier never performs I/O. Inputs are either an SSE
/// `data:` line's payload or a complete non-streaming HTTP body.
pub fn classify(input: &str) -> UpstreamEvent {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return UpstreamEvent::Unknown;
    }
    let lowered = trimmed.to_ascii_lowercase();

    if lowered.contains("just a moment") || lowered.contains("cf-challenge") {
        return UpstreamEvent::CloudflareChallenge;
    }
    if lowered.contains("sorry, you have been blocked") {
        return UpstreamEvent::CloudflareBlock;
    }
    if lowered.contains("503 service temporarily unavailable") {
        return UpstreamEvent::ServiceUnavailable;
    }
    if lowered.contains("\"code\":429") || lowered.contains("rate_limit_exceeded") {
        return UpstreamEvent::RateLimited;
    }
    if lowered.contains("free_quota_exhausted") {
        return UpstreamEvent::FreeQuotaExhausted;
    }
    if lowered.contains("not_logged_in") || lowered.contains("login_required") {
        return UpstreamEvent::NotLoggedIn;
    }
    if lowered.contains("server_overloaded") {
        return UpstreamEvent::ServerOverloaded;
    }
    if lowered.contains("internal_server_error") || lowered.contains("\"code\":500") {
        return UpstreamEvent::ServerError;
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => classify_json(&value),
        Err(_) => UpstreamEvent::Unknown,
    }
}

fn classify_json(value: &Value) -> UpstreamEvent {
    let event_type = value.get("type").and_then(Value::as_str);
    match event_type {
        Some("project_start") => UpstreamEvent::ProjectStart {
            id: value
                .get("id")
                .or_else(|| value.get("project_id"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        Some("message_field_delta") => UpstreamEvent::MessageFieldDelta {
            field_name: value.get("field_name").and_then(Value::as_str).unwrap_or_default().to_string(),
            delta: value.get("delta").and_then(Value::as_str).unwrap_or_default().to_string(),
        },
        Some("message_field") => UpstreamEvent::MessageField {
            field_name: value.get("field_name").and_then(Value::as_str).unwrap_or_default().to_string(),
            value: value.get("field_value").cloned().unwrap_or(Value::Null),
        },
        Some("message_result") => UpstreamEvent::MessageResult {
            content: value.get("content").cloned(),
        },
        Some("generated_images") => UpstreamEvent::GeneratedImages {
            task_ids: value
                .get("images")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(|item| item.get("task_id")?.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
        },
        Some("tasks_status_complete") | Some("TASKS_STATUS_COMPLETE") => {
            UpstreamEvent::TasksStatusComplete {
                per_task: parse_final_status(value.get("final_status")),
            }
        }
        _ => UpstreamEvent::Unknown,
    }
}

fn parse_final_status(final_status: Option<&Value>) -> HashMap<String, TaskStatus> {
    let mut per_task = HashMap::new();
    let Some(obj) = final_status.and_then(Value::as_object) else {
        return per_task;
    };
    for (task_id, status_value) in obj {
        let status = status_value
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let urls = status_value.get("image_urls").and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        });
        per_task.insert(task_id.clone(), TaskStatus { status, urls });
    }
    per_task
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_project_start() {
        let input = r#"{"type":"project_start","id":"P1"}"#;
        assert_eq!(classify(input), UpstreamEvent::ProjectStart { id: "P1".to_string() });
    }

    #[test]
    fn classifies_message_field_delta() {
        let input = r#"{"type":"message_field_delta","field_name":"session_state.answer","delta":"Hel"}"#;
        assert_eq!(
            classify(input),
            UpstreamEvent::MessageFieldDelta {
                field_name: "session_state.answer".to_string(),
                delta: "Hel".to_string(),
            }
        );
    }

    #[test]
    fn classifies_message_result() {
        let input = r#"{"type":"message_result","content":"done"}"#;
        assert_eq!(
            classify(input),
            UpstreamEvent::MessageResult { content: Some(Value::String("done".to_string())) }
        );
    }

    #[test]
    fn classifies_rate_limit_signature() {
        let input = r#"{"error":"rate_limit_exceeded","code":429}"#;
        assert_eq!(classify(input), UpstreamEvent::RateLimited);
    }

    #[test]
    fn classifies_cloudflare_block_html() {
        let input = "Sorry, you have been blocked";
        assert_eq!(classify(input), UpstreamEvent::CloudflareBlock);
    }

    #[test]
    fn unclassifiable_input_is_unknown() {
        assert_eq!(classify(r#"{"type":"something_else"}"#), UpstreamEvent::Unknown);
        assert_eq!(classify(""), UpstreamEvent::Unknown);
    }

    #[test]
    fn classifies_generated_images() {
        let input = r#"{"type":"generated_images","images":[{"task_id":"T1"},{"task_id":"T2"}]}"#;
        assert_eq!(
            classify(input),
            UpstreamEvent::GeneratedImages { task_ids: vec!["T1".to_string(), "T2".to_string()] }
        );
    }

    #[test]
    fn classifies_tasks_status_complete() {
        let input = r#"{"type":"tasks_status_complete","final_status":{"T1":{"status":"SUCCESS","image_urls":["u1"]}}}"#;
        let event = classify(input);
        match event {
            UpstreamEvent::TasksStatusComplete { per_task } => {
                let task = per_task.get("T1").unwrap();
                assert_eq!(task.status, "SUCCESS");
                assert_eq!(task.urls.as_deref(), Some(&["u1".to_string()][..]));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
