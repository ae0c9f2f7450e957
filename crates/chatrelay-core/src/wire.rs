//! The upstream's own JSON wire shape for `/api/copilot/ask` and
//! `/api/ig_tasks_status`. Distinct from `chatrelay_protocol::openai` (the
//! client-facing dialect) — this is what actually goes out over the wire to
//! the upstream.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamMessage {
    pub role: String,
    pub content: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamExtraData {
    pub models: Vec<String>,
    pub run_with_another_model: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_web_knowledge: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamChatBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub current_query_string: String,
    pub messages: Vec<UpstreamMessage>,
    pub action_params: Value,
    pub extra_data: UpstreamExtraData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub g_recaptcha_token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamTaskStatusBody {
    pub task_ids: Vec<String>,
}

/// `id=<sid>&type=<kind>` when a session id is known, else `type=<kind>`.
pub fn query_string(session_id: Option<&str>, kind: &str) -> String {
    match session_id {
        Some(id) => format!("id={id}&type={kind}"),
        None => format!("type={kind}"),
    }
}
