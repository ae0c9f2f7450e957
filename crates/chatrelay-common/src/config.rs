use std::collections::HashMap;
use std::env;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required env var: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {field}: {source}")]
    InvalidJson {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Process-wide configuration, loaded once at startup from the environment.
/// None of this is hot-path state; the request-execution core treats it as
/// read-only after `GlobalConfig::from_env` returns.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub cookies: Vec<String>,
    pub api_keys: Vec<String>,
    pub listen_addr: String,
    pub proxy: Option<String>,
    pub antibot_base_url: Option<String>,
    pub rate_limit_cooldown_secs: u64,
    pub reasoning_visible: bool,
    pub auto_bind_sessions: bool,
    pub auto_delete_sessions: bool,
    pub model_session_map: HashMap<String, String>,
    pub image_session_map: HashMap<String, String>,
    pub prepended_messages: Vec<serde_json::Value>,
    pub detail_answer_models: Vec<String>,
}

impl GlobalConfig {
    pub fn from_env() -> Result<Self, GlobalConfigError> {
        let cookies = required_list("CHATRELAY_COOKIES")?;
        let api_keys = required_list("CHATRELAY_API_KEYS")?;
        Ok(Self {
            cookies,
            api_keys,
            listen_addr: env::var("CHATRELAY_LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            proxy: non_empty_env("CHATRELAY_PROXY_URL"),
            antibot_base_url: non_empty_env("CHATRELAY_ANTIBOT_BASE_URL"),
            rate_limit_cooldown_secs: env::var("CHATRELAY_RATE_LIMIT_COOLDOWN_SECS")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(600),
            reasoning_visible: parse_bool_env("CHATRELAY_REASONING_VISIBLE", false),
            auto_bind_sessions: parse_bool_env("CHATRELAY_AUTO_BIND_SESSIONS", true),
            auto_delete_sessions: parse_bool_env("CHATRELAY_AUTO_DELETE_SESSIONS", false),
            model_session_map: json_map_env("CHATRELAY_MODEL_SESSION_MAP")?,
            image_session_map: json_map_env("CHATRELAY_IMAGE_SESSION_MAP")?,
            prepended_messages: json_array_env("CHATRELAY_PREPENDED_MESSAGES")?,
            detail_answer_models: optional_list("CHATRELAY_DETAIL_ANSWER_MODELS"),
        })
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_bool_env(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|value| matches!(value.trim(), "1" | "true" | "TRUE" | "yes"))
        .unwrap_or(default)
}

fn required_list(name: &'static str) -> Result<Vec<String>, GlobalConfigError> {
    let raw = env::var(name).map_err(|_| GlobalConfigError::MissingField(name))?;
    let items: Vec<String> = raw
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect();
    if items.is_empty() {
        return Err(GlobalConfigError::MissingField(name));
    }
    Ok(items)
}

fn optional_list(name: &str) -> Vec<String> {
    env::var(name)
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn json_map_env(
    name: &'static str,
) -> Result<HashMap<String, String>, GlobalConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
            .map_err(|source| GlobalConfigError::InvalidJson { field: name, source }),
        _ => Ok(HashMap::new()),
    }
}

fn json_array_env(
    name: &'static str,
) -> Result<Vec<serde_json::Value>, GlobalConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
            .map_err(|source| GlobalConfigError::InvalidJson { field: name, source }),
        _ => Ok(Vec::new()),
    }
}

/// A provider-config layer matching the shape `chatrelay-upstream` bootstraps
/// credentials from; kept separate from `GlobalConfig` so tests can build a
/// pool without env access.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CredentialSeed {
    pub cookie: String,
}
