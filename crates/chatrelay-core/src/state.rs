use std::sync::Arc;
use std::time::Duration;

use chatrelay_common::GlobalConfig;
use chatrelay_upstream::{CredentialPool, SessionRegistry, UpstreamClientConfig, UpstreamError, UpstreamHttpClient};

use crate::auth::AuthGate;

/// Everything a request handler needs, assembled once at startup and shared
/// across all in-flight requests. The credential pool and session registry
/// are the only pieces of genuinely shared mutable state; everything else
/// here is read-only after construction.
pub struct Runtime {
    pub pool: Arc<CredentialPool>,
    pub sessions: Arc<SessionRegistry>,
    pub http: Arc<UpstreamHttpClient>,
    pub auth: AuthGate,
    pub antibot_base_url: Option<String>,
    pub rate_limit_cooldown: Duration,
    pub reasoning_visible: bool,
    pub detail_answer_models: Vec<String>,
    pub prepended_messages: Vec<serde_json::Value>,
    pub auto_bind_sessions: bool,
    pub auto_delete_sessions: bool,
    pub image_session_ids: Arc<Vec<String>>,
}

impl Runtime {
    pub fn from_config(config: &GlobalConfig) -> Result<Self, UpstreamError> {
        let pool = Arc::new(CredentialPool::new(config.cookies.clone()));
        let sessions = Arc::new(SessionRegistry::new(config.model_session_map.clone()));
        let http_config = UpstreamClientConfig { proxy: config.proxy.clone(), ..Default::default() };
        let http = Arc::new(UpstreamHttpClient::new(http_config)?);
        let auth = AuthGate::new(config.api_keys.clone());
        let image_session_ids: Vec<String> = config.image_session_map.values().cloned().collect();
        Ok(Self {
            pool,
            sessions,
            http,
            auth,
            antibot_base_url: config.antibot_base_url.clone(),
            rate_limit_cooldown: Duration::from_secs(config.rate_limit_cooldown_secs),
            reasoning_visible: config.reasoning_visible,
            detail_answer_models: config.detail_answer_models.clone(),
            prepended_messages: config.prepended_messages.clone(),
            auto_bind_sessions: config.auto_bind_sessions,
            auto_delete_sessions: config.auto_delete_sessions,
            image_session_ids: Arc::new(image_session_ids),
        })
    }

    /// Auto-bind wins when both are set (a bound session is never deleted
    /// out from under it); auto-delete is otherwise its own independently
    /// configured behavior, not just "auto-bind's absence".
    pub fn janitor_mode(&self) -> crate::janitor::JanitorMode {
        if self.auto_bind_sessions {
            crate::janitor::JanitorMode::AutoBind
        } else if self.auto_delete_sessions {
            crate::janitor::JanitorMode::AutoDelete
        } else {
            crate::janitor::JanitorMode::Noop
        }
    }
}

