//! C10: post-turn session cleanup, run detached from the client response.

use std::sync::Arc;

use chatrelay_upstream::{CredentialId, SessionRegistry, UpstreamHttpClient};
use tracing::warn;
use wreq::Method;

#[derive(Debug, Clone, Copy)]
pub enum JanitorMode {
    AutoBind,
    AutoDelete,
    /// Neither auto-bind nor auto-delete is configured: the session is left
    /// exactly as the turn left it.
    Noop,
}

pub struct JanitorContext {
    pub http: Arc<UpstreamHttpClient>,
    pub sessions: Arc<SessionRegistry>,
    pub mode: JanitorMode,
    pub cookie: String,
    pub credential_id: CredentialId,
    pub model: String,
    pub project_id: String,
    /// Values of the configured image-session map; the Janitor's auto-delete
    /// skip rule treats membership here the same as a registry hit.
    pub image_session_ids: Arc<Vec<String>>,
}

/// Schedules cleanup on a detached task so client response latency is
/// unaffected and a client disconnect does not cancel it.
pub fn schedule_cleanup(ctx: JanitorContext) {
    tokio::spawn(async move {
        run_cleanup(ctx).await;
    });
}

async fn run_cleanup(ctx: JanitorContext) {
    match ctx.mode {
        JanitorMode::AutoBind => {
            ctx.sessions.put(ctx.credential_id, &ctx.model, ctx.project_id).await;
        }
        JanitorMode::AutoDelete => {
            if should_skip_delete(&ctx).await {
                return;
            }
            let url = format!("https://www.genspark.ai/api/project/delete?project_id={}", ctx.project_id);
            if let Err(err) = ctx.http.do_request(Method::GET, &url, &ctx.cookie, &[], None).await {
                warn!(event = "janitor_delete_failed", project_id = %ctx.project_id, error = %err, "project delete failed");
            }
        }
        JanitorMode::Noop => {}
    }
}

async fn should_skip_delete(ctx: &JanitorContext) -> bool {
    if ctx.sessions.is_configured(&ctx.model) {
        return true;
    }
    if ctx.sessions.list_for(ctx.credential_id).await.contains(&ctx.project_id) {
        return true;
    }
    ctx.image_session_ids.contains(&ctx.project_id)
}
