use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::credential::CredentialId;

/// Bi-level map: credential -> logical model -> upstream session (project)
/// id. A configuration-provided layer sits above it: entries there always
/// win and are never mutated or deleted by the registry itself.
pub struct SessionRegistry {
    entries: RwLock<HashMap<CredentialId, HashMap<String, String>>>,
    configured: HashMap<String, String>,
}

impl SessionRegistry {
    pub fn new(configured: HashMap<String, String>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            configured,
        }
    }

    pub async fn get(&self, cred: CredentialId, model: &str) -> Option<String> {
        if let Some(sid) = self.configured.get(model) {
            return Some(sid.clone());
        }
        self.entries
            .read()
            .await
            .get(&cred)
            .and_then(|by_model| by_model.get(model))
            .cloned()
    }

    pub async fn put(&self, cred: CredentialId, model: impl Into<String>, session_id: impl Into<String>) {
        let mut guard = self.entries.write().await;
        guard.entry(cred).or_default().insert(model.into(), session_id.into());
    }

    pub async fn list_for(&self, cred: CredentialId) -> Vec<String> {
        self.entries
            .read()
            .await
            .get(&cred)
            .map(|by_model| by_model.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn forget(&self, cred: CredentialId, model: &str) {
        if let Some(by_model) = self.entries.write().await.get_mut(&cred) {
            by_model.remove(model);
        }
    }

    /// True when `model` is pinned by configuration; the Janitor must never
    /// delete such a session's upstream project.
    pub fn is_configured(&self, model: &str) -> bool {
        self.configured.contains_key(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn configured_map_wins_over_live_registry() {
        let mut configured = HashMap::new();
        configured.insert("gpt-mix".to_string(), "pinned-session".to_string());
        let registry = SessionRegistry::new(configured);
        registry.put(0, "gpt-mix", "live-session").await;
        assert_eq!(registry.get(0, "gpt-mix").await.as_deref(), Some("pinned-session"));
    }

    #[tokio::test]
    async fn put_then_get_round_trips_per_credential() {
        let registry = SessionRegistry::new(HashMap::new());
        registry.put(1, "text-model", "sess-a").await;
        registry.put(2, "text-model", "sess-b").await;
        assert_eq!(registry.get(1, "text-model").await.as_deref(), Some("sess-a"));
        assert_eq!(registry.get(2, "text-model").await.as_deref(), Some("sess-b"));
    }

    #[tokio::test]
    async fn forget_removes_only_the_named_model() {
        let registry = SessionRegistry::new(HashMap::new());
        registry.put(0, "a", "sess-a").await;
        registry.put(0, "b", "sess-b").await;
        registry.forget(0, "a").await;
        assert_eq!(registry.get(0, "a").await, None);
        assert_eq!(registry.get(0, "b").await.as_deref(), Some("sess-b"));
    }
}
