use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

/// Static allowlist of accepted client secrets, loaded once from
/// configuration at startup. Unlike a multi-tenant proxy's database-backed
/// key store, this system has no admin surface to rotate keys at runtime,
/// so there is nothing here to hot-swap.
#[derive(Debug, Clone)]
pub struct AuthGate {
    keys: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthError;

impl AuthGate {
    pub fn new(keys: Vec<String>) -> Self {
        Self { keys }
    }

    /// Accepts `Authorization: Bearer <key>` or `X-API-Key: <key>`. Every
    /// candidate key is compared against every configured key so the
    /// response time does not depend on which key (if any) matched.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        if self.keys.is_empty() {
            return Err(AuthError);
        }
        let Some(presented) = extract_api_key(headers) else {
            return Err(AuthError);
        };
        let mut matched = false;
        for key in &self.keys {
            if constant_time_eq(key.as_bytes(), presented.as_bytes()) {
                matched = true;
            }
        }
        if matched {
            Ok(())
        } else {
            Err(AuthError)
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = header_value(headers, "x-api-key") {
        return Some(value);
    }
    let auth = header_value(headers, "authorization")?;
    let trimmed = auth.trim();
    for prefix in ["Bearer ", "bearer "] {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            return Some(rest.trim().to_string());
        }
    }
    None
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name)?.to_str().ok().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(name: &str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn accepts_matching_bearer_token() {
        let gate = AuthGate::new(vec!["secret-1".to_string(), "secret-2".to_string()]);
        let headers = headers_with("authorization", "Bearer secret-2");
        assert!(gate.authenticate(&headers).is_ok());
    }

    #[test]
    fn accepts_matching_x_api_key_header() {
        let gate = AuthGate::new(vec!["secret-1".to_string()]);
        let headers = headers_with("x-api-key", "secret-1");
        assert!(gate.authenticate(&headers).is_ok());
    }

    #[test]
    fn rejects_unknown_key() {
        let gate = AuthGate::new(vec!["secret-1".to_string()]);
        let headers = headers_with("authorization", "Bearer wrong");
        assert!(gate.authenticate(&headers).is_err());
    }

    #[test]
    fn rejects_missing_header() {
        let gate = AuthGate::new(vec!["secret-1".to_string()]);
        assert!(gate.authenticate(&HeaderMap::new()).is_err());
    }

    #[test]
    fn empty_allowlist_rejects_everything() {
        let gate = AuthGate::new(vec![]);
        let headers = headers_with("authorization", "Bearer anything");
        assert!(gate.authenticate(&headers).is_err());
    }
}
