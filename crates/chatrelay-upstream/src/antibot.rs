use std::time::Duration;

use serde::Deserialize;
use tracing::warn;
use wreq::Client;

const ANTIBOT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct AntiBotResponse {
    code: i64,
    #[serde(default)]
    token: Option<String>,
}

/// `GET {base}/genspark` with the credential's cookie forwarded. Non-fatal
/// on any failure: the caller proceeds without a token rather than failing
/// the turn outright; if the upstream then rejects the request, the
/// classifier downgrades the credential as usual.
pub async fn fetch_antibot_token(client: &Client, base_url: &str, cookie: &str) -> Option<String> {
    let url = format!("{}/genspark", base_url.trim_end_matches('/'));
    let call = client.get(&url).header("Cookie", cookie).send();
    let response = match tokio::time::timeout(ANTIBOT_TIMEOUT, call).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            warn!(event = "antibot_fetch_failed", error = %err, "anti-bot token request failed");
            return None;
        }
        Err(_) => {
            warn!(event = "antibot_fetch_timeout", "anti-bot token request timed out");
            return None;
        }
    };
    let body: AntiBotResponse = match response.json().await {
        Ok(body) => body,
        Err(err) => {
            warn!(event = "antibot_decode_failed", error = %err, "anti-bot token response was not valid JSON");
            return None;
        }
    };
    if body.code != 200 {
        return None;
    }
    body.token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_without_token_field_deserializes_to_none() {
        let parsed: AntiBotResponse = serde_json::from_str(r#"{"code":200}"#).unwrap();
        assert_eq!(parsed.token, None);
    }
}
