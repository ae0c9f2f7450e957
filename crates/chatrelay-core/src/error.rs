use axum::http::StatusCode;
use bytes::Bytes;
use chatrelay_protocol::openai::error::OpenAiErrorBody;

/// The full error taxonomy surfaced at the HTTP boundary. Every variant maps
/// to an OpenAI-shaped JSON body so clients written against the OpenAI API
/// don't need special-case handling for this proxy.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("invalid tool call: {0}")]
    InvalidToolCall(String),
    #[error("no credentials configured")]
    NoCredentials,
    #[error("all credentials unavailable")]
    AllCredentialsUnavailable,
    #[error("upstream presented a cloudflare challenge")]
    CloudflareChallenge,
    #[error("upstream blocked the request")]
    CloudflareBlock,
    #[error("upstream service unavailable")]
    ServiceUnavailable,
    #[error("upstream server error")]
    ServerError,
    #[error("upstream overloaded")]
    ServerOverloaded,
}

impl CoreError {
    pub fn status(&self) -> StatusCode {
        match self {
            CoreError::BadRequest(_) | CoreError::InvalidToolCall(_) => StatusCode::BAD_REQUEST,
            CoreError::Unauthorized => StatusCode::UNAUTHORIZED,
            CoreError::NoCredentials
            | CoreError::AllCredentialsUnavailable
            | CoreError::CloudflareChallenge
            | CoreError::CloudflareBlock
            | CoreError::ServiceUnavailable
            | CoreError::ServerError
            | CoreError::ServerOverloaded => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(&self) -> Bytes {
        let message = match self {
            CoreError::BadRequest(message) => message.clone(),
            CoreError::Unauthorized => "invalid api key".to_string(),
            CoreError::InvalidToolCall(message) => message.clone(),
            CoreError::NoCredentials => "No valid cookies available".to_string(),
            CoreError::AllCredentialsUnavailable => {
                "all configured credentials are rate-limited or unavailable".to_string()
            }
            CoreError::CloudflareChallenge => "upstream presented an anti-bot challenge".to_string(),
            CoreError::CloudflareBlock => "upstream blocked the request".to_string(),
            CoreError::ServiceUnavailable => "upstream service is temporarily unavailable".to_string(),
            CoreError::ServerError => "upstream returned an internal server error".to_string(),
            CoreError::ServerOverloaded => "upstream is currently overloaded".to_string(),
        };
        let body = OpenAiErrorBody::new(message, self.status().as_u16().to_string());
        Bytes::from(serde_json::to_vec(&body).unwrap_or_default())
    }
}

impl axum::response::IntoResponse for CoreError {
    fn into_response(self) -> axum::response::Response {
        (self.status(), [("content-type", "application/json")], self.body()).into_response()
    }
}
