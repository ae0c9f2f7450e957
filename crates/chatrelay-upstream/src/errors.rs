use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    ReadTimeout,
    Dns,
    Tls,
    Connect,
    Other,
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream transport error: {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },
    #[error("upstream responded with status {status}")]
    Status { status: u16, body: Bytes },
}

pub(crate) fn map_wreq_error(err: wreq::Error) -> UpstreamError {
    UpstreamError::Transport {
        kind: classify_wreq_error(&err),
        message: err.to_string(),
    }
}

fn classify_wreq_error(err: &wreq::Error) -> TransportErrorKind {
    let message = err.to_string().to_ascii_lowercase();
    if err.is_timeout() {
        if message.contains("read") || message.contains("idle") {
            return TransportErrorKind::ReadTimeout;
        }
        return TransportErrorKind::Timeout;
    }
    if err.is_connect() {
        if message.contains("dns") || message.contains("resolve") {
            return TransportErrorKind::Dns;
        }
        if message.contains("tls") || message.contains("ssl") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }
    if message.contains("tls") || message.contains("ssl") {
        return TransportErrorKind::Tls;
    }
    TransportErrorKind::Other
}
