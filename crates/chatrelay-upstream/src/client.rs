use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use wreq::{Client, Method, Proxy};

use chatrelay_protocol::{SseEvent, SseParser};

use crate::errors::{map_wreq_error, TransportErrorKind, UpstreamError};

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const UPSTREAM_ORIGIN: &str = "https://www.genspark.ai";

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(600),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

/// TLS-fingerprinted HTTP(S) + SSE client used for all upstream calls. One
/// `wreq::Client` is built per distinct proxy value and cached, since the
/// TLS fingerprint profile is baked in at client-build time.
pub struct UpstreamHttpClient {
    config: UpstreamClientConfig,
    clients: Mutex<HashMap<Option<String>, Client>>,
}

impl UpstreamHttpClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, UpstreamError> {
        let client = build_client(&config).map_err(map_wreq_error)?;
        let mut clients = HashMap::new();
        clients.insert(normalize_proxy(config.proxy.clone()), client);
        Ok(Self {
            config,
            clients: Mutex::new(clients),
        })
    }

    /// Exposes the cached `wreq::Client` for callers (anti-bot token
    /// fetching) that need to issue a request outside this type's own
    /// `do_request`/`do_sse` surface but still want the same TLS profile.
    pub fn raw_client(&self) -> Result<Client, UpstreamError> {
        self.client()
    }

    fn client(&self) -> Result<Client, UpstreamError> {
        let proxy = normalize_proxy(self.config.proxy.clone());
        let mut guard = self.clients.lock().expect("upstream client cache poisoned");
        if let Some(client) = guard.get(&proxy) {
            return Ok(client.clone());
        }
        let client = build_client(&self.config).map_err(map_wreq_error)?;
        guard.insert(proxy, client.clone());
        Ok(client)
    }

    /// `do(url, method, headers, body) -> {status, body_bytes}`.
    pub async fn do_request(
        &self,
        method: Method,
        url: &str,
        cookie: &str,
        extra_headers: &[(&str, &str)],
        body: Option<Vec<u8>>,
    ) -> Result<(u16, Bytes), UpstreamError> {
        let client = self.client()?;
        let mut builder = fixed_headers(client.request(method, url), cookie, "application/json");
        for (name, value) in extra_headers {
            builder = builder.header(*name, *value);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }
        let resp = builder.send().await.map_err(map_wreq_error)?;
        let status = resp.status().as_u16();
        let bytes = resp.bytes().await.map_err(map_wreq_error)?;
        Ok((status, bytes))
    }

    /// `do_sse(url, method, headers, body) -> lazy sequence of {data, done}`.
    /// The returned `SseStream`'s `next_event` resolving to `None` is the
    /// `done = true` sentinel.
    pub async fn do_sse(
        &self,
        method: Method,
        url: &str,
        cookie: &str,
        body: Vec<u8>,
    ) -> Result<SseStream, UpstreamError> {
        let client = self.client()?;
        let builder = fixed_headers(client.request(method, url), cookie, "text/event-stream").body(body);
        let resp = builder.send().await.map_err(map_wreq_error)?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let body = resp.bytes().await.unwrap_or_default();
            return Err(UpstreamError::Status { status, body });
        }
        Ok(SseStream::new(resp, self.config.stream_idle_timeout))
    }
}

fn fixed_headers(builder: wreq::RequestBuilder, cookie: &str, accept: &str) -> wreq::RequestBuilder {
    builder
        .header("User-Agent", DEFAULT_USER_AGENT)
        .header("Origin", UPSTREAM_ORIGIN)
        .header("Referer", format!("{UPSTREAM_ORIGIN}/"))
        .header("Cookie", cookie)
        .header("Accept", accept)
        .header("Content-Type", "application/json")
}

fn normalize_proxy(value: Option<String>) -> Option<String> {
    value.map(|item| item.trim().to_string()).filter(|item| !item.is_empty())
}

fn build_client(config: &UpstreamClientConfig) -> Result<Client, wreq::Error> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .read_timeout(config.stream_idle_timeout);
    if let Some(proxy) = normalize_proxy(config.proxy.clone()) {
        builder = builder.proxy(Proxy::all(proxy)?);
    }
    builder.build()
}

/// Pull-based decoder over a streaming response body. Buffers only the
/// events the parser has already assembled, never the raw byte stream.
pub struct SseStream {
    body: Pin<Box<dyn Stream<Item = Result<Bytes, wreq::Error>> + Send>>,
    parser: SseParser,
    pending: VecDeque<SseEvent>,
    idle_timeout: Duration,
    finished: bool,
}

impl SseStream {
    fn new(resp: wreq::Response, idle_timeout: Duration) -> Self {
        Self {
            body: Box::pin(resp.bytes_stream()),
            parser: SseParser::new(),
            pending: VecDeque::new(),
            idle_timeout,
            finished: false,
        }
    }

    /// Returns the next `data:` line as a decoded event, or `None` once the
    /// upstream has closed the stream (the done sentinel).
    pub async fn next_event(&mut self) -> Option<Result<SseEvent, UpstreamError>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if self.finished {
                return None;
            }
            let next = tokio::time::timeout(self.idle_timeout, self.body.next()).await;
            match next {
                Ok(Some(Ok(chunk))) => {
                    for event in self.parser.push_bytes(&chunk) {
                        self.pending.push_back(event);
                    }
                }
                Ok(Some(Err(err))) => return Some(Err(map_wreq_error(err))),
                Ok(None) => {
                    self.finished = true;
                    for event in self.parser.finish() {
                        self.pending.push_back(event);
                    }
                }
                Err(_) => {
                    return Some(Err(UpstreamError::Transport {
                        kind: TransportErrorKind::ReadTimeout,
                        message: "stream idle timeout exceeded".to_string(),
                    }));
                }
            }
        }
    }
}
