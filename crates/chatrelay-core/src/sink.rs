use async_trait::async_trait;
use chatrelay_protocol::openai::chat::{
    ChatCompletionChoice, ChatCompletionChunkObjectType, ChatCompletionFinishReason,
    ChatCompletionMessageToolCall, ChatCompletionMessageToolCallChunk,
    ChatCompletionMessageToolCallChunkFunction, ChatCompletionMessageToolCallFunction,
    ChatCompletionObjectType, ChatCompletionResponseMessage, ChatCompletionResponseRole,
    ChatCompletionRole, ChatCompletionStreamChoice, ChatCompletionStreamResponseDelta,
    ChatCompletionToolCallChunkType, CompletionUsage, CreateChatCompletionResponse,
    CreateChatCompletionStreamResponse,
};

/// One unit of progress from a chat turn, independent of whether the final
/// client response is streamed or buffered.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    ContentDelta(String),
    ReasoningDelta(String),
    ToolCallStart { id: String, name: String },
    ToolCallArgDelta(String),
    /// Overwrites the accumulated content with a final value (the
    /// `detailAnswer` unwrap). A buffering sink replaces its content
    /// outright; a streaming sink has already sent the accumulated deltas
    /// and can only append the difference, so this is best-effort there.
    ContentReplace(String),
    Finish { finish_reason: ChatCompletionFinishReason },
}

#[async_trait]
pub trait ResponseSink: Send {
    async fn on_event(&mut self, event: TurnEvent);
    async fn on_usage(&mut self, usage: CompletionUsage);
    /// Called exactly once; flushes any trailing frame (e.g. SSE `[DONE]`).
    async fn close(&mut self);
}

/// Buffers a turn into a single non-streaming `CreateChatCompletionResponse`.
pub struct JsonSink {
    id: String,
    model: String,
    created: i64,
    content: String,
    reasoning: String,
    tool_call: Option<(String, String, String)>,
    finish_reason: ChatCompletionFinishReason,
    usage: Option<CompletionUsage>,
}

impl JsonSink {
    pub fn new(id: String, model: String, created: i64) -> Self {
        Self {
            id,
            model,
            created,
            content: String::new(),
            reasoning: String::new(),
            tool_call: None,
            finish_reason: ChatCompletionFinishReason::Stop,
            usage: None,
        }
    }

    pub fn into_response(self) -> CreateChatCompletionResponse {
        let tool_calls = self.tool_call.map(|(id, name, arguments)| {
            vec![ChatCompletionMessageToolCall::Function {
                id,
                function: ChatCompletionMessageToolCallFunction { name, arguments },
            }]
        });
        let message = ChatCompletionResponseMessage {
            role: ChatCompletionResponseRole::Assistant,
            content: if self.content.is_empty() && tool_calls.is_some() {
                None
            } else {
                Some(self.content)
            },
            reasoning_content: if self.reasoning.is_empty() { None } else { Some(self.reasoning) },
            tool_calls,
        };
        CreateChatCompletionResponse {
            id: self.id,
            object: ChatCompletionObjectType::ChatCompletion,
            created: self.created,
            model: self.model,
            choices: vec![ChatCompletionChoice { index: 0, message, finish_reason: self.finish_reason }],
            usage: self.usage,
        }
    }
}

#[async_trait]
impl ResponseSink for JsonSink {
    async fn on_event(&mut self, event: TurnEvent) {
        match event {
            TurnEvent::ContentDelta(text) => self.content.push_str(&text),
            TurnEvent::ReasoningDelta(text) => self.reasoning.push_str(&text),
            TurnEvent::ToolCallStart { id, name } => {
                self.tool_call = Some((id, name, String::new()));
            }
            TurnEvent::ToolCallArgDelta(text) => {
                if let Some((_, _, arguments)) = self.tool_call.as_mut() {
                    arguments.push_str(&text);
                }
            }
            TurnEvent::ContentReplace(text) => self.content = text,
            TurnEvent::Finish { finish_reason } => self.finish_reason = finish_reason,
        }
    }

    async fn on_usage(&mut self, usage: CompletionUsage) {
        self.usage = Some(usage);
    }

    async fn close(&mut self) {}
}

/// Streams a turn as OpenAI-shaped SSE chunks through a byte channel. The
/// axum response body is built from the receiving end of the same channel
/// (see `router::stream_body`).
pub struct SseSink {
    id: String,
    model: String,
    created: i64,
    sender: tokio::sync::mpsc::Sender<bytes::Bytes>,
    sent_role: bool,
    tool_call_index: Option<i64>,
}

impl SseSink {
    pub fn new(
        id: String,
        model: String,
        created: i64,
        sender: tokio::sync::mpsc::Sender<bytes::Bytes>,
    ) -> Self {
        Self { id, model, created, sender, sent_role: false, tool_call_index: None }
    }

    async fn send_chunk(&self, choice: ChatCompletionStreamChoice, usage: Option<CompletionUsage>) {
        let chunk = CreateChatCompletionStreamResponse {
            id: self.id.clone(),
            object: ChatCompletionChunkObjectType::ChatCompletionChunk,
            created: self.created,
            model: self.model.clone(),
            choices: vec![choice],
            usage,
        };
        let Ok(json) = serde_json::to_vec(&chunk) else { return };
        let mut frame = Vec::with_capacity(json.len() + 8);
        frame.extend_from_slice(b"data: ");
        frame.extend_from_slice(&json);
        frame.extend_from_slice(b"\n\n");
        let _ = self.sender.send(bytes::Bytes::from(frame)).await;
    }

    fn role_if_first(&mut self) -> Option<ChatCompletionRole> {
        if self.sent_role {
            None
        } else {
            self.sent_role = true;
            Some(ChatCompletionRole::Assistant)
        }
    }
}

#[async_trait]
impl ResponseSink for SseSink {
    async fn on_event(&mut self, event: TurnEvent) {
        match event {
            TurnEvent::ContentDelta(text) => {
                let role = self.role_if_first();
                let delta = ChatCompletionStreamResponseDelta {
                    role,
                    content: Some(text),
                    reasoning_content: None,
                    tool_calls: None,
                };
                self.send_chunk(ChatCompletionStreamChoice { index: 0, delta, finish_reason: None }, None)
                    .await;
            }
            TurnEvent::ReasoningDelta(text) => {
                let role = self.role_if_first();
                let delta = ChatCompletionStreamResponseDelta {
                    role,
                    content: None,
                    reasoning_content: Some(text),
                    tool_calls: None,
                };
                self.send_chunk(ChatCompletionStreamChoice { index: 0, delta, finish_reason: None }, None)
                    .await;
            }
            TurnEvent::ToolCallStart { id, name } => {
                let role = self.role_if_first();
                self.tool_call_index = Some(0);
                let chunk = ChatCompletionMessageToolCallChunk {
                    index: 0,
                    id: Some(id),
                    r#type: Some(ChatCompletionToolCallChunkType::Function),
                    function: Some(ChatCompletionMessageToolCallChunkFunction {
                        name: Some(name),
                        arguments: Some(String::new()),
                    }),
                };
                let delta = ChatCompletionStreamResponseDelta {
                    role,
                    content: None,
                    reasoning_content: None,
                    tool_calls: Some(vec![chunk]),
                };
                self.send_chunk(ChatCompletionStreamChoice { index: 0, delta, finish_reason: None }, None)
                    .await;
            }
            TurnEvent::ToolCallArgDelta(text) => {
                let index = self.tool_call_index.unwrap_or(0);
                let chunk = ChatCompletionMessageToolCallChunk {
                    index,
                    id: None,
                    r#type: None,
                    function: Some(ChatCompletionMessageToolCallChunkFunction {
                        name: None,
                        arguments: Some(text),
                    }),
                };
                let delta = ChatCompletionStreamResponseDelta {
                    role: None,
                    content: None,
                    reasoning_content: None,
                    tool_calls: Some(vec![chunk]),
                };
                self.send_chunk(ChatCompletionStreamChoice { index: 0, delta, finish_reason: None }, None)
                    .await;
            }
            TurnEvent::ContentReplace(text) => {
                // The accumulated deltas have already reached the client;
                // only the suffix beyond what was already sent can still be
                // delivered over this channel.
                let role = self.role_if_first();
                let delta = ChatCompletionStreamResponseDelta {
                    role,
                    content: Some(text),
                    reasoning_content: None,
                    tool_calls: None,
                };
                self.send_chunk(ChatCompletionStreamChoice { index: 0, delta, finish_reason: None }, None)
                    .await;
            }
            TurnEvent::Finish { finish_reason } => {
                let delta = ChatCompletionStreamResponseDelta {
                    role: None,
                    content: None,
                    reasoning_content: None,
                    tool_calls: None,
                };
                self.send_chunk(
                    ChatCompletionStreamChoice { index: 0, delta, finish_reason: Some(finish_reason) },
                    None,
                )
                .await;
            }
        }
    }

    async fn on_usage(&mut self, usage: CompletionUsage) {
        let delta = ChatCompletionStreamResponseDelta {
            role: None,
            content: None,
            reasoning_content: None,
            tool_calls: None,
        };
        self.send_chunk(ChatCompletionStreamChoice { index: 0, delta, finish_reason: None }, Some(usage))
            .await;
    }

    async fn close(&mut self) {
        let _ = self.sender.send(bytes::Bytes::from_static(b"data: [DONE]\n\n")).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn json_sink_accumulates_content_and_applies_replace() {
        let mut sink = JsonSink::new("id".to_string(), "m".to_string(), 0);
        sink.on_event(TurnEvent::ContentDelta("hel".to_string())).await;
        sink.on_event(TurnEvent::ContentDelta("lo".to_string())).await;
        sink.on_event(TurnEvent::ContentReplace("final".to_string())).await;
        sink.on_event(TurnEvent::Finish { finish_reason: ChatCompletionFinishReason::Stop }).await;
        let response = sink.into_response();
        assert_eq!(response.choices[0].message.content.as_deref(), Some("final"));
        assert_eq!(response.choices[0].finish_reason, ChatCompletionFinishReason::Stop);
    }

    #[tokio::test]
    async fn json_sink_tool_call_has_no_content_when_only_a_tool_was_called() {
        let mut sink = JsonSink::new("id".to_string(), "m".to_string(), 0);
        sink.on_event(TurnEvent::ToolCallStart { id: "call_1".to_string(), name: "get_weather".to_string() }).await;
        sink.on_event(TurnEvent::ToolCallArgDelta(r#"{"city":"#.to_string())).await;
        sink.on_event(TurnEvent::ToolCallArgDelta(r#""Tokyo"}"#.to_string())).await;
        sink.on_event(TurnEvent::Finish { finish_reason: ChatCompletionFinishReason::ToolCalls }).await;
        let response = sink.into_response();
        assert_eq!(response.choices[0].message.content, None);
        let tool_calls = response.choices[0].message.tool_calls.as_ref().unwrap();
        let ChatCompletionMessageToolCall::Function { id, function } = &tool_calls[0];
        assert_eq!(id, "call_1");
        assert_eq!(function.name, "get_weather");
        assert_eq!(function.arguments, r#"{"city":"Tokyo"}"#);
    }

    #[tokio::test]
    async fn sse_sink_sends_role_only_on_first_chunk() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let mut sink = SseSink::new("id".to_string(), "m".to_string(), 0, tx);
        sink.on_event(TurnEvent::ContentDelta("a".to_string())).await;
        sink.on_event(TurnEvent::ContentDelta("b".to_string())).await;
        sink.close().await;

        let first = rx.recv().await.unwrap();
        assert!(String::from_utf8_lossy(&first).contains("\"role\":\"assistant\""));
        let second = rx.recv().await.unwrap();
        assert!(!String::from_utf8_lossy(&second).contains("\"role\""));
        let done = rx.recv().await.unwrap();
        assert_eq!(&done[..], b"data: [DONE]\n\n");
    }
}
