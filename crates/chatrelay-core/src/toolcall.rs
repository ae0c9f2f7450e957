//! Incremental parsing of the upstream's free-text tool-call protocol.
//!
//! The upstream has no native tool-calling support: when tools are offered,
//! the system prompt instructs the model to reply with one of two JSON
//! shapes (`{"type":"response","content":"..."}` or
//! `{"type":"tool_call","tool":"...","arguments":{...}}`). Not every model
//! honors that instruction reliably, so a textual fallback format is also
//! recognized: `[Assistant called tools]:\n- NAME(JSON)\n`.

use chatrelay_protocol::openai::chat::{
    ChatCompletionAssistantContent, ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessage,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    ChatCompletionTextContent, ChatCompletionTextContentPart, ChatCompletionToolDefinition, ChatCompletionUserContent,
};
use rand::Rng;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallEvent {
    Content(char),
    ToolCallStart { tool: String },
    ToolCallInc(char),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseKind {
    Unknown,
    Response,
    ToolCall,
}

fn unescape(ch: char) -> char {
    match ch {
        'n' => '\n',
        'r' => '\r',
        't' => '\t',
        'b' => '\u{8}',
        'f' => '\u{c}',
        other => other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    InObject,
    InKey,
    AfterKey,
    BeforeValue,
    InGenericString { escape: bool },
    InContentString { escape: bool },
    InArgumentsValue { depth: i32, in_string: bool, escape: bool },
    AfterValue,
    Done,
}

struct JsonParser {
    phase: Phase,
    key_buffer: String,
    current_key: String,
    response_kind: ResponseKind,
    tool_name: String,
    started_tool_call: bool,
}

impl JsonParser {
    fn new() -> Self {
        Self {
            phase: Phase::InObject,
            key_buffer: String::new(),
            current_key: String::new(),
            response_kind: ResponseKind::Unknown,
            tool_name: String::new(),
            started_tool_call: false,
        }
    }

    fn feed(&mut self, ch: char) -> Vec<ToolCallEvent> {
        let mut events = Vec::new();
        match self.phase {
            Phase::InObject => {
                if ch == '"' {
                    self.key_buffer.clear();
                    self.phase = Phase::InKey;
                } else if ch == '}' {
                    self.phase = Phase::Done;
                }
            }
            Phase::InKey => {
                if ch == '"' {
                    self.current_key = std::mem::take(&mut self.key_buffer);
                    self.phase = Phase::AfterKey;
                } else {
                    self.key_buffer.push(ch);
                }
            }
            Phase::AfterKey => {
                if ch == ':' {
                    self.phase = Phase::BeforeValue;
                }
            }
            Phase::BeforeValue => {
                if ch.is_whitespace() {
                    return events;
                }
                match self.current_key.as_str() {
                    "arguments" if self.response_kind == ResponseKind::ToolCall && ch == '{' => {
                        if !self.started_tool_call {
                            events.push(ToolCallEvent::ToolCallStart { tool: self.tool_name.clone() });
                            self.started_tool_call = true;
                        }
                        events.push(ToolCallEvent::ToolCallInc(ch));
                        self.phase = Phase::InArgumentsValue { depth: 1, in_string: false, escape: false };
                    }
                    "content" if self.response_kind == ResponseKind::Response && ch == '"' => {
                        self.phase = Phase::InContentString { escape: false };
                    }
                    _ if ch == '"' => {
                        self.phase = Phase::InGenericString { escape: false };
                    }
                    _ => {
                        // Unrecognized, non-string value (number/bool/null):
                        // nothing in the protocol needs these, bail out
                        // rather than model full JSON-value skipping.
                        self.phase = Phase::Done;
                    }
                }
            }
            Phase::InGenericString { escape } => {
                if escape {
                    self.key_buffer.push(unescape(ch));
                    self.phase = Phase::InGenericString { escape: false };
                } else if ch == '\\' {
                    self.phase = Phase::InGenericString { escape: true };
                } else if ch == '"' {
                    let value = std::mem::take(&mut self.key_buffer);
                    match self.current_key.as_str() {
                        "type" => {
                            self.response_kind = match value.as_str() {
                                "tool_call" => ResponseKind::ToolCall,
                                "response" => ResponseKind::Response,
                                _ => ResponseKind::Unknown,
                            };
                        }
                        "tool" => self.tool_name = value,
                        _ => {}
                    }
                    self.phase = Phase::AfterValue;
                } else {
                    self.key_buffer.push(ch);
                }
            }
            Phase::InContentString { escape } => {
                if escape {
                    events.push(ToolCallEvent::Content(unescape(ch)));
                    self.phase = Phase::InContentString { escape: false };
                } else if ch == '\\' {
                    self.phase = Phase::InContentString { escape: true };
                } else if ch == '"' {
                    self.phase = Phase::AfterValue;
                } else {
                    events.push(ToolCallEvent::Content(ch));
                }
            }
            Phase::InArgumentsValue { mut depth, mut in_string, mut escape } => {
                if escape {
                    events.push(ToolCallEvent::ToolCallInc(ch));
                    escape = false;
                } else if in_string {
                    events.push(ToolCallEvent::ToolCallInc(ch));
                    match ch {
                        '\\' => escape = true,
                        '"' => in_string = false,
                        _ => {}
                    }
                } else {
                    match ch {
                        '"' => {
                            in_string = true;
                            events.push(ToolCallEvent::ToolCallInc(ch));
                        }
                        '{' => {
                            depth += 1;
                            events.push(ToolCallEvent::ToolCallInc(ch));
                        }
                        '}' => {
                            depth -= 1;
                            events.push(ToolCallEvent::ToolCallInc(ch));
                            if depth == 0 {
                                self.phase = Phase::AfterValue;
                                return events;
                            }
                        }
                        _ => events.push(ToolCallEvent::ToolCallInc(ch)),
                    }
                }
                self.phase = Phase::InArgumentsValue { depth, in_string, escape };
            }
            Phase::AfterValue => {
                if ch == ',' {
                    self.current_key.clear();
                    self.phase = Phase::InObject;
                } else if ch == '}' {
                    self.phase = Phase::Done;
                }
            }
            Phase::Done => {}
        }
        events
    }

    fn kind(&self) -> Option<ResponseKind> {
        if self.response_kind == ResponseKind::Unknown {
            None
        } else {
            Some(self.response_kind)
        }
    }
}

enum SentinelStage {
    SkippingToDash,
    ReadingName,
    ReadingArgs { depth: i32, in_string: bool, escape: bool },
    Finished,
}

struct SentinelParser {
    raw: String,
    stage: SentinelStage,
}

impl SentinelParser {
    fn new() -> Self {
        Self { raw: String::new(), stage: SentinelStage::SkippingToDash }
    }

    fn feed(&mut self, ch: char) -> Vec<ToolCallEvent> {
        let mut events = Vec::new();
        match &mut self.stage {
            SentinelStage::SkippingToDash => {
                self.raw.push(ch);
                if self.raw == "- " || self.raw.ends_with("\n- ") {
                    self.raw.clear();
                    self.stage = SentinelStage::ReadingName;
                }
            }
            SentinelStage::ReadingName => {
                if ch == '(' {
                    let name = std::mem::take(&mut self.raw);
                    events.push(ToolCallEvent::ToolCallStart { tool: name.trim().to_string() });
                    self.stage = SentinelStage::ReadingArgs { depth: 1, in_string: false, escape: false };
                } else {
                    self.raw.push(ch);
                }
            }
            SentinelStage::ReadingArgs { depth, in_string, escape } => {
                if *escape {
                    events.push(ToolCallEvent::ToolCallInc(ch));
                    *escape = false;
                } else if *in_string {
                    events.push(ToolCallEvent::ToolCallInc(ch));
                    match ch {
                        '\\' => *escape = true,
                        '"' => *in_string = false,
                        _ => {}
                    }
                } else {
                    match ch {
                        '"' => {
                            *in_string = true;
                            events.push(ToolCallEvent::ToolCallInc(ch));
                        }
                        '(' => {
                            *depth += 1;
                            events.push(ToolCallEvent::ToolCallInc(ch));
                        }
                        ')' => {
                            *depth -= 1;
                            if *depth == 0 {
                                self.stage = SentinelStage::Finished;
                            } else {
                                events.push(ToolCallEvent::ToolCallInc(ch));
                            }
                        }
                        _ => events.push(ToolCallEvent::ToolCallInc(ch)),
                    }
                }
            }
            SentinelStage::Finished => {}
        }
        events
    }
}

enum Mode {
    Undetermined,
    Json(JsonParser),
    Sentinel(SentinelParser),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedKind {
    Unset,
    Content,
    ToolCall,
}

/// Single-pass, O(input)-memory state machine driving a model's raw
/// character stream into `ToolCallEvent`s. Fed one `char` at a time so it
/// can sit directly in the upstream event loop without buffering a whole
/// turn before deciding what to do with it.
pub struct IncrementalToolCallParser {
    mode: Mode,
}

impl IncrementalToolCallParser {
    pub fn new() -> Self {
        Self { mode: Mode::Undetermined }
    }

    pub fn push_char(&mut self, ch: char) -> Vec<ToolCallEvent> {
        match &mut self.mode {
            Mode::Undetermined => {
                if ch.is_whitespace() {
                    return Vec::new();
                }
                if ch == '{' {
                    let mut parser = JsonParser::new();
                    let events = parser.feed(ch);
                    self.mode = Mode::Json(parser);
                    events
                } else {
                    let mut parser = SentinelParser::new();
                    let events = parser.feed(ch);
                    self.mode = Mode::Sentinel(parser);
                    events
                }
            }
            Mode::Json(parser) => parser.feed(ch),
            Mode::Sentinel(parser) => parser.feed(ch),
        }
    }

    pub fn push_str(&mut self, text: &str) -> Vec<ToolCallEvent> {
        text.chars().flat_map(|ch| self.push_char(ch)).collect()
    }

    pub fn kind(&self) -> ParsedKind {
        match &self.mode {
            Mode::Json(parser) => match parser.kind() {
                Some(ResponseKind::ToolCall) => ParsedKind::ToolCall,
                Some(ResponseKind::Response) => ParsedKind::Content,
                _ => ParsedKind::Unset,
            },
            Mode::Sentinel(_) => ParsedKind::ToolCall,
            Mode::Undetermined => ParsedKind::Unset,
        }
    }
}

impl Default for IncrementalToolCallParser {
    fn default() -> Self {
        Self::new()
    }
}

pub enum ExtractedReply {
    Content(String),
    ToolCall { name: String, arguments: Value },
}

/// Non-streaming extraction: scans for the first balanced top-level JSON
/// object and falls back to returning the raw text as content if none is
/// found or it doesn't match either known shape.
pub fn extract_tool_call(text: &str) -> ExtractedReply {
    if let Some(json_text) = extract_outer_json_object(text) {
        if let Ok(value) = serde_json::from_str::<Value>(&json_text) {
            match value.get("type").and_then(Value::as_str) {
                Some("tool_call") => {
                    if let (Some(tool), Some(arguments)) =
                        (value.get("tool").and_then(Value::as_str), value.get("arguments"))
                    {
                        return ExtractedReply::ToolCall { name: tool.to_string(), arguments: arguments.clone() };
                    }
                }
                Some("response") => {
                    if let Some(content) = value.get("content").and_then(Value::as_str) {
                        return ExtractedReply::Content(content.to_string());
                    }
                }
                _ => {}
            }
        }
    }
    ExtractedReply::Content(text.to_string())
}

fn extract_outer_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    let mut end = None;
    for (i, ch) in text[start..].char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    end = Some(start + i + ch.len_utf8());
                    break;
                }
            }
            _ => {}
        }
    }
    end.map(|e| text[start..e].to_string())
}

/// Rewrites prior turns so a history that already contains tool calls and
/// tool results reads back to the upstream as plain text, using the same
/// textual shape the sentinel fallback parser recognizes. The upstream has
/// no concept of tool roles at all.
pub fn shim_tool_history(messages: Vec<ChatCompletionRequestMessage>) -> Vec<ChatCompletionRequestMessage> {
    messages.into_iter().map(shim_one).collect()
}

fn shim_one(message: ChatCompletionRequestMessage) -> ChatCompletionRequestMessage {
    match message {
        ChatCompletionRequestMessage::Assistant(assistant) if assistant.tool_calls.is_some() => {
            let mut text = String::from("[Assistant called tools]:\n");
            for call in assistant.tool_calls.as_deref().unwrap_or_default() {
                let ChatCompletionMessageToolCall::Function { function, .. } = call;
                text.push_str(&format!("- {}({})\n", function.name, function.arguments));
            }
            ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                content: Some(ChatCompletionAssistantContent::Text(text)),
                name: assistant.name,
                tool_calls: None,
            })
        }
        ChatCompletionRequestMessage::Tool(tool) => {
            let text = text_content_as_string(&tool.content);
            ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: ChatCompletionUserContent::Text(format!("[Tool result for {}]: {text}", tool.tool_call_id)),
                name: None,
            })
        }
        other => other,
    }
}

fn text_content_as_string(content: &ChatCompletionTextContent) -> String {
    match content {
        ChatCompletionTextContent::Text(text) => text.clone(),
        ChatCompletionTextContent::Parts(parts) => parts
            .iter()
            .map(|ChatCompletionTextContentPart::Text { text }| text.as_str())
            .collect::<Vec<_>>()
            .join(""),
    }
}

/// Builds and injects (or merges into an existing leading system message)
/// the instruction that tells the model to reply with one of the two JSON
/// envelope shapes this module's `JsonParser` understands.
pub fn inject_tool_system_prompt(messages: &mut Vec<ChatCompletionRequestMessage>, tools: &[ChatCompletionToolDefinition]) {
    let prompt = build_tool_system_prompt(tools);
    if let Some(ChatCompletionRequestMessage::System(system)) = messages.first_mut() {
        let existing = text_content_as_string(&system.content);
        system.content = ChatCompletionTextContent::Text(format!("{existing}\n\n{prompt}"));
        return;
    }
    messages.insert(
        0,
        ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
            content: ChatCompletionTextContent::Text(prompt),
            name: None,
        }),
    );
}

fn build_tool_system_prompt(tools: &[ChatCompletionToolDefinition]) -> String {
    let mut listing = String::new();
    for tool in tools {
        let ChatCompletionToolDefinition::Function { function } = tool;
        listing.push_str(&format!("- {}: {}\n", function.name, function.description.as_deref().unwrap_or("")));
        if let Some(parameters) = &function.parameters {
            listing.push_str(&format!("  arguments schema: {parameters}\n"));
        }
    }
    format!(
        "You may call one of the following tools:\n{listing}\n\
         Reply with exactly one JSON object and nothing else: either \
         {{\"type\":\"tool_call\",\"tool\":\"<name>\",\"arguments\":{{...}}}} to call a tool, \
         or {{\"type\":\"response\",\"content\":\"<text>\"}} to reply without calling a tool."
    )
}

/// Ids in this shape are never round-tripped through the upstream, so any
/// unique-enough value works; this mirrors the `call_` prefix OpenAI itself
/// uses.
pub fn generate_tool_call_id() -> String {
    let suffix: u32 = rand::rng().random();
    format!("call_{suffix:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(text: &str) -> (Vec<ToolCallEvent>, ParsedKind) {
        let mut parser = IncrementalToolCallParser::new();
        let events = parser.push_str(text);
        (events, parser.kind())
    }

    #[test]
    fn parses_plain_response_json_as_content_events() {
        let (events, kind) = run(r#"{"type":"response","content":"hi there"}"#);
        assert_eq!(kind, ParsedKind::Content);
        let content: String = events
            .iter()
            .filter_map(|e| match e {
                ToolCallEvent::Content(c) => Some(*c),
                _ => None,
            })
            .collect();
        assert_eq!(content, "hi there");
    }

    #[test]
    fn parses_tool_call_json_incrementally_across_arbitrary_chunk_boundaries() {
        let full = r#"{"type":"tool_call","tool":"get_weather","arguments":{"city":"Tokyo"}}"#;
        // Feed one character at a time: the parser must not care where
        // chunk boundaries fall.
        let mut parser = IncrementalToolCallParser::new();
        let mut events = Vec::new();
        for ch in full.chars() {
            events.extend(parser.push_char(ch));
        }
        assert_eq!(parser.kind(), ParsedKind::ToolCall);
        assert!(events.iter().any(|e| matches!(e, ToolCallEvent::ToolCallStart { tool } if tool == "get_weather")));
        let args: String = events
            .iter()
            .filter_map(|e| match e {
                ToolCallEvent::ToolCallInc(c) => Some(*c),
                _ => None,
            })
            .collect();
        assert_eq!(args, r#"{"city":"Tokyo"}"#);
    }

    #[test]
    fn escaped_quote_inside_arguments_does_not_end_the_value() {
        let full = r#"{"type":"tool_call","tool":"echo","arguments":{"text":"a \"quoted\" word"}}"#;
        let (events, _) = run(full);
        let args: String = events
            .iter()
            .filter_map(|e| match e {
                ToolCallEvent::ToolCallInc(c) => Some(*c),
                _ => None,
            })
            .collect();
        assert_eq!(args, r#"{"text":"a \"quoted\" word"}"#);
    }

    #[test]
    fn textual_sentinel_fallback_extracts_tool_name_and_arguments() {
        let full = "[Assistant called tools]:\n- search_web({\"query\":\"rust async\"})\n";
        let (events, kind) = run(full);
        assert_eq!(kind, ParsedKind::ToolCall);
        assert!(events.iter().any(|e| matches!(e, ToolCallEvent::ToolCallStart { tool } if tool == "search_web")));
        let args: String = events
            .iter()
            .filter_map(|e| match e {
                ToolCallEvent::ToolCallInc(c) => Some(*c),
                _ => None,
            })
            .collect();
        assert_eq!(args, r#"{"query":"rust async"}"#);
    }

    #[test]
    fn paren_inside_sentinel_string_does_not_terminate_early() {
        let full = "[Assistant called tools]:\n- run(\"(nested)\")\n";
        let (events, _) = run(full);
        let args: String = events
            .iter()
            .filter_map(|e| match e {
                ToolCallEvent::ToolCallInc(c) => Some(*c),
                _ => None,
            })
            .collect();
        assert_eq!(args, "\"(nested)\"");
    }

    #[test]
    fn non_streaming_extraction_falls_back_to_raw_text_on_malformed_json() {
        let reply = extract_tool_call("not json at all");
        assert!(matches!(reply, ExtractedReply::Content(text) if text == "not json at all"));
    }

    #[test]
    fn non_streaming_extraction_parses_tool_call() {
        let reply = extract_tool_call(r#"prefix noise {"type":"tool_call","tool":"ping","arguments":{"n":1}} trailing"#);
        match reply {
            ExtractedReply::ToolCall { name, arguments } => {
                assert_eq!(name, "ping");
                assert_eq!(arguments, serde_json::json!({"n": 1}));
            }
            ExtractedReply::Content(_) => panic!("expected tool call"),
        }
    }

    #[test]
    fn shim_tool_history_rewrites_assistant_tool_calls_and_tool_results_as_text() {
        let messages = vec![
            ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                content: None,
                name: None,
                tool_calls: Some(vec![ChatCompletionMessageToolCall::Function {
                    id: "call_1".to_string(),
                    function: ChatCompletionMessageToolCallFunction {
                        name: "get_weather".to_string(),
                        arguments: r#"{"city":"Tokyo"}"#.to_string(),
                    },
                }]),
            }),
            ChatCompletionRequestMessage::Tool(chatrelay_protocol::openai::chat::ChatCompletionRequestToolMessage {
                tool_call_id: "call_1".to_string(),
                content: ChatCompletionTextContent::Text("18C and sunny".to_string()),
            }),
        ];
        let shimmed = shim_tool_history(messages);
        match &shimmed[0] {
            ChatCompletionRequestMessage::Assistant(assistant) => {
                assert!(assistant.tool_calls.is_none());
                let text = text_content_as_string_for_test(assistant.content.as_ref().unwrap());
                assert!(text.contains("get_weather({\"city\":\"Tokyo\"})"));
            }
            _ => panic!("expected assistant message"),
        }
        match &shimmed[1] {
            ChatCompletionRequestMessage::User(user) => {
                let ChatCompletionUserContent::Text(text) = &user.content else { panic!("expected text content") };
                assert!(text.contains("call_1"));
                assert!(text.contains("18C and sunny"));
            }
            _ => panic!("expected tool result rewritten as user message"),
        }
    }

    fn text_content_as_string_for_test(content: &ChatCompletionAssistantContent) -> String {
        match content {
            ChatCompletionAssistantContent::Text(text) => text.clone(),
        }
    }

    #[test]
    fn inject_tool_system_prompt_merges_into_existing_leading_system_message() {
        let mut messages = vec![ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
            content: ChatCompletionTextContent::Text("be terse".to_string()),
            name: None,
        })];
        let tools = vec![ChatCompletionToolDefinition::Function {
            function: chatrelay_protocol::openai::chat::FunctionObject {
                name: "get_weather".to_string(),
                description: Some("looks up the weather".to_string()),
                parameters: None,
            },
        }];
        inject_tool_system_prompt(&mut messages, &tools);
        assert_eq!(messages.len(), 1);
        let ChatCompletionRequestMessage::System(system) = &messages[0] else { panic!("expected system message") };
        let text = text_content_as_string(&system.content);
        assert!(text.starts_with("be terse"));
        assert!(text.contains("get_weather"));
        assert!(text.contains("tool_call"));
    }

    #[test]
    fn inject_tool_system_prompt_inserts_one_when_none_exists() {
        let mut messages = vec![ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
            content: ChatCompletionUserContent::Text("hi".to_string()),
            name: None,
        })];
        inject_tool_system_prompt(&mut messages, &[]);
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], ChatCompletionRequestMessage::System(_)));
    }

    #[test]
    fn generated_tool_call_ids_are_unique_and_prefixed() {
        let a = generate_tool_call_id();
        let b = generate_tool_call_id();
        assert_ne!(a, b);
        assert!(a.starts_with("call_"));
    }
}
