use chatrelay_upstream::UpstreamEvent;
use serde_json::Value;

use crate::sink::TurnEvent;

/// Routes upstream `session_state.*` field events into content or reasoning
/// deltas. Field-name prefixes are the only signal; the upstream never
/// labels a field as "reasoning" directly.
pub struct Translator {
    reasoning_visible: bool,
    content: String,
    reasoning: String,
}

impl Translator {
    pub fn new(reasoning_visible: bool) -> Self {
        Self { reasoning_visible, content: String::new(), reasoning: String::new() }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    /// Unwraps the `detailAnswer` field of a `message_result` payload for
    /// models configured to return that shape, overriding whatever content
    /// was accumulated from deltas.
    pub fn finalize_content(&self, unwrap_detail_answer: bool, message_result_content: Option<&Value>) -> String {
        if unwrap_detail_answer {
            if let Some(detail) = message_result_content.and_then(|value| value.get("detailAnswer")).and_then(Value::as_str) {
                return detail.to_string();
            }
        }
        self.content.clone()
    }

    pub fn handle_event(&mut self, event: &UpstreamEvent) -> Option<TurnEvent> {
        match event {
            UpstreamEvent::MessageFieldDelta { field_name, delta } => self.route(field_name, delta.clone()),
            UpstreamEvent::MessageField { field_name, value } => {
                let text = field_value_as_text(value);
                self.route(field_name, text)
            }
            _ => None,
        }
    }

    fn route(&mut self, field_name: &str, text: String) -> Option<TurnEvent> {
        if text.is_empty() {
            return None;
        }
        if field_name == "session_state.answer"
            || field_name.starts_with("session_state.streaming_detail_answer")
            || field_name == "session_state.streaming_markmap"
        {
            self.content.push_str(&text);
            return Some(TurnEvent::ContentDelta(text));
        }
        if field_name.starts_with("session_state.layer_") {
            self.reasoning.push_str(&text);
            return Some(TurnEvent::ReasoningDelta(text));
        }
        if field_name == "session_state.answerthink" {
            if self.reasoning_visible {
                self.reasoning.push_str(&text);
                return Some(TurnEvent::ReasoningDelta(text));
            }
            return None;
        }
        // session_state.answerthink_is_started / _is_finished and any other
        // field carry no client-visible signal.
        None
    }
}

fn field_value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(field_name: &str, delta: &str) -> UpstreamEvent {
        UpstreamEvent::MessageFieldDelta { field_name: field_name.to_string(), delta: delta.to_string() }
    }

    #[test]
    fn answer_field_routes_to_content() {
        let mut translator = Translator::new(false);
        let event = translator.handle_event(&delta("session_state.answer", "Hello")).unwrap();
        assert!(matches!(event, TurnEvent::ContentDelta(text) if text == "Hello"));
        assert_eq!(translator.content(), "Hello");
    }

    #[test]
    fn layer_prefixed_field_routes_to_reasoning() {
        let mut translator = Translator::new(false);
        let event = translator.handle_event(&delta("session_state.layer_plan", "thinking")).unwrap();
        assert!(matches!(event, TurnEvent::ReasoningDelta(text) if text == "thinking"));
        assert_eq!(translator.reasoning(), "thinking");
    }

    #[test]
    fn answerthink_is_dropped_unless_configured_visible() {
        let mut hidden = Translator::new(false);
        assert!(hidden.handle_event(&delta("session_state.answerthink", "secret")).is_none());

        let mut visible = Translator::new(true);
        let event = visible.handle_event(&delta("session_state.answerthink", "secret")).unwrap();
        assert!(matches!(event, TurnEvent::ReasoningDelta(text) if text == "secret"));
    }

    #[test]
    fn lifecycle_markers_are_ignored() {
        let mut translator = Translator::new(true);
        assert!(translator.handle_event(&delta("session_state.answerthink_is_started", "true")).is_none());
        assert!(translator.handle_event(&delta("session_state.answerthink_is_finished", "true")).is_none());
    }

    #[test]
    fn streaming_markmap_routes_to_content() {
        let mut translator = Translator::new(false);
        let event = translator.handle_event(&delta("session_state.streaming_markmap", "# Title")).unwrap();
        assert!(matches!(event, TurnEvent::ContentDelta(text) if text == "# Title"));
    }

    #[test]
    fn detail_answer_unwraps_when_configured() {
        let translator = Translator::new(false);
        let result = serde_json::json!({"detailAnswer": "final text"});
        assert_eq!(translator.finalize_content(true, Some(&result)), "final text");
        assert_eq!(translator.finalize_content(false, Some(&result)), "");
    }
}
