//! Structured JSON log lines for the dispatch pipeline (`send_success`,
//! `retry_scheduled`, `settings_diff`, ...). Every line carries at least
//! `event`, `adapter`, and `correlation_id` so downstream log tooling can
//! correlate a message end-to-end.
//!
//! Message bodies are never logged whole: a batch can be kilobytes of joined
//! text, so body fields go through [`text_preview`], which flattens the text
//! to one line and bounds its length. JSON escaping itself is serde's job.

use log::Level;
use serde_json::{Map, Value};

/// Longest message-body excerpt a log field may carry.
const PREVIEW_MAX_CHARS: usize = 160;

/// Flatten message text for a log field: whitespace runs (newlines included)
/// become single spaces, other control characters are dropped, and anything
/// past the cap is cut at a char boundary with a trailing ellipsis.
pub fn text_preview(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(PREVIEW_MAX_CHARS) + 4);
    let mut kept = 0usize;
    let mut pending_gap = false;
    for ch in s.chars() {
        if ch.is_whitespace() {
            pending_gap = kept > 0;
            continue;
        }
        if ch.is_control() {
            continue;
        }
        if pending_gap {
            if kept == PREVIEW_MAX_CHARS {
                out.push('…');
                return out;
            }
            out.push(' ');
            kept += 1;
            pending_gap = false;
        }
        if kept == PREVIEW_MAX_CHARS {
            out.push('…');
            return out;
        }
        out.push(ch);
        kept += 1;
    }
    out
}

/// Builder for one structured log line. Field order is stable: `event` first,
/// then `adapter` and `correlation_id`, then extras in insertion order.
pub struct JsonEvent {
    fields: Map<String, Value>,
}

impl JsonEvent {
    pub fn new(event: &str, adapter: &str, correlation_id: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("event".into(), Value::String(event.to_string()));
        fields.insert("adapter".into(), Value::String(adapter.to_string()));
        fields.insert(
            "correlation_id".into(),
            Value::String(correlation_id.to_string()),
        );
        Self { fields }
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn opt_field(self, key: &str, value: Option<impl Into<Value>>) -> Self {
        match value {
            Some(v) => self.field(key, v),
            None => self,
        }
    }

    /// Attach a message body as a bounded single-line preview.
    pub fn text_field(self, key: &str, text: &str) -> Self {
        self.field(key, text_preview(text))
    }

    /// Render the compact JSON line without logging it (used by tests).
    pub fn render(&self) -> String {
        Value::Object(self.fields.clone()).to_string()
    }

    pub fn emit(self, level: Level) {
        log::log!(level, "{}", Value::Object(self.fields));
    }
}

#[cfg(test)]
mod tests {
    use super::{text_preview, JsonEvent};

    #[test]
    fn preview_flattens_multiline_bodies() {
        let body = "weather: sunny\ntemp:\t25C\r\nwind: calm";
        assert_eq!(text_preview(body), "weather: sunny temp: 25C wind: calm");
    }

    #[test]
    fn preview_drops_leading_and_trailing_whitespace() {
        assert_eq!(text_preview("  \n  headline  \n"), "headline");
    }

    #[test]
    fn preview_strips_stray_control_chars() {
        assert_eq!(text_preview("be\u{0007}ep"), "beep");
    }

    #[test]
    fn preview_caps_long_bodies_with_ellipsis() {
        let body = "x".repeat(400);
        let preview = text_preview(&body);
        assert_eq!(preview.chars().count(), 161);
        assert!(preview.ends_with('…'));
    }

    #[test]
    fn json_event_keeps_stable_schema() {
        let line = JsonEvent::new("retry_scheduled", "discord", "abc123")
            .field("attempt", 1)
            .field("max_attempts", 3)
            .opt_field("status_code", Some(429))
            .opt_field("error", None::<&str>)
            .render();
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["event"], "retry_scheduled");
        assert_eq!(parsed["adapter"], "discord");
        assert_eq!(parsed["correlation_id"], "abc123");
        assert_eq!(parsed["attempt"], 1);
        assert!(parsed.get("error").is_none());
    }

    #[test]
    fn text_fields_are_previewed() {
        let line = JsonEvent::new("send_duplicate_skip", "orchestrator", "c1")
            .text_field("text", "line one\nline two")
            .render();
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["text"], "line one line two");
    }
}
