//! Reply envelope decoding.
//!
//! The agent runtime has answered in several shapes over time: bare strings,
//! `{content: [{text}]}`, `{content: "..."}`, `{result: {content: [...]}}`,
//! and JSON documents smuggled inside a `content` string. Every shape is
//! decoded into [`Envelope`] here so callers only ever see display text.

use serde_json::Value;
use thiserror::Error;

/// Object fields that may carry the reply body, in lookup order.
const BODY_FIELDS: [&str; 3] = ["content", "output", "response"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("reply was empty")]
    Empty,
    #[error("reply content had no blocks")]
    EmptyContent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Text(String),
    Blocks(Vec<Value>),
    Nested(Vec<Value>),
    Field(String),
    Opaque(Value),
}

impl Envelope {
    pub fn decode(raw: &Value) -> Result<Envelope, EnvelopeError> {
        match raw {
            Value::Null => Err(EnvelopeError::Empty),
            Value::String(s) => Ok(decode_embedded(s).unwrap_or_else(|| Envelope::Text(s.clone()))),
            Value::Array(blocks) => blocks_or_empty(blocks, Envelope::Blocks),
            Value::Object(map) => {
                let body = BODY_FIELDS
                    .iter()
                    .filter_map(|f| map.get(*f))
                    .find(|v| !v.is_null());

                match body {
                    Some(Value::Array(blocks)) => blocks_or_empty(blocks, Envelope::Blocks),
                    Some(Value::String(s)) => {
                        Ok(decode_embedded(s).unwrap_or_else(|| Envelope::Field(s.clone())))
                    }
                    _ => {
                        if let Some(blocks) = map
                            .get("result")
                            .and_then(|r| r.get("content"))
                            .and_then(Value::as_array)
                        {
                            return blocks_or_empty(blocks, Envelope::Nested);
                        }
                        let fallback = ["message", "body"]
                            .iter()
                            .find_map(|f| map.get(*f).and_then(Value::as_str));
                        match fallback {
                            Some(s) => Ok(Envelope::Field(s.to_string())),
                            None => Ok(Envelope::Opaque(raw.clone())),
                        }
                    }
                }
            }
            other => Ok(Envelope::Opaque(other.clone())),
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Envelope::Text(s) | Envelope::Field(s) => s,
            Envelope::Blocks(blocks) => {
                match blocks.iter().find_map(|b| b.get("text").and_then(Value::as_str)) {
                    Some(text) => text.to_string(),
                    None => blocks.iter().map(block_text).collect::<Vec<_>>().join("\n"),
                }
            }
            Envelope::Nested(blocks) => {
                blocks
                    .iter()
                    .map(|b| b.get("text").and_then(Value::as_str).unwrap_or(""))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            Envelope::Opaque(value) => value.to_string(),
        }
    }
}

/// Extracts display text from an agent reply, or `None` when there is
/// nothing to show.
pub fn normalize(raw: &Value) -> Option<String> {
    match Envelope::decode(raw) {
        Ok(envelope) => Some(envelope.into_text()),
        Err(e) => {
            log::debug!("Agent reply could not be normalized: {}", e);
            None
        }
    }
}

/// Turns reply text into a value [`normalize`] can work on. JSON objects
/// and arrays keep their structure; anything else stays a plain string.
pub fn parse_reply_text(text: String) -> Value {
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => value,
        _ => Value::String(text),
    }
}

fn blocks_or_empty(
    blocks: &[Value],
    wrap: fn(Vec<Value>) -> Envelope
) -> Result<Envelope, EnvelopeError> {
    if blocks.is_empty() {
        Err(EnvelopeError::EmptyContent)
    } else {
        Ok(wrap(blocks.to_vec()))
    }
}

// One level only: a string holding `{result:{content}}` or `{content:[..]}`.
fn decode_embedded(s: &str) -> Option<Envelope> {
    let trimmed = s.trim_start();
    if !trimmed.starts_with('{') {
        return None;
    }
    let inner: Value = serde_json::from_str(trimmed).ok()?;
    if let Some(blocks) = inner
        .get("result")
        .and_then(|r| r.get("content"))
        .and_then(Value::as_array)
    {
        return Some(Envelope::Nested(blocks.clone()));
    }
    inner
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| Envelope::Nested(blocks.clone()))
}

fn block_text(block: &Value) -> String {
    match block.get("text").and_then(Value::as_str) {
        Some(t) => t.to_string(),
        None => block.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_block_text() {
        assert_eq!(normalize(&json!({"content": [{"text": "hello"}]})).as_deref(), Some("hello"));
    }

    #[test]
    fn content_string() {
        assert_eq!(normalize(&json!({"content": "hello"})).as_deref(), Some("hello"));
    }

    #[test]
    fn first_text_block_wins() {
        let raw = json!({"content": [{"text": "a"}, {"text": "b"}]});
        assert_eq!(normalize(&raw).as_deref(), Some("a"));
    }

    #[test]
    fn blocks_without_text_are_joined() {
        let raw = json!({"content": [{"image": "x"}, {"toolUse": {"name": "search"}}]});
        assert_eq!(
            normalize(&raw).as_deref(),
            Some("{\"image\":\"x\"}\n{\"toolUse\":{\"name\":\"search\"}}")
        );
    }

    #[test]
    fn nested_result_joins_all_blocks() {
        let raw = json!({"result": {"content": [{"text": "line one"}, {"text": "line two"}]}});
        assert_eq!(normalize(&raw).as_deref(), Some("line one\nline two"));
    }

    #[test]
    fn json_inside_content_string_is_unwrapped() {
        let inner = json!({"result": {"role": "assistant", "content": [{"text": "Try Ohio State."}]}});
        let raw = json!({"id": "m1", "role": "assistant", "content": inner.to_string()});
        assert_eq!(normalize(&raw).as_deref(), Some("Try Ohio State."));
    }

    #[test]
    fn output_and_response_are_body_fallbacks() {
        assert_eq!(normalize(&json!({"output": "from output"})).as_deref(), Some("from output"));
        assert_eq!(
            normalize(&json!({"response": [{"text": "from response"}]})).as_deref(),
            Some("from response")
        );
    }

    #[test]
    fn message_then_body() {
        assert_eq!(normalize(&json!({"message": "m", "body": "b"})).as_deref(), Some("m"));
        assert_eq!(normalize(&json!({"body": "b"})).as_deref(), Some("b"));
    }

    #[test]
    fn unknown_object_is_stringified() {
        let raw = json!({"status": 7});
        assert_eq!(normalize(&raw).as_deref(), Some("{\"status\":7}"));
    }

    #[test]
    fn bare_string_and_array() {
        assert_eq!(normalize(&json!("plain")).as_deref(), Some("plain"));
        assert_eq!(normalize(&json!([{"text": "x"}])).as_deref(), Some("x"));
    }

    #[test]
    fn empty_replies_decode_as_errors() {
        assert_eq!(Envelope::decode(&Value::Null), Err(EnvelopeError::Empty));
        assert_eq!(Envelope::decode(&json!({"content": []})), Err(EnvelopeError::EmptyContent));
        assert_eq!(normalize(&Value::Null), None);
    }

    #[test]
    fn content_takes_precedence_over_nested_result() {
        let raw = json!({"content": [{"text": "a"}], "result": {"content": [{"text": "x"}]}});
        assert_eq!(normalize(&raw).as_deref(), Some("a"));

        let raw = json!({"content": "hello", "result": {"content": []}});
        assert_eq!(normalize(&raw).as_deref(), Some("hello"));
    }

    #[test]
    fn nested_result_beats_message_fallback() {
        let raw = json!({"message": "status text", "result": {"content": [{"text": "answer"}]}});
        assert_eq!(normalize(&raw).as_deref(), Some("answer"));
    }

    #[test]
    fn reply_text_keeps_json_structure_only() {
        let parsed = parse_reply_text(" {\"content\":[{\"text\":\"hi\"}]} ".to_string());
        assert_eq!(normalize(&parsed).as_deref(), Some("hi"));
        assert_eq!(parse_reply_text("just words".into()), json!("just words"));
        assert_eq!(parse_reply_text("42".into()), json!("42"));
    }
}
