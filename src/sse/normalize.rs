use crate::protocol::{AgentPayload, AgentRecord, Content, NormalizedEvent, Part};
use serde_json::Value;

use super::Frame;

const DATA_PREFIX: &str = "data: ";

/// Classifies one complete upstream line.
///
/// `data: ` lines carrying an agent record become [`Frame::Event`]; anything
/// else that is not blank (comments, `event:` fields, undecodable payloads) is
/// forwarded untouched as [`Frame::Raw`].
pub fn normalize_line(line: &str) -> Option<Frame> {
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        if line.trim().is_empty() {
            return None;
        }
        return Some(Frame::Raw(line.to_string()));
    };

    if payload.trim().is_empty() {
        return None;
    }

    match parse_payload(payload) {
        Some(event) => Some(Frame::Event(event)),
        None => Some(Frame::Raw(line.to_string())),
    }
}

/// Parses a `data:` payload into a normalized event, if it carries a record.
pub fn parse_payload(payload: &str) -> Option<NormalizedEvent> {
    let payload: AgentPayload = serde_json::from_str(payload).ok()?;
    payload.into_record().map(normalize)
}

pub fn normalize(record: AgentRecord) -> NormalizedEvent {
    let mut content = match record.content {
        Some(content) => content,
        None => Content {
            parts: vec![Part::text(fallback_text(record.output, record.response))],
            role: None,
        },
    };
    if content.parts.is_empty() {
        content.parts.push(Part::text(""));
    }

    NormalizedEvent {
        content,
        author: record.author,
        actions: record.actions,
        usage_metadata: record.usage_metadata,
    }
}

/// A part's `text` must be a string for clients that concatenate parts, so
/// structured `output` values are carried as their JSON text.
fn fallback_text(output: Option<Value>, response: Option<Value>) -> String {
    match output.or(response) {
        Some(Value::String(text)) => text,
        Some(other) => other.to_string(),
        None => String::new(),
    }
}
