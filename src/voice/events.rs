//! Realtime control-channel messages.
//!
//! Inbound payloads are decoded into a closed set of [`ControlEvent`]s.
//! Anything that is not JSON or has an unknown shape decodes to
//! [`ControlEvent::Unrecognized`]; decoding never fails.

use serde_json::{Value, json};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// Incremental assistant text.
    TextDelta(String),
    /// The assistant finished its response.
    ResponseDone,
    SessionUpdated,
    Error(String),
    Unrecognized,
}

const DELTA_TYPES: &[&str] = &[
    "response.output_text.delta",
    "response.text.delta",
    "response.audio_transcript.delta",
];

const DONE_TYPES: &[&str] = &[
    "response.completed",
    "response.output_text.done",
    "response.text.done",
    "response.done",
];

pub fn decode_control_event(raw: &str) -> ControlEvent {
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        return ControlEvent::Unrecognized;
    };
    if !value.is_object() {
        return ControlEvent::Unrecognized;
    }

    // Nested shape carries no type field of its own.
    if let Some(delta) = value
        .pointer("/response/output_text/delta")
        .and_then(Value::as_str)
    {
        return text_delta(delta);
    }

    match value.get("type").and_then(Value::as_str) {
        Some("session.created" | "session.updated") => ControlEvent::SessionUpdated,
        Some("error") => {
            let message = value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("unknown realtime error");
            ControlEvent::Error(message.to_string())
        }
        Some(t) if DONE_TYPES.contains(&t) => ControlEvent::ResponseDone,
        Some(t) if DELTA_TYPES.contains(&t) => value
            .get("delta")
            .and_then(Value::as_str)
            .map(text_delta)
            .unwrap_or(ControlEvent::Unrecognized),
        Some(_) => ControlEvent::Unrecognized,
        // Untyped `{delta}` counts unless it is a transcript of the user.
        None => match value.get("delta").and_then(Value::as_str) {
            Some(delta) if value.get("transcript").is_none() => text_delta(delta),
            _ => ControlEvent::Unrecognized,
        },
    }
}

fn text_delta(delta: &str) -> ControlEvent {
    if delta.is_empty() {
        ControlEvent::Unrecognized
    } else {
        ControlEvent::TextDelta(delta.to_string())
    }
}

/// The session configuration message. Safe to re-send on voice change.
pub fn session_update(instructions: &str, voice: &str) -> String {
    json!({
        "type": "session.update",
        "session": {
            "instructions": instructions,
            "voice": voice,
        }
    })
    .to_string()
}
