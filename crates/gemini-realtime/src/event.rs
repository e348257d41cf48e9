//! Normalization of server messages into a closed set of events.

use crate::types::{ServerContent, ServerMessage};
use base64::Engine;
use serde_json::Value;
use tracing::warn;

/// A normalized event produced by the upstream session.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// Raw audio produced by the model.
    Audio(Vec<u8>),
    /// Assistant text, either a text part or the transcript of its speech.
    Text(String),
    /// Transcript of the user's speech.
    InputTranscript(String),
    /// The model's in-flight output was preempted by new user input.
    Interrupted,
    TurnComplete,
    /// A function call request, passed through untouched.
    ToolCall(Value),
}

/// Converts one server message into events.
///
/// Order within a message is fixed: interruption (which suppresses everything
/// else in the message), audio parts, text parts, output transcript, input
/// transcript, turn completion, tool call.
pub fn normalize(message: ServerMessage) -> Vec<LiveEvent> {
    let mut events = Vec::new();

    if let Some(content) = message.server_content {
        if content.interrupted == Some(true) {
            return vec![LiveEvent::Interrupted];
        }
        push_content_events(content, &mut events);
    }

    if let Some(tool_call) = message.tool_call {
        events.push(LiveEvent::ToolCall(tool_call));
    }

    events
}

fn push_content_events(content: ServerContent, events: &mut Vec<LiveEvent>) {
    let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();

    for part in &parts {
        let Some(data) = part.inline_data.as_ref().and_then(|d| d.data.as_deref()) else {
            continue;
        };
        if data.is_empty() {
            continue;
        }
        match base64::engine::general_purpose::STANDARD.decode(data) {
            Ok(bytes) => events.push(LiveEvent::Audio(bytes)),
            Err(e) => warn!(error = %e, "Skipping inline data part with invalid base64"),
        }
    }

    for part in parts {
        if let Some(text) = part.text.filter(|t| !t.is_empty()) {
            events.push(LiveEvent::Text(text));
        }
    }

    if let Some(text) = content
        .output_transcription
        .and_then(|t| t.text)
        .filter(|t| !t.is_empty())
    {
        events.push(LiveEvent::Text(text));
    }

    if let Some(text) = content
        .input_transcription
        .and_then(|t| t.text)
        .filter(|t| !t.is_empty())
    {
        events.push(LiveEvent::InputTranscript(text));
    }

    if content.turn_complete == Some(true) {
        events.push(LiveEvent::TurnComplete);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> ServerMessage {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn full_message_keeps_fixed_order() {
        let msg = parse(json!({
            "serverContent": {
                "modelTurn": {"parts": [
                    {"text": "first"},
                    {"inlineData": {"mimeType": "audio/pcm", "data": "AQID"}},
                    {"text": "second"}
                ]},
                "outputTranscription": {"text": "spoken"},
                "inputTranscription": {"text": "heard"},
                "turnComplete": true
            },
            "toolCall": {"functionCalls": [{"name": "lookup"}]}
        }));

        assert_eq!(
            normalize(msg),
            vec![
                LiveEvent::Audio(vec![1, 2, 3]),
                LiveEvent::Text("first".into()),
                LiveEvent::Text("second".into()),
                LiveEvent::Text("spoken".into()),
                LiveEvent::InputTranscript("heard".into()),
                LiveEvent::TurnComplete,
                LiveEvent::ToolCall(json!({"functionCalls": [{"name": "lookup"}]})),
            ]
        );
    }

    #[test]
    fn interruption_suppresses_the_rest_of_the_message() {
        let msg = parse(json!({
            "serverContent": {
                "interrupted": true,
                "modelTurn": {"parts": [{"text": "stale"}, {"inlineData": {"data": "AQID"}}]},
                "turnComplete": true
            },
            "toolCall": {"functionCalls": []}
        }));
        assert_eq!(normalize(msg), vec![LiveEvent::Interrupted]);
    }

    #[test]
    fn interrupted_false_is_not_an_interruption() {
        let msg = parse(json!({"serverContent": {"interrupted": false, "turnComplete": true}}));
        assert_eq!(normalize(msg), vec![LiveEvent::TurnComplete]);
    }

    #[test]
    fn empty_and_invalid_parts_yield_nothing() {
        let msg = parse(json!({
            "serverContent": {
                "modelTurn": {"parts": [
                    {"text": ""},
                    {"inlineData": {"data": ""}},
                    {"inlineData": {"data": "%%% not base64 %%%"}},
                    {}
                ]},
                "outputTranscription": {},
                "inputTranscription": {"text": ""}
            }
        }));
        assert!(normalize(msg).is_empty());
    }

    #[test]
    fn setup_complete_alone_yields_nothing() {
        assert!(normalize(parse(json!({"setupComplete": {}}))).is_empty());
    }
}
