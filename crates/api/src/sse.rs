use serde::Deserialize;
use serde_json::Value;

use super::events::{ErrorCause, ExchangeEvent};
use super::ids::ValidationId;
use super::types::{Source, ValidationRequest};

const KNOWN_EVENT_TYPES: [&str; 6] = [
    "token",
    "source",
    "validation_requested",
    "validation_resolved",
    "done",
    "error",
];

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Token {
        content: String,
    },
    Source {
        source: Source,
    },
    ValidationRequested {
        validation: ValidationRequest,
    },
    ValidationResolved {
        validation_id: ValidationId,
    },
    Done,
    Error {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
}

impl From<WireEvent> for ExchangeEvent {
    fn from(value: WireEvent) -> Self {
        match value {
            WireEvent::Token { content } => Self::Token(content),
            WireEvent::Source { source } => Self::Source(source),
            WireEvent::ValidationRequested { validation } => Self::ValidationRequested(validation),
            WireEvent::ValidationResolved { validation_id } => {
                Self::ValidationResolved(validation_id)
            }
            WireEvent::Done => Self::Done,
            WireEvent::Error { code, message } => Self::Error {
                cause: ErrorCause::Backend(code.unwrap_or_else(|| "unknown".to_string())),
                message: message.unwrap_or_else(|| "backend reported a stream error".to_string()),
            },
        }
    }
}

/// Incremental parser for the exchange `text/event-stream` body.
///
/// Bytes are buffered raw so a UTF-8 sequence split across network chunks is decoded once the
/// whole frame has arrived.
#[derive(Debug, Default)]
pub struct SseStreamParser {
    buffer: Vec<u8>,
}

impl SseStreamParser {
    /// Feed arbitrary bytes into the parser and drain complete events.
    ///
    /// Frames that cannot be decoded surface as a terminal `Decode` error event.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ExchangeEvent> {
        // A raw CR can only be part of a line ending; JSON escapes it inside strings.
        self.buffer
            .extend(bytes.iter().copied().filter(|byte| *byte != b'\r'));

        let mut events = Vec::new();
        while let Some(split) = self
            .buffer
            .windows(2)
            .position(|window| window == b"\n\n")
        {
            let frame: Vec<u8> = self.buffer.drain(..split + 2).take(split).collect();
            let event = match std::str::from_utf8(&frame) {
                Ok(frame) => decode_frame(frame),
                Err(error) => Some(decode_error(error.to_string())),
            };
            events.extend(event);
        }

        events
    }
}

fn decode_frame(frame: &str) -> Option<ExchangeEvent> {
    let payload = extract_data_payload(frame)?;
    if payload == "[DONE]" {
        return None;
    }

    let mut value = match serde_json::from_str::<Value>(&payload) {
        Ok(value) => value,
        Err(error) => return Some(decode_error(error.to_string())),
    };

    // Some backends put the type on the `event:` line instead of the JSON body.
    if value.get("type").is_none()
        && let Some(event_name) = extract_event_name(frame)
        && let Some(object) = value.as_object_mut()
    {
        object.insert("type".to_string(), Value::String(event_name.to_string()));
    }

    let event_type = value.get("type").and_then(Value::as_str)?;
    if !KNOWN_EVENT_TYPES.contains(&event_type) {
        tracing::debug!("ignoring unknown exchange event type {event_type}");
        return None;
    }

    match serde_json::from_value::<WireEvent>(value) {
        Ok(event) => Some(event.into()),
        Err(error) => Some(decode_error(error.to_string())),
    }
}

fn decode_error(details: String) -> ExchangeEvent {
    ExchangeEvent::Error {
        cause: ErrorCause::Decode,
        message: format!("malformed exchange event: {details}"),
    }
}

fn extract_data_payload(frame: &str) -> Option<String> {
    let data_lines: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .collect();

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

fn extract_event_name(frame: &str) -> Option<&str> {
    frame
        .lines()
        .find_map(|line| line.strip_prefix("event:"))
        .map(str::trim)
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Vec<ExchangeEvent> {
        SseStreamParser::default().feed(input.as_bytes())
    }

    #[test]
    fn frames_split_across_chunks_are_reassembled() {
        let mut parser = SseStreamParser::default();
        let mut events = Vec::new();

        events.extend(parser.feed(b"data: {\"type\":\"token\",\"con"));
        assert!(events.is_empty());
        events.extend(parser.feed(b"tent\":\"Hi\"}\n\ndata: {\"type\":\"done\"}\n\n"));

        assert_eq!(
            events,
            vec![ExchangeEvent::Token("Hi".to_string()), ExchangeEvent::Done]
        );
        assert!(parser.buffer.is_empty());
    }

    #[test]
    fn multibyte_text_split_across_chunks_is_preserved() {
        let mut parser = SseStreamParser::default();
        let mut events = Vec::new();

        events.extend(parser.feed(b"data: {\"type\":\"token\",\"content\":\"caf\xC3"));
        events.extend(parser.feed(b"\xA9 \xF0\x9F"));
        events.extend(parser.feed(b"\xA6\x80\"}\n\n"));

        assert_eq!(events, vec![ExchangeEvent::Token("caf\u{e9} \u{1f980}".to_string())]);
    }

    #[test]
    fn invalid_utf8_frame_becomes_decode_error() {
        let events = SseStreamParser::default()
            .feed(b"data: {\"type\":\"token\",\"content\":\"\xFF\"}\n\n");

        assert!(matches!(
            events.as_slice(),
            [ExchangeEvent::Error {
                cause: ErrorCause::Decode,
                ..
            }]
        ));
    }

    #[test]
    fn validation_request_frame_maps_tool_call() {
        let events = parse(
            "data: {\"type\":\"validation_requested\",\"validation\":{\"id\":\"v-1\",\"tool_name\":\"search\",\"arguments\":{\"q\":\"rust\"},\"chat_id\":\"c-1\"}}\n\n",
        );

        let [ExchangeEvent::ValidationRequested(request)] = events.as_slice() else {
            panic!("expected one validation request, got {events:?}");
        };
        assert_eq!(request.id, ValidationId::new("v-1"));
        assert_eq!(request.tool_name, "search");
        assert_eq!(request.arguments["q"], "rust");
        assert_eq!(request.agent_id, None);
    }

    #[test]
    fn event_line_supplies_missing_type() {
        let events = parse(
            "event: validation_resolved\r\ndata: {\"validation_id\":\"v-9\"}\r\n\r\n",
        );
        assert_eq!(
            events,
            vec![ExchangeEvent::ValidationResolved(ValidationId::new("v-9"))]
        );
    }

    #[test]
    fn unknown_types_and_done_marker_are_ignored() {
        let events = parse(
            "data: {\"type\":\"heartbeat\"}\n\ndata: [DONE]\n\n: comment\n\n",
        );
        assert!(events.is_empty());
    }

    #[test]
    fn malformed_payload_becomes_decode_error() {
        let events = parse(
            "data: {not json}\n\ndata: {\"type\":\"token\"}\n\n",
        );

        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|event| matches!(
            event,
            ExchangeEvent::Error {
                cause: ErrorCause::Decode,
                ..
            }
        )));
    }

    #[test]
    fn backend_error_keeps_code() {
        let events = parse(
            "data: {\"type\":\"error\",\"code\":\"rate_limited\",\"message\":\"slow down\"}\n\n",
        );
        assert_eq!(
            events,
            vec![ExchangeEvent::Error {
                cause: ErrorCause::Backend("rate_limited".to_string()),
                message: "slow down".to_string(),
            }]
        );
    }
}
