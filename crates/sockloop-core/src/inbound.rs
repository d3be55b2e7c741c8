//! Inbound frame parsing.
//!
//! A text frame holding a JSON object with a string `event` field is a named
//! event; `data` is optional. Any other text is a free-text `message` event
//! whose data is the raw string.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::CommandError;

/// Event name used for free-text frames.
pub const MESSAGE_EVENT: &str = "message";

/// Lifecycle events raised by the transport, never by clients.
pub const RESERVED_EVENTS: [&str; 2] = ["connect", "disconnect"];

/// Prefix marking a console-style command inside a free-text message.
pub const COMMAND_PREFIX: &str = "CMD:";

/// A decoded inbound event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundFrame {
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
}

impl InboundFrame {
    /// Build a named event.
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Build a free-text `message` event.
    pub fn message(text: &str) -> Self {
        Self::new(MESSAGE_EVENT, Value::String(text.to_owned()))
    }

    /// Decode one text frame.
    pub fn parse(text: &str) -> Result<Self, CommandError> {
        let Ok(Value::Object(mut map)) = serde_json::from_str::<Value>(text) else {
            return Ok(Self::message(text));
        };

        let event = match map.remove("event") {
            Some(Value::String(event)) => event,
            Some(_) => return Err(CommandError::Malformed("'event' must be a string".into())),
            None => return Err(CommandError::Malformed("missing 'event' field".into())),
        };
        if RESERVED_EVENTS.contains(&event.as_str()) {
            return Err(CommandError::Malformed(format!(
                "'{event}' is raised by the transport"
            )));
        }

        let data = map.remove("data").unwrap_or(Value::Null);
        Ok(Self { event, data })
    }
}

/// Interpretation of a free-text message payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageCommand<'a> {
    /// `CMD:SHUTDOWN`.
    Shutdown,
    /// `CMD:` followed by anything else.
    Unknown(&'a str),
    /// Plain text.
    Text(&'a str),
}

impl<'a> MessageCommand<'a> {
    /// Classify a message payload.
    pub fn parse(text: &'a str) -> Self {
        match text.strip_prefix(COMMAND_PREFIX) {
            Some("SHUTDOWN") => Self::Shutdown,
            Some(cmd) => Self::Unknown(cmd),
            None => Self::Text(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn parses_named_event() {
        let frame = InboundFrame::parse(r#"{"event":"short_request"}"#).unwrap();
        assert_eq!(frame.event, "short_request");
        assert_eq!(frame.data, Value::Null);
    }

    #[test]
    fn keeps_data() {
        let frame = InboundFrame::parse(r#"{"event":"x","data":{"k":1}}"#).unwrap();
        assert_eq!(frame.data, json!({"k": 1}));
    }

    #[test]
    fn plain_text_becomes_message() {
        let frame = InboundFrame::parse("hello").unwrap();
        assert_eq!(frame, InboundFrame::message("hello"));
    }

    #[test]
    fn non_object_json_becomes_message() {
        let frame = InboundFrame::parse("[1,2]").unwrap();
        assert_eq!(frame.event, MESSAGE_EVENT);
        assert_eq!(frame.data, json!("[1,2]"));
    }

    #[test]
    fn object_without_event_is_malformed() {
        assert_matches!(
            InboundFrame::parse(r#"{"data":1}"#),
            Err(CommandError::Malformed(_))
        );
        assert_matches!(
            InboundFrame::parse(r#"{"event":5}"#),
            Err(CommandError::Malformed(_))
        );
    }

    #[test]
    fn lifecycle_events_are_rejected() {
        assert_matches!(
            InboundFrame::parse(r#"{"event":"connect"}"#),
            Err(CommandError::Malformed(_))
        );
        assert_matches!(
            InboundFrame::parse(r#"{"event":"disconnect"}"#),
            Err(CommandError::Malformed(_))
        );
    }

    #[test]
    fn message_commands() {
        assert_eq!(MessageCommand::parse("CMD:SHUTDOWN"), MessageCommand::Shutdown);
        assert_eq!(
            MessageCommand::parse("CMD: SHUTDOWN "),
            MessageCommand::Unknown(" SHUTDOWN ")
        );
        assert_eq!(MessageCommand::parse("CMD:shutdown"), MessageCommand::Unknown("shutdown"));
        assert_eq!(MessageCommand::parse("CMD:reboot"), MessageCommand::Unknown("reboot"));
        assert_eq!(MessageCommand::parse("hi there"), MessageCommand::Text("hi there"));
        assert_eq!(MessageCommand::parse("cmd:SHUTDOWN"), MessageCommand::Text("cmd:SHUTDOWN"));
    }
}
