//! Response envelope.
//!
//! Every reply to a client is a single JSON object:
//!
//! ```json
//! {"response": "ok", "response-text": "ok", "response-code": 200, "request": "short_request"}
//! ```
//!
//! `response` carries the payload (a string for acknowledgements, an array
//! for `connections`). `request` echoes the event that produced the reply and
//! is omitted for the generic malformed-input envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{CommandError, OffloadError};

/// JSON reply sent to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Payload.
    pub response: Value,
    /// Human readable status.
    #[serde(rename = "response-text")]
    pub response_text: String,
    /// HTTP-like status code.
    #[serde(rename = "response-code")]
    pub response_code: u16,
    /// Event name this envelope answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
}

impl Envelope {
    /// Plain acknowledgement for `request`.
    pub fn ok(request: &str) -> Self {
        Self::ok_with(request, Value::String("ok".into()))
    }

    /// Successful reply for `request` carrying `response` as payload.
    pub fn ok_with(request: &str, response: Value) -> Self {
        Self {
            response,
            response_text: "ok".into(),
            response_code: 200,
            request: Some(request.to_owned()),
        }
    }

    /// Generic reply for unrecognized or malformed input.
    pub fn error() -> Self {
        Self::failure(400, "error", None)
    }

    /// Error reply with an explicit code and text.
    pub fn failure(code: u16, text: &str, request: Option<&str>) -> Self {
        Self {
            response: Value::String("error".into()),
            response_text: text.to_owned(),
            response_code: code,
            request: request.map(str::to_owned),
        }
    }

    /// Map a routing error to the envelope the client sees.
    pub fn for_error(err: &CommandError, request: &str) -> Self {
        match err {
            CommandError::Malformed(_) | CommandError::UnknownEvent(_) => Self::error(),
            CommandError::Offload(OffloadError::TimedOut(_)) => {
                Self::failure(err.response_code(), "timeout", Some(request))
            }
            CommandError::Offload(inner) => {
                Self::failure(err.response_code(), &inner.to_string(), Some(request))
            }
        }
    }

    /// Whether the code is in the success range.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.response_code)
    }

    /// Serialize to the compact wire form.
    pub fn to_json(&self) -> String {
        // A struct of strings, integers and `Value` always serializes.
        serde_json::to_string(self).unwrap_or_else(|_| {
            String::from(r#"{"response":"error","response-text":"error","response-code":500}"#)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn short_request_ack_wire_form() {
        assert_eq!(
            Envelope::ok("short_request").to_json(),
            r#"{"response":"ok","response-text":"ok","response-code":200,"request":"short_request"}"#
        );
    }

    #[test]
    fn ok_snapshot() {
        insta::assert_json_snapshot!(Envelope::ok("long_request"), @r#"
        {
          "response": "ok",
          "response-text": "ok",
          "response-code": 200,
          "request": "long_request"
        }
        "#);
    }

    #[test]
    fn error_omits_request() {
        assert_eq!(
            Envelope::error().to_json(),
            r#"{"response":"error","response-text":"error","response-code":400}"#
        );
    }

    #[test]
    fn ok_with_array_payload() {
        let env = Envelope::ok_with("connections", json!(["a", "b"]));
        let value: Value = serde_json::from_str(&env.to_json()).unwrap();
        assert_eq!(value["response"], json!(["a", "b"]));
        assert_eq!(value["request"], "connections");
        assert!(env.is_ok());
    }

    #[test]
    fn malformed_maps_to_generic_error() {
        let env = Envelope::for_error(&CommandError::Malformed("bad".into()), "message");
        assert_eq!(env, Envelope::error());
        assert!(!env.is_ok());
    }

    #[test]
    fn offload_failure_keeps_request() {
        let err = CommandError::from(OffloadError::Failed("disk".into()));
        let env = Envelope::for_error(&err, "long_request");
        assert_eq!(env.response_code, 500);
        assert_eq!(env.response_text, "offloaded job failed: disk");
        assert_eq!(env.request.as_deref(), Some("long_request"));
    }

    #[test]
    fn offload_timeout_is_504() {
        let err = CommandError::from(OffloadError::TimedOut(Duration::from_millis(5)));
        let env = Envelope::for_error(&err, "long_request");
        assert_eq!(env.response_code, 504);
        assert_eq!(env.response_text, "timeout");
    }

    #[test]
    fn parses_from_wire() {
        let env: Envelope = serde_json::from_str(
            r#"{"response":"ok","response-text":"ok","response-code":200,"request":"shutdown"}"#,
        )
        .unwrap();
        assert_eq!(env, Envelope::ok("shutdown"));
    }
}
