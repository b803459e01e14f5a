//! MCP envelope definitions and wire codec.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Method-specific arguments carried by an envelope.
pub type Params = Map<String, Value>;

/// Identity of an agent taking part in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Speech-to-text agent.
    Transcription,
    /// Image understanding agent.
    Vision,
    /// Document and summary generation agent.
    Generation,
    /// Coordinates the other agents.
    Orchestrator,
}

impl AgentKind {
    /// All agent kinds.
    pub fn all() -> [AgentKind; 4] {
        [
            AgentKind::Transcription,
            AgentKind::Vision,
            AgentKind::Generation,
            AgentKind::Orchestrator,
        ]
    }

    /// Wire name of the agent kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Transcription => "transcription",
            AgentKind::Vision => "vision",
            AgentKind::Generation => "generation",
            AgentKind::Orchestrator => "orchestrator",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        AgentKind::all()
            .into_iter()
            .find(|kind| kind.as_str() == s.to_lowercase())
            .ok_or_else(|| Error::InvalidParams(format!("unknown agent kind: {s}")))
    }
}

/// Closed set of message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "request")]
    Request,
    #[serde(rename = "response")]
    Response,
    /// Older agents tag notifications as `publish`.
    #[serde(rename = "notification", alias = "publish")]
    Notification,
    #[serde(rename = "error")]
    Error,
}

impl MessageKind {
    /// Whether this kind completes a request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageKind::Response | MessageKind::Error)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::Notification => "notification",
            MessageKind::Error => "error",
        })
    }
}

/// Structured error carried by an `error` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Error code.
    pub code: i32,
    /// Error message.
    pub message: String,
    /// Additional data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Create an error object without extra data.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Reserved error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const HANDLER_FAILURE: i32 = -32603;
    pub const UNROUTABLE_TARGET: i32 = -32001;
    pub const TIMEOUT: i32 = -32002;
    pub const CANCELLED: i32 = -32003;
    pub const QUEUE_FULL: i32 = -32004;
}

/// One protocol message. Immutable once constructed.
///
/// The constructors are the only way to build an envelope, so a value of this
/// type always satisfies the target and result/error invariants. Decoding
/// goes through the same checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct Envelope {
    id: String,
    created_at: DateTime<Utc>,
    source: AgentKind,
    target: Option<AgentKind>,
    kind: MessageKind,
    method: String,
    params: Params,
    result: Option<Value>,
    error: Option<ErrorObject>,
}

impl Envelope {
    /// Build a request with a fresh id.
    pub fn request(
        source: AgentKind,
        target: AgentKind,
        method: impl Into<String>,
        params: Params,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            source,
            target: Some(target),
            kind: MessageKind::Request,
            method: method.into(),
            params,
            result: None,
            error: None,
        }
    }

    /// Build an untargeted notification.
    pub fn notification(source: AgentKind, method: impl Into<String>, params: Params) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            source,
            target: None,
            kind: MessageKind::Notification,
            method: method.into(),
            params,
            result: None,
            error: None,
        }
    }

    /// Build the successful response to this request.
    pub fn reply(&self, result: Value) -> Result<Envelope> {
        self.terminal(MessageKind::Response, Some(result), None)
    }

    /// Build the error response to this request.
    pub fn reply_error(&self, error: ErrorObject) -> Result<Envelope> {
        self.terminal(MessageKind::Error, None, Some(error))
    }

    fn terminal(
        &self,
        kind: MessageKind,
        result: Option<Value>,
        error: Option<ErrorObject>,
    ) -> Result<Envelope> {
        let responder = match (self.kind, self.target) {
            (MessageKind::Request, Some(target)) => target,
            _ => {
                return Err(Error::InvalidState(format!(
                    "cannot reply to a {} envelope",
                    self.kind
                )))
            }
        };

        Ok(Envelope {
            id: self.id.clone(),
            created_at: Utc::now(),
            source: responder,
            target: Some(self.source),
            kind,
            method: self.method.clone(),
            params: Params::new(),
            result,
            error,
        })
    }

    /// Correlation id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Construction time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Sending agent.
    pub fn source(&self) -> AgentKind {
        self.source
    }

    /// Receiving agent, `None` for notifications.
    pub fn target(&self) -> Option<AgentKind> {
        self.target
    }

    /// Message kind.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Capability name or notification topic.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Method arguments.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Result of a response.
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Error of an error envelope.
    pub fn error(&self) -> Option<&ErrorObject> {
        self.error.as_ref()
    }

    /// Consume a terminal envelope into its outcome.
    pub fn into_outcome(self) -> Option<std::result::Result<Value, ErrorObject>> {
        match self.kind {
            MessageKind::Response => self.result.map(Ok),
            MessageKind::Error => self.error.map(Err),
            _ => None,
        }
    }
}

/// Encode an envelope into its wire bytes.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Decode wire bytes into a validated envelope.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    serde_json::from_slice(bytes).map_err(|e| Error::MalformedEnvelope(e.to_string()))
}

/// On-the-wire shape, field names as deployed agents emit them.
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    message_id: String,
    #[serde(deserialize_with = "lenient_timestamp")]
    timestamp: DateTime<Utc>,
    source: AgentKind,
    #[serde(default)]
    target: Option<AgentKind>,
    message_type: MessageKind,
    method: String,
    #[serde(default)]
    params: Params,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorObject>,
}

/// A field that is present is `Some`, even when it holds `null`.
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// RFC 3339, or ISO 8601 without an offset read as UTC.
fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    raw.parse::<NaiveDateTime>()
        .map(|naive| naive.and_utc())
        .map_err(|e| serde::de::Error::custom(format!("invalid timestamp `{raw}`: {e}")))
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = Error;

    fn try_from(wire: WireEnvelope) -> Result<Self> {
        let kind = wire.message_type;

        match (kind, wire.target) {
            (MessageKind::Notification, Some(target)) => {
                return Err(Error::MalformedEnvelope(format!(
                    "notification must not carry a target (got {target})"
                )))
            }
            (MessageKind::Notification, None) => {}
            (_, Some(_)) => {}
            (_, None) => {
                return Err(Error::MalformedEnvelope(format!("{kind} requires a target")))
            }
        }

        // Non-terminal kinds from older agents carry explicit nulls.
        let result = match (kind, wire.result) {
            (MessageKind::Response, result) => result,
            (_, Some(Value::Null)) | (_, None) => None,
            (_, Some(_)) => {
                return Err(Error::MalformedEnvelope(format!(
                    "{kind} must not carry a result"
                )))
            }
        };

        match (kind, result.is_some(), wire.error.is_some()) {
            (MessageKind::Response, true, false) | (MessageKind::Error, false, true) => {}
            (MessageKind::Response, _, _) | (MessageKind::Error, _, _) => {
                return Err(Error::MalformedEnvelope(format!(
                    "{kind} must carry exactly one of result or error"
                )))
            }
            (_, _, true) => {
                return Err(Error::MalformedEnvelope(format!(
                    "{kind} must not carry an error"
                )))
            }
            _ => {}
        }

        Ok(Envelope {
            id: wire.message_id,
            created_at: wire.timestamp,
            source: wire.source,
            target: wire.target,
            kind,
            method: wire.method,
            params: wire.params,
            result,
            error: wire.error,
        })
    }
}

impl From<Envelope> for WireEnvelope {
    fn from(envelope: Envelope) -> Self {
        Self {
            message_id: envelope.id,
            timestamp: envelope.created_at,
            source: envelope.source,
            target: envelope.target,
            message_type: envelope.kind,
            method: envelope.method,
            params: envelope.params,
            result: envelope.result,
            error: envelope.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => Params::new(),
        }
    }

    fn request() -> Envelope {
        Envelope::request(
            AgentKind::Orchestrator,
            AgentKind::Vision,
            "detect_objects",
            params(json!({"image_path": "/tmp/frame.png"})),
        )
    }

    #[test]
    fn test_round_trip_every_kind() {
        let request = request();
        let response = request.reply(json!({"objects": []})).unwrap();
        let null_response = request.reply(Value::Null).unwrap();
        let error = request
            .reply_error(ErrorObject::new(error_codes::HANDLER_FAILURE, "boom"))
            .unwrap();
        let notification =
            Envelope::notification(AgentKind::Vision, "status", params(json!({"state": "ready"})));

        for envelope in [request, response, null_response, error, notification] {
            let bytes = encode(&envelope).unwrap();
            assert_eq!(decode(&bytes).unwrap(), envelope);
        }
    }

    #[test]
    fn test_reply_correlates_and_swaps() {
        let request = request();
        let response = request.reply(json!({"pong": true})).unwrap();

        assert_eq!(response.id(), request.id());
        assert_eq!(response.kind(), MessageKind::Response);
        assert_eq!(response.source(), AgentKind::Vision);
        assert_eq!(response.target(), Some(AgentKind::Orchestrator));
        assert_eq!(response.method(), "detect_objects");
        assert!(response.params().is_empty());
    }

    #[test]
    fn test_reply_to_notification_rejected() {
        let notification = Envelope::notification(AgentKind::Vision, "status", Params::new());
        assert!(notification.reply(json!(1)).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let raw = json!({
            "message_id": "1",
            "timestamp": "2024-01-01T00:00:00Z",
            "source": "vision",
            "target": "orchestrator",
            "message_type": "query",
            "method": "x",
            "params": {}
        });
        let err = decode(raw.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, Error::MalformedEnvelope(_)));
    }

    #[test]
    fn test_decode_rejects_unknown_agent() {
        let raw = json!({
            "message_id": "1",
            "timestamp": "2024-01-01T00:00:00Z",
            "source": "audio",
            "target": "orchestrator",
            "message_type": "request",
            "method": "x",
            "params": {}
        });
        assert!(decode(raw.to_string().as_bytes()).is_err());
    }

    #[test]
    fn test_decode_rejects_response_without_target() {
        let raw = json!({
            "message_id": "1",
            "timestamp": "2024-01-01T00:00:00Z",
            "source": "vision",
            "message_type": "response",
            "method": "x",
            "params": {},
            "result": {"ok": true}
        });
        assert!(matches!(
            decode(raw.to_string().as_bytes()),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_decode_rejects_both_or_neither_outcome() {
        let both = json!({
            "message_id": "1",
            "timestamp": "2024-01-01T00:00:00Z",
            "source": "vision",
            "target": "orchestrator",
            "message_type": "error",
            "method": "x",
            "params": {},
            "result": 1,
            "error": {"code": -32603, "message": "boom"}
        });
        assert!(decode(both.to_string().as_bytes()).is_err());

        let neither = json!({
            "message_id": "1",
            "timestamp": "2024-01-01T00:00:00Z",
            "source": "vision",
            "target": "orchestrator",
            "message_type": "response",
            "method": "x",
            "params": {}
        });
        assert!(decode(neither.to_string().as_bytes()).is_err());
    }

    #[test]
    fn test_decode_rejects_targeted_notification() {
        let raw = json!({
            "message_id": "1",
            "timestamp": "2024-01-01T00:00:00Z",
            "source": "vision",
            "target": "generation",
            "message_type": "notification",
            "method": "status",
            "params": {}
        });
        assert!(decode(raw.to_string().as_bytes()).is_err());
    }

    #[test]
    fn test_decode_legacy_publish_and_nulls() {
        let raw = json!({
            "message_id": "abc",
            "timestamp": "2024-01-01T00:00:00.123456Z",
            "source": "transcription",
            "target": null,
            "message_type": "publish",
            "method": "status",
            "params": {"state": "ready"},
            "result": null,
            "error": null
        });
        let envelope = decode(raw.to_string().as_bytes()).unwrap();
        assert_eq!(envelope.kind(), MessageKind::Notification);
        assert!(envelope.result().is_none());

        let encoded: Value = serde_json::from_slice(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(encoded["message_type"], "notification");
        assert!(encoded.get("result").is_none());
    }

    #[test]
    fn test_decode_timestamp_without_offset() {
        // `datetime.utcnow().isoformat()` carries no offset.
        let raw = json!({
            "message_id": "abc",
            "timestamp": "2024-01-01T00:00:00.123456",
            "source": "vision",
            "target": "orchestrator",
            "message_type": "response",
            "method": "analyze_image",
            "params": {},
            "result": {"labels": ["cat"]},
            "error": null
        });
        let envelope = decode(raw.to_string().as_bytes()).unwrap();
        let expected = DateTime::parse_from_rfc3339("2024-01-01T00:00:00.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(envelope.created_at(), expected);
        assert_eq!(envelope.result(), Some(&json!({"labels": ["cat"]})));

        let offset = json!({
            "message_id": "abc",
            "timestamp": "2024-01-01T02:00:00+02:00",
            "source": "vision",
            "message_type": "notification",
            "method": "status",
            "params": {}
        });
        let envelope = decode(offset.to_string().as_bytes()).unwrap();
        assert_eq!(envelope.created_at(), expected - chrono::Duration::microseconds(123456));

        let garbage = json!({
            "message_id": "abc",
            "timestamp": "yesterday",
            "source": "vision",
            "message_type": "notification",
            "method": "status",
            "params": {}
        });
        assert!(matches!(
            decode(garbage.to_string().as_bytes()),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_agent_kind_from_str() {
        assert_eq!("Vision".parse::<AgentKind>().unwrap(), AgentKind::Vision);
        assert!("audio".parse::<AgentKind>().is_err());
    }
}
