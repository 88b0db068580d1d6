//! JSON message envelopes: requests, response envelopes, status reports.
//!
//! Wire field names are camelCase. Requests carry an optional `id` that is
//! echoed back in every reply so the client can correlate responses.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request as received off the wire, before action-specific decoding.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub id: Option<u64>,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

/// The closed set of request kinds the bridge understands. Unknown actions
/// are a distinct variant so the router can answer them explicitly.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    SendColor(ColorSpec),
    SendImage(ImageSpec),
    CheckConnection,
    Unknown(String),
}

/// `sendColor` payload. Channels stay as raw integers here; range checking
/// happens in the router so errors can name the offending values.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorSpec {
    pub r: i64,
    pub g: i64,
    pub b: i64,
    pub hex: Option<String>,
}

/// `sendImage` payload. The kind stays a raw string here for the same reason.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSpec {
    pub image_id: String,
    pub kind: String,
}

/// A payload field is missing or has the wrong type.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("missing or invalid field `{0}`")]
pub struct FieldError(pub &'static str);

/// Parse the outer envelope. JSON errors map to the parse-error reply.
pub fn parse_request(text: &str) -> Result<IncomingMessage, serde_json::Error> {
    serde_json::from_str(text)
}

impl IncomingMessage {
    /// Decode the action-specific payload into a typed request.
    pub fn decode(&self) -> Result<Request, FieldError> {
        match self.action.as_str() {
            "sendColor" => Ok(Request::SendColor(decode_color(&self.payload)?)),
            "sendImage" => Ok(Request::SendImage(decode_image(&self.payload)?)),
            "checkConnection" => Ok(Request::CheckConnection),
            other => Ok(Request::Unknown(other.to_string())),
        }
    }
}

/// Decode a color payload, used for both envelopes and the `/color` endpoint.
pub fn decode_color(payload: &Value) -> Result<ColorSpec, FieldError> {
    Ok(ColorSpec {
        r: int_field(payload, "r")?,
        g: int_field(payload, "g")?,
        b: int_field(payload, "b")?,
        hex: payload
            .get("hex")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Decode an image payload, used for both envelopes and the `/image` endpoint.
pub fn decode_image(payload: &Value) -> Result<ImageSpec, FieldError> {
    Ok(ImageSpec {
        image_id: str_field(payload, "imageId")?,
        kind: str_field(payload, "type")?,
    })
}

fn int_field(payload: &Value, name: &'static str) -> Result<i64, FieldError> {
    payload
        .get(name)
        .and_then(Value::as_i64)
        .ok_or(FieldError(name))
}

fn str_field(payload: &Value, name: &'static str) -> Result<String, FieldError> {
    payload
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(FieldError(name))
}

/// Reply to a request: success with data or failure with an error message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseEnvelope {
    pub action: String,
    #[serde(
        rename = "originalAction",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub original_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<u64>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    pub fn ok(original_action: &str, data: Value) -> Self {
        Self {
            action: "response".to_string(),
            original_action: Some(original_action.to_string()),
            id: None,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(original_action: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            action: "response".to_string(),
            original_action: original_action.map(str::to_string),
            id: None,
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn with_id(mut self, id: Option<u64>) -> Self {
        self.id = id;
        self
    }
}

/// Answer to `checkConnection` and `GET /status`. Carries its own action tag,
/// which is what the bridge protocol has always sent for status probes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusReport {
    pub action: String,
    #[serde(rename = "isConnected")]
    pub is_connected: bool,
    pub message: String,
    pub version: String,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<u64>,
}

impl StatusReport {
    pub fn new(message: String, version: &str, timestamp: u64) -> Self {
        Self {
            action: "connectionStatus".to_string(),
            is_connected: true,
            message,
            version: version.to_string(),
            timestamp,
            id: None,
        }
    }

    pub fn with_id(mut self, id: Option<u64>) -> Self {
        self.id = id;
        self
    }
}
