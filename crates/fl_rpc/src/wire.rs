//! Frame types — one JSON document per transport message.
//!
//! A frame is a JSON-RPC 2.0 request or response, a spontaneous
//! notification (a request the server originates; clients tell it from
//! a response by the presence of `method`), a subscribe frame amending
//! an event-stream connection's filter, or an event record. There is
//! no batching and no framing beyond newline-delimited JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use fl_crypto::Aid;
use fl_events::{Event, EventFilter};

use crate::error::ErrorObject;

pub const JSONRPC_VERSION: &str = "2.0";

/// Unix milliseconds.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Request identifier: a non-empty string or a number, echoed verbatim
/// by the server. `-1` is reserved for unparseable-input responses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    Text(String),
}

impl RequestId {
    /// The id carried by error responses to frames that could not be
    /// parsed at all.
    pub const fn parse_error() -> Self {
        RequestId::Number(-1)
    }

    pub fn is_valid(&self) -> bool {
        match self {
            RequestId::Number(_) => true,
            RequestId::Text(s) => !s.is_empty(),
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Text(s) => f.write_str(s),
        }
    }
}

/// Authentication stamp on a request. Strict: unknown fields are
/// rejected so the signed byte image stays stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthStamp {
    pub from: Aid,
    /// Lowercase hex of the 64-byte Ed25519 signature; coverage is
    /// decided by the configured [`crate::signing::SignaturePolicy`].
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthStamp>,
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
            auth: None,
        }
    }

    /// A server-originated notification frame.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::new(
            RequestId::Text(format!("notify-{}", now_ms())),
            method,
            params,
        )
    }

    /// JSON-RPC 2.0 shape check: version literal, non-empty method,
    /// valid id.
    pub fn is_well_formed(&self) -> bool {
        self.jsonrpc == JSONRPC_VERSION && !self.method.is_empty() && self.id.is_valid()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    pub fn ok(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: RequestId, error: ErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Subscribe frame: `{type:"subscribe", filter}`. Sent by a client to
/// turn its connection into an event stream (or amend the filter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Subscribe {
        #[serde(skip_serializing_if = "Option::is_none")]
        filter: Option<EventFilter>,
    },
}

/// A decoded inbound frame, from either side's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(Request),
    Response(Response),
    Control(ControlFrame),
    Event(Event),
}

impl Frame {
    /// Classify one JSON document. `Err` carries a human-readable
    /// reason; the caller decides between `PARSE_ERROR` (not JSON at
    /// all) and `INVALID_REQUEST` (JSON of the wrong shape).
    pub fn decode(value: &Value) -> Result<Frame, String> {
        let Some(obj) = value.as_object() else {
            return Err("frame is not a JSON object".to_string());
        };
        if obj.get("type").map_or(false, |t| t == "subscribe") {
            return serde_json::from_value::<ControlFrame>(value.clone())
                .map(Frame::Control)
                .map_err(|e| format!("bad subscribe frame: {e}"));
        }
        if obj.contains_key("sequence") && obj.contains_key("type") {
            return serde_json::from_value::<Event>(value.clone())
                .map(Frame::Event)
                .map_err(|e| format!("bad event frame: {e}"));
        }
        if obj.contains_key("method") {
            return serde_json::from_value::<Request>(value.clone())
                .map(Frame::Request)
                .map_err(|e| format!("bad request frame: {e}"));
        }
        if obj.contains_key("result") || obj.contains_key("error") {
            return serde_json::from_value::<Response>(value.clone())
                .map(Frame::Response)
                .map_err(|e| format!("bad response frame: {e}"));
        }
        Err("unrecognized frame shape".to_string())
    }
}
