//! RPC error surface: the wire-visible error object plus the typed
//! error the client API returns.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use fl_crypto::CryptoError;

/// Wire-visible error code registry.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const AUTHENTICATION_FAILED: i64 = -32000;
    pub const TIMEOUT: i64 = -32001;
    pub const DISCOVERY_FAILED: i64 = -32002;
    pub const RATE_LIMIT_EXCEEDED: i64 = -32029;
}

/// `{code, message, data?}` as it appears inside a response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::new(codes::PARSE_ERROR, detail)
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(codes::INVALID_REQUEST, detail)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("method '{method}' not found"))
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, detail)
    }

    pub fn internal_error(detail: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, detail)
    }

    pub fn authentication_failed(detail: impl Into<String>) -> Self {
        Self::new(codes::AUTHENTICATION_FAILED, detail)
    }

    pub fn rate_limit_exceeded() -> Self {
        Self::new(codes::RATE_LIMIT_EXCEEDED, "rate limit exceeded")
    }
}

/// Client-facing error. The server converts internal failures into
/// [`ErrorObject`]s at the boundary instead.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("client is closed")]
    Closed,

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ErrorObject> for RpcError {
    fn from(e: ErrorObject) -> Self {
        RpcError::Remote {
            code: e.code,
            message: e.message,
            data: e.data,
        }
    }
}
