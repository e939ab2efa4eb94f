//! Minimal JSON-RPC 2.0 envelope handling.
//!
//! The persistent WebSocket engine needs exactly one mutation: swapping the
//! `id` field of an outgoing request for a correlation ID, and restoring the
//! original on the matching reply. Everything else — `jsonrpc`, `method`,
//! `params`, `result`, `error`, and any nonstandard fields — is passed
//! through untouched via a flattened map.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{WatchError, WatchResult};

/// An outgoing JSON-RPC request envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Request {
    /// Parses a request envelope from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> WatchResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| WatchError::Protocol(format!("invalid JSON-RPC request: {e}")))
    }

    /// True when no envelope field is present.
    pub fn is_empty(&self) -> bool {
        self.jsonrpc.is_none()
            && self.method.is_none()
            && self.params.is_none()
            && self.id.is_none()
            && self.extra.is_empty()
    }

    /// Serializes the envelope back to bytes.
    pub fn to_bytes(&self) -> WatchResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(WatchError::from)
    }
}

/// An incoming JSON-RPC response envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Response {
    /// Parses a response envelope from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> WatchResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| WatchError::Protocol(format!("invalid JSON-RPC response: {e}")))
    }

    /// True when no envelope field is present.
    pub fn is_empty(&self) -> bool {
        self.jsonrpc.is_none()
            && self.result.is_none()
            && self.error.is_none()
            && self.id.is_none()
            && self.extra.is_empty()
    }

    /// The `id` rendered as a plain string: strings without quotes, other
    /// values in their JSON form. Empty when no usable ID is present.
    pub fn id_string(&self) -> String {
        id_as_string(self.id.as_ref())
    }

    /// Serializes the envelope back to bytes.
    pub fn to_bytes(&self) -> WatchResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(WatchError::from)
    }
}

fn id_as_string(id: Option<&Value>) -> String {
    match id {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
