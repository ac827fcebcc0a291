// Switcheroo - JSON-RPC traffic switch
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! JSON-RPC 2.0 message types and wire framing.
//!
//! The switch does not interpret params or results; it only needs enough
//! structure to tell requests from responses, read ids and method names, and
//! build synthetic responses.
//!
//! # Framing
//!
//! A text frame carries either one message object or a batch (an array of
//! message objects). [`decode_frame`] expands a batch into its messages in
//! array order. The switch always writes single messages; JSON-RPC 2.0 only
//! says responses to a batch SHOULD be batched.

use crate::{direction::MessageKind, error::CodecError};
use serde::{
    de::{self, Deserializer},
    ser::{SerializeMap, Serializer},
    Deserialize, Serialize,
};
use serde_json::Value;
use std::fmt;
use tracing::warn;

/// JSON-RPC version string
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error codes used by the switch.
pub mod error_codes {
    /// Internal error - Internal JSON-RPC error
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Server error range start, the default code of synthetic errors
    pub const SERVER_ERROR: i64 = -32000;
}

/// JSON-RPC request/response identifier.
///
/// Can be either a string or number as per JSON-RPC 2.0 specification.
/// Numbers keep their JSON form, so unsigned 64-bit and fractional ids come
/// back to the client exactly as sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    /// Numeric identifier
    Number(serde_json::Number),
    /// String identifier
    String(String),
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for RpcId {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<&str> for RpcId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// JSON-RPC 2.0 request (or notification, when `id` is absent).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Request identifier; `None` for notifications
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RpcId>,
    /// Method name to invoke
    pub method: String,
    /// Optional method parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    /// Build a request with the given id
    pub fn new(id: impl Into<RpcId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    /// Whether no response is expected
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Numeric error code
    pub code: i64,
    /// Human-readable error message
    #[serde(default)]
    pub message: String,
    /// Optional additional error data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC 2.0 response. Carries either a result or an error.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Identifier of the answered request; `None` serializes as `null`
    pub id: Option<RpcId>,
    /// Successful result (`Some(Value::Null)` is a valid result)
    pub result: Option<Value>,
    /// Error information
    pub error: Option<RpcError>,
}

impl RpcResponse {
    /// Successful response
    pub fn success(id: Option<RpcId>, result: Value) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.to_string(), id, result: Some(result), error: None }
    }

    /// Error response
    pub fn failure(id: Option<RpcId>, error: RpcError) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.to_string(), id, result: None, error: Some(error) }
    }
}

impl Serialize for RpcResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("jsonrpc", &self.jsonrpc)?;
        map.serialize_entry("id", &self.id)?;
        match &self.error {
            Some(error) => map.serialize_entry("error", error)?,
            None => map.serialize_entry("result", self.result.as_ref().unwrap_or(&Value::Null))?,
        }
        map.end()
    }
}

/// One JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Request or notification
    Request(RpcRequest),
    /// Response
    Response(RpcResponse),
}

impl Message {
    /// Request or response
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Request(_) => MessageKind::Request,
            Self::Response(_) => MessageKind::Response,
        }
    }

    /// Message id, if any
    pub fn id(&self) -> Option<&RpcId> {
        match self {
            Self::Request(req) => req.id.as_ref(),
            Self::Response(rsp) => rsp.id.as_ref(),
        }
    }

    /// Method name; responses do not carry one
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(req) => Some(&req.method),
            Self::Response(_) => None,
        }
    }

    /// Whether this is a request
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }
}

impl From<RpcRequest> for Message {
    fn from(req: RpcRequest) -> Self {
        Self::Request(req)
    }
}

impl From<RpcResponse> for Message {
    fn from(rsp: RpcResponse) -> Self {
        Self::Response(rsp)
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Request(req) => req.serialize(serializer),
            Self::Response(rsp) => rsp.serialize(serializer),
        }
    }
}

/// Every field a message object may carry, before classification.
#[derive(Deserialize)]
struct RawMessage {
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<RpcId>,
    method: Option<String>,
    params: Option<Value>,
    // keep an explicit `"result": null` apart from a missing result
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    error: Option<RpcError>,
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawMessage::deserialize(deserializer)?;
        let jsonrpc = raw.jsonrpc.unwrap_or_else(|| JSONRPC_VERSION.to_string());
        if jsonrpc != JSONRPC_VERSION {
            return Err(de::Error::custom(format!("unsupported jsonrpc version {jsonrpc:?}")));
        }

        match (raw.method, raw.result, raw.error) {
            (Some(method), None, None) => {
                Ok(Self::Request(RpcRequest { jsonrpc, id: raw.id, method, params: raw.params }))
            }
            (None, Some(result), None) => Ok(Self::Response(RpcResponse {
                jsonrpc,
                id: raw.id,
                result: Some(result),
                error: None,
            })),
            (None, None, Some(error)) => Ok(Self::Response(RpcResponse {
                jsonrpc,
                id: raw.id,
                result: None,
                error: Some(error),
            })),
            (None, None, None) => Err(de::Error::custom("neither a request nor a response")),
            _ => Err(de::Error::custom("ambiguous message: mixes method, result and error")),
        }
    }
}

/// Decode one text frame into its messages, in array order for batches.
///
/// Batch elements are decoded one by one: an element that is not a valid
/// message is logged and skipped while its siblings go through. A batch with
/// no valid element at all fails like a malformed single message.
pub fn decode_frame(frame: &str) -> Result<Vec<Message>, CodecError> {
    if frame.trim_start().starts_with('[') {
        let batch: Vec<Value> = serde_json::from_str(frame)?;
        if batch.is_empty() {
            return Err(CodecError::EmptyBatch);
        }
        let size = batch.len();
        let mut messages = Vec::with_capacity(size);
        let mut first_error = None;
        for (index, element) in batch.into_iter().enumerate() {
            match serde_json::from_value::<Message>(element) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    warn!(index, size, error = %e, "skipping invalid batch element");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if messages.is_empty() => Err(CodecError::Decode(e)),
            _ => Ok(messages),
        }
    } else {
        Ok(vec![serde_json::from_str(frame)?])
    }
}

/// Encode one message as a text frame.
pub fn encode_message(message: &Message) -> Result<String, CodecError> {
    serde_json::to_string(message).map_err(CodecError::Encode)
}
