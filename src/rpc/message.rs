//! JSON-RPC 2.0 wire representations
//!
//! Provides request/response types, payload parsing and response encoding for both
//! single and batched payloads.

use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

pub const JSONRPC_VERSION: &str = "2.0";
pub const EOF: &[u8] = b"\n";
/// Largest accepted frame, delimiter excluded.
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;

/// A request as decoded from the wire. Fields stay untyped until validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub jsonrpc: Value,
    #[serde(default)]
    pub method: Value,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Option<Value>,
}

impl Request {
    pub fn new(method: &str, params: Vec<Value>, id: Option<Value>) -> Self {
        Self {
            jsonrpc: Value::String(JSONRPC_VERSION.to_string()),
            method: Value::String(method.to_string()),
            params: Value::Array(params),
            id,
        }
    }

    pub fn method_name(&self) -> Option<&str> {
        self.method.as_str()
    }

    /// Positional arguments for the handler.
    pub fn positional_params(&self) -> Vec<Value> {
        match &self.params {
            Value::Null => Vec::new(),
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("[{code}] {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request() -> Self {
        Self::new(INVALID_REQUEST, "Invalid Request")
    }

    pub fn method_not_found() -> Self {
        Self::new(METHOD_NOT_FOUND, "Method not found")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    #[serde(rename = "result")]
    Result(Value),
    #[serde(rename = "error")]
    Error(RpcError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl Response {
    pub fn result(result: Value, id: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            outcome: Outcome::Result(result),
        }
    }

    pub fn error(error: RpcError, id: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            outcome: Outcome::Error(error),
        }
    }
}

#[derive(Debug, Error)]
#[error("payload is not a JSON-RPC request or batch")]
pub struct ParseError;

/// Decodes a payload into `(single, requests)`.
pub fn parse(content: &[u8]) -> Result<(bool, Vec<Request>), ParseError> {
    let payload: Value = serde_json::from_slice(content).map_err(|_| ParseError)?;

    match payload {
        Value::Array(items) => Ok((false, items.into_iter().map(decode_request).collect())),
        object @ Value::Object(_) => Ok((true, vec![decode_request(object)])),
        _ => Err(ParseError),
    }
}

fn decode_request(value: Value) -> Request {
    if !value.is_object() {
        return Request::default();
    }
    serde_json::from_value(value).unwrap_or_default()
}

pub fn encode(single: bool, responses: &[Response]) -> Vec<u8> {
    let encoded = if single {
        match responses.first() {
            Some(response) => serde_json::to_vec(response),
            None => serde_json::to_vec(&Value::Null),
        }
    } else {
        serde_json::to_vec(responses)
    };

    encoded.unwrap_or_else(|err| {
        tracing::error!(error = %err, "failed to encode json-rpc responses");
        serde_json::to_vec(&Response::error(RpcError::new(0, "Internal error"), None))
            .unwrap_or_default()
    })
}

/// Appends the end-of-message delimiter to an encoded payload.
pub fn frame(mut payload: Vec<u8>) -> Vec<u8> {
    payload.extend_from_slice(EOF);
    payload
}

/// Reads one delimited frame into `buffer`, delimiter included.
///
/// Returns `Ok(0)` at end of stream. A frame longer than `max_len` without a delimiter is an
/// `InvalidData` error and leaves the stream unusable.
pub async fn read_frame<R>(reader: &mut R, buffer: &mut Vec<u8>, max_len: usize) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let limit = u64::try_from(max_len).unwrap_or(u64::MAX).saturating_add(1);
    let read = (&mut *reader).take(limit).read_until(EOF[0], buffer).await?;

    if buffer.len() > max_len && !buffer.ends_with(EOF) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame exceeds {max_len} bytes"),
        ));
    }
    Ok(read)
}
