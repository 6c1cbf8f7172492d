//! Minimal Ethereum JSON-RPC transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::trace;

/// Errors from the JSON-RPC transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("invalid rpc response: {0}")]
    Decode(String),
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// JSON-RPC 2.0 client over HTTP.
pub struct JsonRpcClient {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Calls `method` and deserializes its `result`.
    pub async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        trace!(method, id, "JSON-RPC request");

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RpcError::Transport(format!("HTTP {status}: {text}")));
        }

        let payload: RpcResponse = response
            .json()
            .await
            .map_err(|e| RpcError::Decode(e.to_string()))?;

        if let Some(err) = payload.error {
            return Err(RpcError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        serde_json::from_value(payload.result.unwrap_or(Value::Null))
            .map_err(|e| RpcError::Decode(format!("{method}: {e}")))
    }
}

/// Formats a number as a JSON-RPC quantity (`0x`-prefixed, no leading zeros).
pub fn to_quantity(value: u128) -> String {
    format!("{value:#x}")
}

/// Parses a JSON-RPC quantity.
pub fn parse_quantity(value: &str) -> Result<u128, RpcError> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| RpcError::Decode(format!("quantity without 0x prefix: {value}")))?;
    if digits.is_empty() {
        return Err(RpcError::Decode("empty quantity".to_string()));
    }
    u128::from_str_radix(digits, 16).map_err(|e| RpcError::Decode(format!("{value}: {e}")))
}

/// Parses a quantity that must fit in `u64` (block numbers, nonces, gas).
pub fn parse_u64_quantity(value: &str) -> Result<u64, RpcError> {
    let wide = parse_quantity(value)?;
    u64::try_from(wide).map_err(|_| RpcError::Decode(format!("quantity {value} exceeds u64")))
}
