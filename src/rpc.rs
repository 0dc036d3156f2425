// JSON-RPC client for a bitcoind-style full node

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::error::RelayError;
use crate::transport::{BlockSubmitter, LocalNode};
use crate::types::{current_timestamp, LocalPeerInfo, Timestamp};

/// JSON-RPC request
#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
}

/// JSON-RPC response. `result` stays a raw value: `null` is meaningful
/// for `submitblock`.
#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

/// JSON-RPC error
#[derive(Debug, Deserialize)]
struct JsonRpcError {
    #[allow(dead_code)]
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// RPC client for one daemon
pub struct RpcClient {
    url: String,
    client: reqwest::Client,
    auth: Option<(String, String)>,
    request_id: AtomicU64,
}

impl RpcClient {
    /// Create new RPC client; every call is bounded by `timeout`
    pub fn new(url: &str, timeout: Duration) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Upstream(format!("http client: {}", e)))?;

        Ok(Self {
            url: url.to_string(),
            client,
            auth: None,
            request_id: AtomicU64::new(1),
        })
    }

    /// Use HTTP basic auth (rpcuser/rpcpassword)
    pub fn with_auth(mut self, user: &str, password: &str) -> Self {
        if !user.is_empty() {
            self.auth = Some((user.to_string(), password.to_string()));
        }
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Get next request ID
    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Make a JSON-RPC call and return the raw `result`
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RelayError> {
        let request = JsonRpcRequest {
            jsonrpc: "1.0",
            method,
            params,
            id: self.next_id(),
        };

        let mut builder = self.client.post(&self.url).json(&request);
        if let Some((user, password)) = &self.auth {
            builder = builder.basic_auth(user, Some(password));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RelayError::Upstream(format!("{}: network error: {}", method, e)))?;

        // bitcoind reports RPC errors with HTTP 500 and a JSON body
        let status = response.status();
        let body: JsonRpcResponse = response.json().await.map_err(|e| {
            RelayError::Upstream(format!("{}: HTTP {} with unparseable body: {}", method, status, e))
        })?;

        if let Some(error) = body.error {
            return Err(RelayError::Upstream(format!("{}: {}", method, error.message)));
        }

        Ok(body.result)
    }

    /// `getpeerinfo`, mapped to local peer entries
    pub async fn get_peer_info(&self) -> Result<Vec<LocalPeerInfo>, RelayError> {
        let result = self.call("getpeerinfo", Value::Array(Vec::new())).await?;
        let entries = result.as_array().ok_or_else(|| {
            RelayError::Upstream("getpeerinfo: result is not an array".to_string())
        })?;
        Ok(parse_peer_info(entries, current_timestamp()))
    }

    /// `submitblock` with the hex-encoded payload
    pub async fn submit_raw_block(&self, payload: &[u8]) -> Result<(), RelayError> {
        let result = self
            .call("submitblock", serde_json::json!([hex::encode(payload)]))
            .await
            .map_err(|e| RelayError::Rejected {
                endpoint: self.url.clone(),
                reason: e.to_string(),
            })?;
        interpret_submit_result(&self.url, &result)
    }
}

/// Map `getpeerinfo` entries. Entries without a usable `addr` are skipped.
pub fn parse_peer_info(entries: &[Value], now: Timestamp) -> Vec<LocalPeerInfo> {
    entries
        .iter()
        .filter_map(|entry| {
            let address = entry.get("addr")?.as_str()?.to_string();
            if address.is_empty() {
                return None;
            }

            let inbound = entry.get("inbound").and_then(Value::as_bool).unwrap_or(true);
            let ping_millis = entry
                .get("pingtime")
                .and_then(Value::as_f64)
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(|secs| (secs * 1000.0).round() as u64);
            let connection_age_secs = entry
                .get("conntime")
                .and_then(Value::as_u64)
                .map(|since| now.saturating_sub(since));

            Some(LocalPeerInfo {
                address,
                inbound,
                ping_millis,
                connection_age_secs,
            })
        })
        .collect()
}

/// `null` means accepted; a string is the rejection reason
pub fn interpret_submit_result(endpoint: &str, result: &Value) -> Result<(), RelayError> {
    match result {
        Value::Null => Ok(()),
        Value::String(reason) => Err(RelayError::Rejected {
            endpoint: endpoint.to_string(),
            reason: reason.clone(),
        }),
        other => {
            debug!("Unexpected submitblock result from {}: {}", endpoint, other);
            Err(RelayError::Rejected {
                endpoint: endpoint.to_string(),
                reason: other.to_string(),
            })
        }
    }
}

#[async_trait]
impl LocalNode for RpcClient {
    async fn peer_info(&self) -> Result<Vec<LocalPeerInfo>, RelayError> {
        self.get_peer_info().await
    }
}

#[async_trait]
impl BlockSubmitter for RpcClient {
    fn name(&self) -> &str {
        &self.url
    }

    async fn submit_block(&self, payload: &[u8]) -> Result<(), RelayError> {
        self.submit_raw_block(payload).await
    }
}
