//! Minimal EVM JSON-RPC client with URL fallback
//!
//! Raw `reqwest` calls for the handful of read methods the relay needs. Each
//! call tries the configured URLs in order and returns the first answer.

use eyre::{eyre, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::{RelayError, RelayResult};

/// Parse a comma-separated RPC URL string into individual trimmed URLs.
pub fn parse_rpc_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse a `0x`-prefixed hex quantity
pub fn parse_hex_u64(value: &str) -> RelayResult<u64> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|e| RelayError::MalformedResponse(format!("bad hex quantity {:?}: {}", value, e)))
}

/// RPC response wrapper
#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Log entry as returned by `eth_getLogs`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: Option<String>,
    pub block_hash: Option<String>,
    pub transaction_hash: Option<String>,
    pub log_index: Option<String>,
    #[serde(default)]
    pub removed: bool,
}

/// Block header fields we read
#[derive(Debug, Clone, Deserialize)]
pub struct RpcBlock {
    pub number: String,
    pub hash: String,
}

/// Transaction receipt fields we read
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    pub transaction_hash: String,
    pub block_number: Option<String>,
    pub block_hash: Option<String>,
    pub status: Option<String>,
}

#[derive(Clone)]
pub struct JsonRpcClient {
    urls: Vec<String>,
    client: Client,
}

impl JsonRpcClient {
    pub fn new(urls: Vec<String>) -> Result<Self> {
        if urls.is_empty() {
            return Err(eyre!("At least one RPC URL is required"));
        }
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self { urls, client })
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// Issue one JSON-RPC call, falling back across URLs on transport errors
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> RelayResult<Option<T>> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let mut last_error = RelayError::TransientNetwork("no RPC URL tried".to_string());
        for url in &self.urls {
            match self.call_one::<T>(url, &body).await {
                Ok(result) => return Ok(result),
                Err(e @ RelayError::MalformedResponse(_)) => return Err(e),
                Err(e) => {
                    debug!(url = %url, method = method, error = %e, "RPC call failed, trying next URL");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn call_one<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> RelayResult<Option<T>> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await?
            .error_for_status()?
            .json::<RpcResponse<T>>()
            .await?;

        if let Some(error) = response.error {
            return Err(RelayError::TransientNetwork(format!(
                "RPC error: {} - {}",
                error.code, error.message
            )));
        }

        Ok(response.result)
    }

    /// Current head height
    pub async fn block_number(&self) -> RelayResult<u64> {
        let hex: String = self
            .call("eth_blockNumber", serde_json::json!([]))
            .await?
            .ok_or_else(|| RelayError::MalformedResponse("No block number returned".into()))?;
        parse_hex_u64(&hex)
    }

    /// `eth_chainId` as reported by each URL, in configured order
    pub async fn chain_ids(&self) -> Vec<RelayResult<u64>> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_chainId",
            "params": [],
            "id": 1
        });

        let mut ids = Vec::with_capacity(self.urls.len());
        for url in &self.urls {
            let id = match self.call_one::<String>(url, &body).await {
                Ok(Some(hex)) => parse_hex_u64(&hex),
                Ok(None) => Err(RelayError::MalformedResponse("No chain id returned".into())),
                Err(e) => Err(e),
            };
            ids.push(id);
        }
        ids
    }

    /// Block header by tag (`latest`, `safe`, `finalized`) or height
    pub async fn block(&self, tag: &str) -> RelayResult<Option<RpcBlock>> {
        self.call("eth_getBlockByNumber", serde_json::json!([tag, false]))
            .await
    }

    pub async fn block_at(&self, height: u64) -> RelayResult<Option<RpcBlock>> {
        self.block(&format!("0x{:x}", height)).await
    }

    /// Logs matching `topics` over a block range (null topics are wildcards)
    pub async fn logs(
        &self,
        address: &str,
        topics: serde_json::Value,
        from_block: u64,
        to_block: u64,
    ) -> RelayResult<Vec<RpcLog>> {
        let filter = serde_json::json!([{
            "address": address,
            "topics": topics,
            "fromBlock": format!("0x{:x}", from_block),
            "toBlock": format!("0x{:x}", to_block),
        }]);
        Ok(self.call("eth_getLogs", filter).await?.unwrap_or_default())
    }

    pub async fn transaction_receipt(&self, tx_hash: &str) -> RelayResult<Option<RpcReceipt>> {
        self.call("eth_getTransactionReceipt", serde_json::json!([tx_hash]))
            .await
    }

    /// Whether the node knows `tx_hash` at all (mined or in its mempool)
    pub async fn transaction_known(&self, tx_hash: &str) -> RelayResult<bool> {
        let tx: Option<serde_json::Value> = self
            .call("eth_getTransactionByHash", serde_json::json!([tx_hash]))
            .await?;
        Ok(tx.map_or(false, |v| !v.is_null()))
    }
}
