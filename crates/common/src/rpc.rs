use alloy::primitives::{Address, Bytes, B256, U256, U64};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

/// Error taxonomy for the JSON-RPC boundary.
///
/// Transport and server-side failures are transient: the affected block is
/// aborted before anything is committed and the next scheduled poll retries
/// the same range. RPC-level errors carry the node's code/message.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {0}")]
    Status(u16),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed response: {0}")]
    Decode(String),
}

impl RpcError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Status(_) => true,
            // -32005: rate limited; -32603: node-internal error.
            Self::Rpc { code, .. } => matches!(code, -32005 | -32603),
            Self::Decode(_) => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    pub number: U64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: U64,
    #[serde(default)]
    pub transactions: Vec<RpcTransaction>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub hash: B256,
    pub from: Address,
    pub to: Option<Address>,
    #[serde(default)]
    pub value: U256,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: U64,
    pub transaction_hash: B256,
    pub log_index: U64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<serde_json::Value>,
    error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorBody {
    code: i64,
    message: String,
}

/// Thin EVM JSON-RPC client over reqwest.
///
/// One instance per chain; only the four methods the pipeline needs.
pub struct EvmRpcClient {
    url: String,
    http: reqwest::Client,
}

impl EvmRpcClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.to_string(),
            http,
        })
    }

    async fn request(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, RpcError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self.http.post(&self.url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RpcError::Status(status.as_u16()));
        }

        let parsed: JsonRpcResponse = resp.json().await?;
        if let Some(err) = parsed.error {
            return Err(RpcError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(parsed.result.unwrap_or(serde_json::Value::Null))
    }

    fn parse<T: DeserializeOwned>(value: serde_json::Value, what: &str) -> Result<T, RpcError> {
        serde_json::from_value(value).map_err(|e| RpcError::Decode(format!("{what}: {e}")))
    }

    /// `eth_blockNumber` — the chain head.
    pub async fn block_number(&self) -> Result<u64, RpcError> {
        let value = self.request("eth_blockNumber", serde_json::json!([])).await?;
        let number: U64 = Self::parse(value, "eth_blockNumber")?;
        Ok(number.to::<u64>())
    }

    /// `eth_getBlockByNumber` with full transaction objects. `None` when the
    /// node does not (yet) have the block.
    pub async fn block_by_number(&self, number: u64) -> Result<Option<RpcBlock>, RpcError> {
        let value = self
            .request(
                "eth_getBlockByNumber",
                serde_json::json!([format!("0x{number:x}"), true]),
            )
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(Self::parse(value, "eth_getBlockByNumber")?))
    }

    /// `eth_getLogs` filtered by topic0 over an inclusive block range.
    pub async fn logs_by_topic(
        &self,
        from_block: u64,
        to_block: u64,
        topic0: B256,
    ) -> Result<Vec<RpcLog>, RpcError> {
        let value = self
            .request(
                "eth_getLogs",
                serde_json::json!([{
                    "fromBlock": format!("0x{from_block:x}"),
                    "toBlock": format!("0x{to_block:x}"),
                    "topics": [format!("{topic0}")],
                }]),
            )
            .await?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        Self::parse(value, "eth_getLogs")
    }

    /// `eth_call` against latest state; used for token/pair metadata reads.
    pub async fn call(&self, to: Address, data: &Bytes) -> Result<Bytes, RpcError> {
        let value = self
            .request(
                "eth_call",
                serde_json::json!([{
                    "to": format!("{to}"),
                    "data": format!("{data}"),
                }, "latest"]),
            )
            .await?;
        Self::parse(value, "eth_call")
    }
}
