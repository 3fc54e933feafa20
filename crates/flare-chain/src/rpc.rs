use std::time::Duration;

use alloy_primitives::{Address, B256, hex};
use serde::Deserialize;
use serde_json::{Value, json};

use flare_core::FetchError;

// ---------------------------------------------------------------------------
// BlockTag
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Number(u64),
}

impl BlockTag {
    fn to_param(self) -> Value {
        match self {
            BlockTag::Latest => json!("latest"),
            BlockTag::Number(n) => json!(format!("0x{n:x}")),
        }
    }
}

// ---------------------------------------------------------------------------
// RpcClient — minimal EVM JSON-RPC 2.0 transport
// ---------------------------------------------------------------------------

/// The four read-only methods the Morpho fetcher needs. HTTP and decoding
/// failures surface as retryable transport errors; RPC error objects are
/// terminal unless they indicate rate limiting.
pub struct RpcClient {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    result: Option<Value>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// `eth_getLogs` entry, reduced to what aggregation needs.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct RawLog {
    topics: Vec<String>,
    data: String,
}

const RATE_LIMIT_CODE: i64 = -32005;

impl RpcClient {
    pub fn new(client: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, FetchError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| FetchError::retryable(format!("rpc {method}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Transport {
                retryable: status.as_u16() == 429 || status.is_server_error(),
                message: format!("rpc {method}: http {status}"),
            });
        }

        let envelope: RpcEnvelope = response
            .json()
            .await
            .map_err(|e| FetchError::retryable(format!("rpc {method}: decode: {e}")))?;

        if let Some(err) = envelope.error {
            return Err(FetchError::Transport {
                retryable: err.code == RATE_LIMIT_CODE,
                message: format!("rpc {method}: {} (code {})", err.message, err.code),
            });
        }
        envelope
            .result
            .ok_or_else(|| FetchError::terminal(format!("rpc {method}: empty result")))
    }

    pub async fn block_number(&self) -> Result<u64, FetchError> {
        let result = self.request("eth_blockNumber", json!([])).await?;
        parse_quantity(&result)
    }

    pub async fn block_timestamp(&self, tag: BlockTag) -> Result<u64, FetchError> {
        let result = self
            .request("eth_getBlockByNumber", json!([tag.to_param(), false]))
            .await?;
        let ts = result
            .get("timestamp")
            .ok_or_else(|| FetchError::terminal("eth_getBlockByNumber: no timestamp"))?;
        parse_quantity(ts)
    }

    pub async fn eth_call(
        &self,
        to: Address,
        calldata: &[u8],
        tag: BlockTag,
    ) -> Result<Vec<u8>, FetchError> {
        let params = json!([
            { "to": to.to_string(), "data": format!("0x{}", hex::encode(calldata)) },
            tag.to_param(),
        ]);
        let result = self.request("eth_call", params).await?;
        decode_hex_blob(&result)
    }

    pub async fn get_logs(
        &self,
        address: Address,
        topics: &[Option<B256>],
        from: BlockTag,
        to: BlockTag,
    ) -> Result<Vec<LogEntry>, FetchError> {
        let topics_json: Vec<Value> = topics
            .iter()
            .map(|t| match t {
                Some(hash) => json!(hash.to_string()),
                None => Value::Null,
            })
            .collect();
        let params = json!([{
            "address": address.to_string(),
            "topics": topics_json,
            "fromBlock": from.to_param(),
            "toBlock": to.to_param(),
        }]);
        let result = self.request("eth_getLogs", params).await?;
        let raw: Vec<RawLog> = serde_json::from_value(result)
            .map_err(|e| FetchError::terminal(format!("eth_getLogs: decode: {e}")))?;
        raw.into_iter()
            .map(|log| {
                let topics = log
                    .topics
                    .iter()
                    .map(|t| {
                        t.parse::<B256>()
                            .map_err(|e| FetchError::terminal(format!("eth_getLogs: topic: {e}")))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let data = hex::decode(&log.data)
                    .map_err(|e| FetchError::terminal(format!("eth_getLogs: data: {e}")))?;
                Ok(LogEntry { topics, data })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Hex & ABI word helpers
// ---------------------------------------------------------------------------

/// Parse a JSON-RPC quantity (`"0x1b4"`) into a u64.
pub fn parse_quantity(value: &Value) -> Result<u64, FetchError> {
    let s = value
        .as_str()
        .ok_or_else(|| FetchError::terminal(format!("expected hex quantity, got {value}")))?;
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16)
        .map_err(|e| FetchError::terminal(format!("bad hex quantity {s:?}: {e}")))
}

fn decode_hex_blob(value: &Value) -> Result<Vec<u8>, FetchError> {
    let s = value
        .as_str()
        .ok_or_else(|| FetchError::terminal(format!("expected hex data, got {value}")))?;
    hex::decode(s).map_err(|e| FetchError::terminal(format!("bad hex data: {e}")))
}

/// The `index`-th 32-byte word of ABI-encoded return data.
pub fn word_at(data: &[u8], index: usize) -> Result<&[u8], FetchError> {
    let start = index * 32;
    let end = start + 32;
    if data.len() < end {
        return Err(FetchError::terminal(format!(
            "return data too short: {} bytes, wanted word {index}",
            data.len()
        )));
    }
    Ok(&data[start..end])
}

/// Big-endian 256-bit word to f64. Lossy above 2^53, which is acceptable for
/// signal arithmetic.
pub fn word_to_f64(word: &[u8]) -> f64 {
    word.iter().fold(0.0, |acc, &b| acc * 256.0 + f64::from(b))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
