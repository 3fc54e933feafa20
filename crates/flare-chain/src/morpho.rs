use std::collections::HashMap;
use std::time::Duration;

use alloy_primitives::{Address, B256, keccak256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use flare_config::ChainConfig;
use flare_core::{DataFetcher, FetchError};
use flare_dsl::{Aggregation, Filter, FilterOp};

use crate::blocks::estimate_block_before;
use crate::rpc::{BlockTag, RpcClient, word_at, word_to_f64};

// ---------------------------------------------------------------------------
// ABI tables — injected configuration for the Morpho Blue contract
// ---------------------------------------------------------------------------

const MARKET_SIG: &str = "market(bytes32)";
const POSITION_SIG: &str = "position(bytes32,address)";

/// `market(Id)` return struct, word per field.
const MARKET_FIELDS: &[(&str, usize)] = &[
    ("total_supply_assets", 0),
    ("total_supply_shares", 1),
    ("total_borrow_assets", 2),
    ("total_borrow_shares", 3),
    ("last_update", 4),
    ("fee", 5),
];

/// `position(Id, address)` return struct, word per field.
const POSITION_FIELDS: &[(&str, usize)] = &[
    ("supply_shares", 0),
    ("borrow_shares", 1),
    ("collateral", 2),
];

/// Event catalog: type name, canonical signature, and the layout of the
/// non-indexed data words. The market id is always `topic1`.
const EVENT_SIGS: &[(&str, &str, &[(&str, usize)])] = &[
    (
        "supply",
        "Supply(bytes32,address,address,uint256,uint256)",
        &[("assets", 0), ("shares", 1)],
    ),
    (
        "withdraw",
        "Withdraw(bytes32,address,address,address,uint256,uint256)",
        &[("caller", 0), ("assets", 1), ("shares", 2)],
    ),
    (
        "borrow",
        "Borrow(bytes32,address,address,address,uint256,uint256)",
        &[("caller", 0), ("assets", 1), ("shares", 2)],
    ),
    (
        "repay",
        "Repay(bytes32,address,address,uint256,uint256)",
        &[("assets", 0), ("shares", 1)],
    ),
    (
        "liquidate",
        "Liquidate(bytes32,address,address,uint256,uint256,uint256,uint256,uint256)",
        &[
            ("repaid_assets", 0),
            ("repaid_shares", 1),
            ("seized_assets", 2),
            ("bad_debt_assets", 3),
            ("bad_debt_shares", 4),
        ],
    ),
];

struct EventAbi {
    topic0: B256,
    fields: &'static [(&'static str, usize)],
}

struct MorphoAbi {
    market_selector: [u8; 4],
    position_selector: [u8; 4],
    events: HashMap<&'static str, EventAbi>,
}

impl MorphoAbi {
    fn build() -> Self {
        let events = EVENT_SIGS
            .iter()
            .map(|(event_type, sig, fields)| {
                (
                    *event_type,
                    EventAbi {
                        topic0: keccak256(sig.as_bytes()),
                        fields: *fields,
                    },
                )
            })
            .collect();
        Self {
            market_selector: selector(MARKET_SIG),
            position_selector: selector(POSITION_SIG),
            events,
        }
    }
}

fn selector(signature: &str) -> [u8; 4] {
    let digest = keccak256(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

fn field_index(table: &[(&str, usize)], field: &str) -> Option<usize> {
    table.iter().find(|(name, _)| *name == field).map(|(_, i)| *i)
}

// ---------------------------------------------------------------------------
// MorphoFetcher
// ---------------------------------------------------------------------------

/// Treat instants this close to now as "latest" instead of estimating.
const LATEST_SLACK_SECS: i64 = 30;

/// Per-call RPC timeout.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

struct ChainBinding {
    rpc: RpcClient,
    contract: Address,
    avg_block_time_secs: f64,
}

/// Reference [`DataFetcher`] binding for Morpho Blue over EVM JSON-RPC.
///
/// Block resolution for past instants is an estimate from the chain's
/// average block time; see [`estimate_block_before`].
pub struct MorphoFetcher {
    chains: HashMap<u64, ChainBinding>,
    abi: MorphoAbi,
}

impl MorphoFetcher {
    pub fn new(chains: &[ChainConfig]) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| anyhow::anyhow!("http client build: {e}"))?;
        let mut bindings = HashMap::with_capacity(chains.len());
        for chain in chains {
            let contract: Address = chain.morpho_address.parse().map_err(|e| {
                anyhow::anyhow!("chain {}: bad Morpho address {:?}: {e}", chain.chain_id, chain.morpho_address)
            })?;
            bindings.insert(
                chain.chain_id,
                ChainBinding {
                    rpc: RpcClient::new(client.clone(), chain.rpc_url.clone(), RPC_TIMEOUT),
                    contract,
                    avg_block_time_secs: chain.avg_block_time_secs,
                },
            );
        }
        Ok(Self {
            chains: bindings,
            abi: MorphoAbi::build(),
        })
    }

    fn binding(&self, chain_id: u64) -> Result<&ChainBinding, FetchError> {
        self.chains
            .get(&chain_id)
            .ok_or_else(|| FetchError::not_found(format!("chain {chain_id} is not configured")))
    }

    async fn resolve_block(
        &self,
        binding: &ChainBinding,
        at: DateTime<Utc>,
    ) -> Result<BlockTag, FetchError> {
        let now = Utc::now();
        if (now - at).num_seconds() <= LATEST_SLACK_SECS {
            return Ok(BlockTag::Latest);
        }
        let latest = binding.rpc.block_number().await?;
        Ok(BlockTag::Number(estimate_block_before(
            latest,
            now,
            at,
            binding.avg_block_time_secs,
        )))
    }

    #[cfg(test)]
    pub(crate) fn event_topic0(&self, event_type: &str) -> Option<B256> {
        self.abi.events.get(event_type).map(|e| e.topic0)
    }
}

// ---------------------------------------------------------------------------
// Filter helpers
// ---------------------------------------------------------------------------

fn ensure_supported(filters: &[Filter], allowed: &[&str]) -> Result<(), FetchError> {
    for filter in filters {
        if !allowed.contains(&filter.field.as_str()) {
            return Err(FetchError::schema(format!(
                "unsupported filter field `{}`",
                filter.field
            )));
        }
        if filter.op != FilterOp::Eq {
            return Err(FetchError::schema(format!(
                "filter `{}` only supports `eq`",
                filter.field
            )));
        }
    }
    Ok(())
}

fn eq_filter<'a>(filters: &'a [Filter], field: &str) -> Option<&'a str> {
    filters
        .iter()
        .find(|f| f.field == field && f.op == FilterOp::Eq)
        .and_then(|f| f.value.as_str())
}

fn market_id_filter(filters: &[Filter]) -> Result<B256, FetchError> {
    let raw = eq_filter(filters, "market_id")
        .ok_or_else(|| FetchError::not_found("no `market_id` filter identifies the market"))?;
    raw.parse::<B256>()
        .map_err(|e| FetchError::not_found(format!("bad market_id {raw:?}: {e}")))
}

fn user_filter(filters: &[Filter]) -> Result<Address, FetchError> {
    let raw = eq_filter(filters, "user")
        .ok_or_else(|| FetchError::not_found("no `user` filter identifies the position"))?;
    raw.parse::<Address>()
        .map_err(|e| FetchError::not_found(format!("bad user address {raw:?}: {e}")))
}

// ---------------------------------------------------------------------------
// DataFetcher impl
// ---------------------------------------------------------------------------

#[async_trait]
impl DataFetcher for MorphoFetcher {
    async fn fetch_state(
        &self,
        chain_id: u64,
        entity_type: &str,
        filters: &[Filter],
        field: &str,
        at: DateTime<Utc>,
    ) -> Result<f64, FetchError> {
        let binding = self.binding(chain_id)?;
        let tag = self.resolve_block(binding, at).await?;

        match entity_type {
            "market" => {
                ensure_supported(filters, &["market_id"])?;
                let market_id = market_id_filter(filters)?;
                let mut calldata = Vec::with_capacity(4 + 32);
                calldata.extend_from_slice(&self.abi.market_selector);
                calldata.extend_from_slice(market_id.as_slice());
                let data = binding.rpc.eth_call(binding.contract, &calldata, tag).await?;

                if field == "utilization" {
                    let supply = word_to_f64(word_at(&data, 0)?);
                    let borrow = word_to_f64(word_at(&data, 2)?);
                    return Ok(if supply == 0.0 { 0.0 } else { borrow / supply });
                }
                let index = field_index(MARKET_FIELDS, field).ok_or_else(|| {
                    FetchError::schema(format!("market has no field `{field}`"))
                })?;
                Ok(word_to_f64(word_at(&data, index)?))
            }
            "position" => {
                ensure_supported(filters, &["market_id", "user"])?;
                let market_id = market_id_filter(filters)?;
                let user = user_filter(filters)?;
                let mut calldata = Vec::with_capacity(4 + 64);
                calldata.extend_from_slice(&self.abi.position_selector);
                calldata.extend_from_slice(market_id.as_slice());
                calldata.extend_from_slice(&[0u8; 12]);
                calldata.extend_from_slice(user.as_slice());
                let data = binding.rpc.eth_call(binding.contract, &calldata, tag).await?;

                let index = field_index(POSITION_FIELDS, field).ok_or_else(|| {
                    FetchError::schema(format!("position has no field `{field}`"))
                })?;
                Ok(word_to_f64(word_at(&data, index)?))
            }
            other => Err(FetchError::schema(format!("unknown entity type `{other}`"))),
        }
    }

    async fn fetch_events(
        &self,
        chain_id: u64,
        event_type: &str,
        filters: &[Filter],
        field: &str,
        aggregation: Aggregation,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<f64, FetchError> {
        let binding = self.binding(chain_id)?;
        let event = self
            .abi
            .events
            .get(event_type)
            .ok_or_else(|| FetchError::schema(format!("unknown event type `{event_type}`")))?;
        ensure_supported(filters, &["market_id"])?;

        let field_word = match aggregation {
            // Count only needs the matching logs themselves.
            Aggregation::Count => None,
            _ => Some(field_index(event.fields, field).ok_or_else(|| {
                FetchError::schema(format!("event `{event_type}` has no field `{field}`"))
            })?),
        };

        let topic1 = match eq_filter(filters, "market_id") {
            Some(raw) => Some(raw.parse::<B256>().map_err(|e| {
                FetchError::not_found(format!("bad market_id {raw:?}: {e}"))
            })?),
            None => None,
        };
        let topics = [Some(event.topic0), topic1];

        let from = self.resolve_block(binding, window_start).await?;
        let to = self.resolve_block(binding, window_end).await?;
        let logs = binding
            .rpc
            .get_logs(binding.contract, &topics, from, to)
            .await?;
        tracing::debug!(
            domain = "chain",
            chain = chain_id,
            event = event_type,
            logs = logs.len(),
            "event window fetched"
        );

        let values = match field_word {
            None => Vec::new(),
            Some(index) => logs
                .iter()
                .map(|log| Ok(word_to_f64(word_at(&log.data, index)?)))
                .collect::<Result<Vec<f64>, FetchError>>()?,
        };

        // Empty sets aggregate to 0 across the board, min/max/avg included.
        Ok(match aggregation {
            Aggregation::Count => logs.len() as f64,
            Aggregation::Sum => values.iter().sum(),
            Aggregation::Avg => {
                if values.is_empty() {
                    0.0
                } else {
                    values.iter().sum::<f64>() / values.len() as f64
                }
            }
            Aggregation::Min => {
                if values.is_empty() {
                    0.0
                } else {
                    values.iter().copied().fold(f64::INFINITY, f64::min)
                }
            }
            Aggregation::Max => {
                if values.is_empty() {
                    0.0
                } else {
                    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use flare_dsl::{FilterValue, MetricKind, MetricRegistry, PROTOCOL_MORPHO};
    use serde_json::{Value, json};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    const MARKET_ID: &str =
        "0xb323495f7e4148be5643a4ea4a8221eef163e4bccfdedc2a6f4696baacbc86cc";
    const USER: &str = "0x5a6B47F4131bf1feAFA56A05573314BcF44C9149";

    fn market_filter() -> Filter {
        Filter {
            field: "market_id".to_string(),
            op: FilterOp::Eq,
            value: FilterValue::Str(MARKET_ID.to_string()),
        }
    }

    fn user_filter_value() -> Filter {
        Filter {
            field: "user".to_string(),
            op: FilterOp::Eq,
            value: FilterValue::Str(USER.to_string()),
        }
    }

    fn chain_config(rpc_url: &str) -> ChainConfig {
        ChainConfig {
            chain_id: 1,
            rpc_url: rpc_url.to_string(),
            morpho_address: "0xBBBBBbbBBb9cC5e90e3b3Af64bdAF62C37EEFFCb".to_string(),
            avg_block_time_secs: 12.0,
        }
    }

    fn hex_words(values: &[u64]) -> String {
        let mut out = String::from("0x");
        for v in values {
            out.push_str(&format!("{v:064x}"));
        }
        out
    }

    /// Serve `count` JSON-RPC requests, answering by method name, and return
    /// the captured request bodies.
    async fn rpc_stub(
        responses: HashMap<&'static str, Value>,
        count: usize,
    ) -> (String, JoinHandle<Vec<Value>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let mut captured = Vec::new();
            for _ in 0..count {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut tmp = [0u8; 4096];
                let body_start = loop {
                    let n = stream.read(&mut tmp).await.unwrap();
                    buf.extend_from_slice(&tmp[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                };
                let headers = String::from_utf8_lossy(&buf[..body_start]).to_ascii_lowercase();
                let content_length: usize = headers
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(0);
                while buf.len() < body_start + content_length {
                    let n = stream.read(&mut tmp).await.unwrap();
                    buf.extend_from_slice(&tmp[..n]);
                }
                let request: Value = serde_json::from_slice(&buf[body_start..]).unwrap();
                let method = request["method"].as_str().unwrap().to_string();
                captured.push(request);

                let result = responses
                    .get(method.as_str())
                    .cloned()
                    .unwrap_or(Value::Null);
                let body =
                    serde_json::to_string(&json!({"jsonrpc": "2.0", "id": 1, "result": result}))
                        .unwrap();
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.ok();
            }
            captured
        });
        (url, handle)
    }

    #[test]
    fn abi_tables_cover_the_metric_catalog() {
        let abi = MorphoAbi::build();
        let registry = MetricRegistry::global();
        for def in registry.by_protocol(PROTOCOL_MORPHO) {
            match def.kind {
                MetricKind::State => {
                    let table = match def.entry_type {
                        "market" => MARKET_FIELDS,
                        "position" => POSITION_FIELDS,
                        other => panic!("no state table for entity `{other}`"),
                    };
                    assert!(
                        field_index(table, def.field).is_some(),
                        "state field {}.{} has no word mapping",
                        def.entry_type,
                        def.field
                    );
                }
                MetricKind::Computed => {
                    assert_eq!(def.entry_type, "market");
                    assert_eq!(def.field, "utilization");
                }
                MetricKind::Event | MetricKind::ChainedEvent => {
                    let event = abi
                        .events
                        .get(def.entry_type)
                        .unwrap_or_else(|| panic!("no event abi for `{}`", def.entry_type));
                    assert!(
                        field_index(event.fields, def.field).is_some(),
                        "event field {}.{} has no data-word mapping",
                        def.entry_type,
                        def.field
                    );
                }
            }
        }
    }

    #[test]
    fn event_topics_are_distinct() {
        let abi = MorphoAbi::build();
        let mut topics: Vec<B256> = abi.events.values().map(|e| e.topic0).collect();
        topics.sort();
        topics.dedup();
        assert_eq!(topics.len(), EVENT_SIGS.len());
    }

    #[tokio::test]
    async fn market_state_reads_the_right_word() {
        let (url, handle) = rpc_stub(
            HashMap::from([("eth_call", json!(hex_words(&[1_000, 11, 250, 33, 44, 55])))]),
            2,
        )
        .await;
        let fetcher = MorphoFetcher::new(&[chain_config(&url)]).unwrap();
        let value = fetcher
            .fetch_state(1, "market", &[market_filter()], "total_borrow_assets", Utc::now())
            .await
            .unwrap();
        assert_eq!(value, 250.0);

        let value = fetcher
            .fetch_state(1, "market", &[market_filter()], "utilization", Utc::now())
            .await
            .unwrap();
        assert_eq!(value, 0.25);

        let requests = handle.await.unwrap();
        let calldata = requests[0]["params"][0]["data"].as_str().unwrap();
        // selector + 32-byte market id
        assert_eq!(calldata.len(), 2 + 2 * (4 + 32));
        assert!(calldata.ends_with(&MARKET_ID[2..]));
    }

    #[tokio::test]
    async fn position_state_encodes_id_and_padded_user() {
        let (url, handle) = rpc_stub(
            HashMap::from([("eth_call", json!(hex_words(&[77, 88, 99])))]),
            1,
        )
        .await;
        let fetcher = MorphoFetcher::new(&[chain_config(&url)]).unwrap();
        let value = fetcher
            .fetch_state(
                1,
                "position",
                &[market_filter(), user_filter_value()],
                "collateral",
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(value, 99.0);

        let requests = handle.await.unwrap();
        let calldata = requests[0]["params"][0]["data"].as_str().unwrap();
        // selector + id word + address word
        assert_eq!(calldata.len(), 2 + 2 * (4 + 32 + 32));
        assert!(
            calldata
                .to_ascii_lowercase()
                .ends_with(&USER[2..].to_ascii_lowercase())
        );
    }

    #[tokio::test]
    async fn schema_and_not_found_errors() {
        let fetcher = MorphoFetcher::new(&[chain_config("http://127.0.0.1:1/")]).unwrap();

        let err = fetcher
            .fetch_state(7, "market", &[market_filter()], "fee", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotFound { .. }));

        let err = fetcher
            .fetch_state(1, "market", &[], "fee", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotFound { .. }));

        // Unknown fields and entity types fail before any RPC traffic.
        let err = fetcher
            .fetch_state(1, "vault", &[market_filter()], "fee", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Schema { .. }));
    }

    #[tokio::test]
    async fn event_aggregation_sums_the_field_word() {
        // Borrow data layout: [caller, assets, shares].
        let logs = json!([
            { "topics": [format!("{:?}", B256::ZERO)], "data": hex_words(&[0, 5, 1]) },
            { "topics": [format!("{:?}", B256::ZERO)], "data": hex_words(&[0, 9, 2]) },
        ]);
        let (url, handle) = rpc_stub(
            HashMap::from([
                ("eth_blockNumber", json!("0x1000")),
                ("eth_getLogs", logs),
            ]),
            2,
        )
        .await;
        let fetcher = MorphoFetcher::new(&[chain_config(&url)]).unwrap();
        let window_end = Utc::now();
        let window_start = window_end - chrono::Duration::hours(1);
        let value = fetcher
            .fetch_events(
                1,
                "borrow",
                &[market_filter()],
                "assets",
                Aggregation::Sum,
                window_start,
                window_end,
            )
            .await
            .unwrap();
        assert_eq!(value, 14.0);

        let requests = handle.await.unwrap();
        let get_logs = requests
            .iter()
            .find(|r| r["method"] == "eth_getLogs")
            .unwrap();
        let expected_topic0 = fetcher.event_topic0("borrow").unwrap();
        assert_eq!(
            get_logs["params"][0]["topics"][0],
            json!(expected_topic0.to_string())
        );
        assert_eq!(
            get_logs["params"][0]["topics"][1],
            json!(MARKET_ID.to_string())
        );
    }

    #[tokio::test]
    async fn empty_event_sets_aggregate_to_zero() {
        for aggregation in [
            Aggregation::Sum,
            Aggregation::Count,
            Aggregation::Avg,
            Aggregation::Min,
            Aggregation::Max,
        ] {
            let (url, _handle) = rpc_stub(
                HashMap::from([
                    ("eth_blockNumber", json!("0x1000")),
                    ("eth_getLogs", json!([])),
                ]),
                2,
            )
            .await;
            let fetcher = MorphoFetcher::new(&[chain_config(&url)]).unwrap();
            let window_end = Utc::now();
            let value = fetcher
                .fetch_events(
                    1,
                    "supply",
                    &[market_filter()],
                    "assets",
                    aggregation,
                    window_end - chrono::Duration::hours(1),
                    window_end,
                )
                .await
                .unwrap();
            assert_eq!(value, 0.0, "{aggregation:?} over empty set");
        }
    }
}
