use serde::Deserialize;

// ---------------------------------------------------------------------------
// Built-in per-chain defaults
// ---------------------------------------------------------------------------

/// Baked-in defaults for the chains Morpho Blue is deployed on. The contract
/// lives at the same canonical address on each of them; operators only need
/// to supply an RPC endpoint.
#[derive(Debug, Clone, Copy)]
pub struct ChainDefaults {
    pub chain_id: u64,
    pub name: &'static str,
    pub morpho_address: &'static str,
    pub avg_block_time_secs: f64,
}

const MORPHO_BLUE: &str = "0xBBBBBbbBBb9cC5e90e3b3Af64bdAF62C37EEFFCb";

pub static CHAIN_DEFAULTS: &[ChainDefaults] = &[
    ChainDefaults { chain_id: 1, name: "ethereum", morpho_address: MORPHO_BLUE, avg_block_time_secs: 12.0 },
    ChainDefaults { chain_id: 10, name: "optimism", morpho_address: MORPHO_BLUE, avg_block_time_secs: 2.0 },
    ChainDefaults { chain_id: 137, name: "polygon", morpho_address: MORPHO_BLUE, avg_block_time_secs: 2.1 },
    ChainDefaults { chain_id: 130, name: "unichain", morpho_address: MORPHO_BLUE, avg_block_time_secs: 1.0 },
    ChainDefaults { chain_id: 480, name: "worldchain", morpho_address: MORPHO_BLUE, avg_block_time_secs: 2.0 },
    ChainDefaults { chain_id: 8453, name: "base", morpho_address: MORPHO_BLUE, avg_block_time_secs: 2.0 },
    ChainDefaults { chain_id: 42161, name: "arbitrum", morpho_address: MORPHO_BLUE, avg_block_time_secs: 0.25 },
];

pub fn chain_defaults(chain_id: u64) -> Option<&'static ChainDefaults> {
    CHAIN_DEFAULTS.iter().find(|d| d.chain_id == chain_id)
}

// ---------------------------------------------------------------------------
// Per-chain override (raw TOML) and resolved config
// ---------------------------------------------------------------------------

/// Raw `[chain.<id>]` table. Only `rpc_url` is mandatory; the rest falls
/// back to [`CHAIN_DEFAULTS`].
#[derive(Debug, Clone, Deserialize)]
pub struct ChainOverride {
    #[serde(default)]
    pub rpc_url: String,
    pub morpho_address: Option<String>,
    pub avg_block_time_secs: Option<f64>,
}

/// Resolved binding for one chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub morpho_address: String,
    pub avg_block_time_secs: f64,
}

impl ChainOverride {
    /// Resolve against the baked-in defaults for `chain_id`.
    pub fn resolve(self, chain_id: u64) -> anyhow::Result<ChainConfig> {
        let defaults = chain_defaults(chain_id);
        let morpho_address = match (self.morpho_address, defaults) {
            (Some(addr), _) => addr,
            (None, Some(d)) => d.morpho_address.to_string(),
            (None, None) => anyhow::bail!(
                "chain {chain_id}: no built-in Morpho address; set `morpho_address` explicitly"
            ),
        };
        let avg_block_time_secs = self
            .avg_block_time_secs
            .or(defaults.map(|d| d.avg_block_time_secs))
            .unwrap_or(12.0);
        if avg_block_time_secs <= 0.0 {
            anyhow::bail!("chain {chain_id}: avg_block_time_secs must be positive");
        }
        Ok(ChainConfig {
            chain_id,
            rpc_url: self.rpc_url,
            morpho_address,
            avg_block_time_secs,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
