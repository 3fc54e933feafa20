use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::chains::{ChainConfig, ChainOverride};
use crate::logging::LoggingConfig;
use crate::scheduler::SchedulerConfig;
use crate::webhook::WebhookConfig;

// ---------------------------------------------------------------------------
// Raw TOML structure (intermediate representation)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FlareConfigRaw {
    #[serde(default)]
    scheduler: SchedulerConfig,
    #[serde(default)]
    webhook: WebhookConfig,
    #[serde(default)]
    signals: SignalsConfig,
    /// `[chain.<id>]` tables, keyed by decimal chain id.
    #[serde(default)]
    chain: HashMap<String, ChainOverride>,
    #[serde(default)]
    logging: LoggingConfig,
}

/// Where signal definition files are loaded from at bootstrap.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalsConfig {
    /// Glob for definition files, resolved against the config directory.
    pub definitions: String,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            definitions: "signals/*.json".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// FlareConfig (resolved, validated)
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FlareConfig {
    pub scheduler: SchedulerConfig,
    pub webhook: WebhookConfig,
    pub signals: SignalsConfig,
    pub chains: Vec<ChainConfig>,
    pub logging: LoggingConfig,
}

impl FlareConfig {
    /// Read and parse a `flare.toml` file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.as_ref().display()))?;
        content.parse()
    }

    /// Overlay operational knobs from the process environment:
    /// `WEBHOOK_SECRET`, `WEBHOOK_TIMEOUT_MS`, `WEBHOOK_MAX_RETRIES`,
    /// `FLARE_TICK_INTERVAL`, and `FLARE_RPC_<chain id>`.
    pub fn overlay_env(&mut self) -> anyhow::Result<()> {
        let vars: Vec<(String, String)> = std::env::vars().collect();
        self.overlay_vars(vars)
    }

    /// Env overlay with an explicit variable set (testable without touching
    /// process state). Unknown variables are ignored.
    pub fn overlay_vars(
        &mut self,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> anyhow::Result<()> {
        for (key, value) in vars {
            match key.as_str() {
                "WEBHOOK_SECRET" => self.webhook.secret = value,
                "WEBHOOK_TIMEOUT_MS" => {
                    self.webhook.timeout_ms = value
                        .parse()
                        .map_err(|_| anyhow::anyhow!("WEBHOOK_TIMEOUT_MS: invalid value {value:?}"))?;
                }
                "WEBHOOK_MAX_RETRIES" => {
                    self.webhook.max_retries = value.parse().map_err(|_| {
                        anyhow::anyhow!("WEBHOOK_MAX_RETRIES: invalid value {value:?}")
                    })?;
                }
                "FLARE_TICK_INTERVAL" => {
                    self.scheduler.tick_interval = value.parse().map_err(|e| {
                        anyhow::anyhow!("FLARE_TICK_INTERVAL: invalid value {value:?}: {e}")
                    })?;
                }
                _ => {
                    if let Some(id) = key.strip_prefix("FLARE_RPC_") {
                        let chain_id: u64 = id
                            .parse()
                            .map_err(|_| anyhow::anyhow!("{key}: invalid chain id {id:?}"))?;
                        self.set_rpc_url(chain_id, value)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn set_rpc_url(&mut self, chain_id: u64, rpc_url: String) -> anyhow::Result<()> {
        if let Some(existing) = self.chains.iter_mut().find(|c| c.chain_id == chain_id) {
            existing.rpc_url = rpc_url;
            return Ok(());
        }
        let resolved = ChainOverride {
            rpc_url,
            morpho_address: None,
            avg_block_time_secs: None,
        }
        .resolve(chain_id)?;
        self.chains.push(resolved);
        self.chains.sort_by_key(|c| c.chain_id);
        Ok(())
    }
}

impl FromStr for FlareConfig {
    type Err = anyhow::Error;

    /// Parse a TOML string into a resolved, validated [`FlareConfig`].
    fn from_str(toml_str: &str) -> anyhow::Result<Self> {
        let raw: FlareConfigRaw = toml::from_str(toml_str)?;

        let mut chains = Vec::with_capacity(raw.chain.len());
        for (id, ovr) in raw.chain {
            let chain_id: u64 = id
                .parse()
                .map_err(|_| anyhow::anyhow!("[chain.{id}]: chain id must be a positive integer"))?;
            if chain_id == 0 {
                anyhow::bail!("[chain.{id}]: chain id must be positive");
            }
            chains.push(ovr.resolve(chain_id)?);
        }
        // Sort by id for deterministic ordering.
        chains.sort_by_key(|c| c.chain_id);

        let config = FlareConfig {
            scheduler: raw.scheduler,
            webhook: raw.webhook,
            signals: raw.signals,
            chains,
            logging: raw.logging,
        };

        validate(&config)?;

        Ok(config)
    }
}

fn validate(config: &FlareConfig) -> anyhow::Result<()> {
    if config.scheduler.tick_interval.as_secs() == 0 {
        anyhow::bail!("[scheduler]: tick_interval must be non-zero");
    }
    if config.scheduler.workers == 0 {
        anyhow::bail!("[scheduler]: workers must be at least 1");
    }
    if config.scheduler.chain_parallelism == 0 {
        anyhow::bail!("[scheduler]: chain_parallelism must be at least 1");
    }
    for chain in &config.chains {
        if chain.rpc_url.is_empty() {
            anyhow::bail!("[chain.{}]: rpc_url is required", chain.chain_id);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_TOML: &str = r#"
[scheduler]
tick_interval = "30s"
workers = 2
chain_parallelism = 4
job_deadline = "90s"

[webhook]
timeout_ms = 5000
max_retries = 2

[signals]
definitions = "defs/*.json"

[chain.1]
rpc_url = "https://eth.example"

[chain.8453]
rpc_url = "https://base.example"
avg_block_time_secs = 2.5

[logging]
level = "debug"
"#;

    #[test]
    fn full_config_round_trip() {
        let cfg: FlareConfig = FULL_TOML.parse().unwrap();
        assert_eq!(cfg.scheduler.tick_interval.as_secs(), 30);
        assert_eq!(cfg.webhook.timeout_ms, 5000);
        assert_eq!(cfg.signals.definitions, "defs/*.json");
        assert_eq!(cfg.chains.len(), 2);
        assert_eq!(cfg.chains[0].chain_id, 1);
        assert_eq!(cfg.chains[1].avg_block_time_secs, 2.5);
        assert_eq!(cfg.logging.level, "debug");
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: FlareConfig = "".parse::<FlareConfig>().unwrap();
        assert_eq!(cfg.scheduler.tick_interval.as_secs(), 60);
        assert_eq!(cfg.webhook.max_retries, 3);
        assert!(cfg.chains.is_empty());
        assert!(!cfg.webhook.signing_enabled());
    }

    #[test]
    fn missing_rpc_url_is_rejected() {
        let err = "[chain.1]\nmorpho_address = \"0x01\""
            .parse::<FlareConfig>()
            .unwrap_err();
        assert!(err.to_string().contains("rpc_url"));
    }

    #[test]
    fn env_overlay_wins_over_toml() {
        let mut cfg: FlareConfig = FULL_TOML.parse().unwrap();
        cfg.overlay_vars([
            ("WEBHOOK_SECRET".to_string(), "hunter2".to_string()),
            ("WEBHOOK_TIMEOUT_MS".to_string(), "2500".to_string()),
            ("WEBHOOK_MAX_RETRIES".to_string(), "5".to_string()),
            ("FLARE_TICK_INTERVAL".to_string(), "2m".to_string()),
            ("FLARE_RPC_1".to_string(), "https://eth2.example".to_string()),
            ("FLARE_RPC_42161".to_string(), "https://arb.example".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ])
        .unwrap();
        assert_eq!(cfg.webhook.secret, "hunter2");
        assert_eq!(cfg.webhook.timeout_ms, 2500);
        assert_eq!(cfg.webhook.max_retries, 5);
        assert_eq!(cfg.scheduler.tick_interval.as_secs(), 120);
        let eth = cfg.chains.iter().find(|c| c.chain_id == 1).unwrap();
        assert_eq!(eth.rpc_url, "https://eth2.example");
        let arb = cfg.chains.iter().find(|c| c.chain_id == 42161).unwrap();
        assert_eq!(arb.rpc_url, "https://arb.example");
        assert_eq!(arb.avg_block_time_secs, 0.25);
    }

    #[test]
    fn bad_env_values_error() {
        let mut cfg: FlareConfig = "".parse::<FlareConfig>().unwrap();
        assert!(
            cfg.overlay_vars([("WEBHOOK_TIMEOUT_MS".to_string(), "soon".to_string())])
                .is_err()
        );
        assert!(
            cfg.overlay_vars([("FLARE_RPC_X".to_string(), "https://x".to_string())])
                .is_err()
        );
    }
}
