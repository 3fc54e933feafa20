use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use flare_config::FlareConfig;
use flare_runtime::lifecycle::{Runtime, load_signals, wait_for_signal};
use flare_runtime::tracing_init::init_tracing;

#[derive(Parser)]
#[command(name = "flare", about = "Flare on-chain signal engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Flare engine
    Run {
        /// Path to flare.toml config file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Validate the config and every signal definition, then exit
    Check {
        /// Path to flare.toml config file
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn load_config(path: &PathBuf) -> Result<(FlareConfig, PathBuf)> {
    let config_path = path
        .canonicalize()
        .map_err(|e| anyhow::anyhow!("config path '{}': {e}", path.display()))?;
    let mut config = FlareConfig::load(&config_path)?;
    config.overlay_env()?;
    let base_dir = config_path
        .parent()
        .expect("config path must have a parent directory")
        .to_path_buf();
    Ok((config, base_dir))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let (config, base_dir) = load_config(&config)?;
            let _guard = init_tracing(&config.logging, &base_dir)?;

            let runtime = Runtime::start(config, &base_dir)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            tracing::info!(domain = "sys", "Flare engine started");

            wait_for_signal(runtime.cancel_token()).await;
            runtime.shutdown();
            runtime.wait().await.map_err(|e| anyhow::anyhow!("{e}"))?;
        }
        Commands::Check { config } => {
            let (config, base_dir) = load_config(&config)?;
            let signals = load_signals(&config.signals.definitions, &base_dir)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!(
                "ok: {} signal(s), {} chain(s) configured",
                signals.len(),
                config.chains.len()
            );
        }
    }

    Ok(())
}
