mod server;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use aula_sfu::engine::loopback::LoopbackEngine;
use aula_sfu::{logging, Config, SfuManager};

/// Selective-forwarding media-session server
#[derive(Debug, Parser)]
#[command(name = "aula", version, about)]
struct Args {
    /// Path to a configuration file (TOML/YAML/JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = Config::load(args.config.as_deref())
        .map_err(|e| anyhow::anyhow!("failed to load configuration: {e}"))?;

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging).map_err(|e| anyhow::anyhow!(e))?;
    info!("Aula server starting...");
    info!("HTTP address: {}", config.http_address());

    // 4. Initialize the orchestrator. The loopback engine negotiates and
    // tracks media state in-process; swap in a real engine behind
    // `MediaEngine` to relay actual packets.
    let engine = Arc::new(LoopbackEngine::new());
    let manager = SfuManager::new(engine, config.clone());

    // 5. Serve until shutdown
    server::serve(config, manager).await
}
