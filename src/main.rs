// main.rs — CLI entry point.
//
// One `#[tokio::main]` entry split into four subcommands (`run`, `replay`,
// `report`, `selftest`) over clap, with the usual env/log bootstrap
// (`dotenvy::dotenv().ok()`, `env_logger::init()`, resolved-config log line).

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::Mutex;

use perp_control_plane::config::EngineConfig;
use perp_control_plane::exchange::{ExchangeClient, LiveExchange};
use perp_control_plane::market_data::MarketDataBuffer;
use perp_control_plane::{engine, replay, report, ws};

#[derive(Parser)]
#[command(name = "perp-engine", about = "Perpetual-futures control plane")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the live trading engine until shutdown.
    Run,
    /// Replay a recorded JSONL market-data stream through the strategy layer
    /// without touching the venue. Coin selection cycles through
    /// `results.len() % coins.len()` and ignores blocked candidates; this is
    /// a known limitation of the harness, preserved as-is.
    Replay {
        /// Path to a JSONL file of recorded market events (candles/l2Book).
        file: PathBuf,
        /// Replay speed multiplier; cycle spacing is
        /// `max(1000, strategyIntervalMs / max(1, speed))`.
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
    },
    /// Print a summary of persisted engine state without starting the engine.
    Report,
    /// Validate config, storage paths, and venue connectivity, then exit.
    Selftest,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let cfg = EngineConfig::load();

    let exit_code = match cli.command {
        Commands::Run => run_live(cfg).await,
        Commands::Replay { file, speed } => replay::run(&cfg, &file, speed),
        Commands::Report => report::run(&cfg),
        Commands::Selftest => selftest(cfg).await,
    };

    std::process::exit(exit_code);
}

async fn run_live(cfg: EngineConfig) -> i32 {
    log::info!(
        "perp-engine starting: base_url={} symbol_whitelist={:?} strategy_interval_ms={}",
        cfg.base_url, cfg.symbol_whitelist, cfg.strategy_interval_ms
    );

    if cfg.account_address.is_empty() || cfg.private_key.is_empty() {
        log::error!("HL_ADDRESS and HL_PRIVATE_KEY must both be set to run live");
        return 1;
    }

    let live = LiveExchange::new(
        cfg.account_address.clone(),
        cfg.private_key.clone(),
        cfg.vault_address.clone(),
        cfg.base_url.clone(),
        cfg.ws_url.clone(),
    );
    let exchange: Box<dyn ExchangeClient> = Box::new(live);
    let md = Arc::new(Mutex::new(MarketDataBuffer::new(cfg.market_ring_capacity)));
    let stall_flag = ws::new_stall_flag();

    let engine = match engine::Engine::new(cfg, exchange, md, stall_flag).await {
        Ok(engine) => engine,
        Err(e) => {
            log::error!("engine init failed: {e}");
            return 1;
        }
    };

    log::info!("Trading engine started: selectedCoins={:?}", engine.universe);
    engine::run(engine).await;
    0
}

async fn selftest(cfg: EngineConfig) -> i32 {
    log::info!("selftest: validating config and storage paths");
    for path in [
        &cfg.budget_state_path,
        &cfg.idempotency_state_path,
        &cfg.bandit_state_path,
        &cfg.coin_selector_state_path,
        &cfg.feedback_state_path,
        &cfg.improvement_state_path,
        &cfg.runtime_state_path,
    ] {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                log::error!("selftest: cannot create state directory {}: {e}", parent.display());
                return 1;
            }
        }
    }
    if let Err(e) = std::fs::create_dir_all(&cfg.streams_dir) {
        log::error!("selftest: cannot create streams directory {}: {e}", cfg.streams_dir);
        return 1;
    }

    if cfg.account_address.is_empty() || cfg.private_key.is_empty() {
        log::warn!("selftest: HL_ADDRESS/HL_PRIVATE_KEY unset, skipping venue connectivity check");
        return 0;
    }

    let mut live = LiveExchange::new(
        cfg.account_address.clone(),
        cfg.private_key.clone(),
        cfg.vault_address.clone(),
        cfg.base_url.clone(),
        cfg.ws_url.clone(),
    );
    match live.load_universe().await {
        Ok(()) => {
            log::info!("selftest: venue reachable, universe loaded");
            0
        }
        Err(e) => {
            log::error!("selftest: venue unreachable: {e}");
            1
        }
    }
}
