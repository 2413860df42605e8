// =============================================================================
// Vortex Core — Main Entry Point
// =============================================================================
//
// The engine starts in Demo + Paused mode for safety. Live trading requires
// an explicit `runtime_config.json` edit and a restart.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod bar_window;
mod binance;
mod event_logger;
mod execution;
mod market_data;
mod orchestrator;
mod position;
mod predictive;
mod runner;
mod runtime_config;
mod signals;
mod topology;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::binance::client::BinanceClient;
use crate::event_logger::{SignalLogger, TradeLogger};
use crate::orchestrator::Orchestrator;
use crate::runtime_config::RuntimeConfig;
use crate::types::{AccountMode, TradingMode};

const CONFIG_PATH: &str = "runtime_config.json";
const DATA_DIR: &str = "data";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║                 Vortex Core — Starting Up                 ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });

    // SAFETY: force Demo + Paused on every boot regardless of persisted state.
    config.trading_mode = TradingMode::Paused;
    config.account_mode = AccountMode::Demo;

    info!(
        auto_start = ?config.auto_start,
        trading_mode = %config.trading_mode,
        account_mode = %config.account_mode,
        "engine starting in SAFE mode (Demo + Paused)"
    );

    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    let client = Arc::new(BinanceClient::new(api_key, api_secret));

    let data_dir = std::path::PathBuf::from(DATA_DIR);
    std::fs::create_dir_all(&data_dir)?;
    let signal_logger = Arc::new(SignalLogger::new(&data_dir).await?);
    let trade_logger = Arc::new(TradeLogger::new(&data_dir).await?);

    let orchestrator = Arc::new(Orchestrator::new(client, signal_logger, trade_logger));

    let matrix = config.auto_start.clone();
    let defaults_config = config.clone();
    orchestrator
        .start_all(&matrix, |symbol, timeframe| {
            defaults_config.trading_config_for(symbol, timeframe)
        })
        .await;

    info!(count = matrix.len(), "auto-start matrix launched");
    info!("all subsystems running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    orchestrator.stop_all().await;

    if let Err(e) = config.save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("vortex core shut down complete");
    Ok(())
}
