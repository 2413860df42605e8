// =============================================================================
// Orchestrator — keyed registry of StreamRunners
// =============================================================================
//
// Grounded on core spec §4.9, replacing the teacher's single shared
// `AppState` (one `CandleBuffer`/`PositionManager`/etc keyed internally by
// symbol) with an explicit `(symbol, timeframe) -> StreamRunner` registry,
// per the Design Notes' "Global-by-symbol state" redesign: each runner owns
// its own engines instead of every engine owning a keyed map of all
// symbols.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::binance::client::BinanceClient;
use crate::event_logger::{SignalLogger, TradeLogger};
use crate::execution::TradingConfig;
use crate::runner::{RunnerStatus, StreamRunner, UpdateFrame};

pub type RunnerKey = (String, String);

pub struct Orchestrator {
    client: Arc<BinanceClient>,
    signal_logger: Arc<SignalLogger>,
    trade_logger: Arc<TradeLogger>,
    runners: RwLock<HashMap<RunnerKey, Arc<StreamRunner>>>,
}

impl Orchestrator {
    pub fn new(client: Arc<BinanceClient>, signal_logger: Arc<SignalLogger>, trade_logger: Arc<TradeLogger>) -> Self {
        Self {
            client,
            signal_logger,
            trade_logger,
            runners: RwLock::new(HashMap::new()),
        }
    }

    /// Return the runner for `(symbol, timeframe)`, creating it (without
    /// starting it) if it doesn't exist yet.
    pub fn get_or_create(&self, symbol: &str, timeframe: &str, trading_config: TradingConfig) -> Arc<StreamRunner> {
        let key = (symbol.to_string(), timeframe.to_string());
        if let Some(runner) = self.runners.read().get(&key) {
            return runner.clone();
        }

        let runner = StreamRunner::new(
            symbol,
            timeframe,
            trading_config,
            self.client.clone(),
            self.signal_logger.clone(),
            self.trade_logger.clone(),
        );
        self.runners.write().insert(key, runner.clone());
        runner
    }

    pub fn get(&self, symbol: &str, timeframe: &str) -> Option<Arc<StreamRunner>> {
        self.runners.read().get(&(symbol.to_string(), timeframe.to_string())).cloned()
    }

    pub async fn start(&self, symbol: &str, timeframe: &str, trading_config: TradingConfig) -> Result<()> {
        let runner = self.get_or_create(symbol, timeframe, trading_config);
        runner.start().await.with_context(|| format!("starting runner {symbol}/{timeframe}"))
    }

    pub async fn stop(&self, symbol: &str, timeframe: &str) {
        if let Some(runner) = self.get(symbol, timeframe) {
            runner.stop().await;
        }
    }

    /// Start every entry in the auto-start matrix, logging (not aborting)
    /// individual failures.
    pub async fn start_all(&self, matrix: &[(String, String)], defaults: impl Fn(&str, &str) -> TradingConfig) {
        for (symbol, timeframe) in matrix {
            let cfg = defaults(symbol, timeframe);
            if let Err(e) = self.start(symbol, timeframe, cfg).await {
                warn!(symbol, timeframe, error = %e, "failed to start runner, continuing with others");
            } else {
                info!(symbol, timeframe, "runner auto-started");
            }
        }
    }

    /// Stop all runners in parallel and clear the registry.
    pub async fn stop_all(&self) {
        let runners: Vec<Arc<StreamRunner>> = self.runners.read().values().cloned().collect();
        let stops = runners.iter().map(|r| r.stop());
        futures_util::future::join_all(stops).await;
        self.runners.write().clear();
        info!("all runners stopped");
    }

    pub fn status_all(&self) -> Vec<RunnerStatus> {
        self.runners.read().values().map(|r| r.status()).collect()
    }

    /// Register a subscriber against every runner currently in the
    /// registry. Runners created after this call are not retroactively
    /// wired up — callers that need "every future runner too" should
    /// re-subscribe after `start_all`.
    pub fn subscribe_all(&self) -> Vec<mpsc::UnboundedReceiver<UpdateFrame>> {
        self.runners.read().values().map(|r| r.subscribe()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempdir() -> std::path::PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("vortex-core-orchestrator-test-{}", uuid::Uuid::new_v4()));
        dir
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let client = Arc::new(BinanceClient::new("key", "secret"));
        let dir = tempdir();
        let signal_logger = Arc::new(SignalLogger::new(&dir).await.unwrap());
        let trade_logger = Arc::new(TradeLogger::new(&dir).await.unwrap());
        let orch = Orchestrator::new(client, signal_logger, trade_logger);

        let cfg = TradingConfig::new("BTCUSDT", "5m");
        let a = orch.get_or_create("BTCUSDT", "5m", cfg.clone());
        let b = orch.get_or_create("BTCUSDT", "5m", cfg);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn status_all_reflects_created_runners() {
        let client = Arc::new(BinanceClient::new("key", "secret"));
        let dir = tempdir();
        let signal_logger = Arc::new(SignalLogger::new(&dir).await.unwrap());
        let trade_logger = Arc::new(TradeLogger::new(&dir).await.unwrap());
        let orch = Orchestrator::new(client, signal_logger, trade_logger);

        orch.get_or_create("ETHUSDT", "1m", TradingConfig::new("ETHUSDT", "1m"));
        let statuses = orch.status_all();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].symbol, "ETHUSDT");
    }
}
