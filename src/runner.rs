// =============================================================================
// StreamRunner — owns one (symbol, timeframe)'s feed, engines and execution
// =============================================================================
//
// Grounded on core spec §4.8 and, structurally, on the teacher's per-symbol
// task-spawning in main.rs (one task per kline stream, one handler per
// closed bar) generalized into an owned object instead of loose module-level
// state, per the Design Notes' "Global-by-symbol state" redesign flag.
//
// The feed's bar callback is synchronous, so it only forwards the bar
// through an unbounded channel; a single dedicated task drains that channel
// and runs the (necessarily async) analytics + execution pipeline, which
// keeps bar-handler invocations strictly serialised per runner.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bar_window::{Bar, BarWindow};
use crate::binance::client::BinanceClient;
use crate::event_logger::{SignalEvent, SignalLogger, TradeLogger};
use crate::execution::{ExecutionManager, TradingConfig};
use crate::market_data::MarketDataFeed;
use crate::predictive::{PredictiveConfig, PredictiveEngine, PredictiveSnapshot};
use crate::signals::{Signal, SignalEngine, SignalState};
use crate::topology::{TopologyEngine, TopologySnapshot};
use crate::types::Decision;

const MIN_BARS_FOR_ANALYTICS: usize = 5;
const WINDOW_CAPACITY: usize = 200;
const BAR_LOG_EVERY: u64 = 10;
const NEUTRAL_LOG_EVERY: u64 = 10;
const HEALTH_INTERVAL_SECS: u64 = 30;
const STALE_DATA_SECS: i64 = 120;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunnerStats {
    pub bars_processed: u64,
    pub signals_generated: u64,
    pub trades_executed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateFrame {
    pub bar: Bar,
    pub topology: TopologySnapshot,
    pub predictive: PredictiveSnapshot,
    pub signal: Signal,
    pub stats: RunnerStats,
    pub balance: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunnerStatus {
    pub symbol: String,
    pub timeframe: String,
    pub feed_state: String,
    pub stats: RunnerStats,
    pub last_bar: Option<Bar>,
}

pub struct StreamRunner {
    symbol: String,
    timeframe: String,
    feed: Arc<MarketDataFeed>,
    execution: Arc<ExecutionManager>,
    client: Arc<BinanceClient>,
    signal_logger: Arc<SignalLogger>,
    window: RwLock<BarWindow>,
    signal_state: RwLock<SignalState>,
    predictive: PredictiveEngine,
    bars_processed: AtomicU64,
    signals_generated: AtomicU64,
    trades_executed: AtomicU64,
    last_bar: RwLock<Option<Bar>>,
    subscribers: RwLock<Vec<mpsc::UnboundedSender<UpdateFrame>>>,
    running: AtomicBool,
    tasks: RwLock<Vec<JoinHandle<()>>>,
}

impl StreamRunner {
    pub fn new(
        symbol: impl Into<String>,
        timeframe: impl Into<String>,
        trading_config: TradingConfig,
        client: Arc<BinanceClient>,
        signal_logger: Arc<SignalLogger>,
        trade_logger: Arc<TradeLogger>,
    ) -> Arc<Self> {
        let symbol = symbol.into();
        let timeframe = timeframe.into();
        let feed = Arc::new(MarketDataFeed::new(symbol.clone(), timeframe.clone()));
        let execution = Arc::new(ExecutionManager::new(trading_config, client.clone(), trade_logger));

        Arc::new(Self {
            symbol,
            timeframe,
            feed,
            execution,
            client,
            signal_logger,
            window: RwLock::new(BarWindow::new(WINDOW_CAPACITY)),
            signal_state: RwLock::new(SignalState::new(20)),
            predictive: PredictiveEngine::new(PredictiveConfig::default()),
            bars_processed: AtomicU64::new(0),
            signals_generated: AtomicU64::new(0),
            trades_executed: AtomicU64::new(0),
            last_bar: RwLock::new(None),
            subscribers: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
            tasks: RwLock::new(Vec::new()),
        })
    }

    pub fn key(&self) -> (String, String) {
        (self.symbol.clone(), self.timeframe.clone())
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<UpdateFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(tx);
        rx
    }

    pub fn status(&self) -> RunnerStatus {
        RunnerStatus {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe.clone(),
            feed_state: self.feed.state().to_string(),
            stats: self.stats(),
            last_bar: self.last_bar.read().clone(),
        }
    }

    fn stats(&self) -> RunnerStats {
        RunnerStats {
            bars_processed: self.bars_processed.load(Ordering::Relaxed),
            signals_generated: self.signals_generated.load(Ordering::Relaxed),
            trades_executed: self.trades_executed.load(Ordering::Relaxed),
        }
    }

    /// Build and start ExecutionManager, register the bar handler, and
    /// spawn the feed, bar-processing and health-monitor tasks.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        self.execution.start().await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Bar>();
        self.feed.on_bar(move |bar| {
            let _ = tx.send(bar.clone());
        });

        let processor = self.clone();
        let process_task = tokio::spawn(async move {
            while let Some(bar) = rx.recv().await {
                processor.handle_bar(bar).await;
            }
        });

        let feed_runner = self.feed.clone();
        let feed_task = tokio::spawn(async move {
            feed_runner.run().await;
        });

        let health_runner = self.clone();
        let health_task = tokio::spawn(async move {
            health_runner.health_loop().await;
        });

        self.tasks.write().extend([process_task, feed_task, health_task]);
        info!(symbol = %self.symbol, timeframe = %self.timeframe, "runner started");
        Ok(())
    }

    /// Stop the feed, health loop and ExecutionManager without closing
    /// broker positions — they are intentionally left open and reconciled
    /// on next start.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.feed.stop();
        for task in self.tasks.write().drain(..) {
            task.abort();
        }
        let stats = self.stats();
        info!(
            symbol = %self.symbol,
            timeframe = %self.timeframe,
            bars_processed = stats.bars_processed,
            signals_generated = stats.signals_generated,
            trades_executed = stats.trades_executed,
            "runner stopped"
        );
    }

    async fn handle_bar(&self, bar: Bar) {
        let processed = self.bars_processed.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_bar.write() = Some(bar.clone());

        let closed_bars = {
            let mut window = self.window.write();
            window.push(bar.clone());
            if window.len() < MIN_BARS_FOR_ANALYTICS {
                None
            } else {
                Some(window.closed_slice(WINDOW_CAPACITY))
            }
        };
        let Some(closed_bars) = closed_bars else {
            return;
        };

        let topology = TopologyEngine::compute(&self.symbol, &closed_bars);
        let predictive = self.predictive.compute(&self.symbol, &closed_bars, processed);
        let signal = {
            let mut state = self.signal_state.write();
            SignalEngine::evaluate(&self.symbol, &predictive, &closed_bars, &mut state)
        };

        let bar_delta = bar.delta().unwrap_or(0.0);

        if signal.signal_type == crate::types::SignalType::Neutral {
            if processed % NEUTRAL_LOG_EVERY == 0 {
                self.persist_signal(&signal, Decision::Ignored, None, "neutral", bar_delta).await;
            }
        } else {
            self.signals_generated.fetch_add(1, Ordering::SeqCst);
            let signal_id = Uuid::new_v4();
            let decision = self.execution.process_signal(&signal, signal_id).await;
            if decision == Decision::Executed {
                self.trades_executed.fetch_add(1, Ordering::SeqCst);
            }
            let linked = if decision == Decision::Executed { Some(signal_id) } else { None };
            let reason = signal.description.clone();
            self.persist_signal(&signal, decision, linked, &reason, bar_delta).await;
        }

        if processed % BAR_LOG_EVERY == 0 {
            info!(
                symbol = %self.symbol,
                timeframe = %self.timeframe,
                bars_processed = processed,
                close = bar.close,
                coherence = topology.coherence,
                ifi = predictive.ifi,
                "status"
            );
        }

        if let Err(e) = self.execution.check_position_status().await {
            warn!(symbol = %self.symbol, error = %e, "check_position_status failed");
        }

        let balance = self.client.get_balance().await.unwrap_or(0.0);
        self.broadcast(UpdateFrame {
            bar,
            topology,
            predictive,
            signal,
            stats: self.stats(),
            balance,
        });
    }

    async fn persist_signal(
        &self,
        signal: &Signal,
        decision: Decision,
        linked_trade_id: Option<Uuid>,
        reason: &str,
        delta: f64,
    ) {
        let event = SignalEvent {
            id: Uuid::new_v4(),
            ts: Utc::now(),
            symbol: self.symbol.clone(),
            timeframe: self.timeframe.clone(),
            signal_type: signal.signal_type,
            strength: signal.confidence,
            delta,
            ifi: signal.ifi,
            vortex: signal.breakout_probability,
            regime: signal.delta_trend,
            decision,
            reason: reason.to_string(),
            linked_trade_id,
            meta: Value::Null,
        };
        if let Err(e) = self.signal_logger.log(event).await {
            warn!(symbol = %self.symbol, error = %e, "failed to log signal event");
        }
    }

    fn broadcast(&self, frame: UpdateFrame) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(frame.clone()).is_ok());
    }

    async fn health_loop(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(HEALTH_INTERVAL_SECS));
        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            self.check_health().await;
        }
    }

    async fn check_health(&self) {
        let data_ok = self.feed.connected()
            && self
                .feed
                .last_message_time()
                .map(|t| (Utc::now() - t).num_seconds() <= STALE_DATA_SECS)
                .unwrap_or(false);
        if !data_ok {
            warn!(symbol = %self.symbol, timeframe = %self.timeframe, state = %self.feed.state(), "feed data health check failed, relying on idle-timeout reconnect");
        }

        if let Err(e) = self.client.get_price(&self.symbol).await {
            warn!(symbol = %self.symbol, error = %e, "broker health check failed");
        } else {
            debug!(symbol = %self.symbol, "broker health check ok");
        }
    }
}
