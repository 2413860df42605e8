// =============================================================================
// EventLogger — append-only JSONL persistence for signals and trades
// =============================================================================
//
// Grounded on original_source/backend/services/signal_logger.py and
// trade_logger.py: JSONL append, bounded in-memory reload on startup,
// per-symbol last-event lookup, rollup stats, and an atomic tmp+rename
// `reset`. The atomic-write idiom itself is grounded on the teacher's
// runtime_config.rs::save.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{Decision, Regime, SignalType, Side, TradeAction};

const SIGNAL_LOAD_LIMIT: usize = 1000;
const SIGNAL_MEMORY_CAP: usize = 5000;
const SIGNAL_MEMORY_TRIM_TO: usize = 3000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEvent {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub timeframe: String,
    pub signal_type: SignalType,
    pub strength: f64,
    pub delta: f64,
    pub ifi: f64,
    pub vortex: f64,
    pub regime: Regime,
    pub decision: Decision,
    pub reason: String,
    #[serde(default)]
    pub linked_trade_id: Option<Uuid>,
    #[serde(default)]
    pub meta: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub timeframe: String,
    pub side: Side,
    pub action: TradeAction,
    pub qty: f64,
    pub entry_price: f64,
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub pnl: f64,
    #[serde(default)]
    pub fees: f64,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub signal_id: Option<Uuid>,
    #[serde(default)]
    pub meta: Value,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub total: usize,
    pub executed: usize,
    pub ignored: usize,
    pub blocked: usize,
    pub long_signals: usize,
    pub short_signals: usize,
    pub execution_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TradeStats {
    pub total_trades: usize,
    pub closed_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub total_fees: f64,
    pub net_pnl: f64,
    pub avg_pnl: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
}

/// Thread-safe signal logger with JSONL persistence. A process-wide
/// singleton by convention (one instance, constructed once in `main` and
/// shared via `Arc`), not module-level state.
pub struct SignalLogger {
    path: PathBuf,
    inner: Mutex<SignalLoggerState>,
}

struct SignalLoggerState {
    signals: Vec<SignalEvent>,
    last_by_symbol: HashMap<String, SignalEvent>,
}

impl SignalLogger {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir).context("creating data directory for signal logger")?;
        let path = data_dir.join("signals.jsonl");
        let logger = Self {
            path,
            inner: Mutex::new(SignalLoggerState {
                signals: Vec::new(),
                last_by_symbol: HashMap::new(),
            }),
        };
        logger.load_from_disk().await?;
        Ok(logger)
    }

    async fn load_from_disk(&self) -> Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        let contents = std::fs::read_to_string(&self.path).context("reading signals.jsonl")?;

        let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(SIGNAL_LOAD_LIMIT);

        let mut state = self.inner.lock().await;
        state.signals.clear();
        state.last_by_symbol.clear();
        for line in &lines[start..] {
            match serde_json::from_str::<SignalEvent>(line) {
                Ok(event) => {
                    state.last_by_symbol.insert(event.symbol.clone(), event.clone());
                    state.signals.push(event);
                }
                Err(e) => warn!(error = %e, "skipping invalid signal line on load"),
            }
        }
        info!(count = state.signals.len(), "loaded signals from disk");
        Ok(state.signals.len())
    }

    pub async fn log(&self, event: SignalEvent) -> Result<()> {
        use std::io::Write;

        let mut state = self.inner.lock().await;

        let line = serde_json::to_string(&event).context("serialising signal event")?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("opening signals.jsonl for append")?;
        writeln!(file, "{line}")?;

        state.last_by_symbol.insert(event.symbol.clone(), event.clone());
        state.signals.push(event);
        if state.signals.len() > SIGNAL_MEMORY_CAP {
            let drop = state.signals.len() - SIGNAL_MEMORY_TRIM_TO;
            state.signals.drain(0..drop);
        }
        Ok(())
    }

    pub async fn last_for_symbol(&self, symbol: &str) -> Option<SignalEvent> {
        self.inner.lock().await.last_by_symbol.get(symbol).cloned()
    }

    pub async fn recent(&self, symbol: Option<&str>, limit: usize) -> Vec<SignalEvent> {
        let state = self.inner.lock().await;
        let mut matched: Vec<SignalEvent> = state
            .signals
            .iter()
            .filter(|s| symbol.map(|sym| s.symbol == sym).unwrap_or(true))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.ts.cmp(&a.ts));
        matched.truncate(limit);
        matched
    }

    pub async fn stats(&self, symbol: Option<&str>) -> Stats {
        let state = self.inner.lock().await;
        let filtered: Vec<&SignalEvent> = state
            .signals
            .iter()
            .filter(|s| symbol.map(|sym| s.symbol == sym).unwrap_or(true))
            .collect();
        calc_signal_stats(&filtered)
    }

    /// Rewrite the file atomically (temp + rename) keeping only retained
    /// records, either all (symbol=None) cleared or a single symbol's
    /// records dropped.
    pub async fn reset(&self, symbol: Option<&str>) -> Result<()> {
        let mut state = self.inner.lock().await;
        match symbol {
            Some(sym) => {
                state.signals.retain(|s| s.symbol != sym);
                state.last_by_symbol.remove(sym);
            }
            None => {
                state.signals.clear();
                state.last_by_symbol.clear();
            }
        }

        let tmp_path = self.path.with_extension("jsonl.tmp");
        let mut buf = String::new();
        for event in &state.signals {
            buf.push_str(&serde_json::to_string(event)?);
            buf.push('\n');
        }
        std::fs::write(&tmp_path, buf.as_bytes()).context("writing temp signals file")?;
        std::fs::rename(&tmp_path, &self.path).context("renaming temp signals file into place")?;
        info!(symbol = ?symbol, "reset signals");
        Ok(())
    }
}

fn calc_signal_stats(signals: &[&SignalEvent]) -> Stats {
    if signals.is_empty() {
        return Stats::default();
    }
    let executed = signals.iter().filter(|s| s.decision == Decision::Executed).count();
    let ignored = signals.iter().filter(|s| s.decision == Decision::Ignored).count();
    let blocked = signals.iter().filter(|s| s.decision == Decision::Blocked).count();
    let long_signals = signals.iter().filter(|s| s.signal_type == SignalType::Long).count();
    let short_signals = signals.iter().filter(|s| s.signal_type == SignalType::Short).count();
    Stats {
        total: signals.len(),
        executed,
        ignored,
        blocked,
        long_signals,
        short_signals,
        execution_rate: executed as f64 / signals.len() as f64 * 100.0,
    }
}

/// Thread-safe trade logger with JSONL persistence.
pub struct TradeLogger {
    path: PathBuf,
    inner: Mutex<Vec<TradeEvent>>,
}

impl TradeLogger {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir).context("creating data directory for trade logger")?;
        let path = data_dir.join("trades.jsonl");
        let logger = Self {
            path,
            inner: Mutex::new(Vec::new()),
        };
        logger.load_from_disk().await?;
        Ok(logger)
    }

    async fn load_from_disk(&self) -> Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        let contents = std::fs::read_to_string(&self.path).context("reading trades.jsonl")?;
        let mut trades = self.inner.lock().await;
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<TradeEvent>(line) {
                Ok(event) => trades.push(event),
                Err(e) => warn!(error = %e, "skipping invalid trade line on load"),
            }
        }
        info!(count = trades.len(), "loaded trades from disk");
        Ok(trades.len())
    }

    pub async fn log(&self, event: TradeEvent) -> Result<()> {
        use std::io::Write;

        let mut trades = self.inner.lock().await;
        let line = serde_json::to_string(&event).context("serialising trade event")?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("opening trades.jsonl for append")?;
        writeln!(file, "{line}")?;
        trades.push(event);
        Ok(())
    }

    pub async fn recent(&self, symbol: Option<&str>, limit: usize) -> Vec<TradeEvent> {
        let trades = self.inner.lock().await;
        let mut matched: Vec<TradeEvent> = trades
            .iter()
            .filter(|t| symbol.map(|sym| t.symbol == sym).unwrap_or(true))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.ts.cmp(&a.ts));
        matched.truncate(limit);
        matched
    }

    pub async fn stats(&self, symbol: Option<&str>) -> TradeStats {
        let trades = self.inner.lock().await;
        let filtered: Vec<&TradeEvent> = trades
            .iter()
            .filter(|t| symbol.map(|sym| t.symbol == sym).unwrap_or(true))
            .collect();
        calc_trade_stats(&filtered)
    }

    pub async fn reset(&self, symbol: Option<&str>) -> Result<()> {
        let mut trades = self.inner.lock().await;
        match symbol {
            Some(sym) => trades.retain(|t| t.symbol != sym),
            None => trades.clear(),
        }

        let tmp_path = self.path.with_extension("jsonl.tmp");
        let mut buf = String::new();
        for event in trades.iter() {
            buf.push_str(&serde_json::to_string(event)?);
            buf.push('\n');
        }
        std::fs::write(&tmp_path, buf.as_bytes()).context("writing temp trades file")?;
        std::fs::rename(&tmp_path, &self.path).context("renaming temp trades file into place")?;
        info!(symbol = ?symbol, "reset trades");
        Ok(())
    }
}

fn calc_trade_stats(trades: &[&TradeEvent]) -> TradeStats {
    if trades.is_empty() {
        return TradeStats::default();
    }
    let closed: Vec<&&TradeEvent> = trades
        .iter()
        .filter(|t| matches!(t.action, TradeAction::Close | TradeAction::StopLoss | TradeAction::TakeProfit))
        .collect();

    let total_pnl: f64 = closed.iter().map(|t| t.pnl).sum();
    let total_fees: f64 = trades.iter().map(|t| t.fees).sum();
    let winning = closed.iter().filter(|t| t.pnl > 0.0).count();
    let losing = closed.iter().filter(|t| t.pnl < 0.0).count();
    let pnls: Vec<f64> = closed.iter().map(|t| t.pnl).collect();

    TradeStats {
        total_trades: trades.len(),
        closed_trades: closed.len(),
        winning_trades: winning,
        losing_trades: losing,
        win_rate: if closed.is_empty() { 0.0 } else { winning as f64 / closed.len() as f64 * 100.0 },
        total_pnl,
        total_fees,
        net_pnl: total_pnl - total_fees,
        avg_pnl: if closed.is_empty() { 0.0 } else { total_pnl / closed.len() as f64 },
        best_trade: pnls.iter().cloned().fold(f64::MIN, f64::max).max(if pnls.is_empty() { 0.0 } else { f64::MIN }),
        worst_trade: pnls.iter().cloned().fold(f64::MAX, f64::min).min(if pnls.is_empty() { 0.0 } else { f64::MAX }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal_event(symbol: &str, decision: Decision) -> SignalEvent {
        SignalEvent {
            id: Uuid::new_v4(),
            ts: Utc::now(),
            symbol: symbol.to_string(),
            timeframe: "5m".to_string(),
            signal_type: SignalType::Long,
            strength: 0.7,
            delta: 10.0,
            ifi: 12.0,
            vortex: 0.0,
            regime: Regime::Bullish,
            decision,
            reason: "test".to_string(),
            linked_trade_id: None,
            meta: Value::Null,
        }
    }

    #[tokio::test]
    async fn append_then_reload_roundtrips() {
        let dir = tempdir();
        {
            let logger = SignalLogger::new(&dir).await.unwrap();
            logger.log(signal_event("BTCUSDT", Decision::Executed)).await.unwrap();
            logger.log(signal_event("BTCUSDT", Decision::Ignored)).await.unwrap();
        }
        let reloaded = SignalLogger::new(&dir).await.unwrap();
        let recent = reloaded.recent(Some("BTCUSDT"), 10).await;
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn reset_clears_only_requested_symbol() {
        let dir = tempdir();
        let logger = SignalLogger::new(&dir).await.unwrap();
        logger.log(signal_event("BTCUSDT", Decision::Executed)).await.unwrap();
        logger.log(signal_event("ETHUSDT", Decision::Executed)).await.unwrap();
        logger.reset(Some("BTCUSDT")).await.unwrap();
        assert!(logger.recent(Some("BTCUSDT"), 10).await.is_empty());
        assert_eq!(logger.recent(Some("ETHUSDT"), 10).await.len(), 1);
    }

    #[tokio::test]
    async fn stats_compute_execution_rate() {
        let dir = tempdir();
        let logger = SignalLogger::new(&dir).await.unwrap();
        logger.log(signal_event("BTCUSDT", Decision::Executed)).await.unwrap();
        logger.log(signal_event("BTCUSDT", Decision::Ignored)).await.unwrap();
        let stats = logger.stats(Some("BTCUSDT")).await;
        assert_eq!(stats.total, 2);
        assert!((stats.execution_rate - 50.0).abs() < 1e-9);
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("vortex-core-test-{}", Uuid::new_v4()));
        dir
    }
}
