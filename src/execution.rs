// =============================================================================
// ExecutionManager — turns Signals into broker orders and tracks one
// OpenTrade per (symbol, timeframe)
// =============================================================================
//
// Grounded on original_source/backend/trading/paper_trading.py
// (PaperTradingManager: start/_sync_existing_position/process_signal/
// _check_reversal_allowed/check_position_status/_close_position_with_reason)
// and on core spec §4.4, kept in the teacher's execution.rs idiom: an
// Arc-wrapped dependency struct, a typed outcome, tracing at every branch,
// and a hand-written Debug that never prints secrets.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::binance::client::BinanceClient;
use crate::event_logger::{TradeEvent, TradeLogger};
use crate::position::OpenTrade;
use crate::signals::Signal;
use crate::types::{Decision, Direction, SignalType, TradeAction};

fn default_true() -> bool {
    true
}

/// Per-(symbol, timeframe) trading parameters, named identically to the
/// Python `TradingConfig` dataclass this is ported from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    pub symbol: String,
    pub timeframe: String,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default = "default_max_position_value")]
    pub max_position_value: f64,
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade: f64,
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_min_reversal_confidence")]
    pub min_reversal_confidence: f64,
    #[serde(default = "default_reversal_cooldown_minutes")]
    pub reversal_cooldown_minutes: f64,
    #[serde(default = "default_true")]
    pub protect_profitable_positions: bool,
    #[serde(default = "default_true")]
    pub never_reverse_in_profit: bool,
    #[serde(default = "default_min_loss_before_reversal")]
    pub min_loss_before_reversal: f64,
    #[serde(default = "default_true")]
    pub trading_enabled: bool,
}

fn default_leverage() -> u32 {
    5
}
fn default_max_position_value() -> f64 {
    1000.0
}
fn default_risk_per_trade() -> f64 {
    0.01
}
fn default_stop_loss_pct() -> f64 {
    1.0
}
fn default_take_profit_pct() -> f64 {
    1.0
}
fn default_min_confidence() -> f64 {
    0.62
}
fn default_min_reversal_confidence() -> f64 {
    0.70
}
fn default_reversal_cooldown_minutes() -> f64 {
    25.0
}
fn default_min_loss_before_reversal() -> f64 {
    0.3
}

impl TradingConfig {
    pub fn new(symbol: impl Into<String>, timeframe: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe: timeframe.into(),
            leverage: default_leverage(),
            max_position_value: default_max_position_value(),
            risk_per_trade: default_risk_per_trade(),
            stop_loss_pct: default_stop_loss_pct(),
            take_profit_pct: default_take_profit_pct(),
            min_confidence: default_min_confidence(),
            min_reversal_confidence: default_min_reversal_confidence(),
            reversal_cooldown_minutes: default_reversal_cooldown_minutes(),
            protect_profitable_positions: true,
            never_reverse_in_profit: true,
            min_loss_before_reversal: default_min_loss_before_reversal(),
            trading_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionStats {
    pub total_trades: u64,
    pub wins: u64,
    pub total_pnl: f64,
}

pub struct ExecutionManager {
    config: RwLock<TradingConfig>,
    client: Arc<BinanceClient>,
    trade_logger: Arc<TradeLogger>,
    position: RwLock<Option<OpenTrade>>,
    stats: RwLock<ExecutionStats>,
}

impl ExecutionManager {
    pub fn new(config: TradingConfig, client: Arc<BinanceClient>, trade_logger: Arc<TradeLogger>) -> Self {
        Self {
            config: RwLock::new(config),
            client,
            trade_logger,
            position: RwLock::new(None),
            stats: RwLock::new(ExecutionStats::default()),
        }
    }

    pub fn config(&self) -> TradingConfig {
        self.config.read().clone()
    }

    pub fn current_position(&self) -> Option<OpenTrade> {
        self.position.read().clone()
    }

    pub fn stats(&self) -> ExecutionStats {
        self.stats.read().clone()
    }

    /// Connect-time setup: set leverage, then adopt any position already
    /// open on the exchange (survives process restarts).
    pub async fn start(&self) -> Result<()> {
        let symbol = self.config.read().symbol.clone();
        let leverage = self.config.read().leverage;
        if let Err(e) = self.client.set_leverage(&symbol, leverage).await {
            warn!(symbol, error = %e, "failed to set leverage at startup");
        }
        self.sync_existing_position().await
    }

    async fn sync_existing_position(&self) -> Result<()> {
        let symbol = self.config.read().symbol.clone();
        let broker_position = self.client.get_position(&symbol).await?;
        let Some(broker_position) = broker_position else {
            info!(symbol, "no existing position to adopt at startup");
            return Ok(());
        };

        let cfg = self.config.read().clone();
        let (sl, tp) = derive_sl_tp(broker_position.side, broker_position.entry_price, &cfg);

        // Prefer the real exchange SL/TP orders over the config-derived
        // estimate, if any are still resting on the books.
        let orders = match self.client.get_open_orders(&symbol).await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(symbol, error = %e, "failed to query open orders while syncing position");
                Vec::new()
            }
        };
        let (stop_loss, take_profit) = override_sl_tp_from_orders(sl, tp, &orders);
        if stop_loss != sl {
            debug!(symbol, stop_loss, "adopted real SL order on sync");
        }
        if take_profit != tp {
            debug!(symbol, take_profit, "adopted real TP order on sync");
        }

        let trade = OpenTrade::new(
            match broker_position.side {
                Direction::Long => SignalType::Long,
                Direction::Short => SignalType::Short,
            },
            cfg.min_confidence,
            broker_position.side,
            broker_position.entry_price,
            broker_position.quantity,
            stop_loss,
            take_profit,
            "adopted".to_string(),
        );
        info!(symbol, direction = %broker_position.side, entry = broker_position.entry_price, "adopted existing broker position");
        *self.position.write() = Some(trade);
        Ok(())
    }

    /// Process one signal. Returns the decision recorded against the
    /// originating SignalEvent.
    pub async fn process_signal(&self, signal: &Signal, signal_id: Uuid) -> Decision {
        let cfg = self.config.read().clone();

        if !cfg.trading_enabled || signal.signal_type == SignalType::Neutral || signal.confidence < cfg.min_confidence {
            return Decision::Ignored;
        }

        let Some(direction) = signal.signal_type.direction() else {
            return Decision::Ignored;
        };

        let broker_position = match self.client.get_position(&cfg.symbol).await {
            Ok(p) => p,
            Err(e) => {
                warn!(symbol = %cfg.symbol, error = %e, "failed to query broker position");
                return Decision::Ignored;
            }
        };

        if broker_position.is_none() {
            if self.position.read().is_some() {
                *self.position.write() = None;
            }
            match self.client.get_open_orders(&cfg.symbol).await {
                Ok(orders) if !orders.is_empty() => {
                    if let Err(e) = self.client.cancel_all_orders(&cfg.symbol).await {
                        warn!(symbol = %cfg.symbol, error = %e, "failed to cancel orphan orders");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(symbol = %cfg.symbol, error = %e, "failed to query open orders"),
            }
        }

        if let Some(broker_position) = &broker_position {
            if broker_position.side == direction {
                debug!(symbol = %cfg.symbol, "signal matches open position direction, skipping");
                return Decision::Blocked;
            }

            let price = match self.client.get_price(&cfg.symbol).await {
                Ok(p) => p,
                Err(_) => broker_position.entry_price,
            };
            let local = self.position.read().clone();
            let (allowed, reason) = match &local {
                Some(trade) => self.check_reversal_allowed(trade, signal.confidence, price, &cfg),
                None => (true, None),
            };
            if !allowed {
                debug!(symbol = %cfg.symbol, reason = ?reason, "reversal blocked");
                return Decision::Blocked;
            }
            if let Err(e) = self.close_position("signal_reversal").await {
                warn!(symbol = %cfg.symbol, error = %e, "failed to close position ahead of reversal");
                return Decision::Blocked;
            }
        }

        let price = match self.client.get_price(&cfg.symbol).await {
            Ok(p) => p,
            Err(e) => {
                warn!(symbol = %cfg.symbol, error = %e, "failed to fetch price for sizing");
                return Decision::Ignored;
            }
        };
        let balance = match self.client.get_balance().await {
            Ok(b) => b,
            Err(e) => {
                warn!(symbol = %cfg.symbol, error = %e, "failed to fetch balance for sizing");
                return Decision::Ignored;
            }
        };

        let risk_based_qty = (balance * cfg.risk_per_trade) / (price * cfg.stop_loss_pct / 100.0);
        let max_qty = cfg.max_position_value / price;
        let raw_qty = risk_based_qty.min(max_qty);
        let qty = match self.client.round_quantity(&cfg.symbol, raw_qty).await {
            Ok(q) => q,
            Err(e) => {
                warn!(symbol = %cfg.symbol, error = %e, "failed to round quantity");
                return Decision::Ignored;
            }
        };

        let symbol_info = match self.client.get_symbol_info(&cfg.symbol).await {
            Ok(info) => info,
            Err(e) => {
                warn!(symbol = %cfg.symbol, error = %e, "failed to fetch symbol info");
                return Decision::Ignored;
            }
        };
        if qty < symbol_info.min_qty {
            debug!(symbol = %cfg.symbol, qty, min_qty = symbol_info.min_qty, "quantity below exchange minimum, skipping");
            return Decision::Ignored;
        }

        let (stop_loss, take_profit) = derive_sl_tp(direction, price, &cfg);

        let result = match direction {
            Direction::Long => self.client.open_long(&cfg.symbol, qty, Some(stop_loss), Some(take_profit)).await,
            Direction::Short => self.client.open_short(&cfg.symbol, qty, Some(stop_loss), Some(take_profit)).await,
        };

        if !result.success {
            warn!(symbol = %cfg.symbol, message = ?result.message, "order placement failed");
            return Decision::Ignored;
        }

        let trade = OpenTrade::new(
            signal.signal_type,
            signal.confidence,
            direction,
            result.price,
            qty,
            stop_loss,
            take_profit,
            result.order_id.clone(),
        );
        *self.position.write() = Some(trade);

        let event = TradeEvent {
            id: Uuid::new_v4(),
            ts: Utc::now(),
            symbol: cfg.symbol.clone(),
            timeframe: cfg.timeframe.clone(),
            side: direction.opening_side(),
            action: TradeAction::Open,
            qty,
            entry_price: result.price,
            exit_price: None,
            pnl: 0.0,
            fees: 0.0,
            reason: "signal".to_string(),
            signal_id: Some(signal_id),
            meta: serde_json::Value::Null,
        };
        if let Err(e) = self.trade_logger.log(event).await {
            warn!(symbol = %cfg.symbol, error = %e, "failed to log OPEN trade event");
        }

        info!(symbol = %cfg.symbol, direction = %direction, entry = result.price, qty, "opened position");
        Decision::Executed
    }

    /// `check_reversal_allowed`, evaluated in order; first failing rule
    /// blocks. Rule order confirmed against paper_trading.py.
    fn check_reversal_allowed(
        &self,
        position: &OpenTrade,
        new_confidence: f64,
        current_price: f64,
        cfg: &TradingConfig,
    ) -> (bool, Option<String>) {
        if new_confidence < cfg.min_reversal_confidence {
            return (false, Some("confidence below reversal threshold".to_string()));
        }
        if position.minutes_since_open() < cfg.reversal_cooldown_minutes {
            return (false, Some("reversal cooldown active".to_string()));
        }

        let pnl_pct = position.pnl_pct(current_price);

        if pnl_pct > 0.0 && cfg.never_reverse_in_profit {
            return (false, Some("position is in profit".to_string()));
        }
        if pnl_pct > 0.5 && cfg.protect_profitable_positions {
            return (false, Some("protecting profitable position".to_string()));
        }
        if pnl_pct < 0.0 && pnl_pct > -cfg.min_loss_before_reversal {
            return (false, Some("loss below minimum reversal floor".to_string()));
        }
        (true, None)
    }

    /// Called each bar: detect SL/TP/manual exits and orphaned orders.
    pub async fn check_position_status(&self) -> Result<()> {
        let cfg = self.config.read().clone();

        if self.position.read().is_none() {
            if let Ok(orders) = self.client.get_open_orders(&cfg.symbol).await {
                if !orders.is_empty() {
                    let _ = self.client.cancel_all_orders(&cfg.symbol).await;
                }
            }
            return Ok(());
        }

        let broker_position = self.client.get_position(&cfg.symbol).await?;
        if broker_position.is_none() {
            let trade = self.position.write().take();
            if let Some(trade) = trade {
                let price = self.client.get_price(&cfg.symbol).await.unwrap_or(trade.entry_price);
                self.record_close(&cfg, &trade, price, "stop_loss_or_take_profit").await;
            }
            let _ = self.client.cancel_all_orders(&cfg.symbol).await;
            return Ok(());
        }

        let price = self.client.get_price(&cfg.symbol).await?;
        let pnl_pct = {
            let guard = self.position.read();
            guard.as_ref().map(|t| t.pnl_pct(price))
        };
        let Some(pnl_pct) = pnl_pct else { return Ok(()) };

        if pnl_pct >= cfg.take_profit_pct {
            self.close_position("take_profit_manual").await?;
        } else if pnl_pct <= -cfg.stop_loss_pct {
            self.close_position("stop_loss_manual").await?;
        }
        Ok(())
    }

    /// Close the currently-open position via a reverse MARKET order,
    /// recording realised pnl and cancelling any remaining protective
    /// orders for the symbol.
    pub async fn close_position(&self, reason: &str) -> Result<()> {
        let cfg = self.config.read().clone();
        let trade = self.position.write().take();
        let Some(trade) = trade else {
            return Ok(());
        };

        let result = self.client.close_position(&cfg.symbol).await;
        let exit_price = if result.success {
            result.price
        } else {
            self.client.get_price(&cfg.symbol).await.unwrap_or(trade.entry_price)
        };

        self.record_close(&cfg, &trade, exit_price, reason).await;
        let _ = self.client.cancel_all_orders(&cfg.symbol).await;
        Ok(())
    }

    async fn record_close(&self, cfg: &TradingConfig, trade: &OpenTrade, exit_price: f64, reason: &str) {
        let mut closed = trade.clone();
        closed.mark_closed();

        let pnl = match trade.direction {
            Direction::Long => (exit_price - trade.entry_price) * trade.quantity,
            Direction::Short => (trade.entry_price - exit_price) * trade.quantity,
        };

        {
            let mut stats = self.stats.write();
            stats.total_trades += 1;
            if pnl > 0.0 {
                stats.wins += 1;
            }
            stats.total_pnl += pnl;
        }

        let action = if reason.contains("take_profit") {
            TradeAction::TakeProfit
        } else if reason.contains("stop_loss") {
            TradeAction::StopLoss
        } else {
            TradeAction::Close
        };

        let event = TradeEvent {
            id: Uuid::new_v4(),
            ts: Utc::now(),
            symbol: cfg.symbol.clone(),
            timeframe: cfg.timeframe.clone(),
            side: trade.direction.closing_side(),
            action,
            qty: trade.quantity,
            entry_price: trade.entry_price,
            exit_price: Some(exit_price),
            pnl,
            fees: 0.0,
            reason: reason.to_string(),
            signal_id: None,
            meta: serde_json::Value::Null,
        };
        if let Err(e) = self.trade_logger.log(event).await {
            warn!(symbol = %cfg.symbol, error = %e, "failed to log CLOSE trade event");
        }
        info!(symbol = %cfg.symbol, reason, pnl, "closed position");
    }
}

/// Override config-derived `(stop_loss, take_profit)` with the real
/// `stopPrice` of any resting STOP_MARKET/TAKE_PROFIT_MARKET order, per
/// `paper_trading.py::_sync_existing_position`'s "override calculated
/// values if found" pass over `get_open_orders`.
fn override_sl_tp_from_orders(mut stop_loss: f64, mut take_profit: f64, orders: &[serde_json::Value]) -> (f64, f64) {
    for order in orders {
        let order_type = order["type"].as_str().unwrap_or_default();
        let stop_price: f64 = order["stopPrice"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .or_else(|| order["stopPrice"].as_f64())
            .unwrap_or(0.0);
        if stop_price <= 0.0 {
            continue;
        }
        if order_type.contains("STOP") {
            stop_loss = stop_price;
        } else if order_type.contains("PROFIT") {
            take_profit = stop_price;
        }
    }
    (stop_loss, take_profit)
}

fn derive_sl_tp(direction: Direction, entry_price: f64, cfg: &TradingConfig) -> (f64, f64) {
    match direction {
        Direction::Long => (
            entry_price * (1.0 - cfg.stop_loss_pct / 100.0),
            entry_price * (1.0 + cfg.take_profit_pct / 100.0),
        ),
        Direction::Short => (
            entry_price * (1.0 + cfg.stop_loss_pct / 100.0),
            entry_price * (1.0 - cfg.take_profit_pct / 100.0),
        ),
    }
}

impl std::fmt::Debug for ExecutionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionManager")
            .field("symbol", &self.config.read().symbol)
            .field("client", &"<BinanceClient>")
            .field("position", &self.position.read().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn cfg() -> TradingConfig {
        TradingConfig::new("BTCUSDT", "5m")
    }

    fn trade(direction: Direction, entry: f64, minutes_ago: i64) -> OpenTrade {
        let mut t = OpenTrade::new(SignalType::Long, 0.8, direction, entry, 1.0, 0.0, 0.0, "1".to_string());
        t.timestamp = Utc::now() - chrono::Duration::minutes(minutes_ago);
        t
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("vortex-core-execution-test-{}", Uuid::new_v4()));
        dir
    }

    async fn manager() -> ExecutionManager {
        let client = Arc::new(BinanceClient::new("key", "secret"));
        let trade_logger = Arc::new(TradeLogger::new(&tempdir()).await.unwrap());
        ExecutionManager::new(cfg(), client, trade_logger)
    }

    #[test]
    fn derive_sl_tp_is_mirrored_for_direction() {
        let cfg = cfg();
        let (sl_long, tp_long) = derive_sl_tp(Direction::Long, 100.0, &cfg);
        assert!(sl_long < 100.0 && tp_long > 100.0);
        let (sl_short, tp_short) = derive_sl_tp(Direction::Short, 100.0, &cfg);
        assert!(sl_short > 100.0 && tp_short < 100.0);
    }

    #[tokio::test]
    async fn reversal_guard_rejects_low_confidence() {
        let mgr = manager().await;
        let cfg_val = cfg();
        let position = trade(Direction::Long, 100.0, 30);
        let (allowed, reason) = mgr.check_reversal_allowed(&position, 0.5, 100.0, &cfg_val);
        assert!(!allowed);
        assert!(reason.unwrap().contains("confidence"));
    }

    #[tokio::test]
    async fn reversal_guard_rejects_within_cooldown() {
        let mgr = manager().await;
        let cfg_val = cfg();
        let position = trade(Direction::Long, 100.0, 1);
        let (allowed, _) = mgr.check_reversal_allowed(&position, 0.9, 100.0, &cfg_val);
        assert!(!allowed);
    }

    #[tokio::test]
    async fn reversal_guard_blocks_profitable_position() {
        let mgr = manager().await;
        let cfg_val = cfg();
        let position = trade(Direction::Long, 100.0, 60);
        let (allowed, _) = mgr.check_reversal_allowed(&position, 0.9, 102.0, &cfg_val);
        assert!(!allowed);
    }

    #[test]
    fn override_sl_tp_keeps_config_derived_when_no_real_orders() {
        let (sl, tp) = override_sl_tp_from_orders(95.0, 105.0, &[]);
        assert_eq!(sl, 95.0);
        assert_eq!(tp, 105.0);
    }

    #[test]
    fn override_sl_tp_uses_real_orders_when_present() {
        let orders = serde_json::json!([
            { "type": "STOP_MARKET", "stopPrice": "94.50" },
            { "type": "TAKE_PROFIT_MARKET", "stopPrice": "106.20" },
        ]);
        let (sl, tp) = override_sl_tp_from_orders(95.0, 105.0, orders.as_array().unwrap());
        assert_eq!(sl, 94.50);
        assert_eq!(tp, 106.20);
    }

    #[tokio::test]
    async fn reversal_guard_allows_past_loss_floor() {
        let mgr = manager().await;
        let cfg_val = cfg();
        let position = trade(Direction::Long, 100.0, 60);
        let (allowed, _) = mgr.check_reversal_allowed(&position, 0.9, 99.0, &cfg_val);
        assert!(allowed);
    }
}
