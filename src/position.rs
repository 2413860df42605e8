// =============================================================================
// OpenTrade — the single position a StreamRunner may hold at a time
// =============================================================================
//
// Grounded on core spec §3's OpenTrade (runtime) shape and on
// paper_trading.py's TradeLog, collapsed to the one-position-per-runner
// model: a runner owns at most one OpenTrade, mutated only by
// ExecutionManager, cleared on close even though the broker-side position
// may outlive a process restart (re-adopted via reconciliation).
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Direction, SignalType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "CLOSED")]
    Closed,
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Runtime view of a position a runner currently holds (or just closed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTrade {
    pub timestamp: DateTime<Utc>,
    pub signal_type: SignalType,
    pub confidence: f64,
    pub direction: Direction,
    pub entry_price: f64,
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub order_id: String,
    pub status: TradeStatus,
}

impl OpenTrade {
    pub fn new(
        signal_type: SignalType,
        confidence: f64,
        direction: Direction,
        entry_price: f64,
        quantity: f64,
        stop_loss: f64,
        take_profit: f64,
        order_id: String,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            signal_type,
            confidence,
            direction,
            entry_price,
            quantity,
            stop_loss,
            take_profit,
            order_id,
            status: TradeStatus::Open,
        }
    }

    pub fn minutes_since_open(&self) -> f64 {
        (Utc::now() - self.timestamp).num_milliseconds() as f64 / 60_000.0
    }

    /// Unrealised pnl percentage of `current_price` vs entry, signed in the
    /// position's direction (positive is favourable).
    pub fn pnl_pct(&self, current_price: f64) -> f64 {
        let raw = (current_price - self.entry_price) / self.entry_price * 100.0;
        match self.direction {
            Direction::Long => raw,
            Direction::Short => -raw,
        }
    }

    pub fn mark_closed(&mut self) {
        self.status = TradeStatus::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(direction: Direction, entry: f64) -> OpenTrade {
        OpenTrade::new(SignalType::Long, 0.8, direction, entry, 1.0, 0.0, 0.0, "1".to_string())
    }

    #[test]
    fn pnl_pct_is_positive_when_long_moves_up() {
        let t = trade(Direction::Long, 100.0);
        assert!((t.pnl_pct(105.0) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn pnl_pct_is_positive_when_short_moves_down() {
        let t = trade(Direction::Short, 100.0);
        assert!((t.pnl_pct(95.0) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn pnl_pct_is_negative_against_direction() {
        let long = trade(Direction::Long, 100.0);
        assert!(long.pnl_pct(95.0) < 0.0);
        let short = trade(Direction::Short, 100.0);
        assert!(short.pnl_pct(105.0) < 0.0);
    }

    #[test]
    fn mark_closed_flips_status() {
        let mut t = trade(Direction::Long, 100.0);
        t.mark_closed();
        assert_eq!(t.status, TradeStatus::Closed);
    }
}
