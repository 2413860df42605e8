// =============================================================================
// BarWindow — bounded ring of recent bars for one (symbol, timeframe)
// =============================================================================
//
// Grounded on market_data/candle_buffer.rs's Candle / ring-eviction /
// in-progress-replace logic, narrowed to a single buffer per runner
// instead of a shared keyed map.
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single OHLCV bar, optionally carrying buy/sell volume split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub buy_volume: Option<f64>,
    #[serde(default)]
    pub sell_volume: Option<f64>,
    #[serde(default)]
    pub is_closed: bool,
}

impl Bar {
    /// `delta = buy_volume - sell_volume` when both sides are known.
    pub fn delta(&self) -> Option<f64> {
        match (self.buy_volume, self.sell_volume) {
            (Some(b), Some(s)) => Some(b - s),
            _ => None,
        }
    }

    pub fn true_range(&self) -> f64 {
        self.high - self.low
    }
}

/// Bounded ring of recent bars for one (symbol, timeframe) pair. Oldest
/// bar is evicted once the window is at capacity. The bar currently being
/// built (not yet closed) replaces any existing in-progress bar with the
/// same timestamp rather than being appended as a new entry.
pub struct BarWindow {
    capacity: usize,
    closed: VecDeque<Bar>,
    in_progress: Option<Bar>,
}

impl BarWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            closed: VecDeque::with_capacity(capacity),
            in_progress: None,
        }
    }

    /// Feed a bar from the market data source. Closed bars are folded
    /// into the permanent sequence (trimming the oldest on overflow);
    /// in-progress bars replace the current in-progress bar.
    pub fn push(&mut self, bar: Bar) {
        if bar.is_closed {
            self.in_progress = None;
            self.closed.push_back(bar);
            while self.closed.len() > self.capacity {
                self.closed.pop_front();
            }
        } else {
            self.in_progress = Some(bar);
        }
    }

    pub fn len(&self) -> usize {
        self.closed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closed.is_empty()
    }

    pub fn current_bar(&self) -> Option<&Bar> {
        self.in_progress.as_ref()
    }

    /// All closed bars, oldest first.
    pub fn bars(&self) -> impl Iterator<Item = &Bar> {
        self.closed.iter()
    }

    /// The last `n` closed bars, oldest first.
    pub fn closed_slice(&self, n: usize) -> Vec<Bar> {
        let start = self.closed.len().saturating_sub(n);
        self.closed.iter().skip(start).cloned().collect()
    }

    pub fn closes(&self, n: usize) -> Vec<f64> {
        self.closed_slice(n).iter().map(|b| b.close).collect()
    }

    pub fn last_close(&self) -> Option<f64> {
        self.closed.back().map(|b| b.close)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(ts: i64, close: f64, closed: bool) -> Bar {
        Bar {
            timestamp: DateTime::from_timestamp(ts, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            buy_volume: Some(0.6),
            sell_volume: Some(0.4),
            is_closed: closed,
        }
    }

    #[test]
    fn ring_buffer_trims_oldest() {
        let mut w = BarWindow::new(3);
        for i in 0..5 {
            w.push(bar(i, i as f64, true));
        }
        assert_eq!(w.len(), 3);
        assert_eq!(w.closes(3), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn in_progress_does_not_count_toward_closed_len() {
        let mut w = BarWindow::new(5);
        w.push(bar(0, 1.0, true));
        w.push(bar(1, 2.0, false));
        assert_eq!(w.len(), 1);
        assert_eq!(w.current_bar().unwrap().close, 2.0);
    }

    #[test]
    fn delta_requires_both_sides() {
        let mut b = bar(0, 1.0, true);
        assert_eq!(b.delta(), Some(0.2));
        b.sell_volume = None;
        assert_eq!(b.delta(), None);
    }

    #[test]
    fn last_close_empty_is_none() {
        let w = BarWindow::new(5);
        assert_eq!(w.last_close(), None);
    }
}
