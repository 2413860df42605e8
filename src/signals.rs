// =============================================================================
// SignalEngine — fuses predictive + delta-trend into LONG/SHORT/NEUTRAL
// =============================================================================
//
// Grounded on original_source/backend/signals/engine.py (delta-trend ring,
// fusion thresholds, confidence formulas), collapsed per the core spec into
// a single fused decision per bar with LONG taking precedence over SHORT
// when both conditions hold (the original emits up to two signals; this
// spec's contract is one decision).
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bar_window::Bar;
use crate::predictive::PredictiveSnapshot;
use crate::types::{Regime, SignalType};

const T_LONG: f64 = 0.60;
const T_SHORT: f64 = 0.65;
const MIN_DELTA_STRENGTH: f64 = 0.30;
const DELTA_THRESHOLD: f64 = 0.6;
const CONTRA_TREND_STRENGTH: f64 = 0.5;
const DELTA_TREND_MIN_RATIO: f64 = 0.10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub confidence: f64,
    pub breakout_probability: f64,
    pub ifi: f64,
    pub collapse_risk: f64,
    /// Independent delta-trend classification for this bar, computed
    /// regardless of which (if any) signal fired — can disagree with
    /// `signal_type` (e.g. a LONG can fire on a NEUTRAL delta trend).
    pub delta_trend: Regime,
    pub description: String,
}

/// Per-(symbol, timeframe) mutable state owned by the StreamRunner and
/// passed into `SignalEngine::evaluate` — never a module-level singleton
/// (core spec §9's "Global-by-symbol state" redesign).
pub struct SignalState {
    delta_lookback: usize,
    last_ifi: Option<f64>,
    recent_bars: VecDeque<Bar>,
}

impl SignalState {
    pub fn new(delta_lookback: usize) -> Self {
        Self {
            delta_lookback: delta_lookback.max(1),
            last_ifi: None,
            recent_bars: VecDeque::new(),
        }
    }

    fn update_bars(&mut self, bars: &[Bar]) {
        self.recent_bars.clear();
        let start = bars.len().saturating_sub(self.delta_lookback);
        for bar in &bars[start..] {
            self.recent_bars.push_back(bar.clone());
        }
    }

    fn delta_trend(&self) -> (Regime, f64) {
        if self.recent_bars.len() < 3 {
            return (Regime::Neutral, 0.0);
        }

        let mut cumulative_delta = 0.0;
        let mut total_volume = 0.0;
        for bar in &self.recent_bars {
            if let Some(delta) = bar.delta() {
                cumulative_delta += delta;
            }
            total_volume += bar.volume;
        }

        if total_volume == 0.0 {
            return (Regime::Neutral, 0.0);
        }

        let delta_ratio = cumulative_delta.abs() / total_volume;
        let strength = (delta_ratio / DELTA_THRESHOLD).min(1.0);

        if cumulative_delta > 0.0 && delta_ratio > DELTA_TREND_MIN_RATIO {
            (Regime::Bullish, strength)
        } else if cumulative_delta < 0.0 && delta_ratio > DELTA_TREND_MIN_RATIO {
            (Regime::Bearish, strength)
        } else {
            (Regime::Neutral, strength)
        }
    }
}

pub struct SignalEngine;

impl SignalEngine {
    pub fn evaluate(
        symbol: &str,
        predictive: &PredictiveSnapshot,
        bars: &[Bar],
        state: &mut SignalState,
    ) -> Signal {
        state.update_bars(bars);

        let ifi = predictive.ifi;
        let bp_up = predictive.bp_up;
        let bp_down = predictive.bp_down;
        let collapse_risk = predictive.collapse_risk;
        let timestamp = predictive.timestamp;

        let ifi_rising = state.last_ifi.map(|prev| ifi > prev).unwrap_or(false);
        state.last_ifi = Some(ifi);

        let (delta_trend, delta_strength) = state.delta_trend();

        let long_blocked = delta_trend == Regime::Bearish && delta_strength >= CONTRA_TREND_STRENGTH;
        let short_blocked = delta_trend == Regime::Bullish && delta_strength >= CONTRA_TREND_STRENGTH;

        let long_eligible = !long_blocked
            && bp_up >= T_LONG
            && ifi_rising
            && (delta_trend == Regime::Neutral || delta_strength >= MIN_DELTA_STRENGTH);

        let short_eligible = !short_blocked
            && bp_down >= T_SHORT
            && ifi_rising
            && (delta_trend == Regime::Neutral || delta_strength >= MIN_DELTA_STRENGTH);

        if long_eligible {
            let base = 0.5 + (bp_up - T_LONG);
            let confidence = match delta_trend {
                Regime::Bullish => (base + delta_strength * 0.25).min(1.0),
                Regime::Bearish => (base - delta_strength * 0.5).max(0.0),
                Regime::Neutral => base,
            };
            return Signal {
                symbol: symbol.to_string(),
                timestamp,
                signal_type: SignalType::Long,
                confidence,
                breakout_probability: bp_up,
                ifi,
                collapse_risk,
                delta_trend,
                description: format!(
                    "LONG: bp_up={:.0}% delta={} ({:.0}%)",
                    bp_up * 100.0,
                    delta_trend,
                    delta_strength * 100.0
                ),
            };
        }

        if short_eligible {
            let base = 0.5 + (bp_down - T_SHORT);
            let confidence = match delta_trend {
                Regime::Bearish => (base + delta_strength * 0.25).min(1.0),
                Regime::Bullish => (base - delta_strength * 0.5).max(0.0),
                Regime::Neutral => base,
            };
            return Signal {
                symbol: symbol.to_string(),
                timestamp,
                signal_type: SignalType::Short,
                confidence,
                breakout_probability: bp_down,
                ifi,
                collapse_risk,
                delta_trend,
                description: format!(
                    "SHORT: bp_down={:.0}% delta={} ({:.0}%)",
                    bp_down * 100.0,
                    delta_trend,
                    delta_strength * 100.0
                ),
            };
        }

        let max_bp = bp_up.max(bp_down);
        Signal {
            symbol: symbol.to_string(),
            timestamp,
            signal_type: SignalType::Neutral,
            confidence: (1.0 - max_bp).clamp(0.0, 1.0),
            breakout_probability: max_bp,
            ifi,
            collapse_risk,
            delta_trend,
            description: format!("Neutral. Delta trend: {delta_trend} ({:.0}%)", delta_strength * 100.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(close: f64, buy: f64, sell: f64) -> Bar {
        Bar {
            timestamp: Utc::now(),
            open: close,
            high: close,
            low: close,
            close,
            volume: buy + sell,
            buy_volume: Some(buy),
            sell_volume: Some(sell),
            is_closed: true,
        }
    }

    fn predictive(bp_up: f64, bp_down: f64, ifi: f64) -> PredictiveSnapshot {
        PredictiveSnapshot {
            symbol: "BTCUSDT".to_string(),
            timestamp: Utc::now(),
            horizon_bars: 20,
            num_scenarios: 20,
            ifi,
            bp_up,
            bp_down,
            collapse_risk: 0.1,
            cone_upper: vec![],
            cone_lower: vec![],
        }
    }

    #[test]
    fn long_requires_ifi_rising() {
        let mut state = SignalState::new(10);
        let bars = vec![bar(100.0, 7.0, 3.0); 10];
        // First call seeds last_ifi with no prior value, so ifi_rising is false.
        let sig = SignalEngine::evaluate("BTCUSDT", &predictive(0.8, 0.1, 12.0), &bars, &mut state);
        assert_eq!(sig.signal_type, SignalType::Neutral);
        let sig2 = SignalEngine::evaluate("BTCUSDT", &predictive(0.8, 0.1, 14.0), &bars, &mut state);
        assert_eq!(sig2.signal_type, SignalType::Long);
    }

    #[test]
    fn contra_trend_blocks_long() {
        let mut state = SignalState::new(10);
        let bars = vec![bar(100.0, 2.0, 8.0); 10];
        SignalEngine::evaluate("BTCUSDT", &predictive(0.8, 0.1, 12.0), &bars, &mut state);
        let sig = SignalEngine::evaluate("BTCUSDT", &predictive(0.8, 0.1, 14.0), &bars, &mut state);
        assert_ne!(sig.signal_type, SignalType::Long);
    }

    #[test]
    fn confidence_stays_in_unit_range() {
        let mut state = SignalState::new(10);
        let bars = vec![bar(100.0, 5.0, 5.0); 10];
        for ifi in [10.0, 12.0, 9.0, 15.0] {
            let sig = SignalEngine::evaluate("BTCUSDT", &predictive(0.55, 0.2, ifi), &bars, &mut state);
            assert!((0.0..=1.0).contains(&sig.confidence));
        }
    }

    #[test]
    fn long_takes_precedence_when_both_qualify() {
        let mut state = SignalState::new(10);
        let bars = vec![bar(100.0, 5.0, 5.0); 10];
        SignalEngine::evaluate("BTCUSDT", &predictive(0.95, 0.95, 10.0), &bars, &mut state);
        let sig = SignalEngine::evaluate("BTCUSDT", &predictive(0.95, 0.95, 20.0), &bars, &mut state);
        assert_eq!(sig.signal_type, SignalType::Long);
    }
}
