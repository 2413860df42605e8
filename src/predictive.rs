// =============================================================================
// PredictiveEngine — Monte-Carlo horizon simulation
// =============================================================================
//
// Grounded on original_source/backend/predictive/engine.py and models.py:
// sample stdev over simple returns, ATR floored at 1e-6, H-step
// multiplicative-shock scenarios, per-horizon cone, breakout/collapse
// probabilities, and the IFI clamp. The RNG seed is an explicit parameter
// (never implicit global state) so scenario generation is reproducible.
// =============================================================================

use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::bar_window::Bar;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictiveSnapshot {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub horizon_bars: usize,
    pub num_scenarios: usize,
    pub ifi: f64,
    pub bp_up: f64,
    pub bp_down: f64,
    pub collapse_risk: f64,
    pub cone_upper: Vec<f64>,
    pub cone_lower: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct PredictiveConfig {
    pub horizon_bars: usize,
    pub num_scenarios: usize,
    pub breakout_atr_mult: f64,
    pub collapse_atr_mult: f64,
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            horizon_bars: 20,
            num_scenarios: 20,
            breakout_atr_mult: 1.0,
            collapse_atr_mult: 0.5,
        }
    }
}

pub struct PredictiveEngine {
    config: PredictiveConfig,
}

impl PredictiveEngine {
    pub fn new(config: PredictiveConfig) -> Self {
        Self { config }
    }

    fn flat_snapshot(&self, symbol: &str, timestamp: DateTime<Utc>, price: f64) -> PredictiveSnapshot {
        PredictiveSnapshot {
            symbol: symbol.to_string(),
            timestamp,
            horizon_bars: self.config.horizon_bars,
            num_scenarios: self.config.num_scenarios,
            ifi: 0.0,
            bp_up: 0.0,
            bp_down: 0.0,
            collapse_risk: 0.0,
            cone_upper: vec![price; self.config.horizon_bars],
            cone_lower: vec![price; self.config.horizon_bars],
        }
    }

    /// Compute a PredictiveSnapshot over the given window of bars, oldest
    /// first. `seed` drives the Monte-Carlo scenario generation so results
    /// are reproducible.
    pub fn compute(&self, symbol: &str, bars: &[Bar], seed: u64) -> PredictiveSnapshot {
        if bars.len() < 2 {
            let price = bars.last().map(|b| b.close).unwrap_or(0.0);
            let ts = bars.last().map(|b| b.timestamp).unwrap_or_else(Utc::now);
            return self.flat_snapshot(symbol, ts, price);
        }

        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        if closes.len() < 2 {
            return self.flat_snapshot(symbol, bars.last().unwrap().timestamp, closes[0]);
        }

        let mut returns = Vec::with_capacity(closes.len() - 1);
        for i in 1..closes.len() {
            let prev = closes[i - 1];
            let ret = if prev == 0.0 { 0.0 } else { (closes[i] - prev) / prev.abs() };
            returns.push(ret);
        }

        let sigma = sample_stdev(&returns);

        let n_atr = bars.len().min(20);
        let recent = &bars[bars.len() - n_atr..];
        let true_ranges: Vec<f64> = recent.iter().map(|b| b.true_range()).collect();
        let avg_tr = if true_ranges.is_empty() {
            0.0
        } else {
            true_ranges.iter().sum::<f64>() / true_ranges.len() as f64
        };
        let atr = if avg_tr > 0.0 { avg_tr } else { 1e-6 };

        let recent_high = recent.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let recent_low = recent.iter().map(|b| b.low).fold(f64::MAX, f64::min);

        let breakout_up_level = recent_high + self.config.breakout_atr_mult * atr;
        let breakout_down_level = recent_low - self.config.breakout_atr_mult * atr;

        let last_price = *closes.last().unwrap();

        let mut rng = StdRng::seed_from_u64(seed);
        let mut paths = Vec::with_capacity(self.config.num_scenarios);
        for _ in 0..self.config.num_scenarios {
            let mut price = last_price;
            let mut path = Vec::with_capacity(self.config.horizon_bars);
            for _ in 0..self.config.horizon_bars {
                let eps = standard_normal(&mut rng);
                let step_ret = sigma * eps;
                price *= 1.0 + step_ret;
                path.push(price);
            }
            paths.push(path);
        }

        let mut cone_upper = Vec::with_capacity(self.config.horizon_bars);
        let mut cone_lower = Vec::with_capacity(self.config.horizon_bars);
        let mut std_values = Vec::with_capacity(self.config.horizon_bars);

        for h in 0..self.config.horizon_bars {
            let step_values: Vec<f64> = paths.iter().map(|p| p[h]).collect();
            let mean_h = step_values.iter().sum::<f64>() / step_values.len() as f64;
            let std_h = sample_stdev_from_mean(&step_values, mean_h);
            std_values.push(std_h);
            cone_upper.push(mean_h + std_h);
            cone_lower.push(mean_h - std_h);
        }

        let count_breakout_up = paths
            .iter()
            .filter(|p| p.iter().any(|&price| price >= breakout_up_level))
            .count();
        let count_breakout_down = paths
            .iter()
            .filter(|p| p.iter().any(|&price| price <= breakout_down_level))
            .count();

        let bp_up = count_breakout_up as f64 / self.config.num_scenarios as f64;
        let bp_down = count_breakout_down as f64 / self.config.num_scenarios as f64;

        let collapse_band = self.config.collapse_atr_mult * atr;
        let count_collapse = paths
            .iter()
            .filter(|p| (p.last().unwrap() - last_price).abs() <= collapse_band)
            .count();
        let collapse_risk = count_collapse as f64 / self.config.num_scenarios as f64;

        let avg_std = if std_values.is_empty() {
            0.0
        } else {
            std_values.iter().sum::<f64>() / std_values.len() as f64
        };
        let vol_ratio = avg_std / (last_price.abs() + 1e-9);
        let ifi = (vol_ratio * 10000.0).clamp(0.0, 100.0);

        PredictiveSnapshot {
            symbol: symbol.to_string(),
            timestamp: bars.last().unwrap().timestamp,
            horizon_bars: self.config.horizon_bars,
            num_scenarios: self.config.num_scenarios,
            ifi,
            bp_up,
            bp_down,
            collapse_risk,
            cone_upper,
            cone_lower,
        }
    }
}

fn sample_stdev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    sample_stdev_from_mean(values, mean)
}

fn sample_stdev_from_mean(values: &[f64], mean: f64) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    var.sqrt()
}

/// Box-Muller standard normal sample.
fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(close: f64) -> Bar {
        Bar {
            timestamp: Utc::now(),
            open: close,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume: 10.0,
            buy_volume: None,
            sell_volume: None,
            is_closed: true,
        }
    }

    #[test]
    fn short_window_returns_flat_cone() {
        let bars = vec![bar(100.0)];
        let engine = PredictiveEngine::new(PredictiveConfig::default());
        let snap = engine.compute("BTCUSDT", &bars, 42);
        assert_eq!(snap.bp_up, 0.0);
        assert_eq!(snap.bp_down, 0.0);
        assert!(snap.cone_upper.iter().all(|&p| p == 100.0));
    }

    #[test]
    fn zero_returns_collapse_to_certainty() {
        let bars: Vec<Bar> = (0..25).map(|_| bar(100.0)).collect();
        let engine = PredictiveEngine::new(PredictiveConfig::default());
        let snap = engine.compute("BTCUSDT", &bars, 7);
        assert_eq!(snap.bp_up, 0.0);
        assert_eq!(snap.bp_down, 0.0);
        assert_eq!(snap.collapse_risk, 1.0);
    }

    #[test]
    fn invariants_hold_on_trending_window() {
        let bars: Vec<Bar> = (0..50).map(|i| bar(100.0 + i as f64 * 0.3)).collect();
        let engine = PredictiveEngine::new(PredictiveConfig::default());
        let snap = engine.compute("ETHUSDT", &bars, 99);
        assert!((0.0..=1.0).contains(&snap.bp_up));
        assert!((0.0..=1.0).contains(&snap.bp_down));
        assert!((0.0..=1.0).contains(&snap.collapse_risk));
        assert!((0.0..=100.0).contains(&snap.ifi));
        for (u, l) in snap.cone_upper.iter().zip(snap.cone_lower.iter()) {
            assert!(u >= l);
        }
    }

    #[test]
    fn same_seed_is_deterministic() {
        let bars: Vec<Bar> = (0..40).map(|i| bar(100.0 + (i as f64 * 0.37).sin() * 3.0)).collect();
        let engine = PredictiveEngine::new(PredictiveConfig::default());
        let a = engine.compute("BTCUSDT", &bars, 123);
        let b = engine.compute("BTCUSDT", &bars, 123);
        assert_eq!(a.bp_up, b.bp_up);
        assert_eq!(a.cone_upper, b.cone_upper);
    }
}
