// =============================================================================
// TopologyEngine — rotation/energy/vortex features from a bar window
// =============================================================================
//
// Grounded on original_source/backend/topology/engine.py: for each interior
// bar we build a (return, flow) vector, measure the normalised cross
// product against its neighbours (a signed sine of the turn angle), weight
// it by an energy term normalised against the running median, and flag a
// vortex where the composite score clears 0.08 and the raw energy sits in
// the top 30% of the window.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bar_window::Bar;
use crate::types::VortexDirection;

const VORTEX_COMPOSITE_THRESHOLD: f64 = 0.08;
const ENERGY_PERCENTILE: f64 = 0.70;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VortexMarker {
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub strength: f64,
    pub direction: VortexDirection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub symbol: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub coherence: f64,
    pub energy: f64,
    pub vortexes: Vec<VortexMarker>,
}

impl TopologySnapshot {
    fn empty(symbol: &str, timestamp: Option<DateTime<Utc>>) -> Self {
        Self {
            symbol: symbol.to_string(),
            timestamp,
            coherence: 0.0,
            energy: 0.0,
            vortexes: Vec::new(),
        }
    }
}

pub struct TopologyEngine;

impl TopologyEngine {
    /// Compute a TopologySnapshot over the given window of bars, oldest
    /// first. Windows shorter than 3 bars produce an empty snapshot.
    pub fn compute(symbol: &str, bars: &[Bar]) -> TopologySnapshot {
        if bars.len() < 3 {
            return TopologySnapshot::empty(symbol, bars.last().map(|b| b.timestamp));
        }

        let mut returns = Vec::with_capacity(bars.len());
        let mut flows = Vec::with_capacity(bars.len());

        for (i, bar) in bars.iter().enumerate() {
            let ret = if i == 0 {
                0.0
            } else {
                let prev_close = bars[i - 1].close;
                if prev_close == 0.0 {
                    0.0
                } else {
                    (bar.close - prev_close) / prev_close.abs()
                }
            };
            returns.push(ret);

            let flow = match (bar.volume > 0.0, bar.delta()) {
                (true, Some(delta)) => delta / bar.volume,
                _ => 0.0,
            };
            flows.push(flow);
        }

        let mut rotations = Vec::new();
        let mut energies = Vec::new();
        let mut composite_scores = Vec::new();

        for k in 1..bars.len() - 1 {
            let v_prev = (returns[k - 1], flows[k - 1]);
            let v_next = (returns[k + 1], flows[k + 1]);

            let cross = v_prev.0 * v_next.1 - v_prev.1 * v_next.0;
            let denom = norm(v_prev) * norm(v_next);
            let rot = if denom < 1e-9 { 0.0 } else { cross / denom };
            rotations.push(rot);

            let energy_k = returns[k].abs() * bars[k].volume.max(0.0);
            energies.push(energy_k);

            // Median grows with k: computed over energies accumulated so
            // far at this step, matching the source's literal behaviour.
            let median_energy = median(&energies);
            let normalized_energy = if median_energy > 0.0 {
                (energy_k / median_energy).sqrt()
            } else {
                0.0
            };
            composite_scores.push(rot.abs() * normalized_energy);
        }

        if rotations.is_empty() {
            return TopologySnapshot::empty(symbol, bars.last().map(|b| b.timestamp));
        }

        let coherence = rotations.iter().map(|r| r.abs()).sum::<f64>() / rotations.len() as f64;

        let mut sorted_energies = energies.clone();
        sorted_energies.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let thr_index = ((ENERGY_PERCENTILE * sorted_energies.len() as f64) as usize)
            .clamp(0, sorted_energies.len() - 1);
        let energy_threshold = sorted_energies[thr_index];

        let mut vortexes = Vec::new();
        for (k_idx, k) in (1..bars.len() - 1).enumerate() {
            if composite_scores[k_idx] >= VORTEX_COMPOSITE_THRESHOLD
                && energies[k_idx] >= energy_threshold
            {
                let direction = if rotations[k_idx] < 0.0 {
                    VortexDirection::Clockwise
                } else {
                    VortexDirection::CounterClockwise
                };
                vortexes.push(VortexMarker {
                    index: k,
                    timestamp: bars[k].timestamp,
                    price: bars[k].close,
                    strength: rotations[k_idx].abs(),
                    direction,
                });
            }
        }

        let energy = *energies.last().unwrap_or(&0.0);

        TopologySnapshot {
            symbol: symbol.to_string(),
            timestamp: bars.last().map(|b| b.timestamp),
            coherence,
            energy,
            vortexes,
        }
    }
}

fn norm(v: (f64, f64)) -> f64 {
    (v.0 * v.0 + v.1 * v.1).sqrt()
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    sorted[sorted.len() / 2]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(close: f64, volume: f64, buy: f64, sell: f64) -> Bar {
        Bar {
            timestamp: Utc::now(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume,
            buy_volume: Some(buy),
            sell_volume: Some(sell),
            is_closed: true,
        }
    }

    #[test]
    fn short_window_is_empty() {
        let bars = vec![bar(1.0, 10.0, 6.0, 4.0), bar(2.0, 10.0, 6.0, 4.0)];
        let snap = TopologyEngine::compute("BTCUSDT", &bars);
        assert_eq!(snap.coherence, 0.0);
        assert_eq!(snap.energy, 0.0);
        assert!(snap.vortexes.is_empty());
    }

    #[test]
    fn coherence_is_nonnegative_and_rotation_bounded() {
        let mut bars = Vec::new();
        let mut price = 100.0;
        for i in 0..40 {
            let drift = if i % 2 == 0 { 1.5 } else { -0.5 };
            price += drift;
            let buy = if drift > 0.0 { 7.0 } else { 3.0 };
            bars.push(bar(price, 20.0, buy, 10.0 - (buy - 5.0)));
        }
        let snap = TopologyEngine::compute("ETHUSDT", &bars);
        assert!(snap.coherence >= 0.0);
        assert!(snap.energy >= 0.0);
        for v in &snap.vortexes {
            assert!(v.strength <= 1.0 + 1e-9);
        }
    }

    #[test]
    fn vortex_count_never_exceeds_high_composite_candidates() {
        let mut bars = Vec::new();
        let mut price = 50.0;
        for i in 0..30 {
            price += if i % 3 == 0 { 3.0 } else { -1.0 };
            bars.push(bar(price, 15.0 + i as f64, 9.0, 2.0));
        }
        let snap = TopologyEngine::compute("SOLUSDT", &bars);
        assert!(snap.vortexes.len() <= bars.len());
    }
}
