//! Threshold signal generation and the offline threshold sweep.

use crate::model::Score;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalThresholds {
    pub buy_threshold: f64,
    pub sell_threshold: f64,
}

impl Default for SignalThresholds {
    fn default() -> Self {
        Self {
            buy_threshold: 0.1,
            sell_threshold: -0.1,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub buy: bool,
    pub sell: bool,
}

impl Signal {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_none(&self) -> bool {
        !self.buy && !self.sell
    }
}

impl SignalThresholds {
    pub fn generate(&self, score: &Score) -> Signal {
        self.from_value(score.trade_score)
    }

    /// A NaN score never produces a signal.
    pub fn from_value(&self, trade_score: f64) -> Signal {
        Signal {
            buy: trade_score >= self.buy_threshold,
            sell: trade_score <= self.sell_threshold,
        }
    }
}

/// One operating point of [`sweep_thresholds`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    pub buy_threshold: f64,
    pub sell_threshold: f64,
    pub trades: usize,
    pub win_rate: f64,
    /// Compounded return of all closed round trips.
    pub profit: f64,
}

/// Replays a long-only flat/open strategy over historical scores and closes
/// for every `(buy, sell)` pair, entering and exiting at the close of the
/// signalling bar. Results are ranked by profit, then win rate.
pub fn sweep_thresholds(
    scores: &[f64],
    closes: &[f64],
    buy_grid: &[f64],
    sell_grid: &[f64],
) -> Vec<SweepResult> {
    let n = scores.len().min(closes.len());
    let mut results = Vec::with_capacity(buy_grid.len() * sell_grid.len());
    for &buy in buy_grid {
        for &sell in sell_grid {
            // Overlapping bands would make the same score both enter and exit.
            if sell >= buy {
                continue;
            }
            let thresholds = SignalThresholds {
                buy_threshold: buy,
                sell_threshold: sell,
            };
            let mut entry: Option<f64> = None;
            let mut equity = 1.0;
            let (mut trades, mut wins) = (0usize, 0usize);
            for i in 0..n {
                let signal = thresholds.from_value(scores[i]);
                match entry {
                    None if signal.buy && closes[i] > 0.0 => entry = Some(closes[i]),
                    Some(price) if signal.sell => {
                        let ret = closes[i] / price;
                        equity *= ret;
                        trades += 1;
                        if ret > 1.0 {
                            wins += 1;
                        }
                        entry = None;
                    }
                    _ => {}
                }
            }
            results.push(SweepResult {
                buy_threshold: buy,
                sell_threshold: sell,
                trades,
                win_rate: if trades == 0 { 0.0 } else { wins as f64 / trades as f64 },
                profit: equity - 1.0,
            });
        }
    }
    results.sort_by(|a, b| {
        b.profit
            .total_cmp(&a.profit)
            .then(b.win_rate.total_cmp(&a.win_rate))
    });
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn thresholds_are_independent_and_inclusive() {
        let t = SignalThresholds {
            buy_threshold: 0.5,
            sell_threshold: -0.5,
        };
        assert_eq!(t.from_value(0.5), Signal { buy: true, sell: false });
        assert_eq!(t.from_value(-0.5), Signal { buy: false, sell: true });
        assert!(t.from_value(0.0).is_none());
        assert!(t.from_value(f64::NAN).is_none());

        let score = Score {
            trade_score: 0.7,
            components: BTreeMap::new(),
        };
        assert!(t.generate(&score).buy);
    }

    #[test]
    fn sweep_ranks_by_profit() {
        let scores = [0.9, 0.2, -0.6, 0.4, 0.9, -0.9];
        let closes = [100.0, 105.0, 110.0, 108.0, 100.0, 90.0];
        let results = sweep_thresholds(&scores, &closes, &[0.3, 0.8], &[-0.5, -0.8, 0.5]);
        // sell >= buy pairs are skipped: (0.3, 0.5)
        assert_eq!(results.len(), 5);

        let best = &results[0];
        assert_eq!((best.buy_threshold, best.sell_threshold), (0.8, -0.5));
        assert_eq!(best.trades, 2);
        assert!((best.profit - (1.1 * 0.9 - 1.0)).abs() < 1e-12);
        assert_eq!(best.win_rate, 0.5);
        assert!(results.windows(2).all(|w| w[0].profit >= w[1].profit));
    }
}
