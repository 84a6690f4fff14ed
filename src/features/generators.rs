//! The closed set of feature generator kinds.
//!
//! Every kernel computes each row from its own trailing window only, so the
//! trailing values over a suffix of the data are bit-identical to the values
//! over the full history (as long as the suffix covers the required history).

use crate::error::{BotError, BotResult};
use crate::features::frame::FeatureFrame;
use crate::types::{BookSnapshot, Frequency};
use serde::{Deserialize, Serialize};

fn default_close() -> String {
    "close".to_string()
}

fn default_levels() -> usize {
    5
}

/// Side inputs a generator may read besides the frame.
#[derive(Clone, Copy, Debug)]
pub struct GeneratorInputs<'a> {
    pub freq: Frequency,
    /// Book snapshots sorted by timestamp. Empty when no store is configured.
    pub snapshots: &'a [BookSnapshot],
}

impl<'a> GeneratorInputs<'a> {
    pub fn bars_only(freq: Frequency) -> Self {
        Self { freq, snapshots: &[] }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "generator", rename_all = "snake_case")]
pub enum GeneratorSpec {
    /// `x[t] / x[t-p] - 1` for each period.
    Returns {
        #[serde(default = "default_close")]
        column: String,
        periods: Vec<usize>,
    },
    /// Trailing mean; with `relative`, `x[t] / mean - 1`.
    RollingMean {
        #[serde(default = "default_close")]
        column: String,
        windows: Vec<usize>,
        #[serde(default)]
        relative: bool,
    },
    /// Trailing population standard deviation.
    RollingStd {
        #[serde(default = "default_close")]
        column: String,
        windows: Vec<usize>,
    },
    /// `(max(high) - min(low)) / close` over the window.
    RollingRange { windows: Vec<usize> },
    /// Simple-average RSI over `window` price changes.
    Rsi {
        #[serde(default = "default_close")]
        column: String,
        window: usize,
    },
    /// `volume / mean(volume)` over the window.
    VolumeRatio { windows: Vec<usize> },
    /// Per-bar aggregates of the collected order-book snapshots.
    OrderFlow {
        #[serde(default = "default_levels")]
        levels: usize,
    },
}

impl GeneratorSpec {
    pub fn name(&self) -> &'static str {
        match self {
            GeneratorSpec::Returns { .. } => "returns",
            GeneratorSpec::RollingMean { .. } => "rolling_mean",
            GeneratorSpec::RollingStd { .. } => "rolling_std",
            GeneratorSpec::RollingRange { .. } => "rolling_range",
            GeneratorSpec::Rsi { .. } => "rsi",
            GeneratorSpec::VolumeRatio { .. } => "volume_ratio",
            GeneratorSpec::OrderFlow { .. } => "order_flow",
        }
    }

    pub fn validate(&self) -> BotResult<()> {
        let bad = |what: &str| Err(BotError::Config(format!("generator {}: {what}", self.name())));
        match self {
            GeneratorSpec::Returns { periods: w, .. }
            | GeneratorSpec::RollingMean { windows: w, .. }
            | GeneratorSpec::RollingStd { windows: w, .. }
            | GeneratorSpec::RollingRange { windows: w }
            | GeneratorSpec::VolumeRatio { windows: w } => {
                if w.is_empty() {
                    return bad("needs at least one window");
                }
                if w.contains(&0) {
                    return bad("windows must be positive");
                }
            }
            GeneratorSpec::Rsi { window, .. } => {
                if *window == 0 {
                    return bad("window must be positive");
                }
            }
            GeneratorSpec::OrderFlow { levels } => {
                if *levels == 0 {
                    return bad("levels must be positive");
                }
            }
        }
        Ok(())
    }

    /// Columns read from the frame.
    pub fn inputs(&self) -> Vec<String> {
        match self {
            GeneratorSpec::Returns { column, .. }
            | GeneratorSpec::RollingMean { column, .. }
            | GeneratorSpec::RollingStd { column, .. }
            | GeneratorSpec::Rsi { column, .. } => vec![column.clone()],
            GeneratorSpec::RollingRange { .. } => vec!["high".into(), "low".into(), "close".into()],
            GeneratorSpec::VolumeRatio { .. } => vec!["volume".into()],
            GeneratorSpec::OrderFlow { .. } => vec![],
        }
    }

    pub fn outputs(&self) -> Vec<String> {
        match self {
            GeneratorSpec::Returns { column, periods } => {
                periods.iter().map(|p| format!("{column}_ret_{p}")).collect()
            }
            GeneratorSpec::RollingMean {
                column,
                windows,
                relative,
            } => {
                let kind = if *relative { "rel_mean" } else { "mean" };
                windows.iter().map(|w| format!("{column}_{kind}_{w}")).collect()
            }
            GeneratorSpec::RollingStd { column, windows } => {
                windows.iter().map(|w| format!("{column}_std_{w}")).collect()
            }
            GeneratorSpec::RollingRange { windows } => windows.iter().map(|w| format!("range_{w}")).collect(),
            GeneratorSpec::Rsi { column, window } => vec![format!("{column}_rsi_{window}")],
            GeneratorSpec::VolumeRatio { windows } => {
                windows.iter().map(|w| format!("volume_ratio_{w}")).collect()
            }
            GeneratorSpec::OrderFlow { .. } => vec![
                "book_imbalance".into(),
                "book_spread_bps".into(),
                "book_updates".into(),
            ],
        }
    }

    /// Rows of history needed before the first fully defined output.
    pub fn required_history(&self) -> usize {
        let max = |w: &[usize]| w.iter().copied().max().unwrap_or(1);
        match self {
            GeneratorSpec::Returns { periods, .. } => max(periods) + 1,
            GeneratorSpec::RollingMean { windows, .. }
            | GeneratorSpec::RollingStd { windows, .. }
            | GeneratorSpec::RollingRange { windows }
            | GeneratorSpec::VolumeRatio { windows } => max(windows),
            GeneratorSpec::Rsi { window, .. } => window + 1,
            GeneratorSpec::OrderFlow { .. } => 1,
        }
    }

    pub fn reads_snapshots(&self) -> bool {
        matches!(self, GeneratorSpec::OrderFlow { .. })
    }

    /// Computes this generator's columns over the whole frame.
    pub fn apply(&self, frame: &FeatureFrame, inputs: &GeneratorInputs<'_>) -> BotResult<Vec<(String, Vec<f64>)>> {
        let name = self.name();
        let names = self.outputs();
        let values: Vec<Vec<f64>> = match self {
            GeneratorSpec::Returns { column, periods } => {
                let x = frame.require(column, name)?;
                periods.iter().map(|&p| pct_change(x, p)).collect()
            }
            GeneratorSpec::RollingMean {
                column,
                windows,
                relative,
            } => {
                let x = frame.require(column, name)?;
                windows
                    .iter()
                    .map(|&w| {
                        let mean = rolling(x, w, mean);
                        if *relative {
                            x.iter().zip(&mean).map(|(v, m)| ratio(*v, *m) - 1.0).collect()
                        } else {
                            mean
                        }
                    })
                    .collect()
            }
            GeneratorSpec::RollingStd { column, windows } => {
                let x = frame.require(column, name)?;
                windows.iter().map(|&w| rolling(x, w, std_dev)).collect()
            }
            GeneratorSpec::RollingRange { windows } => {
                let high = frame.require("high", name)?;
                let low = frame.require("low", name)?;
                let close = frame.require("close", name)?;
                windows
                    .iter()
                    .map(|&w| {
                        let hi = rolling(high, w, max);
                        let lo = rolling(low, w, min);
                        (0..frame.len())
                            .map(|i| ratio(hi[i] - lo[i], close[i]))
                            .collect()
                    })
                    .collect()
            }
            GeneratorSpec::Rsi { column, window } => {
                let x = frame.require(column, name)?;
                vec![rsi(x, *window)]
            }
            GeneratorSpec::VolumeRatio { windows } => {
                let v = frame.require("volume", name)?;
                windows
                    .iter()
                    .map(|&w| {
                        let m = rolling(v, w, mean);
                        v.iter().zip(&m).map(|(a, b)| ratio(*a, *b)).collect()
                    })
                    .collect()
            }
            GeneratorSpec::OrderFlow { levels } => order_flow(frame, inputs, *levels),
        };
        Ok(names.into_iter().zip(values).collect())
    }
}

fn ratio(num: f64, den: f64) -> f64 {
    if den == 0.0 || !den.is_finite() || !num.is_finite() {
        f64::NAN
    } else {
        num / den
    }
}

/// Applies `f` to each full trailing window of length `w`. Rows without a full
/// window, or whose window holds a non-finite value, are NaN.
fn rolling(x: &[f64], w: usize, f: fn(&[f64]) -> f64) -> Vec<f64> {
    let mut out = vec![f64::NAN; x.len()];
    if w == 0 {
        return out;
    }
    for i in (w - 1)..x.len() {
        let win = &x[i + 1 - w..=i];
        if win.iter().all(|v| v.is_finite()) {
            out[i] = f(win);
        }
    }
    out
}

fn mean(w: &[f64]) -> f64 {
    w.iter().sum::<f64>() / w.len() as f64
}

fn std_dev(w: &[f64]) -> f64 {
    let m = mean(w);
    (w.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / w.len() as f64).sqrt()
}

fn max(w: &[f64]) -> f64 {
    w.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

fn min(w: &[f64]) -> f64 {
    w.iter().copied().fold(f64::INFINITY, f64::min)
}

fn pct_change(x: &[f64], p: usize) -> Vec<f64> {
    (0..x.len())
        .map(|i| if i >= p { ratio(x[i], x[i - p]) - 1.0 } else { f64::NAN })
        .collect()
}

fn rsi(x: &[f64], w: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; x.len()];
    for i in w..x.len() {
        let win = &x[i - w..=i];
        if !win.iter().all(|v| v.is_finite()) {
            continue;
        }
        let (mut gain, mut loss) = (0.0, 0.0);
        for pair in win.windows(2) {
            let d = pair[1] - pair[0];
            if d > 0.0 {
                gain += d;
            } else {
                loss -= d;
            }
        }
        out[i] = if loss == 0.0 {
            if gain == 0.0 {
                50.0
            } else {
                100.0
            }
        } else {
            100.0 - 100.0 / (1.0 + gain / loss)
        };
    }
    out
}

/// Imbalance `(bid - ask) / (bid + ask)` over the top `levels`, spread in bps
/// of mid, and update count, averaged over the snapshots inside each bar.
fn order_flow(frame: &FeatureFrame, inputs: &GeneratorInputs<'_>, levels: usize) -> Vec<Vec<f64>> {
    let n = frame.len();
    let mut imbalance = vec![f64::NAN; n];
    let mut spread_bps = vec![f64::NAN; n];
    let mut updates = vec![0.0; n];
    let snaps = inputs.snapshots;
    for (i, ts) in frame.index().iter().enumerate() {
        let end = *ts + inputs.freq.duration();
        let lo = snaps.partition_point(|s| s.ts < *ts);
        let hi = snaps.partition_point(|s| s.ts < end);
        let in_bar = &snaps[lo..hi.max(lo)];
        if in_bar.is_empty() {
            continue;
        }
        let imb: Vec<f64> = in_bar
            .iter()
            .map(|s| {
                let (b, a) = s.depth_qty(levels);
                ratio(b - a, b + a)
            })
            .filter(|v| v.is_finite())
            .collect();
        let spr: Vec<f64> = in_bar
            .iter()
            .map(|s| ratio(s.spread, s.mid_price) * 10_000.0)
            .filter(|v| v.is_finite())
            .collect();
        if !imb.is_empty() {
            imbalance[i] = mean(&imb);
        }
        if !spr.is_empty() {
            spread_bps[i] = mean(&spr);
        }
        updates[i] = in_bar.len() as f64;
    }
    vec![imbalance, spread_bps, updates]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Bar, BookLevel};
    use chrono::{TimeZone, Utc};

    fn frame(closes: &[f64]) -> FeatureFrame {
        let bars: Vec<Bar> = closes
            .iter()
            .enumerate()
            .map(|(i, c)| Bar {
                ts: Utc.timestamp_opt(i as i64 * 60, 0).unwrap(),
                open: *c,
                high: c + 1.0,
                low: c - 1.0,
                close: *c,
                volume: (i + 1) as f64,
            })
            .collect();
        FeatureFrame::from_bars(&bars)
    }

    fn apply(spec: &GeneratorSpec, f: &FeatureFrame) -> Vec<(String, Vec<f64>)> {
        spec.apply(f, &GeneratorInputs::bars_only(Frequency::minutes(1))).unwrap()
    }

    #[test]
    fn returns_and_mean() {
        let f = frame(&[100.0, 110.0, 121.0, 133.1]);
        let out = apply(
            &GeneratorSpec::Returns {
                column: "close".into(),
                periods: vec![1],
            },
            &f,
        );
        assert_eq!(out[0].0, "close_ret_1");
        assert!(out[0].1[0].is_nan());
        assert!((out[0].1[3] - 0.1).abs() < 1e-12);

        let out = apply(
            &GeneratorSpec::RollingMean {
                column: "close".into(),
                windows: vec![2],
                relative: false,
            },
            &f,
        );
        assert_eq!(out[0].0, "close_mean_2");
        assert!(out[0].1[0].is_nan());
        assert_eq!(out[0].1[1], 105.0);
    }

    #[test]
    fn std_range_and_volume_ratio() {
        let f = frame(&[1.0, 3.0, 1.0, 3.0]);
        let std = apply(
            &GeneratorSpec::RollingStd {
                column: "close".into(),
                windows: vec![2],
            },
            &f,
        );
        assert_eq!(std[0].1[3], 1.0);

        let range = apply(&GeneratorSpec::RollingRange { windows: vec![2] }, &f);
        // high max 4, low min 0, close 3
        assert!((range[0].1[3] - 4.0 / 3.0).abs() < 1e-12);

        let vr = apply(&GeneratorSpec::VolumeRatio { windows: vec![2] }, &f);
        // volumes 3,4 -> mean 3.5
        assert!((vr[0].1[3] - 4.0 / 3.5).abs() < 1e-12);
    }

    #[test]
    fn rsi_extremes() {
        let up = frame(&[1.0, 2.0, 3.0, 4.0]);
        let out = apply(
            &GeneratorSpec::Rsi {
                column: "close".into(),
                window: 3,
            },
            &up,
        );
        assert!(out[0].1[2].is_nan());
        assert_eq!(out[0].1[3], 100.0);

        let flat = frame(&[5.0; 4]);
        let out = apply(
            &GeneratorSpec::Rsi {
                column: "close".into(),
                window: 3,
            },
            &flat,
        );
        assert_eq!(out[0].1[3], 50.0);
    }

    #[test]
    fn nan_inputs_propagate_as_nan() {
        let f = frame(&[1.0, f64::NAN, 3.0, 4.0, 5.0]);
        let out = apply(
            &GeneratorSpec::RollingMean {
                column: "close".into(),
                windows: vec![2],
                relative: false,
            },
            &f,
        );
        assert!(out[0].1[1].is_nan());
        assert!(out[0].1[2].is_nan());
        assert_eq!(out[0].1[3], 3.5);
    }

    #[test]
    fn order_flow_aggregates_snapshots_per_bar() {
        let f = frame(&[100.0, 100.0, 100.0]);
        let snap = |secs: i64, bid_qty: f64, ask_qty: f64| BookSnapshot {
            ts: Utc.timestamp_opt(secs, 0).unwrap(),
            update_id: secs as u64,
            bids: vec![BookLevel { price: 99.0, qty: bid_qty }],
            asks: vec![BookLevel { price: 101.0, qty: ask_qty }],
            mid_price: 100.0,
            spread: 2.0,
        };
        let snaps = vec![snap(5, 3.0, 1.0), snap(30, 1.0, 1.0), snap(125, 1.0, 3.0)];
        let out = GeneratorSpec::OrderFlow { levels: 5 }
            .apply(
                &f,
                &GeneratorInputs {
                    freq: Frequency::minutes(1),
                    snapshots: &snaps,
                },
            )
            .unwrap();
        let (imb, spread, count) = (&out[0].1, &out[1].1, &out[2].1);
        assert_eq!(imb[0], 0.25);
        assert!(imb[1].is_nan());
        assert_eq!(imb[2], -0.5);
        assert_eq!(spread[0], 200.0);
        assert_eq!(count.as_slice(), &[2.0, 0.0, 1.0]);
    }

    #[test]
    fn validation_rejects_zero_windows() {
        assert!(GeneratorSpec::RollingMean {
            column: "close".into(),
            windows: vec![0],
            relative: false
        }
        .validate()
        .is_err());
        assert!(GeneratorSpec::VolumeRatio { windows: vec![] }.validate().is_err());
        assert!(GeneratorSpec::Rsi {
            column: "close".into(),
            window: 14
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn specs_deserialize_from_tagged_json() {
        let spec: GeneratorSpec =
            serde_json::from_str(r#"{"generator":"rolling_mean","windows":[5,10],"relative":true}"#).unwrap();
        assert_eq!(spec.outputs(), vec!["close_rel_mean_5", "close_rel_mean_10"]);
        assert_eq!(spec.required_history(), 10);
        assert!(serde_json::from_str::<GeneratorSpec>(r#"{"generator":"talib"}"#).is_err());
    }
}
