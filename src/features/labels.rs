//! Label generators. These look forward in time and are only meant for
//! offline dataset preparation; the live cycle never calls them.

use crate::error::{BotError, BotResult};
use crate::features::frame::FeatureFrame;
use serde::{Deserialize, Serialize};

fn default_close() -> String {
    "close".to_string()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Up,
    Down,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "label", rename_all = "snake_case")]
pub enum LabelSpec {
    /// 1.0 when price reaches `close * (1 +- threshold)` within the next
    /// `horizon` bars, else 0.0.
    HighLow {
        horizon: usize,
        threshold: f64,
        #[serde(default)]
        direction: Direction,
    },
    /// `x[t + horizon] / x[t] - 1`.
    ForwardReturn {
        #[serde(default = "default_close")]
        column: String,
        horizon: usize,
    },
}

impl LabelSpec {
    pub fn output(&self) -> String {
        match self {
            LabelSpec::HighLow {
                horizon,
                threshold,
                direction,
            } => {
                let dir = match direction {
                    Direction::Up => "high",
                    Direction::Down => "low",
                };
                format!("label_{dir}_{horizon}_{}", (threshold * 10_000.0).round() as i64)
            }
            LabelSpec::ForwardReturn { column, horizon } => format!("{column}_fwd_ret_{horizon}"),
        }
    }

    pub fn generate(&self, frame: &FeatureFrame) -> BotResult<Vec<f64>> {
        let n = frame.len();
        match self {
            LabelSpec::HighLow {
                horizon,
                threshold,
                direction,
            } => {
                if *horizon == 0 {
                    return Err(BotError::Config("high_low label needs a positive horizon".into()));
                }
                let close = frame.require("close", "high_low")?;
                let mut out = vec![f64::NAN; n];
                for i in 0..n.saturating_sub(*horizon) {
                    let future = i + 1..=i + horizon;
                    let hit = match direction {
                        Direction::Up => {
                            let high = frame.require("high", "high_low")?;
                            let best = high[future].iter().copied().fold(f64::NEG_INFINITY, f64::max);
                            best >= close[i] * (1.0 + threshold)
                        }
                        Direction::Down => {
                            let low = frame.require("low", "high_low")?;
                            let worst = low[future].iter().copied().fold(f64::INFINITY, f64::min);
                            worst <= close[i] * (1.0 - threshold)
                        }
                    };
                    out[i] = if hit { 1.0 } else { 0.0 };
                }
                Ok(out)
            }
            LabelSpec::ForwardReturn { column, horizon } => {
                let x = frame.require(column, "forward_return")?;
                Ok((0..n)
                    .map(|i| match x.get(i + horizon) {
                        Some(f) if x[i] != 0.0 => f / x[i] - 1.0,
                        _ => f64::NAN,
                    })
                    .collect())
            }
        }
    }
}

/// Adds every label column to the frame, returning the new column names.
pub fn generate_labels(frame: &mut FeatureFrame, specs: &[LabelSpec]) -> BotResult<Vec<String>> {
    let mut names = Vec::with_capacity(specs.len());
    for spec in specs {
        let values = spec.generate(frame)?;
        let name = spec.output();
        frame.insert(name.clone(), values)?;
        names.push(name);
    }
    Ok(names)
}
