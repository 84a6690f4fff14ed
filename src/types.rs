use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Instrument(pub String);

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn sign(self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => f.write_str("buy"),
            Side::Sell => f.write_str("sell"),
        }
    }
}

/// Bar frequency, stored as a whole number of seconds.
///
/// Parses and serializes as `"1m"`, `"5m"`, `"1h"`, `"1d"` etc.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Frequency {
    secs: i64,
}

/// Longest frequency accepted, so grid arithmetic stays far from overflow.
const MAX_FREQUENCY_SECS: i64 = 366 * 86_400;

impl Frequency {
    pub fn from_secs(secs: i64) -> Option<Self> {
        (secs > 0 && secs <= MAX_FREQUENCY_SECS).then_some(Self { secs })
    }

    pub fn minutes(m: i64) -> Self {
        Self { secs: m * 60 }
    }

    pub fn as_secs(self) -> i64 {
        self.secs
    }

    pub fn duration(self) -> ChronoDuration {
        ChronoDuration::seconds(self.secs)
    }

    pub fn std_duration(self) -> std::time::Duration {
        std::time::Duration::from_secs(self.secs as u64)
    }

    /// True when `ts` lies exactly on the frequency grid (epoch aligned).
    pub fn is_aligned(self, ts: DateTime<Utc>) -> bool {
        ts.timestamp_subsec_nanos() == 0 && ts.timestamp().rem_euclid(self.secs) == 0
    }

    /// Start of the grid slot containing `ts`.
    pub fn floor(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = ts.timestamp();
        let floored = secs - secs.rem_euclid(self.secs);
        Utc.timestamp_opt(floored, 0).single().unwrap_or(ts)
    }

    /// First grid point strictly after `ts`.
    pub fn next_boundary(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        self.floor(ts) + self.duration()
    }
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("frequency '{s}' is missing a unit"))?;
        let (num, unit) = s.split_at(split);
        let n: i64 = num
            .parse()
            .map_err(|_| format!("frequency '{s}' has no numeric part"))?;
        let mult = match unit {
            "s" => 1,
            "m" | "min" => 60,
            "h" => 3_600,
            "d" => 86_400,
            other => return Err(format!("unknown frequency unit '{other}'")),
        };
        let secs = n
            .checked_mul(mult)
            .ok_or_else(|| format!("frequency '{s}' is too large"))?;
        Frequency::from_secs(secs).ok_or_else(|| format!("frequency '{s}' must be positive and at most 366d"))
    }
}

impl TryFrom<String> for Frequency {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Frequency> for String {
    fn from(f: Frequency) -> String {
        f.to_string()
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.secs;
        if s % 86_400 == 0 {
            write!(f, "{}d", s / 86_400)
        } else if s % 3_600 == 0 {
            write!(f, "{}h", s / 3_600)
        } else if s % 60 == 0 {
            write!(f, "{}m", s / 60)
        } else {
            write!(f, "{s}s")
        }
    }
}

/// One OHLCV candle. `ts` is the open time of the bar.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn close_time(&self, freq: Frequency) -> DateTime<Utc> {
        self.ts + freq.duration()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderId(pub String);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LimitOrder {
    pub instrument: Instrument,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
}

/// Order state as reported by the market.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled { filled_qty: f64, avg_price: f64 },
    Filled { filled_qty: f64, avg_price: f64 },
    Cancelled { filled_qty: f64, avg_price: f64 },
    Rejected { reason: String },
}

impl OrderStatus {
    pub fn filled_qty(&self) -> f64 {
        match self {
            OrderStatus::PartiallyFilled { filled_qty, .. }
            | OrderStatus::Filled { filled_qty, .. }
            | OrderStatus::Cancelled { filled_qty, .. } => *filled_qty,
            OrderStatus::New | OrderStatus::Rejected { .. } => 0.0,
        }
    }

    pub fn avg_price(&self) -> Option<f64> {
        match self {
            OrderStatus::PartiallyFilled { avg_price, .. }
            | OrderStatus::Filled { avg_price, .. }
            | OrderStatus::Cancelled { avg_price, .. } => Some(*avg_price),
            OrderStatus::New | OrderStatus::Rejected { .. } => None,
        }
    }

    /// No further fills can arrive.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled { .. } | OrderStatus::Cancelled { .. } | OrderStatus::Rejected { .. }
        )
    }
}

/// Free balances keyed by asset code.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Balances {
    pub free: BTreeMap<String, f64>,
}

impl Balances {
    pub fn get(&self, asset: &str) -> f64 {
        self.free.get(asset).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, asset: &str, amount: f64) {
        self.free.insert(asset.to_string(), amount);
    }

    pub fn add(&mut self, asset: &str, delta: f64) {
        *self.free.entry(asset.to_string()).or_insert(0.0) += delta;
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub qty: f64,
}

/// One message from the streaming book feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BookUpdate {
    pub update_id: u64,
    pub ts: DateTime<Utc>,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

/// Compact top-of-book capture persisted by the collector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub ts: DateTime<Utc>,
    pub update_id: u64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub mid_price: f64,
    pub spread: f64,
}

impl BookSnapshot {
    /// Builds a snapshot truncated to `depth` levels per side.
    pub fn from_update(update: &BookUpdate, depth: usize) -> Self {
        let bids: Vec<BookLevel> = update.bids.iter().take(depth).cloned().collect();
        let asks: Vec<BookLevel> = update.asks.iter().take(depth).cloned().collect();
        let (mid_price, spread) = match (bids.first(), asks.first()) {
            (Some(b), Some(a)) => ((b.price + a.price) / 2.0, a.price - b.price),
            _ => (f64::NAN, f64::NAN),
        };
        Self {
            ts: update.ts,
            update_id: update.update_id,
            bids,
            asks,
            mid_price,
            spread,
        }
    }

    pub fn depth_qty(&self, levels: usize) -> (f64, f64) {
        let bid = self.bids.iter().take(levels).map(|l| l.qty).sum();
        let ask = self.asks.iter().take(levels).map(|l| l.qty).sum();
        (bid, ask)
    }
}
