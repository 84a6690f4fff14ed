use crate::error::{BotError, BotResult};
use crate::types::Bar;
use chrono::{DateTime, Utc};

pub const BASE_COLUMNS: [&str; 5] = ["open", "high", "low", "close", "volume"];

/// Column-oriented table indexed by bar timestamp.
///
/// Holds the base OHLCV columns plus whatever the generators derived, in the
/// order they were added.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeatureFrame {
    index: Vec<DateTime<Utc>>,
    columns: Vec<(String, Vec<f64>)>,
    /// Trailing rows computed from inputs that may still grow.
    provisional: usize,
}

impl FeatureFrame {
    pub fn from_bars(bars: &[Bar]) -> Self {
        let index = bars.iter().map(|b| b.ts).collect();
        let columns = vec![
            ("open".to_string(), bars.iter().map(|b| b.open).collect()),
            ("high".to_string(), bars.iter().map(|b| b.high).collect()),
            ("low".to_string(), bars.iter().map(|b| b.low).collect()),
            ("close".to_string(), bars.iter().map(|b| b.close).collect()),
            ("volume".to_string(), bars.iter().map(|b| b.volume).collect()),
        ];
        Self {
            index,
            columns,
            provisional: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn index(&self) -> &[DateTime<Utc>] {
        &self.index
    }

    pub fn last_ts(&self) -> Option<DateTime<Utc>> {
        self.index.last().copied()
    }

    /// Number of trailing rows that must be recomputed before they are final.
    pub fn provisional_rows(&self) -> usize {
        self.provisional
    }

    pub fn set_provisional_rows(&mut self, n: usize) {
        self.provisional = n.min(self.len());
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Like [`column`](Self::column) but a missing column is a generation fault.
    pub fn require(&self, name: &str, generator: &str) -> BotResult<&[f64]> {
        self.column(name)
            .ok_or_else(|| BotError::generation(generator, format!("missing input column '{name}'")))
    }

    /// Adds a column, replacing any existing column with the same name.
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) -> BotResult<()> {
        let name = name.into();
        if values.len() != self.len() {
            return Err(BotError::generation(
                name.clone(),
                format!("produced {} rows for a frame of {}", values.len(), self.len()),
            ));
        }
        match self.columns.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = values,
            None => self.columns.push((name, values)),
        }
        Ok(())
    }

    /// The trailing `k` rows.
    pub fn tail(&self, k: usize) -> FeatureFrame {
        let start = self.len().saturating_sub(k);
        FeatureFrame {
            index: self.index[start..].to_vec(),
            columns: self
                .columns
                .iter()
                .map(|(n, v)| (n.clone(), v[start..].to_vec()))
                .collect(),
            provisional: self.provisional.min(k),
        }
    }

    /// Appends rows of a frame with the same column layout.
    pub fn append(&mut self, other: FeatureFrame) -> BotResult<()> {
        if self.is_empty() && self.columns.is_empty() {
            *self = other;
            return Ok(());
        }
        let same_layout = self.columns.len() == other.columns.len()
            && self
                .columns
                .iter()
                .zip(&other.columns)
                .all(|((a, _), (b, _))| a == b);
        if !same_layout {
            return Err(BotError::generation("frame", "appended rows have a different column layout"));
        }
        if let (Some(last), Some(first)) = (self.last_ts(), other.index.first()) {
            if *first <= last {
                return Err(BotError::generation("frame", "appended rows are not newer than the frame"));
            }
        }
        self.provisional = if other.provisional == other.len() {
            self.provisional + other.provisional
        } else {
            other.provisional
        };
        self.index.extend(other.index);
        for ((_, dst), (_, src)) in self.columns.iter_mut().zip(other.columns) {
            dst.extend(src);
        }
        Ok(())
    }

    pub fn drop_front(&mut self, n: usize) {
        let n = n.min(self.len());
        self.index.drain(..n);
        for (_, v) in &mut self.columns {
            v.drain(..n);
        }
        self.provisional = self.provisional.min(self.len());
    }

    /// Removes the trailing `n` rows.
    pub fn truncate_back(&mut self, n: usize) {
        let keep = self.len().saturating_sub(n);
        self.index.truncate(keep);
        for (_, v) in &mut self.columns {
            v.truncate(keep);
        }
        self.provisional = self.provisional.min(keep);
    }

    /// Values of `names` at row `i`, in the given order.
    pub fn row(&self, i: usize, names: &[String]) -> Option<Vec<f64>> {
        if i >= self.len() {
            return None;
        }
        names
            .iter()
            .map(|n| self.column(n).map(|c| c[i]))
            .collect()
    }
}
