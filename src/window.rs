use crate::types::{Bar, Frequency};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Outcome of appending a batch of bars to the window.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AppendReport {
    pub appended: usize,
    /// Bars at or before the current last timestamp, ignored.
    pub duplicates: usize,
    /// Bars off the frequency grid, ignored.
    pub misaligned: usize,
    /// Appended bars that did not directly follow their predecessor.
    pub gaps: usize,
    pub evicted: usize,
}

/// Bounded, strictly increasing sequence of bars for one instrument/frequency.
#[derive(Clone, Debug)]
pub struct RollingWindow {
    freq: Frequency,
    capacity: usize,
    bars: VecDeque<Bar>,
}

impl RollingWindow {
    pub fn new(freq: Frequency, capacity: usize) -> Self {
        Self {
            freq,
            capacity: capacity.max(1),
            bars: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn frequency(&self) -> Frequency {
        self.freq
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last_ts(&self) -> Option<DateTime<Utc>> {
        self.bars.back().map(|b| b.ts)
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.back()
    }

    pub fn bars(&self) -> impl DoubleEndedIterator<Item = &Bar> + ExactSizeIterator {
        self.bars.iter()
    }

    /// The trailing `n` bars (or all of them), oldest first.
    pub fn tail(&self, n: usize) -> Vec<Bar> {
        let skip = self.bars.len().saturating_sub(n);
        self.bars.iter().skip(skip).cloned().collect()
    }

    /// Appends bars in order. Anything not strictly newer than the current
    /// last bar is ignored, so replaying bars is a no-op.
    pub fn append<I>(&mut self, incoming: I) -> AppendReport
    where
        I: IntoIterator<Item = Bar>,
    {
        let mut report = AppendReport::default();
        for bar in incoming {
            if !self.freq.is_aligned(bar.ts) {
                report.misaligned += 1;
                continue;
            }
            match self.bars.back() {
                Some(last) if bar.ts <= last.ts => {
                    report.duplicates += 1;
                    continue;
                }
                Some(last) if bar.ts != last.ts + self.freq.duration() => report.gaps += 1,
                _ => {}
            }
            self.bars.push_back(bar);
            report.appended += 1;
            if self.bars.len() > self.capacity {
                self.bars.pop_front();
                report.evicted += 1;
            }
        }
        report
    }

    /// Ingestion health over the trailing `span` bars: true when they are
    /// contiguous on the frequency grid.
    pub fn is_healthy(&self, span: usize) -> bool {
        let start = self.bars.len().saturating_sub(span.max(1));
        let step = self.freq.duration();
        self.bars
            .range(start..)
            .zip(self.bars.range(start..).skip(1))
            .all(|(a, b)| b.ts - a.ts == step)
    }

    /// Timestamps where a bar does not directly follow its predecessor.
    pub fn gap_starts(&self) -> Vec<DateTime<Utc>> {
        let step = self.freq.duration();
        self.bars
            .iter()
            .zip(self.bars.iter().skip(1))
            .filter(|(a, b)| b.ts - a.ts != step)
            .map(|(_, b)| b.ts)
            .collect()
    }
}
