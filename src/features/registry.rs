use crate::error::{BotError, BotResult};
use crate::features::frame::{FeatureFrame, BASE_COLUMNS};
use crate::features::generators::{GeneratorInputs, GeneratorSpec};
use crate::types::Bar;
use crate::window::RollingWindow;
use std::collections::BTreeSet;

/// Ordered, validated list of generators.
#[derive(Clone, Debug, Default)]
pub struct FeatureRegistry {
    specs: Vec<GeneratorSpec>,
}

impl FeatureRegistry {
    /// Validates the wiring: each generator may only read base columns or the
    /// outputs of generators declared before it, and no column is produced twice.
    pub fn new(specs: Vec<GeneratorSpec>) -> BotResult<Self> {
        let mut available: BTreeSet<String> = BASE_COLUMNS.iter().map(|c| c.to_string()).collect();
        for (pos, spec) in specs.iter().enumerate() {
            spec.validate()?;
            for input in spec.inputs() {
                if !available.contains(&input) {
                    return Err(BotError::Config(format!(
                        "generator #{pos} ({}) reads '{input}', which no earlier generator produces",
                        spec.name()
                    )));
                }
            }
            for output in spec.outputs() {
                if !available.insert(output.clone()) {
                    return Err(BotError::Config(format!(
                        "generator #{pos} ({}) produces '{output}', which already exists",
                        spec.name()
                    )));
                }
            }
        }
        Ok(Self { specs })
    }

    pub fn specs(&self) -> &[GeneratorSpec] {
        &self.specs
    }

    /// Rows needed so the last row of a chained computation is fully defined.
    pub fn required_history(&self) -> usize {
        1 + self
            .specs
            .iter()
            .map(|s| s.required_history().saturating_sub(1))
            .sum::<usize>()
    }

    pub fn output_columns(&self) -> Vec<String> {
        self.specs.iter().flat_map(|s| s.outputs()).collect()
    }

    pub fn needs_snapshots(&self) -> bool {
        self.specs.iter().any(|s| s.reads_snapshots())
    }

    /// Runs every generator in order, adding its columns to `frame`.
    pub fn apply(&self, frame: &mut FeatureFrame, inputs: &GeneratorInputs<'_>) -> BotResult<()> {
        for spec in &self.specs {
            for (name, values) in spec.apply(frame, inputs)? {
                frame.insert(name, values)?;
            }
        }
        Ok(())
    }

    /// Builds the derived frame for `bars`. With `last_rows`, only the trailing
    /// `last_rows` rows are returned, computed from the shortest suffix that
    /// still yields identical values.
    pub fn compute(
        &self,
        bars: &[Bar],
        inputs: &GeneratorInputs<'_>,
        last_rows: Option<usize>,
    ) -> BotResult<FeatureFrame> {
        let suffix = match last_rows {
            Some(k) => &bars[bars.len().saturating_sub(k + self.required_history() - 1)..],
            None => bars,
        };
        let mut frame = FeatureFrame::from_bars(suffix);
        self.apply(&mut frame, inputs)?;
        frame.set_provisional_rows(self.incomplete_rows(&frame, inputs));
        Ok(match last_rows {
            Some(k) => frame.tail(k),
            None => frame,
        })
    }

    /// Trailing rows whose bar has not closed inside the snapshot set yet.
    ///
    /// Snapshots are flushed in order, so once one at or after a bar's end is
    /// visible every snapshot of that bar is too.
    fn incomplete_rows(&self, frame: &FeatureFrame, inputs: &GeneratorInputs<'_>) -> usize {
        if !self.needs_snapshots() {
            return 0;
        }
        let seen = inputs.snapshots.last().map(|s| s.ts);
        let step = inputs.freq.duration();
        frame
            .index()
            .iter()
            .rev()
            .take_while(|ts| seen.map_or(true, |seen| seen < **ts + step))
            .count()
    }

    /// Brings `frame` up to date with `window`, computing the rows for bars
    /// the frame has not seen and recomputing its provisional rows. Returns
    /// the number of rows added.
    ///
    /// If a generator fails `frame` is left untouched, and the next call
    /// picks up every pending bar again.
    pub fn extend(
        &self,
        frame: &mut FeatureFrame,
        window: &RollingWindow,
        inputs: &GeneratorInputs<'_>,
    ) -> BotResult<usize> {
        let new_rows = pending_rows(frame, window);
        let redo = frame.provisional_rows();
        let rows = new_rows + redo;
        if rows > 0 {
            let suffix = window.tail(rows + self.required_history() - 1);
            let computed = self.compute(&suffix, inputs, Some(rows))?;
            frame.truncate_back(redo);
            if frame.is_empty() {
                *frame = computed;
            } else {
                frame.append(computed)?;
            }
        }
        let excess = frame.len().saturating_sub(window.len());
        frame.drop_front(excess);
        Ok(new_rows)
    }

    /// Bars in `window` that `extend` will (re)compute: the unseen ones plus
    /// the frame's provisional rows.
    pub fn rows_to_compute(&self, frame: &FeatureFrame, window: &RollingWindow) -> usize {
        pending_rows(frame, window) + frame.provisional_rows()
    }
}

fn pending_rows(frame: &FeatureFrame, window: &RollingWindow) -> usize {
    match frame.last_ts() {
        Some(last) => window.bars().rev().take_while(|b| b.ts > last).count(),
        None => window.len(),
    }
}
