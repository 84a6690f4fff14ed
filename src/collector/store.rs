//! Parquet storage for order-book snapshots.
//!
//! Layout: `{dir}/{instrument}_{window_start_ms}.parquet`, one file per flush.
//! Every write goes to `{name}.parquet.tmp` first and is renamed into place, so
//! a reader never sees a half-written file. Leftover `.tmp` files from a crash
//! are removed when the store is opened.

use crate::error::{BotError, BotResult};
use crate::types::{BookLevel, BookSnapshot, Instrument};
use chrono::{DateTime, Utc};
use polars::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct SnapshotStore {
    dir: PathBuf,
    depth: usize,
}

impl SnapshotStore {
    pub fn open(dir: impl Into<PathBuf>, depth: usize) -> BotResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| storage(format!("create {}: {e}", dir.display())))?;
        let mut removed = 0usize;
        let entries = fs::read_dir(&dir).map_err(|e| storage(format!("read dir: {e}")))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "could not remove stale temp file"),
                }
            }
        }
        if removed > 0 {
            info!(dir = %dir.display(), removed, "removed stale snapshot temp files");
        }
        Ok(Self {
            dir,
            depth: depth.max(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Writes one batch atomically. Returns `None` for an empty batch.
    pub fn write(&self, instrument: &Instrument, snapshots: &[BookSnapshot]) -> BotResult<Option<PathBuf>> {
        let Some(first) = snapshots.first() else {
            return Ok(None);
        };
        let mut start_ms = first.ts.timestamp_millis();
        let mut path = self.path_for(instrument, start_ms);
        while path.exists() {
            start_ms += 1;
            path = self.path_for(instrument, start_ms);
        }
        let tmp = path.with_extension("parquet.tmp");

        let mut df = self.to_dataframe(snapshots)?;
        let mut file = fs::File::create(&tmp).map_err(|e| storage(format!("create {}: {e}", tmp.display())))?;
        if let Err(e) = ParquetWriter::new(&mut file).finish(&mut df) {
            let _ = fs::remove_file(&tmp);
            return Err(storage(format!("write parquet: {e}")));
        }
        // Durable before it becomes visible under the final name.
        if let Err(e) = file.sync_all() {
            let _ = fs::remove_file(&tmp);
            return Err(storage(format!("sync {}: {e}", tmp.display())));
        }
        drop(file);
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            storage(format!("atomic rename failed: {e}"))
        })?;
        debug!(path = %path.display(), rows = snapshots.len(), "snapshot batch written");
        Ok(Some(path))
    }

    /// Finished files for `instrument` as `(window_start_ms, path)`, oldest first.
    pub fn list(&self, instrument: &Instrument) -> BotResult<Vec<(i64, PathBuf)>> {
        let prefix = format!("{}_", instrument.0);
        let mut files = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| storage(format!("read dir: {e}")))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("parquet") {
                continue;
            }
            let start = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.strip_prefix(&prefix))
                .and_then(|s| s.parse::<i64>().ok());
            if let Some(start) = start {
                files.push((start, path));
            }
        }
        files.sort();
        Ok(files)
    }

    pub fn load_file(&self, path: &Path) -> BotResult<Vec<BookSnapshot>> {
        let file = fs::File::open(path).map_err(|e| storage(format!("open {}: {e}", path.display())))?;
        let df = ParquetReader::new(file)
            .finish()
            .map_err(|e| storage(format!("read {}: {e}", path.display())))?;
        self.from_dataframe(&df)
    }

    /// Every stored snapshot for `instrument` with `from <= ts < to`, in order.
    pub fn load_range(
        &self,
        instrument: &Instrument,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BotResult<Vec<BookSnapshot>> {
        let files = self.list(instrument)?;
        let (from_ms, to_ms) = (from.timestamp_millis(), to.timestamp_millis());
        let mut out = Vec::new();
        for (i, (start, path)) in files.iter().enumerate() {
            if *start >= to_ms {
                break;
            }
            // A file ends before the next one starts.
            if let Some((next_start, _)) = files.get(i + 1) {
                if *next_start <= from_ms {
                    continue;
                }
            }
            out.extend(
                self.load_file(path)?
                    .into_iter()
                    .filter(|s| s.ts >= from && s.ts < to),
            );
        }
        out.sort_by_key(|s| (s.ts, s.update_id));
        Ok(out)
    }

    fn path_for(&self, instrument: &Instrument, start_ms: i64) -> PathBuf {
        self.dir.join(format!("{}_{start_ms}.parquet", instrument.0))
    }

    fn to_dataframe(&self, snapshots: &[BookSnapshot]) -> BotResult<DataFrame> {
        let level = |levels: &[BookLevel], i: usize, price: bool| -> f64 {
            levels
                .get(i)
                .map(|l| if price { l.price } else { l.qty })
                .unwrap_or(f64::NAN)
        };
        let mut columns = vec![
            Column::new(
                "timestamp".into(),
                snapshots.iter().map(|s| s.ts.timestamp_micros()).collect::<Vec<i64>>(),
            ),
            Column::new(
                "update_id".into(),
                snapshots.iter().map(|s| s.update_id).collect::<Vec<u64>>(),
            ),
        ];
        for (side, price) in [("bid_price", true), ("bid_qty", false), ("ask_price", true), ("ask_qty", false)] {
            for i in 0..self.depth {
                let values: Vec<f64> = snapshots
                    .iter()
                    .map(|s| {
                        let levels = if side.starts_with("bid") { &s.bids } else { &s.asks };
                        level(levels, i, price)
                    })
                    .collect();
                columns.push(Column::new(format!("{side}_{i}").into(), values));
            }
        }
        columns.push(Column::new(
            "mid_price".into(),
            snapshots.iter().map(|s| s.mid_price).collect::<Vec<f64>>(),
        ));
        columns.push(Column::new(
            "spread".into(),
            snapshots.iter().map(|s| s.spread).collect::<Vec<f64>>(),
        ));
        DataFrame::new(columns).map_err(|e| storage(format!("dataframe creation: {e}")))
    }

    fn from_dataframe(&self, df: &DataFrame) -> BotResult<Vec<BookSnapshot>> {
        let col_err = |e: PolarsError| storage(format!("column read: {e}"));
        let ts = df.column("timestamp").map_err(col_err)?.i64().map_err(col_err)?;
        let ids = df.column("update_id").map_err(col_err)?.u64().map_err(col_err)?;
        let mid = df.column("mid_price").map_err(col_err)?.f64().map_err(col_err)?;
        let spread = df.column("spread").map_err(col_err)?.f64().map_err(col_err)?;

        // Files written with a smaller depth simply have fewer level columns.
        let mut sides: Vec<Vec<(&Float64Chunked, &Float64Chunked)>> = vec![Vec::new(), Vec::new()];
        for (slot, side) in ["bid", "ask"].iter().enumerate() {
            for i in 0..self.depth {
                let (Ok(p), Ok(q)) = (
                    df.column(&format!("{side}_price_{i}")),
                    df.column(&format!("{side}_qty_{i}")),
                ) else {
                    break;
                };
                sides[slot].push((p.f64().map_err(col_err)?, q.f64().map_err(col_err)?));
            }
        }

        let mut out = Vec::with_capacity(df.height());
        for row in 0..df.height() {
            let micros = ts
                .get(row)
                .ok_or_else(|| storage(format!("null timestamp at row {row}")))?;
            let ts = DateTime::<Utc>::from_timestamp_micros(micros)
                .ok_or_else(|| storage(format!("timestamp out of range at row {row}")))?;
            let levels = |cols: &[(&Float64Chunked, &Float64Chunked)]| -> Vec<BookLevel> {
                cols.iter()
                    .map_while(|(p, q)| match (p.get(row), q.get(row)) {
                        (Some(price), Some(qty)) if price.is_finite() => Some(BookLevel { price, qty }),
                        _ => None,
                    })
                    .collect()
            };
            out.push(BookSnapshot {
                ts,
                update_id: ids
                    .get(row)
                    .ok_or_else(|| storage(format!("null update_id at row {row}")))?,
                bids: levels(&sides[0]),
                asks: levels(&sides[1]),
                mid_price: mid.get(row).unwrap_or(f64::NAN),
                spread: spread.get(row).unwrap_or(f64::NAN),
            });
        }
        Ok(out)
    }
}

fn storage(msg: String) -> BotError {
    BotError::Storage(msg)
}
