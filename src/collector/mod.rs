//! Streaming order-book collector.
//!
//! Runs as its own task, independent of the trading cycle. Updates are turned
//! into [`BookSnapshot`]s, buffered, and flushed to the [`SnapshotStore`] on a
//! timer or when the buffer reaches its size threshold.

pub mod store;

pub use store::SnapshotStore;

use crate::error::BotResult;
use crate::market::MarketClient;
use crate::metrics::RuntimeMetrics;
use crate::retry::backoff_delay;
use crate::types::{BookSnapshot, BookUpdate, Instrument};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl ReconnectConfig {
    pub fn delay(&self, attempt: u32) -> Duration {
        backoff_delay(
            self.initial_backoff_ms,
            self.max_backoff_ms,
            self.backoff_multiplier,
            self.jitter_factor,
            attempt,
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    /// Book levels kept per side.
    pub depth: usize,
    pub flush_interval_ms: u64,
    /// Flush early once this many snapshots are buffered.
    pub max_buffered: usize,
    /// Hard cap while flushes keep failing; the oldest snapshots are dropped
    /// beyond it.
    pub max_retained: usize,
    /// Bound on the cycle's blocking read of stored snapshots.
    pub read_timeout_ms: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("data/orderbook"),
            depth: 10,
            flush_interval_ms: 60_000,
            max_buffered: 5_000,
            max_retained: 50_000,
            read_timeout_ms: 2_000,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Totals reported when the collector stops.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectorSummary {
    pub received: u64,
    pub duplicates: u64,
    pub flushed: u64,
    pub reconnects: u64,
    pub flush_failures: u64,
    /// Snapshots discarded because storage stayed unavailable.
    pub dropped: u64,
}

pub struct OrderBookCollector {
    client: Arc<dyn MarketClient>,
    instrument: Instrument,
    store: Arc<SnapshotStore>,
    cfg: CollectorConfig,
    metrics: Arc<RuntimeMetrics>,
    buffer: Vec<BookSnapshot>,
    last_update_id: Option<u64>,
    summary: CollectorSummary,
    /// Consecutive failed flushes and when the next attempt is allowed.
    flush_backoff: Option<(u32, Instant)>,
}

impl OrderBookCollector {
    pub fn new(
        client: Arc<dyn MarketClient>,
        instrument: Instrument,
        store: Arc<SnapshotStore>,
        cfg: CollectorConfig,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            client,
            instrument,
            store,
            cfg,
            metrics,
            buffer: Vec::new(),
            last_update_id: None,
            summary: CollectorSummary::default(),
            flush_backoff: None,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Consumes the book stream until `shutdown` resolves, reconnecting with
    /// backoff whenever the stream fails or ends. The buffer is flushed one
    /// last time before returning.
    pub async fn run<S>(mut self, shutdown: S) -> BotResult<CollectorSummary>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let interval = Duration::from_millis(self.cfg.flush_interval_ms.max(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures: u32 = 0;

        'session: loop {
            let connected = tokio::select! {
                _ = &mut shutdown => break 'session,
                r = self.client.stream_book(&self.instrument, self.cfg.depth) => r,
            };
            match connected {
                Ok(mut stream) => {
                    info!(instrument = %self.instrument, after_update = ?self.last_update_id, "book stream connected");
                    loop {
                        tokio::select! {
                            _ = &mut shutdown => break 'session,
                            _ = ticker.tick() => self.flush_when_ready().await,
                            item = stream.next() => match item {
                                Some(Ok(update)) => {
                                    failures = 0;
                                    self.ingest(update);
                                    if self.buffer.len() >= self.cfg.max_buffered {
                                        self.flush_when_ready().await;
                                    }
                                }
                                Some(Err(e)) => {
                                    warn!(instrument = %self.instrument, error = %e, "book stream failed");
                                    break;
                                }
                                None => {
                                    warn!(instrument = %self.instrument, "book stream ended");
                                    break;
                                }
                            },
                        }
                    }
                }
                Err(e) => warn!(instrument = %self.instrument, error = %e, "book stream connect failed"),
            }

            failures = failures.saturating_add(1);
            self.summary.reconnects += 1;
            self.metrics.collector_reconnect();
            let delay = self.cfg.reconnect.delay(failures);
            info!(instrument = %self.instrument, attempt = failures, delay_ms = delay.as_millis() as u64, "reconnecting book stream");
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut shutdown => break 'session,
                    _ = ticker.tick() => self.flush_when_ready().await,
                    _ = &mut sleep => break,
                }
            }
        }

        self.flush().await;
        info!(
            instrument = %self.instrument,
            received = self.summary.received,
            duplicates = self.summary.duplicates,
            flushed = self.summary.flushed,
            dropped = self.summary.dropped,
            "collector stopped"
        );
        Ok(self.summary)
    }

    /// Buffers `update` unless its id was already seen.
    pub fn ingest(&mut self, update: BookUpdate) -> bool {
        self.summary.received += 1;
        if matches!(self.last_update_id, Some(last) if update.update_id <= last) {
            self.summary.duplicates += 1;
            return false;
        }
        self.last_update_id = Some(update.update_id);
        self.buffer.push(BookSnapshot::from_update(&update, self.cfg.depth));
        let excess = self.buffer.len().saturating_sub(self.cfg.max_retained.max(1));
        if excess > 0 {
            self.buffer.drain(..excess);
            self.summary.dropped += excess as u64;
            self.metrics.snapshots_dropped(excess);
            warn!(
                instrument = %self.instrument,
                dropped = excess,
                retained = self.buffer.len(),
                "snapshot buffer full, oldest snapshots dropped"
            );
        }
        true
    }

    /// Flushes unless a recent failure put flushing on backoff.
    async fn flush_when_ready(&mut self) {
        if matches!(self.flush_backoff, Some((_, until)) if Instant::now() < until) {
            return;
        }
        self.flush().await;
    }

    /// Writes the buffer on the blocking pool. On failure the snapshots stay
    /// buffered and timer or size flushes back off with the reconnect delays.
    pub async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.buffer);
        let store = self.store.clone();
        let instrument = self.instrument.clone();
        let result = tokio::task::spawn_blocking(move || {
            let written = store.write(&instrument, &batch);
            (written, batch)
        })
        .await;
        match result {
            Ok((Ok(_), batch)) => {
                self.flush_backoff = None;
                self.summary.flushed += batch.len() as u64;
                self.metrics.snapshots_flushed(batch.len());
            }
            Ok((Err(e), mut batch)) => {
                let attempt = self.flush_backoff.map_or(1, |(n, _)| n.saturating_add(1));
                let delay = self.cfg.reconnect.delay(attempt);
                self.flush_backoff = Some((attempt, Instant::now() + delay));
                self.summary.flush_failures += 1;
                self.metrics.flush_failure();
                error!(
                    instrument = %self.instrument,
                    error = %e,
                    rows = batch.len(),
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "snapshot flush failed"
                );
                batch.append(&mut self.buffer);
                self.buffer = batch;
            }
            Err(e) => error!(instrument = %self.instrument, error = %e, "snapshot flush task panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::sim::SimulatedMarket;
    use crate::types::{BookLevel, Frequency};
    use chrono::{TimeZone, Utc};

    fn update(id: u64) -> BookUpdate {
        BookUpdate {
            update_id: id,
            ts: Utc.timestamp_opt(1_700_000_000 + id as i64, 0).unwrap(),
            bids: vec![BookLevel { price: 99.0, qty: 1.0 }],
            asks: vec![BookLevel { price: 101.0, qty: 1.0 }],
        }
    }

    #[tokio::test]
    async fn ingest_drops_replayed_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SnapshotStore::open(dir.path(), 5).unwrap());
        let sim = Arc::new(SimulatedMarket::new(Frequency::minutes(1), "BTC", "USDT"));
        let mut c = OrderBookCollector::new(
            sim,
            Instrument("BTCUSDT".into()),
            store.clone(),
            CollectorConfig::default(),
            Arc::new(RuntimeMetrics::new()),
        );
        assert!(c.ingest(update(1)));
        assert!(c.ingest(update(2)));
        assert!(!c.ingest(update(2)));
        assert!(!c.ingest(update(1)));
        assert_eq!(c.buffered(), 2);

        c.flush().await;
        assert_eq!(c.buffered(), 0);
        assert_eq!(store.list(&Instrument("BTCUSDT".into())).unwrap().len(), 1);
    }
}
