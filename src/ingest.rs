//! Bar ingestion: bounded backfill at startup, incremental fetch per cycle.

use crate::error::{BotError, BotResult};
use crate::market::MarketClient;
use crate::retry::RetryPolicy;
use crate::types::{Bar, Frequency, Instrument};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_PAGE_LIMIT: usize = 1_000;

#[derive(Clone)]
pub struct Ingestor {
    client: Arc<dyn MarketClient>,
    instrument: Instrument,
    freq: Frequency,
    train_length: usize,
    page_limit: usize,
    retry: RetryPolicy,
}

impl Ingestor {
    pub fn new(
        client: Arc<dyn MarketClient>,
        instrument: Instrument,
        freq: Frequency,
        train_length: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            instrument,
            freq,
            train_length,
            page_limit: DEFAULT_PAGE_LIMIT,
            retry,
        }
    }

    pub fn with_page_limit(mut self, page_limit: usize) -> Self {
        self.page_limit = page_limit.max(1);
        self
    }

    pub fn frequency(&self) -> Frequency {
        self.freq
    }

    /// Fetch the most recent `train_length` completed bars.
    pub async fn backfill(&self, now: DateTime<Utc>) -> BotResult<Vec<Bar>> {
        let lookback = self.freq.duration() * (self.train_length as i32 + 1);
        let since = self.freq.floor(now) - lookback;
        let mut bars = self.fetch_pages(since, now).await?;
        let skip = bars.len().saturating_sub(self.train_length);
        bars.drain(..skip);
        debug!(instrument = %self.instrument, bars = bars.len(), "backfill complete");
        Ok(bars)
    }

    /// Completed bars strictly after `last`. Falls back to a backfill when the
    /// window is still empty.
    pub async fn fetch_since(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> BotResult<Vec<Bar>> {
        match last {
            Some(last) => self.fetch_pages(last, now).await,
            None => self.backfill(now).await,
        }
    }

    async fn fetch_pages(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> BotResult<Vec<Bar>> {
        let max_pages = self.train_length / self.page_limit + 2;
        let mut out: Vec<Bar> = Vec::new();
        let mut cursor = since;
        for _ in 0..max_pages {
            let page = self.fetch_page(cursor).await?;
            let full_page = page.len() >= self.page_limit;
            let clean = self.sanitize(page, cursor, now);
            match clean.last() {
                Some(last) => cursor = last.ts,
                None => break,
            }
            out.extend(clean);
            if !full_page {
                break;
            }
        }
        Ok(out)
    }

    async fn fetch_page(&self, since: DateTime<Utc>) -> BotResult<Vec<Bar>> {
        let client = &self.client;
        let instrument = &self.instrument;
        let freq = self.freq;
        let limit = self.page_limit;
        self.retry
            .run("get_bars", || client.get_bars(instrument, freq, Some(since), limit))
            .await
            .map_err(|e| BotError::Ingestion(e.to_string()))
    }

    /// Sort, drop anything already known, off-grid or still forming, and
    /// deduplicate by timestamp (first occurrence wins).
    pub fn sanitize(&self, mut bars: Vec<Bar>, after: DateTime<Utc>, now: DateTime<Utc>) -> Vec<Bar> {
        bars.sort_by_key(|b| b.ts);
        bars.dedup_by_key(|b| b.ts);

        let before = bars.len();
        bars.retain(|b| b.ts > after);
        let stale = before - bars.len();

        let before = bars.len();
        bars.retain(|b| self.freq.is_aligned(b.ts));
        let misaligned = before - bars.len();

        let before = bars.len();
        bars.retain(|b| b.close_time(self.freq) <= now);
        let partial = before - bars.len();

        if misaligned > 0 {
            warn!(instrument = %self.instrument, misaligned, "rejected bars off the frequency grid");
        }
        if stale > 0 || partial > 0 {
            debug!(instrument = %self.instrument, stale, partial, "dropped stale or still-forming bars");
        }
        bars
    }
}
