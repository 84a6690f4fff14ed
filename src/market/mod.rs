use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;

use crate::types::{Balances, Bar, BookUpdate, Frequency, Instrument, LimitOrder, OrderId, OrderStatus};

pub mod sim;

pub type BookStream = BoxStream<'static, anyhow::Result<BookUpdate>>;

/// Abstract exchange API. The wire protocol lives behind this trait.
#[async_trait]
pub trait MarketClient: Send + Sync {
    /// Bars with open time strictly after `since` (or the most recent ones when
    /// `since` is `None`), oldest first, at most `limit` of them.
    async fn get_bars(
        &self,
        instrument: &Instrument,
        freq: Frequency,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> anyhow::Result<Vec<Bar>>;

    async fn stream_book(&self, instrument: &Instrument, depth: usize) -> anyhow::Result<BookStream>;

    async fn place_limit_order(&self, order: &LimitOrder) -> anyhow::Result<OrderId>;

    async fn cancel_order(&self, instrument: &Instrument, order_id: &OrderId) -> anyhow::Result<()>;

    async fn get_order_status(&self, instrument: &Instrument, order_id: &OrderId) -> anyhow::Result<OrderStatus>;

    async fn get_balances(&self) -> anyhow::Result<Balances>;
}
