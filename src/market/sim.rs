use crate::market::{BookStream, MarketClient};
use crate::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// How newly placed orders get filled.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FillBehavior {
    /// Filled in full at the limit price as soon as it is placed.
    Immediate,
    /// Stays `New` until [`SimulatedMarket::fill_order`] is called.
    Never,
    /// Fills the given fraction right away, the rest never.
    Partial(f64),
}

/// One item of a scripted book session.
#[derive(Clone, Debug)]
pub enum FeedItem {
    Update(BookUpdate),
    Disconnect,
}

enum BookFeed {
    Scripted(VecDeque<Vec<FeedItem>>),
    Synthetic { interval: Duration },
}

#[derive(Clone, Debug)]
struct SimOrder {
    order: LimitOrder,
    status: OrderStatus,
}

struct Walk {
    rng: StdRng,
    last_close: f64,
}

/// In-memory market used for paper runs and tests.
///
/// Bars are either pushed explicitly or synthesized as a random walk up to the
/// last completed grid slot. Orders, fills and balances are tracked locally,
/// and every order entry point is counted so callers can assert on traffic.
pub struct SimulatedMarket {
    pub base_asset: String,
    pub quote_asset: String,
    freq: Frequency,
    bars: Mutex<Vec<Bar>>,
    walk: Mutex<Option<Walk>>,
    orders: DashMap<OrderId, SimOrder>,
    fill_behavior: Mutex<FillBehavior>,
    balances: Mutex<Balances>,
    feed: Mutex<BookFeed>,
    bar_delay: Mutex<Duration>,
    failing_bar_calls: AtomicU32,
    failing_order_calls: AtomicU32,
    order_seq: AtomicU64,
    place_calls: AtomicU64,
    cancel_calls: AtomicU64,
    status_calls: AtomicU64,
    bar_calls: AtomicU64,
    stream_calls: AtomicU64,
}

impl SimulatedMarket {
    pub fn new(freq: Frequency, base_asset: impl Into<String>, quote_asset: impl Into<String>) -> Self {
        Self {
            base_asset: base_asset.into(),
            quote_asset: quote_asset.into(),
            freq,
            bars: Mutex::new(Vec::new()),
            walk: Mutex::new(None),
            orders: DashMap::new(),
            fill_behavior: Mutex::new(FillBehavior::Never),
            balances: Mutex::new(Balances::default()),
            feed: Mutex::new(BookFeed::Scripted(VecDeque::new())),
            bar_delay: Mutex::new(Duration::ZERO),
            failing_bar_calls: AtomicU32::new(0),
            failing_order_calls: AtomicU32::new(0),
            order_seq: AtomicU64::new(0),
            place_calls: AtomicU64::new(0),
            cancel_calls: AtomicU64::new(0),
            status_calls: AtomicU64::new(0),
            bar_calls: AtomicU64::new(0),
            stream_calls: AtomicU64::new(0),
        }
    }

    /// Synthesize bars as a seeded random walk whenever they are requested.
    pub fn with_random_walk(self, start_price: f64, seed: u64) -> Self {
        *self.walk.lock() = Some(Walk {
            rng: StdRng::seed_from_u64(seed),
            last_close: start_price,
        });
        self
    }

    /// Serve an endless synthetic book stream, one update per `interval`.
    pub fn with_synthetic_book(self, interval: Duration) -> Self {
        *self.feed.lock() = BookFeed::Synthetic { interval };
        self
    }

    pub fn push_bars(&self, new: impl IntoIterator<Item = Bar>) {
        let mut bars = self.bars.lock();
        bars.extend(new);
        bars.sort_by_key(|b| b.ts);
    }

    /// Queue one connection's worth of book updates. Each `stream_book` call
    /// consumes one session; when none are left the stream stays silent.
    pub fn push_book_session(&self, items: Vec<FeedItem>) {
        let mut feed = self.feed.lock();
        match &mut *feed {
            BookFeed::Scripted(sessions) => sessions.push_back(items),
            BookFeed::Synthetic { .. } => *feed = BookFeed::Scripted(VecDeque::from([items])),
        }
    }

    pub fn set_fill_behavior(&self, behavior: FillBehavior) {
        *self.fill_behavior.lock() = behavior;
    }

    pub fn set_balance(&self, asset: &str, amount: f64) {
        self.balances.lock().set(asset, amount);
    }

    pub fn set_bar_delay(&self, delay: Duration) {
        *self.bar_delay.lock() = delay;
    }

    /// The next `n` calls to `get_bars` fail.
    pub fn fail_next_bar_calls(&self, n: u32) {
        self.failing_bar_calls.store(n, Ordering::SeqCst);
    }

    /// The next `n` order placement/cancel calls fail.
    pub fn fail_next_order_calls(&self, n: u32) {
        self.failing_order_calls.store(n, Ordering::SeqCst);
    }

    /// Complete an open order at its limit price.
    pub fn fill_order(&self, order_id: &OrderId) -> bool {
        let Some(mut entry) = self.orders.get_mut(order_id) else {
            return false;
        };
        if entry.status.is_terminal() {
            return false;
        }
        let remaining = entry.order.qty - entry.status.filled_qty();
        entry.status = OrderStatus::Filled {
            filled_qty: entry.order.qty,
            avg_price: entry.order.price,
        };
        let order = entry.order.clone();
        drop(entry);
        self.apply_fill(&order, remaining);
        true
    }

    /// Mark an open order as cancelled by the venue.
    pub fn cancel_externally(&self, order_id: &OrderId) -> bool {
        let Some(mut entry) = self.orders.get_mut(order_id) else {
            return false;
        };
        if entry.status.is_terminal() {
            return false;
        }
        entry.status = OrderStatus::Cancelled {
            filled_qty: entry.status.filled_qty(),
            avg_price: entry.order.price,
        };
        true
    }

    pub fn balances_now(&self) -> Balances {
        self.balances.lock().clone()
    }

    pub fn order(&self, order_id: &OrderId) -> Option<(LimitOrder, OrderStatus)> {
        self.orders
            .get(order_id)
            .map(|o| (o.order.clone(), o.status.clone()))
    }

    pub fn place_calls(&self) -> u64 {
        self.place_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> u64 {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> u64 {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn bar_calls(&self) -> u64 {
        self.bar_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> u64 {
        self.stream_calls.load(Ordering::SeqCst)
    }

    fn apply_fill(&self, order: &LimitOrder, qty: f64) {
        if qty <= 0.0 {
            return;
        }
        let mut balances = self.balances.lock();
        let notional = qty * order.price;
        match order.side {
            Side::Buy => {
                balances.add(&self.base_asset, qty);
                balances.add(&self.quote_asset, -notional);
            }
            Side::Sell => {
                balances.add(&self.base_asset, -qty);
                balances.add(&self.quote_asset, notional);
            }
        }
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn extend_walk(&self, now: DateTime<Utc>) {
        let mut walk_guard = self.walk.lock();
        let Some(walk) = walk_guard.as_mut() else {
            return;
        };
        let mut bars = self.bars.lock();
        // last slot whose close time is not in the future
        let last_complete = self.freq.floor(now) - self.freq.duration();
        let mut next = match bars.last() {
            Some(b) => b.ts + self.freq.duration(),
            None => last_complete - self.freq.duration() * 1_000,
        };
        while next <= last_complete {
            let open = walk.last_close;
            let close = open * (1.0 + walk.rng.gen_range(-0.003..=0.003));
            let high = open.max(close) * (1.0 + walk.rng.gen_range(0.0..=0.001));
            let low = open.min(close) * (1.0 - walk.rng.gen_range(0.0..=0.001));
            bars.push(Bar {
                ts: next,
                open,
                high,
                low,
                close,
                volume: walk.rng.gen_range(10.0..=100.0),
            });
            walk.last_close = close;
            next += self.freq.duration();
        }
    }
}

fn synthetic_book_stream(interval: Duration, seed: u64) -> BookStream {
    let start_id = Utc::now().timestamp_millis().max(0) as u64;
    let state = (start_id, 100.0f64, StdRng::seed_from_u64(seed));
    stream::unfold(state, move |(id, mid, mut rng)| async move {
        tokio::time::sleep(interval).await;
        let mid = mid * (1.0 + rng.gen_range(-0.0005..=0.0005));
        let half_spread = mid * 0.0001;
        let level = |i: usize, sign: f64, rng: &mut StdRng| BookLevel {
            price: mid + sign * (half_spread + i as f64 * half_spread),
            qty: rng.gen_range(0.1..=5.0),
        };
        let bids = (0..10).map(|i| level(i, -1.0, &mut rng)).collect();
        let asks = (0..10).map(|i| level(i, 1.0, &mut rng)).collect();
        let update = BookUpdate {
            update_id: id + 1,
            ts: Utc::now(),
            bids,
            asks,
        };
        Some((Ok(update), (id + 1, mid, rng)))
    })
    .boxed()
}

#[async_trait]
impl MarketClient for SimulatedMarket {
    async fn get_bars(
        &self,
        _instrument: &Instrument,
        freq: Frequency,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> anyhow::Result<Vec<Bar>> {
        self.bar_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.bar_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if Self::take_failure(&self.failing_bar_calls) {
            anyhow::bail!("simulated bar endpoint failure");
        }
        anyhow::ensure!(freq == self.freq, "simulated market only serves {}", self.freq);
        self.extend_walk(Utc::now());

        let bars = self.bars.lock();
        let out: Vec<Bar> = match since {
            Some(since) => bars.iter().filter(|b| b.ts > since).take(limit).cloned().collect(),
            None => {
                let skip = bars.len().saturating_sub(limit);
                bars[skip..].to_vec()
            }
        };
        Ok(out)
    }

    async fn stream_book(&self, _instrument: &Instrument, _depth: usize) -> anyhow::Result<BookStream> {
        let n = self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let mut feed = self.feed.lock();
        match &mut *feed {
            BookFeed::Synthetic { interval } => Ok(synthetic_book_stream(*interval, n)),
            BookFeed::Scripted(sessions) => match sessions.pop_front() {
                Some(items) => {
                    let mut out: Vec<anyhow::Result<BookUpdate>> = Vec::with_capacity(items.len());
                    for item in items {
                        match item {
                            FeedItem::Update(u) => out.push(Ok(u)),
                            FeedItem::Disconnect => {
                                out.push(Err(anyhow::anyhow!("simulated disconnect")));
                                break;
                            }
                        }
                    }
                    Ok(stream::iter(out).boxed())
                }
                None => Ok(stream::pending().boxed()),
            },
        }
    }

    async fn place_limit_order(&self, order: &LimitOrder) -> anyhow::Result<OrderId> {
        self.place_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_order_calls) {
            anyhow::bail!("simulated order endpoint failure");
        }
        anyhow::ensure!(order.qty > 0.0 && order.price > 0.0, "invalid order {order:?}");
        let order_id = OrderId(format!("sim:{}", self.order_seq.fetch_add(1, Ordering::SeqCst) + 1));

        let behavior = *self.fill_behavior.lock();
        let (status, filled) = match behavior {
            FillBehavior::Immediate => (
                OrderStatus::Filled {
                    filled_qty: order.qty,
                    avg_price: order.price,
                },
                order.qty,
            ),
            FillBehavior::Never => (OrderStatus::New, 0.0),
            FillBehavior::Partial(frac) => {
                let q = order.qty * frac.clamp(0.0, 1.0);
                (
                    OrderStatus::PartiallyFilled {
                        filled_qty: q,
                        avg_price: order.price,
                    },
                    q,
                )
            }
        };
        self.apply_fill(order, filled);
        self.orders.insert(
            order_id.clone(),
            SimOrder {
                order: order.clone(),
                status,
            },
        );
        Ok(order_id)
    }

    async fn cancel_order(&self, _instrument: &Instrument, order_id: &OrderId) -> anyhow::Result<()> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_order_calls) {
            anyhow::bail!("simulated cancel endpoint failure");
        }
        let mut entry = self
            .orders
            .get_mut(order_id)
            .ok_or_else(|| anyhow::anyhow!("unknown order {order_id}"))?;
        if !entry.status.is_terminal() {
            entry.status = OrderStatus::Cancelled {
                filled_qty: entry.status.filled_qty(),
                avg_price: entry.order.price,
            };
        }
        Ok(())
    }

    async fn get_order_status(&self, _instrument: &Instrument, order_id: &OrderId) -> anyhow::Result<OrderStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.orders
            .get(order_id)
            .map(|o| o.status.clone())
            .ok_or_else(|| anyhow::anyhow!("unknown order {order_id}"))
    }

    async fn get_balances(&self) -> anyhow::Result<Balances> {
        Ok(self.balances.lock().clone())
    }
}
