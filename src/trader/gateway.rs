//! Where the trader's orders go: the real market client, or a shadow recorder
//! that never touches the venue's order endpoints.

use crate::error::{BotError, BotResult};
use crate::market::MarketClient;
use crate::retry::RetryPolicy;
use crate::types::*;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place(&self, order: &LimitOrder) -> BotResult<OrderId>;

    async fn cancel(&self, instrument: &Instrument, order_id: &OrderId) -> BotResult<()>;

    async fn status(&self, instrument: &Instrument, order_id: &OrderId) -> BotResult<OrderStatus>;

    async fn balances(&self) -> BotResult<Balances>;

    fn is_shadow(&self) -> bool {
        false
    }
}

/// Sends orders to the market client.
///
/// Placement is attempted once under the call timeout: a lost response may
/// still have created the order, so a blind retry could double the position.
/// Reads and cancels are idempotent and use the full retry policy.
pub struct LiveGateway {
    client: Arc<dyn MarketClient>,
    retry: RetryPolicy,
}

impl LiveGateway {
    pub fn new(client: Arc<dyn MarketClient>, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }
}

#[async_trait]
impl OrderGateway for LiveGateway {
    async fn place(&self, order: &LimitOrder) -> BotResult<OrderId> {
        let once = RetryPolicy {
            max_attempts: 1,
            ..self.retry.clone()
        };
        let client = &self.client;
        once.run("place_limit_order", || client.place_limit_order(order))
            .await
            .map_err(|e| BotError::execution("place_limit_order", e.to_string()))
    }

    async fn cancel(&self, instrument: &Instrument, order_id: &OrderId) -> BotResult<()> {
        let client = &self.client;
        self.retry
            .run("cancel_order", || client.cancel_order(instrument, order_id))
            .await
            .map_err(|e| BotError::execution("cancel_order", e.to_string()))
    }

    async fn status(&self, instrument: &Instrument, order_id: &OrderId) -> BotResult<OrderStatus> {
        let client = &self.client;
        self.retry
            .run("get_order_status", || client.get_order_status(instrument, order_id))
            .await
            .map_err(|e| BotError::execution("get_order_status", e.to_string()))
    }

    async fn balances(&self) -> BotResult<Balances> {
        let client = &self.client;
        self.retry
            .run("get_balances", || client.get_balances())
            .await
            .map_err(|e| BotError::execution("get_balances", e.to_string()))
    }
}

/// Records orders instead of sending them. Every order counts as filled at its
/// limit price, and balances are virtual.
pub struct ShadowGateway {
    base_asset: String,
    quote_asset: String,
    orders: DashMap<OrderId, (LimitOrder, OrderStatus)>,
    balances: Mutex<Balances>,
    seq: AtomicU64,
}

impl ShadowGateway {
    pub fn new(base_asset: impl Into<String>, quote_asset: impl Into<String>, starting_quote: f64) -> Self {
        let quote_asset = quote_asset.into();
        let mut balances = Balances::default();
        balances.set(&quote_asset, starting_quote);
        Self {
            base_asset: base_asset.into(),
            quote_asset,
            orders: DashMap::new(),
            balances: Mutex::new(balances),
            seq: AtomicU64::new(0),
        }
    }

    pub fn recorded_orders(&self) -> Vec<LimitOrder> {
        let mut orders: Vec<(OrderId, LimitOrder)> =
            self.orders.iter().map(|e| (e.key().clone(), e.value().0.clone())).collect();
        orders.sort_by_key(|(id, _)| id.0.trim_start_matches("shadow:").parse::<u64>().unwrap_or(0));
        orders.into_iter().map(|(_, o)| o).collect()
    }
}

#[async_trait]
impl OrderGateway for ShadowGateway {
    async fn place(&self, order: &LimitOrder) -> BotResult<OrderId> {
        let order_id = OrderId(format!("shadow:{}", self.seq.fetch_add(1, Ordering::SeqCst) + 1));
        {
            let mut balances = self.balances.lock();
            let notional = order.qty * order.price;
            balances.add(&self.base_asset, order.side.sign() * order.qty);
            balances.add(&self.quote_asset, -order.side.sign() * notional);
        }
        info!(
            order_id = %order_id,
            side = %order.side,
            price = order.price,
            qty = order.qty,
            "shadow order recorded"
        );
        self.orders.insert(
            order_id.clone(),
            (
                order.clone(),
                OrderStatus::Filled {
                    filled_qty: order.qty,
                    avg_price: order.price,
                },
            ),
        );
        Ok(order_id)
    }

    async fn cancel(&self, _instrument: &Instrument, order_id: &OrderId) -> BotResult<()> {
        if self.orders.contains_key(order_id) {
            Ok(())
        } else {
            Err(BotError::execution("cancel_order", format!("unknown shadow order {order_id}")))
        }
    }

    async fn status(&self, _instrument: &Instrument, order_id: &OrderId) -> BotResult<OrderStatus> {
        self.orders
            .get(order_id)
            .map(|e| e.value().1.clone())
            .ok_or_else(|| BotError::execution("get_order_status", format!("unknown shadow order {order_id}")))
    }

    async fn balances(&self) -> BotResult<Balances> {
        Ok(self.balances.lock().clone())
    }

    fn is_shadow(&self) -> bool {
        true
    }
}
