//! Order execution state machine.
//!
//! Each [`Trader::apply`] call runs three steps in order:
//! 1. reconcile with the market (order status while an order is pending,
//!    balances while idle), market truth wins;
//! 2. expire a pending order past its timeout (cancel, then re-read);
//! 3. act on the signal, if the current phase accepts it.
//!
//! Execution faults stop the remaining steps and leave the phase unchanged, so
//! the next cycle reconciles again instead of assuming success.

pub mod gateway;
pub mod state;

pub use gateway::{LiveGateway, OrderGateway, ShadowGateway};
pub use state::{transition, Phase, PendingOrder, PositionState, Reconciliation, TradeEvent, TransitionRecord};

use crate::error::{BotError, BotResult};
use crate::notify::{deliver, EventType, NoopSink, Notification, NotificationSink};
use crate::signal::Signal;
use crate::types::*;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraderConfig {
    pub base_asset: String,
    pub quote_asset: String,
    /// Share of the free quote balance committed per entry (0.0-1.0].
    pub percentage_used: f64,
    pub max_quote_per_trade: f64,
    pub min_qty: f64,
    pub qty_step: f64,
    pub price_tick: f64,
    /// Limit offset from the last close: below for buys, above for sells.
    pub limit_price_adjustment: f64,
    /// Age after which a pending order is cancelled. Expiry is checked when a
    /// cycle runs, so the effective timeout rounds up to the next cycle: with
    /// 5m bars a 60s timeout acts after about 5m.
    pub order_timeout_secs: i64,
    pub shadow: bool,
    pub shadow_starting_quote: f64,
}

impl Default for TraderConfig {
    fn default() -> Self {
        Self {
            base_asset: "BTC".to_string(),
            quote_asset: "USDT".to_string(),
            percentage_used: 0.95,
            max_quote_per_trade: 1_000.0,
            min_qty: 0.0001,
            qty_step: 0.0001,
            price_tick: 0.01,
            limit_price_adjustment: 0.0005,
            order_timeout_secs: 60,
            shadow: false,
            shadow_starting_quote: 1_000.0,
        }
    }
}

impl TraderConfig {
    pub fn validate(&self) -> BotResult<()> {
        let bad = |msg: &str| Err(BotError::Config(format!("trader: {msg}")));
        if !(self.percentage_used > 0.0 && self.percentage_used <= 1.0) {
            return bad("percentage_used must be in (0, 1]");
        }
        if self.max_quote_per_trade <= 0.0 {
            return bad("max_quote_per_trade must be positive");
        }
        if self.min_qty <= 0.0 || self.qty_step <= 0.0 || self.price_tick <= 0.0 {
            return bad("min_qty, qty_step and price_tick must be positive");
        }
        if !(0.0..0.5).contains(&self.limit_price_adjustment) {
            return bad("limit_price_adjustment must be in [0, 0.5)");
        }
        if self.order_timeout_secs <= 0 {
            return bad("order_timeout_secs must be positive");
        }
        if self.base_asset.is_empty() || self.quote_asset.is_empty() {
            return bad("base_asset and quote_asset are required");
        }
        Ok(())
    }

    pub fn order_timeout(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.order_timeout_secs)
    }
}

/// Rounds down to a multiple of `step`, tolerating float noise just below it.
pub fn floor_to_step(x: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return x;
    }
    let n = (x / step + 1e-9).floor();
    n * step
}

pub fn ceil_to_step(x: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return x;
    }
    let n = (x / step - 1e-9).ceil();
    n * step
}

/// What one `apply` call did.
#[derive(Debug, Default)]
pub struct TraderReport {
    pub transitions: Vec<TransitionRecord>,
    pub reconciliations: Vec<Reconciliation>,
    /// A signal that did not fit the current phase.
    pub ignored: Option<(Side, Phase)>,
    pub fault: Option<BotError>,
}

pub struct Trader {
    instrument: Instrument,
    cfg: TraderConfig,
    gateway: Arc<dyn OrderGateway>,
    notifier: Arc<dyn NotificationSink>,
    state: PositionState,
    history: Vec<TransitionRecord>,
}

impl Trader {
    pub fn new(instrument: Instrument, cfg: TraderConfig, gateway: Arc<dyn OrderGateway>) -> Self {
        Self {
            instrument,
            cfg,
            gateway,
            notifier: Arc::new(NoopSink),
            state: PositionState::default(),
            history: Vec::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn state(&self) -> &PositionState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn is_shadow(&self) -> bool {
        self.gateway.is_shadow()
    }

    /// Every table transition taken since startup.
    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    /// Startup reconciliation: derive the phase from balances alone. An
    /// order left pending by a previous process is not tracked.
    pub async fn recover(&mut self, now: DateTime<Utc>) -> BotResult<Phase> {
        let balances = self.gateway.balances().await?;
        let held = balances.get(&self.cfg.base_asset);
        self.state = if held >= self.cfg.min_qty {
            PositionState {
                phase: Phase::Open,
                qty: floor_to_step(held, self.cfg.qty_step),
                entry_price: None,
                pending: None,
            }
        } else {
            PositionState::default()
        };
        info!(
            instrument = %self.instrument,
            phase = %self.state.phase,
            qty = self.state.qty,
            shadow = self.is_shadow(),
            at = %now,
            "trader recovered from balances"
        );
        Ok(self.state.phase)
    }

    /// Reconcile, expire, then act on `signal`. `price` is the last close and
    /// is needed to place orders; `score` is only reported.
    pub async fn apply(
        &mut self,
        now: DateTime<Utc>,
        signal: Option<Signal>,
        score: Option<f64>,
        price: Option<f64>,
    ) -> TraderReport {
        let mut report = TraderReport::default();
        if let Err(fault) = self.step(now, signal, score, price, &mut report).await {
            error!(instrument = %self.instrument, phase = %self.state.phase, error = %fault, "trader step failed");
            report.fault = Some(fault);
        }
        report
    }

    async fn step(
        &mut self,
        now: DateTime<Utc>,
        signal: Option<Signal>,
        score: Option<f64>,
        price: Option<f64>,
        report: &mut TraderReport,
    ) -> BotResult<()> {
        let balances = match self.state.pending.clone() {
            Some(pending) => {
                self.reconcile_order(now, &pending, score, report).await?;
                None
            }
            None => Some(self.reconcile_balances(now, report).await?),
        };

        let Some(signal) = signal else {
            return Ok(());
        };
        if signal.buy == signal.sell {
            return Ok(());
        }
        let side = if signal.buy { Side::Buy } else { Side::Sell };
        let event = match side {
            Side::Buy => TradeEvent::Buy,
            Side::Sell => TradeEvent::Sell,
        };
        if transition(self.state.phase, event).is_none() {
            debug!(instrument = %self.instrument, side = %side, phase = %self.state.phase, "signal ignored in current phase");
            report.ignored = Some((side, self.state.phase));
            return Ok(());
        }
        let Some(price) = price.filter(|p| p.is_finite() && *p > 0.0) else {
            warn!(instrument = %self.instrument, side = %side, "no reference price, signal not acted on");
            return Ok(());
        };
        let balances = match balances {
            Some(b) => b,
            None => self.gateway.balances().await?,
        };
        let Some(order) = self.size_order(side, price, &balances) else {
            info!(instrument = %self.instrument, side = %side, "order below minimum quantity, not placed");
            return Ok(());
        };

        let order_id = self.gateway.place(&order).await?;
        self.state.pending = Some(PendingOrder {
            order_id: order_id.clone(),
            side,
            price: order.price,
            qty: order.qty,
            placed_at: now,
        });
        info!(
            instrument = %self.instrument,
            order_id = %order_id,
            side = %side,
            price = order.price,
            qty = order.qty,
            "limit order placed"
        );
        self.record(now, event, Some(side), Some(order.price), Some(order.qty), score, report);
        Ok(())
    }

    fn size_order(&self, side: Side, close: f64, balances: &Balances) -> Option<LimitOrder> {
        let cfg = &self.cfg;
        let (price, qty) = match side {
            Side::Buy => {
                let price = floor_to_step(close * (1.0 - cfg.limit_price_adjustment), cfg.price_tick);
                if price <= 0.0 {
                    return None;
                }
                let quote = (balances.get(&cfg.quote_asset) * cfg.percentage_used).min(cfg.max_quote_per_trade);
                (price, floor_to_step(quote / price, cfg.qty_step))
            }
            Side::Sell => {
                let price = ceil_to_step(close * (1.0 + cfg.limit_price_adjustment), cfg.price_tick);
                (price, floor_to_step(self.state.qty, cfg.qty_step))
            }
        };
        (qty >= cfg.min_qty).then(|| LimitOrder {
            instrument: self.instrument.clone(),
            side,
            price,
            qty,
        })
    }

    async fn reconcile_order(
        &mut self,
        now: DateTime<Utc>,
        pending: &PendingOrder,
        score: Option<f64>,
        report: &mut TraderReport,
    ) -> BotResult<()> {
        let status = self.gateway.status(&self.instrument, &pending.order_id).await?;
        match status {
            OrderStatus::Filled { filled_qty, avg_price } => {
                self.confirm_fill(now, pending, filled_qty, avg_price, score, report);
            }
            OrderStatus::Rejected { ref reason } => {
                warn!(instrument = %self.instrument, order_id = %pending.order_id, reason, "order rejected by venue");
                self.resolve_unfilled(now, pending, &status, TradeEvent::Rejected, score, report);
            }
            OrderStatus::Cancelled { .. } => {
                warn!(instrument = %self.instrument, order_id = %pending.order_id, "order cancelled outside the trader");
                self.resolve_unfilled(now, pending, &status, TradeEvent::Rejected, score, report);
            }
            OrderStatus::New | OrderStatus::PartiallyFilled { .. } => {
                if now - pending.placed_at < self.cfg.order_timeout() {
                    return Ok(());
                }
                self.gateway.cancel(&self.instrument, &pending.order_id).await?;
                let last = self.gateway.status(&self.instrument, &pending.order_id).await?;
                info!(
                    instrument = %self.instrument,
                    order_id = %pending.order_id,
                    filled = last.filled_qty(),
                    "order timed out and was cancelled"
                );
                match last {
                    OrderStatus::Filled { filled_qty, avg_price } => {
                        self.confirm_fill(now, pending, filled_qty, avg_price, score, report)
                    }
                    other => self.resolve_unfilled(now, pending, &other, TradeEvent::Timeout, score, report),
                }
            }
        }
        Ok(())
    }

    /// Settles an order that ended without a full fill. A partial fill large
    /// enough to matter is confirmed; anything else takes `event`.
    fn resolve_unfilled(
        &mut self,
        now: DateTime<Utc>,
        pending: &PendingOrder,
        status: &OrderStatus,
        event: TradeEvent,
        score: Option<f64>,
        report: &mut TraderReport,
    ) {
        let filled = status.filled_qty();
        let avg = status.avg_price().unwrap_or(pending.price);
        let confirm = match pending.side {
            Side::Buy => filled >= self.cfg.min_qty,
            Side::Sell => self.state.qty - filled < self.cfg.min_qty,
        };
        if confirm {
            self.confirm_fill(now, pending, filled, avg, score, report);
            return;
        }
        if pending.side == Side::Sell {
            self.state.qty -= filled;
        }
        self.state.pending = None;
        self.record(now, event, Some(pending.side), Some(pending.price), Some(filled), score, report);
    }

    fn confirm_fill(
        &mut self,
        now: DateTime<Utc>,
        pending: &PendingOrder,
        filled_qty: f64,
        avg_price: f64,
        score: Option<f64>,
        report: &mut TraderReport,
    ) {
        match pending.side {
            Side::Buy => {
                self.state.qty = filled_qty;
                self.state.entry_price = Some(avg_price);
            }
            Side::Sell => {
                self.state.qty = 0.0;
                self.state.entry_price = None;
            }
        }
        self.state.pending = None;
        self.record(
            now,
            TradeEvent::Fill,
            Some(pending.side),
            Some(avg_price),
            Some(filled_qty),
            score,
            report,
        );
    }

    async fn reconcile_balances(&mut self, now: DateTime<Utc>, report: &mut TraderReport) -> BotResult<Balances> {
        let balances = self.gateway.balances().await?;
        let held = balances.get(&self.cfg.base_asset);
        let market_phase = if held >= self.cfg.min_qty { Phase::Open } else { Phase::Flat };
        let market_qty = if market_phase == Phase::Open {
            floor_to_step(held, self.cfg.qty_step)
        } else {
            0.0
        };

        let local = &self.state;
        let phase_differs = local.phase != market_phase;
        let qty_differs = (local.qty - market_qty).abs() > self.cfg.qty_step;
        if phase_differs || qty_differs {
            let rec = Reconciliation {
                ts: now,
                local_phase: local.phase,
                local_qty: local.qty,
                market_phase,
                market_qty,
            };
            let mismatch = BotError::ReconciliationMismatch {
                local: format!("{} {}", rec.local_phase, rec.local_qty),
                market: format!("{} {}", rec.market_phase, rec.market_qty),
            };
            warn!(instrument = %self.instrument, %mismatch, "market state overrides local position");
            deliver(
                self.notifier.as_ref(),
                &Notification {
                    event_type: EventType::ReconciliationMismatch,
                    instrument: self.instrument.clone(),
                    side: None,
                    price: None,
                    qty: Some(market_qty),
                    score: None,
                    ts: now,
                },
            );
            report.reconciliations.push(rec);
            if market_phase == Phase::Flat {
                self.state.entry_price = None;
            }
        }
        self.state.phase = market_phase;
        self.state.qty = market_qty;
        Ok(balances)
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &mut self,
        now: DateTime<Utc>,
        event: TradeEvent,
        side: Option<Side>,
        price: Option<f64>,
        qty: Option<f64>,
        score: Option<f64>,
        report: &mut TraderReport,
    ) {
        let from = self.state.phase;
        let Some(to) = transition(from, event) else {
            // Callers only record events accepted by the table.
            error!(instrument = %self.instrument, phase = %from, ?event, "event outside the transition table");
            return;
        };
        self.state.phase = to;
        let rec = TransitionRecord {
            ts: now,
            from,
            to,
            event,
            side,
            price,
            qty,
            score,
        };
        info!(
            instrument = %self.instrument,
            from = %from,
            to = %to,
            ?event,
            price,
            qty,
            shadow = self.is_shadow(),
            "trader transition"
        );
        let event_type = match (from, event) {
            (Phase::Flat, TradeEvent::Buy) => EventType::EntryPlaced,
            (Phase::Entering, TradeEvent::Fill) => EventType::EntryFilled,
            (Phase::Entering, TradeEvent::Timeout) => EventType::EntryTimedOut,
            (Phase::Open, TradeEvent::Sell) => EventType::ExitPlaced,
            (Phase::Exiting, TradeEvent::Fill) => EventType::ExitFilled,
            (Phase::Exiting, TradeEvent::Timeout) => EventType::ExitTimedOut,
            _ => EventType::OrderRejected,
        };
        deliver(
            self.notifier.as_ref(),
            &Notification {
                event_type,
                instrument: self.instrument.clone(),
                side,
                price,
                qty,
                score,
                ts: now,
            },
        );
        self.history.push(rec.clone());
        report.transitions.push(rec);
    }
}
