use crate::types::{OrderId, Side};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position lifecycle of one instrument.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Flat,
    Entering,
    Open,
    Exiting,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Flat => "flat",
            Phase::Entering => "entering",
            Phase::Open => "open",
            Phase::Exiting => "exiting",
        })
    }
}

/// Inputs that can move a [`Phase`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeEvent {
    Buy,
    Sell,
    Fill,
    Timeout,
    /// Rejected or cancelled by the venue; handled like a timeout.
    Rejected,
}

/// The complete transition table. `None` means the event does not apply in
/// that phase and must be ignored.
pub fn transition(phase: Phase, event: TradeEvent) -> Option<Phase> {
    use Phase::*;
    use TradeEvent::*;
    match (phase, event) {
        (Flat, Buy) => Some(Entering),
        (Entering, Fill) => Some(Open),
        (Entering, Timeout | Rejected) => Some(Flat),
        (Open, Sell) => Some(Exiting),
        (Exiting, Fill) => Some(Flat),
        (Exiting, Timeout | Rejected) => Some(Open),
        _ => None,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub order_id: OrderId,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    pub placed_at: DateTime<Utc>,
}

/// Everything the trader knows about its exposure.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub phase: Phase,
    /// Base quantity held; zero while flat.
    pub qty: f64,
    pub entry_price: Option<f64>,
    /// Set exactly while `Entering` or `Exiting`.
    pub pending: Option<PendingOrder>,
}

impl PositionState {
    pub fn is_flat(&self) -> bool {
        self.phase == Phase::Flat
    }
}

/// One transition taken from the table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub ts: DateTime<Utc>,
    pub from: Phase,
    pub to: Phase,
    pub event: TradeEvent,
    pub side: Option<Side>,
    pub price: Option<f64>,
    pub qty: Option<f64>,
    pub score: Option<f64>,
}

/// Local state overridden by market truth, outside the transition table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub ts: DateTime<Utc>,
    pub local_phase: Phase,
    pub local_qty: f64,
    pub market_phase: Phase,
    pub market_qty: f64,
}
