//! Notification sinks for trader transitions.
//!
//! Delivery to chat or alerting services lives outside the crate; anything that
//! implements [`NotificationSink`] can be plugged into the orchestrator context.

use crate::types::{Instrument, Side};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    EntryPlaced,
    EntryFilled,
    EntryTimedOut,
    ExitPlaced,
    ExitFilled,
    ExitTimedOut,
    OrderRejected,
    ReconciliationMismatch,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::EntryPlaced => "entry_placed",
            EventType::EntryFilled => "entry_filled",
            EventType::EntryTimedOut => "entry_timed_out",
            EventType::ExitPlaced => "exit_placed",
            EventType::ExitFilled => "exit_filled",
            EventType::ExitTimedOut => "exit_timed_out",
            EventType::OrderRejected => "order_rejected",
            EventType::ReconciliationMismatch => "reconciliation_mismatch",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub event_type: EventType,
    pub instrument: Instrument,
    pub side: Option<Side>,
    pub price: Option<f64>,
    pub qty: Option<f64>,
    pub score: Option<f64>,
    pub ts: DateTime<Utc>,
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Sends to `sink`, logging instead of propagating failures. A broken sink
/// never affects trading state.
pub fn deliver(sink: &dyn NotificationSink, notification: &Notification) {
    if let Err(err) = sink.notify(notification) {
        warn!(event = notification.event_type.as_str(), error = %err, "notification sink failed");
    }
}

#[derive(Clone, Debug, Default)]
pub struct NoopSink;

impl NotificationSink for NoopSink {
    fn notify(&self, _notification: &Notification) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Writes every notification as a structured `tracing` event.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, n: &Notification) -> anyhow::Result<()> {
        info!(
            target: "notify",
            event = n.event_type.as_str(),
            instrument = %n.instrument,
            side = n.side.map(|s| s.to_string()).as_deref().unwrap_or("-"),
            price = n.price,
            qty = n.qty,
            score = n.score,
            ts = %n.ts,
            "trader notification"
        );
        Ok(())
    }
}

/// Keeps notifications in memory; used by tests and the paper-trading binary.
#[derive(Debug, Default)]
pub struct MemorySink {
    seen: Mutex<Vec<Notification>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }

    pub fn event_types(&self) -> Vec<EventType> {
        self.seen.lock().iter().map(|n| n.event_type).collect()
    }
}

impl NotificationSink for MemorySink {
    fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        self.seen.lock().push(notification.clone());
        Ok(())
    }
}

/// Fan-out to several sinks; every sink is tried even if an earlier one fails.
pub struct CompositeSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl CompositeSink {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }
}

impl NotificationSink for CompositeSink {
    fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.notify(notification) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl NotificationSink for Failing {
        fn notify(&self, _n: &Notification) -> anyhow::Result<()> {
            anyhow::bail!("offline")
        }
    }

    fn sample() -> Notification {
        Notification {
            event_type: EventType::EntryPlaced,
            instrument: Instrument("BTCUSDT".into()),
            side: Some(Side::Buy),
            price: Some(100.0),
            qty: Some(0.5),
            score: Some(0.3),
            ts: Utc::now(),
        }
    }

    #[test]
    fn composite_reaches_every_sink_despite_failures() {
        let memory = Arc::new(MemorySink::new());
        let composite = CompositeSink::new(vec![Arc::new(Failing), memory.clone(), Arc::new(LogSink)]);
        assert!(composite.notify(&sample()).is_err());
        assert_eq!(memory.event_types(), vec![EventType::EntryPlaced]);

        // deliver swallows the error
        deliver(&composite, &sample());
        assert_eq!(memory.notifications().len(), 2);
    }

    #[test]
    fn event_type_serializes_snake_case() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(json.contains("\"event_type\":\"entry_placed\""));
    }
}
