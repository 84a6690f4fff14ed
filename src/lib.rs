//! Bar-signal trading core.
//!
//! A wall-clock scheduler turns a rolling window of market bars into features,
//! runs model inference, thresholds the score into a signal and advances a
//! per-instrument order state machine. A separate collector task streams the
//! order book into parquet files that the order-flow features read back.
//!
//! ```text
//! Ingestor -> RollingWindow -> FeatureRegistry -> ModelStore -> SignalThresholds -> Trader
//!                                    ^                                               |
//!                         SnapshotStore <- OrderBookCollector          OrderGateway / NotificationSink
//! ```

pub mod collector;
pub mod config;
pub mod error;
pub mod features;
pub mod ingest;
pub mod market;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod retry;
pub mod signal;
pub mod trader;
pub mod types;
pub mod window;

pub use crate::config::BotConfig;
pub use crate::error::{BotError, BotResult};
pub use crate::orchestrator::{Context, CycleOutcome, Orchestrator};
