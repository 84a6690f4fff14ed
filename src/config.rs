use crate::collector::CollectorConfig;
use crate::error::{BotError, BotResult};
use crate::features::{FeatureRegistry, GeneratorSpec};
use crate::model::ScoreConfig;
use crate::retry::RetryPolicy;
use crate::signal::SignalThresholds;
use crate::trader::TraderConfig;
use crate::types::{Frequency, Instrument};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub dir: PathBuf,
    pub labels: Vec<String>,
    pub algorithms: Vec<String>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("models"),
            labels: Vec::new(),
            algorithms: Vec::new(),
        }
    }
}

/// Everything one trading process needs, loaded once at startup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub instrument: Instrument,
    pub frequency: Frequency,
    /// Bars kept in the rolling window and fetched on backfill.
    pub train_length: usize,
    /// Seconds after each frequency boundary at which the cycle fires.
    pub cycle_offset_secs: u64,
    /// A cycle running longer than this is logged, not interrupted.
    pub cycle_soft_deadline_secs: u64,
    pub features: Vec<GeneratorSpec>,
    pub models: ModelsConfig,
    pub score: ScoreConfig,
    pub signal: SignalThresholds,
    pub trader: TraderConfig,
    pub retry: RetryPolicy,
    pub collector: CollectorConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            instrument: Instrument("BTCUSDT".to_string()),
            frequency: Frequency::minutes(5),
            train_length: 1_000,
            cycle_offset_secs: 5,
            cycle_soft_deadline_secs: 60,
            features: Vec::new(),
            models: ModelsConfig::default(),
            score: ScoreConfig::default(),
            signal: SignalThresholds::default(),
            trader: TraderConfig::default(),
            retry: RetryPolicy::default(),
            collector: CollectorConfig::default(),
        }
    }
}

impl BotConfig {
    pub fn from_json_str(s: &str) -> BotResult<Self> {
        let cfg: BotConfig =
            serde_json::from_str(s).map_err(|e| BotError::Config(format!("invalid config json: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: &Path) -> BotResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| BotError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    /// Builds the generator registry, checking the wiring.
    pub fn registry(&self) -> BotResult<FeatureRegistry> {
        FeatureRegistry::new(self.features.clone())
    }

    pub fn validate(&self) -> BotResult<()> {
        let bad = |msg: String| Err(BotError::Config(msg));
        if self.instrument.0.is_empty() {
            return bad("instrument is required".into());
        }
        if self.cycle_offset_secs as i64 >= self.frequency.as_secs() {
            return bad(format!(
                "cycle_offset_secs {} must be shorter than the bar frequency {}",
                self.cycle_offset_secs, self.frequency
            ));
        }
        let registry = self.registry()?;
        if self.train_length < registry.required_history() {
            return bad(format!(
                "train_length {} is shorter than the required history {}",
                self.train_length,
                registry.required_history()
            ));
        }
        if self.models.labels.is_empty() || self.models.algorithms.is_empty() {
            return bad("models.labels and models.algorithms must not be empty".into());
        }
        for l in self.score.buy_labels.iter().chain(&self.score.sell_labels) {
            if !self.models.labels.contains(l) {
                return bad(format!("score label '{l}' is not in models.labels"));
            }
        }
        let SignalThresholds {
            buy_threshold,
            sell_threshold,
        } = self.signal;
        if !buy_threshold.is_finite() || !sell_threshold.is_finite() || sell_threshold >= buy_threshold {
            return bad(format!(
                "sell_threshold {sell_threshold} must be below buy_threshold {buy_threshold}"
            ));
        }
        if self.retry.max_attempts == 0 || self.retry.call_timeout_ms == 0 {
            return bad("retry.max_attempts and retry.call_timeout_ms must be positive".into());
        }
        if self.collector.enabled && (self.collector.depth == 0 || self.collector.max_buffered == 0) {
            return bad("collector.depth and collector.max_buffered must be positive".into());
        }
        if self.collector.enabled && self.collector.max_retained < self.collector.max_buffered {
            return bad(format!(
                "collector.max_retained {} must be at least collector.max_buffered {}",
                self.collector.max_retained, self.collector.max_buffered
            ));
        }
        if registry.needs_snapshots() && !self.collector.enabled {
            return bad("order_flow features need the collector to be enabled".into());
        }
        self.trader.validate()
    }
}
