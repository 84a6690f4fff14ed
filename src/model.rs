//! Model artifacts and inference.
//!
//! Estimators are opaque: the store only needs `predict(row) -> f64`. Artifacts
//! are loaded once at startup; a missing or unreadable artifact is fatal.

use crate::error::{BotError, BotResult};
use crate::features::FeatureFrame;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub trait Estimator: Send + Sync {
    fn predict(&self, row: &[f64]) -> anyhow::Result<f64>;
}

/// Standardization applied to a feature row before prediction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl Scaler {
    pub fn transform(&self, row: &mut [f64]) {
        for ((v, m), s) in row.iter_mut().zip(&self.mean).zip(&self.scale) {
            *v = if *s == 0.0 { *v - m } else { (*v - m) / s };
        }
    }
}

#[derive(Clone)]
pub struct ModelArtifact {
    pub label: String,
    pub algorithm: String,
    /// Frame columns fed to the estimator, in order.
    pub features: Vec<String>,
    pub scaler: Option<Scaler>,
    pub estimator: Arc<dyn Estimator>,
    /// blake3 hex digest of the artifact source, when it came from a file.
    pub digest: Option<String>,
}

impl ModelArtifact {
    pub fn key(&self) -> String {
        format!("{}/{}", self.label, self.algorithm)
    }
}

impl std::fmt::Debug for ModelArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelArtifact")
            .field("label", &self.label)
            .field("algorithm", &self.algorithm)
            .field("features", &self.features)
            .field("digest", &self.digest)
            .finish()
    }
}

/// External source of trained artifacts.
pub trait ArtifactStore: Send + Sync {
    fn load(&self, label: &str, algorithm: &str) -> anyhow::Result<ModelArtifact>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Link {
    Identity,
    #[default]
    Logistic,
}

/// `link(intercept + w . x)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinearEstimator {
    pub weights: Vec<f64>,
    pub intercept: f64,
    #[serde(default)]
    pub link: Link,
}

impl Estimator for LinearEstimator {
    fn predict(&self, row: &[f64]) -> anyhow::Result<f64> {
        anyhow::ensure!(
            row.len() == self.weights.len(),
            "expected {} features, got {}",
            self.weights.len(),
            row.len()
        );
        let z = self.intercept + row.iter().zip(&self.weights).map(|(x, w)| x * w).sum::<f64>();
        Ok(match self.link {
            Link::Identity => z,
            Link::Logistic => 1.0 / (1.0 + (-z).exp()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct LinearArtifactFile {
    features: Vec<String>,
    #[serde(default)]
    scaler: Option<Scaler>,
    #[serde(flatten)]
    model: LinearEstimator,
}

/// Reads `{dir}/{label}_{algorithm}.json` linear artifacts.
pub struct JsonArtifactStore {
    dir: PathBuf,
}

impl JsonArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, label: &str, algorithm: &str) -> PathBuf {
        self.dir.join(format!("{label}_{algorithm}.json"))
    }
}

impl ArtifactStore for JsonArtifactStore {
    fn load(&self, label: &str, algorithm: &str) -> anyhow::Result<ModelArtifact> {
        use anyhow::Context;

        let path = self.path_for(label, algorithm);
        let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        let file: LinearArtifactFile =
            serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;
        anyhow::ensure!(
            file.features.len() == file.model.weights.len(),
            "{} lists {} features but {} weights",
            path.display(),
            file.features.len(),
            file.model.weights.len()
        );
        if let Some(scaler) = &file.scaler {
            anyhow::ensure!(
                scaler.mean.len() == file.features.len() && scaler.scale.len() == file.features.len(),
                "{} scaler does not match its feature list",
                path.display()
            );
        }
        Ok(ModelArtifact {
            label: label.to_string(),
            algorithm: algorithm.to_string(),
            features: file.features,
            scaler: file.scaler,
            estimator: Arc::new(file.model),
            digest: Some(blake3::hash(&bytes).to_hex().to_string()),
        })
    }
}

/// Which labels push the trade score up and which push it down.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreConfig {
    pub buy_labels: Vec<String>,
    pub sell_labels: Vec<String>,
}

/// Model output for the latest frame row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Score {
    /// `mean(buy-label predictions) - mean(sell-label predictions)`.
    pub trade_score: f64,
    /// Raw prediction per `label/algorithm`.
    pub components: BTreeMap<String, f64>,
}

#[derive(Clone, Debug)]
pub struct ModelStore {
    artifacts: Vec<ModelArtifact>,
    score: ScoreConfig,
}

impl ModelStore {
    /// Loads every `label x algorithm` artifact. Any failure is a
    /// [`BotError::ModelUnavailable`].
    pub fn load(
        store: &dyn ArtifactStore,
        labels: &[String],
        algorithms: &[String],
        score: ScoreConfig,
    ) -> BotResult<Self> {
        let mut artifacts = Vec::with_capacity(labels.len() * algorithms.len());
        for label in labels {
            for algorithm in algorithms {
                let artifact = store.load(label, algorithm).map_err(|e| BotError::ModelUnavailable {
                    label: label.clone(),
                    algorithm: algorithm.clone(),
                    reason: format!("{e:#}"),
                })?;
                info!(
                    model = %artifact.key(),
                    features = artifact.features.len(),
                    digest = artifact.digest.as_deref().unwrap_or("-"),
                    "loaded model artifact"
                );
                artifacts.push(artifact);
            }
        }
        Self::from_artifacts(artifacts, score)
    }

    pub fn from_artifacts(artifacts: Vec<ModelArtifact>, score: ScoreConfig) -> BotResult<Self> {
        if artifacts.is_empty() {
            return Err(BotError::ModelUnavailable {
                label: "*".into(),
                algorithm: "*".into(),
                reason: "no artifacts configured".into(),
            });
        }
        let labels: BTreeSet<&str> = artifacts.iter().map(|a| a.label.as_str()).collect();
        for l in score.buy_labels.iter().chain(&score.sell_labels) {
            if !labels.contains(l.as_str()) {
                return Err(BotError::Config(format!("score refers to unknown label '{l}'")));
            }
        }
        Ok(Self { artifacts, score })
    }

    pub fn artifacts(&self) -> &[ModelArtifact] {
        &self.artifacts
    }

    /// Every frame column some artifact reads.
    pub fn feature_columns(&self) -> BTreeSet<String> {
        self.artifacts.iter().flat_map(|a| a.features.iter().cloned()).collect()
    }

    /// Fails when an artifact needs a column the registry never produces.
    pub fn check_features<'a>(&self, available: impl IntoIterator<Item = &'a str>) -> BotResult<()> {
        let available: BTreeSet<&str> = available.into_iter().collect();
        for artifact in &self.artifacts {
            if let Some(missing) = artifact.features.iter().find(|f| !available.contains(f.as_str())) {
                return Err(BotError::Config(format!(
                    "model {} needs feature '{missing}', which is not generated",
                    artifact.key()
                )));
            }
        }
        Ok(())
    }

    /// Runs every artifact on the last frame row.
    pub fn score_latest(&self, frame: &FeatureFrame) -> BotResult<Score> {
        let last = frame
            .len()
            .checked_sub(1)
            .ok_or_else(|| BotError::generation("inference", "feature frame is empty"))?;
        let mut components = BTreeMap::new();
        for artifact in &self.artifacts {
            let key = artifact.key();
            let mut row = frame
                .row(last, &artifact.features)
                .ok_or_else(|| BotError::generation(&key, "feature column missing from frame"))?;
            if let Some(pos) = row.iter().position(|v| !v.is_finite()) {
                return Err(BotError::generation(
                    &key,
                    format!("feature '{}' is not finite in the latest row", artifact.features[pos]),
                ));
            }
            if let Some(scaler) = &artifact.scaler {
                scaler.transform(&mut row);
            }
            let value = artifact
                .estimator
                .predict(&row)
                .map_err(|e| BotError::generation(&key, format!("predict failed: {e:#}")))?;
            components.insert(key, value);
        }
        Ok(Score {
            trade_score: self.combine(&components),
            components,
        })
    }

    fn combine(&self, components: &BTreeMap<String, f64>) -> f64 {
        let mean_of = |labels: &[String]| -> Option<f64> {
            let vals: Vec<f64> = self
                .artifacts
                .iter()
                .filter(|a| labels.contains(&a.label))
                .filter_map(|a| components.get(&a.key()).copied())
                .collect();
            (!vals.is_empty()).then(|| vals.iter().sum::<f64>() / vals.len() as f64)
        };
        if self.score.buy_labels.is_empty() && self.score.sell_labels.is_empty() {
            return components.values().sum::<f64>() / components.len().max(1) as f64;
        }
        mean_of(&self.score.buy_labels).unwrap_or(0.0) - mean_of(&self.score.sell_labels).unwrap_or(0.0)
    }
}
