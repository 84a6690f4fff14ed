use thiserror::Error;

/// Fault taxonomy for the trading core.
///
/// Only `ModelUnavailable` and `Config` are fatal, and only at startup. Every
/// other variant is contained to the cycle that raised it.
#[derive(Debug, Error)]
pub enum BotError {
    #[error("ingestion fault: {0}")]
    Ingestion(String),

    #[error("generator '{generator}' failed: {reason}")]
    Generation { generator: String, reason: String },

    #[error("model artifact {label}/{algorithm} unavailable: {reason}")]
    ModelUnavailable {
        label: String,
        algorithm: String,
        reason: String,
    },

    #[error("execution fault during {op}: {reason}")]
    Execution { op: String, reason: String },

    #[error("reconciliation mismatch: local {local}, market {market}")]
    ReconciliationMismatch { local: String, market: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("snapshot storage: {0}")]
    Storage(String),
}

impl BotError {
    pub fn generation(generator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Generation {
            generator: generator.into(),
            reason: reason.into(),
        }
    }

    pub fn execution(op: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Execution {
            op: op.into(),
            reason: reason.into(),
        }
    }

    /// True for the faults that must stop the process from starting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BotError::ModelUnavailable { .. } | BotError::Config(_))
    }
}

pub type BotResult<T> = Result<T, BotError>;
