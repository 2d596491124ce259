use crate::{config::ConfigError, timeframe::Timeframe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

/// All errors generated in `barter-levels`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Error)]
pub enum LevelError {
    #[error("insufficient data for {timeframe} ATR: {available} closed bars, {required} required")]
    InsufficientData {
        timeframe: Timeframe,
        available: usize,
        required: usize,
    },

    #[error("levels unavailable for {timeframe}: {reason}")]
    LevelsUnavailable { timeframe: Timeframe, reason: String },

    #[error("unsupported timeframe: {0}")]
    UnsupportedTimeframe(String),

    #[error("malformed tick rejected: {0}")]
    MalformedTick(#[from] TickRejection),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl LevelError {
    /// Determine if an error is an expected warm-up condition rather than a fault.
    ///
    /// Callers treat "not ready" timeframes as warming up and retry on the next bar close.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_not_ready(&self) -> bool {
        match self {
            LevelError::InsufficientData { .. } | LevelError::LevelsUnavailable { .. } => true,
            _ => false,
        }
    }
}

/// Reasons a [`PriceTick`](crate::tick::PriceTick) is dropped at the ingress boundary.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Error)]
pub enum TickRejection {
    #[error("non-finite price field")]
    NonFinitePrice,

    #[error("non-positive price: {0}")]
    NonPositivePrice(f64),

    #[error("inverted range: high {high} < low {low}")]
    InvertedRange { high: f64, low: f64 },

    #[error("invalid volume: {0}")]
    InvalidVolume(f64),

    #[error("timestamp {received} precedes previous tick at {previous}")]
    NonMonotonicTimestamp {
        previous: DateTime<Utc>,
        received: DateTime<Utc>,
    },

    #[error("tick for {received} delivered to {expected} pipeline")]
    InstrumentMismatch { expected: SmolStr, received: SmolStr },
}

/// Errors produced by a [`HitStore`](crate::store::HitStore) implementation.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(String),

    #[error("serialisation: {0}")]
    Serde(String),

    #[error("store closed")]
    Closed,

    #[error("write rejected: {0}")]
    Rejected(String),
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value.to_string())
    }
}
