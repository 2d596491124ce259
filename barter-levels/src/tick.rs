use crate::error::TickRejection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Price observation delivered by the feed collaborator. The only external input.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PriceTick {
    pub instrument: SmolStr,
    pub price: f64,
    /// Observation high, defaults to `price`.
    #[serde(default)]
    pub high: Option<f64>,
    /// Observation low, defaults to `price`.
    #[serde(default)]
    pub low: Option<f64>,
    #[serde(default)]
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

impl PriceTick {
    pub fn new(instrument: impl Into<SmolStr>, price: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            instrument: instrument.into(),
            price,
            high: None,
            low: None,
            volume: 0.0,
            timestamp,
        }
    }

    pub fn with_range(mut self, high: f64, low: f64) -> Self {
        self.high = Some(high);
        self.low = Some(low);
        self
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = volume;
        self
    }
}

/// Ingress validation: rejects malformed ticks and enforces non-decreasing timestamps.
#[derive(Debug, Clone, Default)]
pub struct TickGuard {
    last_timestamp: Option<DateTime<Utc>>,
}

impl TickGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `tick`. Only accepted ticks advance the timestamp watermark.
    pub fn check(&mut self, tick: &PriceTick) -> Result<(), TickRejection> {
        Self::validate(tick, self.last_timestamp)?;
        self.last_timestamp = Some(tick.timestamp);
        Ok(())
    }

    fn validate(tick: &PriceTick, last: Option<DateTime<Utc>>) -> Result<(), TickRejection> {
        let prices = [Some(tick.price), tick.high, tick.low];
        if prices.iter().flatten().any(|price| !price.is_finite()) {
            return Err(TickRejection::NonFinitePrice);
        }

        if let Some(price) = prices.iter().flatten().find(|price| **price <= 0.0) {
            return Err(TickRejection::NonPositivePrice(*price));
        }

        if let (Some(high), Some(low)) = (tick.high, tick.low) {
            if high < low {
                return Err(TickRejection::InvertedRange { high, low });
            }
        }

        if !tick.volume.is_finite() || tick.volume < 0.0 {
            return Err(TickRejection::InvalidVolume(tick.volume));
        }

        match last {
            Some(previous) if tick.timestamp < previous => {
                Err(TickRejection::NonMonotonicTimestamp {
                    previous,
                    received: tick.timestamp,
                })
            }
            _ => Ok(()),
        }
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_timestamp
    }
}
