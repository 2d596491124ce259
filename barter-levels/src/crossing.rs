use crate::{
    level::{Level, LevelId, LevelSet},
    timeframe::Timeframe,
};
use chrono::{DateTime, Utc};
use derive_more::{Constructor, Display, From};
use serde::{Deserialize, Serialize};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tracing::debug;

/// Unique identifier of a [`Hit`], monotonically increasing within a pipeline.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    Display,
    From,
    Constructor,
)]
pub struct HitId(pub u64);

/// Shared [`HitId`] sequence.
#[derive(Debug, Clone)]
pub struct HitIdGenerator {
    next: Arc<AtomicU64>,
}

impl Default for HitIdGenerator {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl HitIdGenerator {
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: Arc::new(AtomicU64::new(first)),
        }
    }

    pub fn next_id(&self) -> HitId {
        HitId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Ensure ids handed out from now on are greater than `id`.
    pub fn advance_past(&self, id: HitId) {
        self.next.fetch_max(id.0.saturating_add(1), Ordering::Relaxed);
    }

    pub fn peek(&self) -> HitId {
        HitId(self.next.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum CrossDirection {
    #[display("up")]
    Up,
    #[display("down")]
    Down,
}

/// A crossing of one ladder level (or entry into an overflow region) by the live price.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Hit {
    pub id: HitId,
    pub timeframe: Timeframe,
    #[serde(rename = "level_name")]
    pub level: LevelId,
    pub level_value: f64,
    pub price_at_cross: f64,
    pub direction: CrossDirection,
    pub timestamp: DateTime<Utc>,
    pub reference_price: f64,
    pub atr_value: f64,
    /// Id of the next hit on the same timeframe, set once when it arrives.
    #[serde(default)]
    pub next_hit_id: Option<HitId>,
}

/// Per-timeframe crossing state machine.
#[derive(Debug, Clone)]
pub struct CrossingDetector {
    timeframe: Timeframe,
    tolerance: f64,
    previous_price: Option<f64>,
}

impl CrossingDetector {
    pub fn new(timeframe: Timeframe, tolerance: f64) -> Self {
        Self {
            timeframe,
            tolerance: tolerance.max(0.0),
            previous_price: None,
        }
    }

    pub fn previous_price(&self) -> Option<f64> {
        self.previous_price
    }

    pub fn reset(&mut self) {
        self.previous_price = None;
    }

    /// Compare `price` against the previous observation and every level of `levels`.
    ///
    /// Hits are ordered in the direction of travel, followed by at most one overflow hit. The
    /// first observation, or one arriving while no ladder exists, only seeds the previous
    /// price.
    pub fn process_observation(
        &mut self,
        levels: Option<&LevelSet>,
        price: f64,
        timestamp: DateTime<Utc>,
        ids: &HitIdGenerator,
    ) -> Vec<Hit> {
        let Some(previous) = self.previous_price.replace(price) else {
            return Vec::new();
        };
        let Some(levels) = levels else {
            return Vec::new();
        };

        let tau = self.tolerance;
        let mut crossed: Vec<(Level, CrossDirection)> = if price > previous {
            levels
                .levels
                .iter()
                .filter(|level| previous < level.value - tau && price >= level.value - tau)
                .map(|level| (*level, CrossDirection::Up))
                .collect()
        } else if price < previous {
            levels
                .levels
                .iter()
                .rev()
                .filter(|level| previous > level.value + tau && price <= level.value + tau)
                .map(|level| (*level, CrossDirection::Down))
                .collect()
        } else {
            Vec::new()
        };

        let (lower_bound, upper_bound) = levels.overflow_bounds();
        let [beyond_lower, beyond_upper] = levels.overflow_markers();
        if previous <= upper_bound + tau && price > upper_bound + tau {
            crossed.push((beyond_upper, CrossDirection::Up));
        } else if previous >= lower_bound - tau && price < lower_bound - tau {
            crossed.push((beyond_lower, CrossDirection::Down));
        }

        crossed
            .into_iter()
            .map(|(level, direction)| {
                let hit = Hit {
                    id: ids.next_id(),
                    timeframe: self.timeframe,
                    level: level.id,
                    level_value: level.value,
                    price_at_cross: price,
                    direction,
                    timestamp,
                    reference_price: levels.reference_price,
                    atr_value: levels.atr_value,
                    next_hit_id: None,
                };
                debug!(
                    timeframe = %hit.timeframe,
                    hit_id = %hit.id,
                    level = %hit.level,
                    direction = %hit.direction,
                    price,
                    "level crossed"
                );
                hit
            })
            .collect()
    }
}
