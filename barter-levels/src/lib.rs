#![forbid(unsafe_code)]

//! # Barter-Levels
//! Multi-timeframe ATR level ladders for a single instrument.
//!
//! Price ticks are merged into minute bars and resampled into closed bars per timeframe. Each
//! closed bar refreshes a Wilder ATR and a symmetric ladder of levels around the last close.
//! Live prices are checked against every ladder for crossings ("hits"), and consecutive hits on
//! a timeframe are linked into movement chains that are matched against a small table of named
//! multi-level patterns.
//!
//! The [`LevelPipeline`] drives every stage. Persistence is an external collaborator reached
//! through the [`HitStore`] trait and a background writer.
//!
//! ```ignore
//! let store = Arc::new(MemoryStore::new());
//! let (persistence, writer) = spawn_writer(store.clone());
//!
//! let mut pipeline = LevelPipeline::new(PipelineConfig::default())?.with_persistence(persistence);
//! let outcome = pipeline.ingest(&PriceTick::new("SPX", 5003.82, Utc::now()))?;
//! ```

/// Minute-bar buffering and resampling into closed timeframe bars.
pub mod aggregation;

/// True Range and Wilder-smoothed ATR.
pub mod atr;

pub mod config;

/// Per-timeframe crossing detection and [`Hit`] identifiers.
pub mod crossing;

pub mod error;

pub mod level;

/// Links consecutive hits into movements, chains, patterns and transition statistics.
pub mod movement;

pub mod pipeline;

pub mod store;

pub mod tick;

pub mod timeframe;

pub use aggregation::{Bar, TimeframeAggregator};
pub use atr::{AtrSeries, AtrState};
pub use config::{PipelineConfig, TimeframeConfig};
pub use crossing::{CrossDirection, Hit, HitId};
pub use error::{LevelError, StoreError, TickRejection};
pub use level::{LadderRatio, LevelCalculator, LevelId, LevelSet, PositionAnalysis, Zone};
pub use movement::{ChainSummary, Movement, MovementChain, MovementDirection, PatternKind};
pub use pipeline::{LevelEvent, LevelPipeline, PipelineStats, TickOutcome};
pub use store::{HitStore, JsonLinesStore, MemoryStore, PersistenceHandle, spawn_writer};
pub use tick::PriceTick;
pub use timeframe::Timeframe;
