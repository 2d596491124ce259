use crate::{
    aggregation::{Bar, TimeframeAggregator},
    atr::{AtrSeries, AtrState, HISTORY_MARGIN},
    config::{PipelineConfig, TimeframeConfig},
    crossing::{CrossingDetector, Hit, HitId, HitIdGenerator},
    error::{LevelError, TickRejection},
    level::{LevelCalculator, LevelSet, PositionAnalysis},
    movement::{
        ChainSummary, Movement, MovementTracker, PatternKind, TransitionReport, TransitionTable,
    },
    store::{HitStore, PersistenceHandle},
    tick::{PriceTick, TickGuard},
    timeframe::Timeframe,
};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Nearest levels reported on each side by [`LevelPipeline::position_analysis`].
const NEAREST_LEVEL_COUNT: usize = 3;

/// Notification published to [`LevelPipeline::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LevelEvent {
    Hit(Hit),
    Movement(Movement),
    Pattern {
        pattern: PatternKind,
        movement: Movement,
    },
    LevelsUpdated(LevelSet),
}

/// Hits and movements produced by one ingested tick, in emission order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutcome {
    pub hits: Vec<Hit>,
    pub movements: Vec<Movement>,
}

impl TickOutcome {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty() && self.movements.is_empty()
    }

    pub fn patterns(&self) -> impl Iterator<Item = (PatternKind, &Movement)> {
        self.movements
            .iter()
            .filter_map(|movement| movement.pattern_type.map(|pattern| (pattern, movement)))
    }
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct PipelineStats {
    pub ticks_processed: u64,
    pub ticks_rejected: u64,
    pub hits_detected: u64,
    pub movements_linked: u64,
    pub patterns_detected: u64,
    pub level_recalculations: u64,
}

/// All state owned by one timeframe: ATR cache, level ladder, last price and movement chain.
#[derive(Debug, Clone)]
pub struct TimeframeTrack {
    timeframe: Timeframe,
    atr_period: usize,
    last_bar_end: Option<DateTime<Utc>>,
    atr: Option<AtrState>,
    levels: Option<LevelSet>,
    crossing: CrossingDetector,
    movements: MovementTracker,
}

enum Refresh {
    Unchanged,
    Updated,
    NotReady,
}

impl TimeframeTrack {
    fn new(config: &TimeframeConfig, tolerance: f64) -> Self {
        Self {
            timeframe: config.timeframe,
            atr_period: config.atr_period,
            last_bar_end: None,
            atr: None,
            levels: None,
            crossing: CrossingDetector::new(config.timeframe, tolerance),
            movements: MovementTracker::new(config.timeframe),
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn levels(&self) -> Option<&LevelSet> {
        self.levels.as_ref()
    }

    pub fn atr(&self) -> Option<&AtrState> {
        self.atr.as_ref()
    }

    pub fn movements(&self) -> &MovementTracker {
        &self.movements
    }

    /// Recompute ATR and the ladder if a new bar has closed since the last refresh.
    fn refresh(&mut self, bars: &[Bar], calculator: &LevelCalculator) -> Refresh {
        let last_end = bars.last().map(|bar| bar.period_end);
        if last_end == self.last_bar_end {
            return Refresh::Unchanged;
        }
        self.last_bar_end = last_end;

        let mut series = AtrSeries::new(self.timeframe, self.atr_period);
        bars.iter().for_each(|bar| series.push(bar));

        let result = series
            .compute()
            .and_then(|state| calculator.from_atr(&state).map(|levels| (state, levels)));

        match result {
            Ok((state, levels)) => {
                info!(
                    timeframe = %self.timeframe,
                    reference_price = state.reference_price,
                    atr = state.atr_value,
                    "levels recalculated"
                );
                self.atr = Some(state);
                self.levels = Some(levels);
                Refresh::Updated
            }
            Err(error) => {
                debug!(timeframe = %self.timeframe, %error, "levels not ready");
                self.atr = match error {
                    LevelError::LevelsUnavailable { .. } => series.compute().ok(),
                    _ => None,
                };
                self.levels = None;
                Refresh::NotReady
            }
        }
    }
}

/// Single-instrument level pipeline: tick ingestion, aggregation, ATR, ladders, crossings and
/// movement chains for every configured timeframe.
///
/// Timeframes are processed sequentially per tick, each owning disjoint state.
#[derive(Debug)]
pub struct LevelPipeline {
    config: PipelineConfig,
    guard: TickGuard,
    aggregator: TimeframeAggregator,
    calculator: LevelCalculator,
    tracks: IndexMap<Timeframe, TimeframeTrack>,
    ids: HitIdGenerator,
    recent_hits: VecDeque<Hit>,
    persistence: Option<PersistenceHandle>,
    events: broadcast::Sender<LevelEvent>,
    stats: PipelineStats,
    last_revision: u64,
}

impl LevelPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, LevelError> {
        config.validate()?;

        let calculator = LevelCalculator::new(config.ladder()?);
        let aggregator = TimeframeAggregator::new(config.timeframe_list(), config.buffer_capacity);
        let tracks = config
            .timeframes
            .iter()
            .map(|entry| {
                (
                    entry.timeframe,
                    TimeframeTrack::new(entry, config.crossing_tolerance),
                )
            })
            .collect();
        let (events, _) = broadcast::channel(config.event_buffer);

        info!(
            instrument = %config.instrument,
            timeframes = ?config.timeframe_list(),
            tolerance = config.crossing_tolerance,
            "level pipeline initialised"
        );

        Ok(Self {
            recent_hits: VecDeque::with_capacity(config.recent_hits_capacity),
            config,
            guard: TickGuard::new(),
            aggregator,
            calculator,
            tracks,
            ids: HitIdGenerator::default(),
            persistence: None,
            events,
            stats: PipelineStats::default(),
            last_revision: 0,
        })
    }

    /// Hand hits, links and pattern detections to a persistence writer.
    pub fn with_persistence(mut self, handle: PersistenceHandle) -> Self {
        self.persistence = Some(handle);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LevelEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn track(&self, timeframe: Timeframe) -> Result<&TimeframeTrack, LevelError> {
        self.tracks
            .get(&timeframe)
            .ok_or_else(|| LevelError::UnsupportedTimeframe(timeframe.to_string()))
    }

    /// Process one price observation.
    ///
    /// Malformed ticks are dropped and counted. In-memory state is updated before any hit,
    /// link or pattern is queued for persistence.
    pub fn ingest(&mut self, tick: &PriceTick) -> Result<TickOutcome, LevelError> {
        if let Err(rejection) = self.validate(tick) {
            self.stats.ticks_rejected += 1;
            warn!(%rejection, ?tick, "tick rejected");
            return Err(LevelError::MalformedTick(rejection));
        }

        self.aggregator.add_tick(
            tick.timestamp,
            tick.price,
            tick.high,
            tick.low,
            Some(tick.volume),
        );
        self.stats.ticks_processed += 1;

        if self.aggregator.revision() != self.last_revision {
            self.refresh_levels();
        }

        let mut outcome = TickOutcome::default();
        for track in self.tracks.values_mut() {
            let hits = track.crossing.process_observation(
                track.levels.as_ref(),
                tick.price,
                tick.timestamp,
                &self.ids,
            );

            for hit in hits {
                self.stats.hits_detected += 1;
                if let Some(persistence) = &self.persistence {
                    persistence.store_hit(&hit);
                }
                if self.recent_hits.len() >= self.config.recent_hits_capacity {
                    self.recent_hits.pop_front();
                }
                self.recent_hits.push_back(hit.clone());
                let _ = self.events.send(LevelEvent::Hit(hit.clone()));

                let tracked = track.movements.process_hit(&hit);
                outcome.hits.push(hit);

                let Some(tracked) = tracked else {
                    continue;
                };
                let movement = tracked.movement;
                self.stats.movements_linked += 1;

                link_hit(&mut self.recent_hits, movement.from_hit_id, movement.to_hit_id);
                link_hit(&mut outcome.hits, movement.from_hit_id, movement.to_hit_id);
                if let Some(persistence) = &self.persistence {
                    persistence.store_link(movement.from_hit_id, movement.to_hit_id);
                }
                let _ = self.events.send(LevelEvent::Movement(movement.clone()));

                if let Some(pattern) = tracked.pattern {
                    self.stats.patterns_detected += 1;
                    if let Some(persistence) = &self.persistence {
                        persistence.store_pattern(&movement);
                    }
                    let _ = self.events.send(LevelEvent::Pattern {
                        pattern,
                        movement: movement.clone(),
                    });
                }

                outcome.movements.push(movement);
            }
        }

        Ok(outcome)
    }

    fn validate(&mut self, tick: &PriceTick) -> Result<(), TickRejection> {
        if tick.instrument != self.config.instrument {
            return Err(TickRejection::InstrumentMismatch {
                expected: self.config.instrument.clone(),
                received: tick.instrument.clone(),
            });
        }
        self.guard.check(tick)
    }

    fn refresh_levels(&mut self) {
        self.last_revision = self.aggregator.revision();

        for track in self.tracks.values_mut() {
            let bars = match self
                .aggregator
                .get_history(track.timeframe, track.atr_period + HISTORY_MARGIN)
            {
                Ok(bars) => bars,
                Err(error) => {
                    warn!(timeframe = %track.timeframe, %error, "closed bars unavailable");
                    continue;
                }
            };

            if let Refresh::Updated = track.refresh(&bars, &self.calculator) {
                self.stats.level_recalculations += 1;
                if let Some(levels) = &track.levels {
                    let _ = self.events.send(LevelEvent::LevelsUpdated(levels.clone()));
                }
            }
        }
    }

    /// Load already-closed bars for `timeframe` so ATR can warm up without minute history.
    pub fn seed_history(
        &mut self,
        timeframe: Timeframe,
        bars: impl IntoIterator<Item = Bar>,
    ) -> Result<usize, LevelError> {
        let seeded = self.aggregator.seed_history(timeframe, bars)?;
        self.refresh_levels();
        Ok(seeded)
    }

    /// Resume movement chains from the most recent persisted hit of each timeframe.
    ///
    /// Hits for unconfigured timeframes are skipped. Returns the number of hits restored.
    pub fn restore_last_hits(&mut self, hits: impl IntoIterator<Item = Hit>) -> usize {
        let mut restored = 0;
        for hit in hits {
            self.ids.advance_past(hit.id);
            match self.tracks.get_mut(&hit.timeframe) {
                Some(track) => {
                    debug!(
                        timeframe = %hit.timeframe,
                        hit_id = %hit.id,
                        level = %hit.level,
                        "restored last hit"
                    );
                    track.movements.restore(hit);
                    restored += 1;
                }
                None => {
                    debug!(
                        timeframe = %hit.timeframe,
                        hit_id = %hit.id,
                        "skipping hit for unconfigured timeframe"
                    );
                }
            }
        }

        info!(restored, next_hit_id = %self.ids.peek(), "movement chains restored");
        restored
    }

    /// [`Self::restore_last_hits`] using `store`'s latest hits.
    pub async fn restore_from<Store>(&mut self, store: &Store) -> Result<usize, LevelError>
    where
        Store: HitStore + ?Sized,
    {
        let hits = store.latest_hits().await?;
        Ok(self.restore_last_hits(hits))
    }

    /// Start a new session: clears chains, last hits and previous prices. Levels, bar history
    /// and transition statistics are kept.
    pub fn reset_session(&mut self) {
        for track in self.tracks.values_mut() {
            track.crossing.reset();
            track.movements.reset_session();
        }
        info!(instrument = %self.config.instrument, "session reset");
    }

    /// Ladder for `timeframe`, `Ok(None)` while warming up.
    pub fn current_levels(&self, timeframe: Timeframe) -> Result<Option<&LevelSet>, LevelError> {
        Ok(self.track(timeframe)?.levels.as_ref())
    }

    pub fn atr_state(&self, timeframe: Timeframe) -> Result<Option<AtrState>, LevelError> {
        Ok(self.track(timeframe)?.atr)
    }

    pub fn position_analysis(
        &self,
        price: f64,
        timeframe: Timeframe,
    ) -> Result<Option<PositionAnalysis>, LevelError> {
        Ok(self
            .track(timeframe)?
            .levels
            .as_ref()
            .map(|levels| levels.position(price, NEAREST_LEVEL_COUNT)))
    }

    /// Up to `limit` most recent hits across all timeframes, newest first.
    pub fn recent_hits(&self, limit: usize) -> Vec<Hit> {
        self.recent_hits.iter().rev().take(limit).cloned().collect()
    }

    /// Hit that followed `id` on `timeframe` during the current session.
    pub fn next_hit_id(
        &self,
        timeframe: Timeframe,
        id: HitId,
    ) -> Result<Option<HitId>, LevelError> {
        Ok(self.track(timeframe)?.movements.next_hit_id(id))
    }

    pub fn active_chains(&self) -> IndexMap<Timeframe, ChainSummary> {
        self.tracks
            .iter()
            .filter_map(|(timeframe, track)| {
                track
                    .movements
                    .summary()
                    .map(|summary| (*timeframe, summary))
            })
            .collect()
    }

    /// Transition statistics for one timeframe, or merged across all timeframes.
    pub fn transition_statistics(
        &self,
        timeframe: Option<Timeframe>,
    ) -> Result<TransitionReport, LevelError> {
        match timeframe {
            Some(timeframe) => Ok(self
                .track(timeframe)?
                .movements
                .transitions()
                .report(Some(timeframe))),
            None => {
                let mut merged = TransitionTable::default();
                self.tracks
                    .values()
                    .for_each(|track| merged.merge(track.movements.transitions()));
                Ok(merged.report(None))
            }
        }
    }
}

fn link_hit<'a>(hits: impl IntoIterator<Item = &'a mut Hit>, from: HitId, to: HitId) {
    if let Some(hit) = hits.into_iter().find(|hit| hit.id == from) {
        hit.next_hit_id.get_or_insert(to);
    }
}
