use crate::{
    crossing::{Hit, HitId},
    level::{LadderRatio, LevelId},
    timeframe::Timeframe,
};
use chrono::{DateTime, Utc};
use derive_more::Display;
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info};

/// Movements retained per chain, older movements only survive in the chain totals.
pub const MAX_CHAIN_MOVEMENTS: usize = 1_000;

/// Number of trailing movements whose levels are searched for patterns.
const PATTERN_WINDOW: usize = 3;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum MovementDirection {
    #[display("bullish")]
    Bullish,
    #[display("bearish")]
    Bearish,
    #[display("neutral")]
    Neutral,
}

impl MovementDirection {
    pub fn between(from: LevelId, to: LevelId) -> Self {
        match to.canonical_index().cmp(&from.canonical_index()) {
            std::cmp::Ordering::Greater => MovementDirection::Bullish,
            std::cmp::Ordering::Less => MovementDirection::Bearish,
            std::cmp::Ordering::Equal => MovementDirection::Neutral,
        }
    }
}

/// Named multi-level pattern, matched as an ordered subsequence of recent chain levels.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    #[display("golden_gate_bull")]
    GoldenGateBull,
    #[display("golden_gate_bear")]
    GoldenGateBear,
    #[display("full_atr_bull")]
    FullAtrBull,
    #[display("full_atr_bear")]
    FullAtrBear,
    #[display("trigger_breakout")]
    TriggerBreakout,
    #[display("trigger_breakdown")]
    TriggerBreakdown,
    #[display("double_atr_extension")]
    DoubleAtrExtension,
    #[display("double_atr_collapse")]
    DoubleAtrCollapse,
}

impl PatternKind {
    /// Detection priority order.
    pub const ALL: [PatternKind; 8] = [
        PatternKind::GoldenGateBull,
        PatternKind::GoldenGateBear,
        PatternKind::FullAtrBull,
        PatternKind::FullAtrBear,
        PatternKind::TriggerBreakout,
        PatternKind::TriggerBreakdown,
        PatternKind::DoubleAtrExtension,
        PatternKind::DoubleAtrCollapse,
    ];

    pub fn sequence(&self) -> [LevelId; 2] {
        use LadderRatio::*;
        match self {
            PatternKind::GoldenGateBull => [LevelId::Upper(R0382), LevelId::Upper(R0618)],
            PatternKind::GoldenGateBear => [LevelId::Lower(R0382), LevelId::Lower(R0618)],
            PatternKind::FullAtrBull => [LevelId::Reference, LevelId::Upper(R1000)],
            PatternKind::FullAtrBear => [LevelId::Reference, LevelId::Lower(R1000)],
            PatternKind::TriggerBreakout => [LevelId::Reference, LevelId::Upper(Trigger)],
            PatternKind::TriggerBreakdown => [LevelId::Reference, LevelId::Lower(Trigger)],
            PatternKind::DoubleAtrExtension => [LevelId::Upper(R1000), LevelId::Upper(R2000)],
            PatternKind::DoubleAtrCollapse => [LevelId::Lower(R1000), LevelId::Lower(R2000)],
        }
    }

    /// First pattern, in priority order, appearing in order within `levels`.
    pub fn detect(levels: &[LevelId]) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|pattern| is_subsequence(&pattern.sequence(), levels))
    }
}

fn is_subsequence(needle: &[LevelId], haystack: &[LevelId]) -> bool {
    let mut remaining = haystack.iter();
    needle
        .iter()
        .all(|wanted| remaining.any(|level| level == wanted))
}

/// Link between two consecutive hits on the same timeframe.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Movement {
    pub from_level: LevelId,
    pub to_level: LevelId,
    pub from_hit_id: HitId,
    pub to_hit_id: HitId,
    pub timeframe: Timeframe,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Seconds between the hits, at least 1.
    pub duration_secs: f64,
    pub price_start: f64,
    pub price_end: f64,
    pub price_delta: f64,
    pub direction: MovementDirection,
    pub levels_traversed: usize,
    /// Levels per minute.
    pub velocity: f64,
    pub pattern_type: Option<PatternKind>,
}

impl Movement {
    pub fn between(from: &Hit, to: &Hit) -> Self {
        let duration_secs = ((to.timestamp - from.timestamp).num_milliseconds() as f64 / 1_000.0)
            .max(1.0);
        let levels_traversed = to
            .level
            .canonical_index()
            .abs_diff(from.level.canonical_index());

        Self {
            from_level: from.level,
            to_level: to.level,
            from_hit_id: from.id,
            to_hit_id: to.id,
            timeframe: to.timeframe,
            start_time: from.timestamp,
            end_time: to.timestamp,
            duration_secs,
            price_start: from.price_at_cross,
            price_end: to.price_at_cross,
            price_delta: to.price_at_cross - from.price_at_cross,
            direction: MovementDirection::between(from.level, to.level),
            levels_traversed,
            velocity: levels_traversed as f64 / duration_secs * 60.0,
            pattern_type: None,
        }
    }
}

/// Ordered movements accumulated for one timeframe during a session.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MovementChain {
    pub chain_id: String,
    pub timeframe: Timeframe,
    /// Most recent movements, oldest first.
    pub movements: VecDeque<Movement>,
    pub movement_count: usize,
    pub start_level: LevelId,
    pub current_level: LevelId,
    pub total_duration_secs: f64,
    pub total_levels_traversed: usize,
    pub pattern_detected: Option<PatternKind>,
}

impl MovementChain {
    fn start(first: &Movement) -> Self {
        Self {
            chain_id: format!("{}_{}", first.timeframe, first.start_time.to_rfc3339()),
            timeframe: first.timeframe,
            movements: VecDeque::new(),
            movement_count: 0,
            start_level: first.from_level,
            current_level: first.from_level,
            total_duration_secs: 0.0,
            total_levels_traversed: 0,
            pattern_detected: None,
        }
    }

    /// Append `movement`, returning a newly detected pattern, if any, and the movement evicted
    /// to stay within [`MAX_CHAIN_MOVEMENTS`].
    ///
    /// A pattern is reported only when it differs from the chain's current detection, the
    /// movement that triggered it carries it in `pattern_type`.
    fn push(
        &mut self,
        mut movement: Movement,
    ) -> (Movement, Option<PatternKind>, Option<Movement>) {
        self.current_level = movement.to_level;
        self.movement_count += 1;
        self.total_duration_secs += movement.duration_secs;
        self.total_levels_traversed += movement.levels_traversed;

        let evicted = if self.movements.len() >= MAX_CHAIN_MOVEMENTS {
            self.movements.pop_front()
        } else {
            None
        };
        self.movements.push_back(movement.clone());

        let detected = PatternKind::detect(&self.recent_levels())
            .filter(|pattern| self.pattern_detected != Some(*pattern));

        if let Some(pattern) = detected {
            self.pattern_detected = Some(pattern);
            movement.pattern_type = Some(pattern);
            if let Some(last) = self.movements.back_mut() {
                last.pattern_type = Some(pattern);
            }
        }

        (movement, detected, evicted)
    }

    /// Origins of the last three movements followed by the newest destination.
    pub fn recent_levels(&self) -> Vec<LevelId> {
        let start = self.movements.len().saturating_sub(PATTERN_WINDOW);
        let mut levels: Vec<LevelId> = self
            .movements
            .range(start..)
            .map(|movement| movement.from_level)
            .collect();
        levels.extend(self.movements.back().map(|movement| movement.to_level));
        levels
    }

    pub fn summary(&self) -> ChainSummary {
        ChainSummary {
            chain_id: self.chain_id.clone(),
            timeframe: self.timeframe,
            start_level: self.start_level,
            current_level: self.current_level,
            movements_count: self.movement_count,
            total_duration_secs: self.total_duration_secs,
            total_levels_traversed: self.total_levels_traversed,
            pattern_detected: self.pattern_detected,
            last_movement: self.movements.back().map(|last| MovementSummary {
                from: last.from_level,
                to: last.to_level,
                duration_secs: last.duration_secs,
                velocity: last.velocity,
                direction: last.direction,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChainSummary {
    pub chain_id: String,
    pub timeframe: Timeframe,
    pub start_level: LevelId,
    pub current_level: LevelId,
    pub movements_count: usize,
    pub total_duration_secs: f64,
    pub total_levels_traversed: usize,
    pub pattern_detected: Option<PatternKind>,
    pub last_movement: Option<MovementSummary>,
}

#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct MovementSummary {
    pub from: LevelId,
    pub to: LevelId,
    pub duration_secs: f64,
    pub velocity: f64,
    pub direction: MovementDirection,
}

/// Aggregated statistics for one `(from_level, to_level)` transition.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct TransitionStats {
    pub from_level: LevelId,
    pub to_level: LevelId,
    pub count: u64,
    pub avg_duration_secs: f64,
    pub min_duration_secs: f64,
    pub max_duration_secs: f64,
    pub avg_price_change: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TransitionReport {
    /// `None` when the report spans every timeframe.
    pub timeframe: Option<Timeframe>,
    pub total_transitions: u64,
    /// Sorted by count, most frequent first.
    pub transitions: Vec<TransitionStats>,
}

#[derive(Debug, Copy, Clone, PartialEq)]
struct TransitionAccumulator {
    count: u64,
    duration_sum: f64,
    duration_min: f64,
    duration_max: f64,
    price_change_sum: f64,
}

impl TransitionAccumulator {
    fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.duration_sum += other.duration_sum;
        self.duration_min = self.duration_min.min(other.duration_min);
        self.duration_max = self.duration_max.max(other.duration_max);
        self.price_change_sum += other.price_change_sum;
    }
}

/// Running transition counts and durations keyed by level pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionTable {
    transitions: FnvHashMap<(LevelId, LevelId), TransitionAccumulator>,
}

impl TransitionTable {
    pub fn record(&mut self, movement: &Movement) {
        let sample = TransitionAccumulator {
            count: 1,
            duration_sum: movement.duration_secs,
            duration_min: movement.duration_secs,
            duration_max: movement.duration_secs,
            price_change_sum: movement.price_delta,
        };

        self.transitions
            .entry((movement.from_level, movement.to_level))
            .and_modify(|accumulator| accumulator.merge(&sample))
            .or_insert(sample);
    }

    pub fn merge(&mut self, other: &TransitionTable) {
        for (key, accumulator) in &other.transitions {
            self.transitions
                .entry(*key)
                .and_modify(|existing| existing.merge(accumulator))
                .or_insert(*accumulator);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    pub fn report(&self, timeframe: Option<Timeframe>) -> TransitionReport {
        let mut transitions: Vec<TransitionStats> = self
            .transitions
            .iter()
            .map(|((from_level, to_level), accumulator)| TransitionStats {
                from_level: *from_level,
                to_level: *to_level,
                count: accumulator.count,
                avg_duration_secs: accumulator.duration_sum / accumulator.count as f64,
                min_duration_secs: accumulator.duration_min,
                max_duration_secs: accumulator.duration_max,
                avg_price_change: accumulator.price_change_sum / accumulator.count as f64,
            })
            .collect();

        transitions.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then(a.from_level.cmp(&b.from_level))
                .then(a.to_level.cmp(&b.to_level))
        });

        TransitionReport {
            timeframe,
            total_transitions: transitions.iter().map(|stats| stats.count).sum(),
            transitions,
        }
    }
}

/// Outcome of feeding one hit to a [`MovementTracker`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedMovement {
    pub movement: Movement,
    pub pattern: Option<PatternKind>,
}

/// Links consecutive hits of one timeframe into a movement chain.
#[derive(Debug, Clone)]
pub struct MovementTracker {
    timeframe: Timeframe,
    last_hit: Option<Hit>,
    chain: Option<MovementChain>,
    links: FnvHashMap<HitId, HitId>,
    transitions: TransitionTable,
}

impl MovementTracker {
    pub fn new(timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            last_hit: None,
            chain: None,
            links: FnvHashMap::default(),
            transitions: TransitionTable::default(),
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Link `hit` to the previous hit of this timeframe.
    ///
    /// The first hit of a session only seeds the tracker. Hits for other timeframes are
    /// ignored.
    pub fn process_hit(&mut self, hit: &Hit) -> Option<TrackedMovement> {
        if hit.timeframe != self.timeframe {
            return None;
        }

        let Some(previous) = self.last_hit.replace(hit.clone()) else {
            debug!(timeframe = %self.timeframe, hit_id = %hit.id, level = %hit.level, "first hit of session");
            return None;
        };

        self.links.insert(previous.id, hit.id);

        let movement = Movement::between(&previous, hit);
        self.transitions.record(&movement);

        let chain = self
            .chain
            .get_or_insert_with(|| MovementChain::start(&movement));
        let (movement, pattern, evicted) = chain.push(movement);

        // Links only live as long as their movement is in the chain window
        if let Some(evicted) = evicted {
            self.links.remove(&evicted.from_hit_id);
        }

        debug!(
            timeframe = %self.timeframe,
            from = %movement.from_level,
            to = %movement.to_level,
            direction = %movement.direction,
            levels = movement.levels_traversed,
            velocity = movement.velocity,
            "movement linked"
        );

        if let Some(pattern) = pattern {
            info!(
                timeframe = %self.timeframe,
                %pattern,
                chain_id = %chain.chain_id,
                "pattern detected"
            );
        }

        Some(TrackedMovement { movement, pattern })
    }

    /// Seed the tracker with a persisted hit after a restart, without producing a movement.
    pub fn restore(&mut self, hit: Hit) {
        if hit.timeframe == self.timeframe {
            self.last_hit = Some(hit);
        }
    }

    /// Forget the session's chain, links and last hit. Transition statistics are kept.
    pub fn reset_session(&mut self) {
        self.last_hit = None;
        self.chain = None;
        self.links.clear();
    }

    pub fn last_hit(&self) -> Option<&Hit> {
        self.last_hit.as_ref()
    }

    pub fn chain(&self) -> Option<&MovementChain> {
        self.chain.as_ref()
    }

    /// Hit that followed `id` on this timeframe, if it has arrived and its movement is still
    /// held by the chain.
    pub fn next_hit_id(&self, id: HitId) -> Option<HitId> {
        self.links.get(&id).copied()
    }

    pub fn summary(&self) -> Option<ChainSummary> {
        self.chain.as_ref().map(MovementChain::summary)
    }

    pub fn transitions(&self) -> &TransitionTable {
        &self.transitions
    }
}
