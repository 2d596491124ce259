//! ATR level ladder.
//!
//! A [`LevelSet`] holds the reference price plus one level above and one below it for every
//! configured [`LadderRatio`], strictly increasing by value. Two open-ended overflow markers sit
//! at `reference ± 2×ATR` and are reported separately.
//!
//! Every level is identified by a [`LevelId`]. The declaration order of identifiers, from
//! `beyond_minus2atr` to `beyond_2atr`, is the canonical ordering used to count traversed
//! levels.

use crate::{atr::AtrState, error::LevelError, timeframe::Timeframe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{cmp::Ordering, fmt::Display, str::FromStr};

/// ATR values at or below this are treated as zero.
pub const ATR_EPSILON: f64 = 1e-9;

/// Number of canonical level identifiers, including both overflow markers.
pub const LEVEL_COUNT: usize = 27;

/// ATR multiple of a ladder rung, applied symmetrically above and below the reference price.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub enum LadderRatio {
    Trigger,
    R0382,
    R0500,
    R0618,
    R0786,
    R1000,
    R1236,
    R1382,
    R1500,
    R1618,
    R1786,
    R2000,
}

impl LadderRatio {
    pub const ALL: [LadderRatio; 12] = [
        LadderRatio::Trigger,
        LadderRatio::R0382,
        LadderRatio::R0500,
        LadderRatio::R0618,
        LadderRatio::R0786,
        LadderRatio::R1000,
        LadderRatio::R1236,
        LadderRatio::R1382,
        LadderRatio::R1500,
        LadderRatio::R1618,
        LadderRatio::R1786,
        LadderRatio::R2000,
    ];

    pub fn value(&self) -> f64 {
        match self {
            LadderRatio::Trigger => 0.236,
            LadderRatio::R0382 => 0.382,
            LadderRatio::R0500 => 0.5,
            LadderRatio::R0618 => 0.618,
            LadderRatio::R0786 => 0.786,
            LadderRatio::R1000 => 1.0,
            LadderRatio::R1236 => 1.236,
            LadderRatio::R1382 => 1.382,
            LadderRatio::R1500 => 1.5,
            LadderRatio::R1618 => 1.618,
            LadderRatio::R1786 => 1.786,
            LadderRatio::R2000 => 2.0,
        }
    }

    /// Name suffix, eg/ `"0382"` in `"upper_0382"`.
    pub fn suffix(&self) -> &'static str {
        match self {
            LadderRatio::Trigger => "trigger",
            LadderRatio::R0382 => "0382",
            LadderRatio::R0500 => "0500",
            LadderRatio::R0618 => "0618",
            LadderRatio::R0786 => "0786",
            LadderRatio::R1000 => "1000",
            LadderRatio::R1236 => "1236",
            LadderRatio::R1382 => "1382",
            LadderRatio::R1500 => "1500",
            LadderRatio::R1618 => "1618",
            LadderRatio::R1786 => "1786",
            LadderRatio::R2000 => "2000",
        }
    }

    /// Position from the reference price outward, `Trigger` is 0.
    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn from_value(value: f64) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|ratio| (ratio.value() - value).abs() < ATR_EPSILON)
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ratio| ratio.suffix() == suffix)
    }
}

/// Identifier of a ladder level or overflow marker.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum LevelId {
    /// Open-ended region below `reference - 2×ATR`.
    BeyondLower,
    Lower(LadderRatio),
    /// The reference price ("PDC").
    Reference,
    Upper(LadderRatio),
    /// Open-ended region above `reference + 2×ATR`.
    BeyondUpper,
}

impl LevelId {
    /// Position in the canonical ordering, 0 (`beyond_minus2atr`) to 26 (`beyond_2atr`).
    pub fn canonical_index(&self) -> usize {
        match self {
            LevelId::BeyondLower => 0,
            LevelId::Lower(ratio) => 12 - ratio.index(),
            LevelId::Reference => 13,
            LevelId::Upper(ratio) => 14 + ratio.index(),
            LevelId::BeyondUpper => LEVEL_COUNT - 1,
        }
    }

    pub fn from_canonical_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(LevelId::BeyondLower),
            1..=12 => LadderRatio::ALL.get(12 - index).copied().map(LevelId::Lower),
            13 => Some(LevelId::Reference),
            14..=25 => LadderRatio::ALL.get(index - 14).copied().map(LevelId::Upper),
            26 => Some(LevelId::BeyondUpper),
            _ => None,
        }
    }

    /// All identifiers in canonical order.
    pub fn all() -> impl Iterator<Item = LevelId> {
        (0..LEVEL_COUNT).filter_map(Self::from_canonical_index)
    }

    pub fn side(&self) -> LevelSide {
        match self {
            LevelId::BeyondLower | LevelId::Lower(_) => LevelSide::Lower,
            LevelId::Reference => LevelSide::Neutral,
            LevelId::Upper(_) | LevelId::BeyondUpper => LevelSide::Upper,
        }
    }

    pub fn is_overflow(&self) -> bool {
        matches!(self, LevelId::BeyondLower | LevelId::BeyondUpper)
    }

    /// Signed ATR multiple, overflow markers report their ±2.0 boundary.
    pub fn signed_ratio(&self) -> f64 {
        match self {
            LevelId::BeyondLower => -LadderRatio::R2000.value(),
            LevelId::Lower(ratio) => -ratio.value(),
            LevelId::Reference => 0.0,
            LevelId::Upper(ratio) => ratio.value(),
            LevelId::BeyondUpper => LadderRatio::R2000.value(),
        }
    }
}

impl Ord for LevelId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical_index().cmp(&other.canonical_index())
    }
}

impl PartialOrd for LevelId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for LevelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LevelId::BeyondLower => write!(f, "beyond_minus2atr"),
            LevelId::Lower(ratio) => write!(f, "lower_{}", ratio.suffix()),
            LevelId::Reference => write!(f, "PDC"),
            LevelId::Upper(ratio) => write!(f, "upper_{}", ratio.suffix()),
            LevelId::BeyondUpper => write!(f, "beyond_2atr"),
        }
    }
}

impl FromStr for LevelId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = match s {
            "beyond_minus2atr" => Some(LevelId::BeyondLower),
            "PDC" => Some(LevelId::Reference),
            "beyond_2atr" => Some(LevelId::BeyondUpper),
            _ => match s.split_once('_') {
                Some(("upper", suffix)) => LadderRatio::from_suffix(suffix).map(LevelId::Upper),
                Some(("lower", suffix)) => LadderRatio::from_suffix(suffix).map(LevelId::Lower),
                _ => None,
            },
        };

        parsed.ok_or_else(|| format!("unknown level identifier: {s}"))
    }
}

impl Serialize for LevelId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LevelId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        LevelId::from_str(&name).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelSide {
    Lower,
    Neutral,
    Upper,
}

#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct Level {
    #[serde(rename = "name")]
    pub id: LevelId,
    /// Signed ATR multiple, negative below the reference.
    pub ratio: f64,
    pub value: f64,
    pub side: LevelSide,
}

impl Level {
    fn new(id: LevelId, reference_price: f64, atr_value: f64) -> Self {
        let ratio = id.signed_ratio();
        Self {
            id,
            ratio,
            value: reference_price + atr_value * ratio,
            side: id.side(),
        }
    }
}

/// Ladder derived from exactly one ATR state.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LevelSet {
    pub timeframe: Timeframe,
    pub reference_price: f64,
    pub atr_value: f64,
    pub computed_at: Option<DateTime<Utc>>,
    /// Bounded levels ordered by strictly increasing value.
    pub levels: Vec<Level>,
}

impl LevelSet {
    pub fn get(&self, id: LevelId) -> Option<&Level> {
        self.levels.iter().find(|level| level.id == id)
    }

    pub fn reference(&self) -> Option<&Level> {
        self.get(LevelId::Reference)
    }

    /// Lower and upper overflow boundaries, `reference ± 2×ATR`.
    pub fn overflow_bounds(&self) -> (f64, f64) {
        let span = self.atr_value * LadderRatio::R2000.value();
        (self.reference_price - span, self.reference_price + span)
    }

    /// Overflow markers anchored at their boundaries, lower first.
    pub fn overflow_markers(&self) -> [Level; 2] {
        [
            Level::new(LevelId::BeyondLower, self.reference_price, self.atr_value),
            Level::new(LevelId::BeyondUpper, self.reference_price, self.atr_value),
        ]
    }

    pub fn position(&self, price: f64, count: usize) -> PositionAnalysis {
        let distance = price - self.reference_price;
        let atr_multiple = if self.atr_value > ATR_EPSILON {
            distance / self.atr_value
        } else {
            0.0
        };
        let percent_from_reference = if self.reference_price > 0.0 {
            distance / self.reference_price * 100.0
        } else {
            0.0
        };

        let (above, below) = find_nearest_levels(price, self, count);
        let nearby = |level: &Level| NearbyLevel {
            id: level.id,
            value: level.value,
            distance: (level.value - price).abs(),
        };

        PositionAnalysis {
            timeframe: self.timeframe,
            price,
            reference_price: self.reference_price,
            atr_value: self.atr_value,
            distance_from_reference: distance,
            atr_multiple,
            percent_from_reference,
            zone: classify_zone(price, self.reference_price, self.atr_value),
            nearest_above: above.iter().map(nearby).collect(),
            nearest_below: below.iter().map(nearby).collect(),
        }
    }
}

/// Builds ladders for a fixed ordered list of ratios.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelCalculator {
    ratios: Vec<LadderRatio>,
}

impl Default for LevelCalculator {
    fn default() -> Self {
        Self::new(LadderRatio::ALL)
    }
}

impl LevelCalculator {
    pub fn new(ratios: impl IntoIterator<Item = LadderRatio>) -> Self {
        let mut ratios: Vec<LadderRatio> = ratios.into_iter().collect();
        ratios.sort();
        ratios.dedup();
        Self { ratios }
    }

    pub fn ratios(&self) -> &[LadderRatio] {
        &self.ratios
    }

    pub fn calculate_levels(
        &self,
        reference_price: f64,
        atr_value: f64,
        timeframe: Timeframe,
    ) -> Result<LevelSet, LevelError> {
        if !reference_price.is_finite() || !atr_value.is_finite() {
            return Err(LevelError::LevelsUnavailable {
                timeframe,
                reason: format!("non-finite input: reference {reference_price}, ATR {atr_value}"),
            });
        }

        if atr_value <= ATR_EPSILON {
            return Err(LevelError::LevelsUnavailable {
                timeframe,
                reason: format!("ATR {atr_value} is zero"),
            });
        }

        let levels = self
            .ratios
            .iter()
            .rev()
            .map(|ratio| LevelId::Lower(*ratio))
            .chain(std::iter::once(LevelId::Reference))
            .chain(self.ratios.iter().map(|ratio| LevelId::Upper(*ratio)))
            .map(|id| Level::new(id, reference_price, atr_value))
            .collect();

        Ok(LevelSet {
            timeframe,
            reference_price,
            atr_value,
            computed_at: None,
            levels,
        })
    }

    pub fn from_atr(&self, state: &AtrState) -> Result<LevelSet, LevelError> {
        let mut set = self.calculate_levels(state.reference_price, state.atr_value, state.timeframe)?;
        set.computed_at = Some(state.computed_at);
        Ok(set)
    }
}

/// The `count` nearest bounded levels strictly above and strictly below `price`, each sorted
/// by distance from `price`.
pub fn find_nearest_levels(price: f64, levels: &LevelSet, count: usize) -> (Vec<Level>, Vec<Level>) {
    let above = levels
        .levels
        .iter()
        .filter(|level| level.value > price)
        .take(count)
        .copied()
        .collect();

    let below = levels
        .levels
        .iter()
        .rev()
        .filter(|level| level.value < price)
        .take(count)
        .copied()
        .collect();

    (above, below)
}

/// Band of the ladder a price sits in.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum Zone {
    #[serde(rename = "beyond_+2ATR")]
    BeyondUpper,
    #[serde(rename = "between_+1ATR_and_+2ATR")]
    UpperExtension,
    #[serde(rename = "between_PDC_and_+1ATR")]
    UpperCore,
    #[serde(rename = "between_PDC_and_-1ATR")]
    LowerCore,
    #[serde(rename = "between_-1ATR_and_-2ATR")]
    LowerExtension,
    #[serde(rename = "beyond_-2ATR")]
    BeyondLower,
    /// ATR is zero, no band can be assigned.
    #[serde(rename = "neutral")]
    Neutral,
}

impl Display for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Zone::BeyondUpper => "beyond_+2ATR",
            Zone::UpperExtension => "between_+1ATR_and_+2ATR",
            Zone::UpperCore => "between_PDC_and_+1ATR",
            Zone::LowerCore => "between_PDC_and_-1ATR",
            Zone::LowerExtension => "between_-1ATR_and_-2ATR",
            Zone::BeyondLower => "beyond_-2ATR",
            Zone::Neutral => "neutral",
        };
        write!(f, "{label}")
    }
}

/// Bucket `price` by its ATR multiple from `reference_price`. Upper bands are open below,
/// so a price exactly on the reference falls in [`Zone::LowerCore`].
pub fn classify_zone(price: f64, reference_price: f64, atr_value: f64) -> Zone {
    if atr_value.is_nan() || atr_value <= ATR_EPSILON || !price.is_finite() || !reference_price.is_finite() {
        return Zone::Neutral;
    }

    match (price - reference_price) / atr_value {
        multiple if multiple > 2.0 => Zone::BeyondUpper,
        multiple if multiple > 1.0 => Zone::UpperExtension,
        multiple if multiple > 0.0 => Zone::UpperCore,
        multiple if multiple > -1.0 => Zone::LowerCore,
        multiple if multiple > -2.0 => Zone::LowerExtension,
        _ => Zone::BeyondLower,
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct NearbyLevel {
    #[serde(rename = "name")]
    pub id: LevelId,
    pub value: f64,
    /// Absolute distance from the analysed price.
    pub distance: f64,
}

/// Where a price sits relative to one timeframe's ladder.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PositionAnalysis {
    pub timeframe: Timeframe,
    pub price: f64,
    pub reference_price: f64,
    pub atr_value: f64,
    pub distance_from_reference: f64,
    pub atr_multiple: f64,
    pub percent_from_reference: f64,
    pub zone: Zone,
    pub nearest_above: Vec<NearbyLevel>,
    pub nearest_below: Vec<NearbyLevel>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ladder(reference: f64, atr: f64) -> LevelSet {
        LevelCalculator::default()
            .calculate_levels(reference, atr, Timeframe::Day1)
            .unwrap()
    }

    #[test]
    fn test_level_names_and_canonical_order() {
        let names: Vec<String> = LevelId::all().map(|id| id.to_string()).collect();
        assert_eq!(names.len(), LEVEL_COUNT);
        assert_eq!(names[0], "beyond_minus2atr");
        assert_eq!(names[1], "lower_2000");
        assert_eq!(names[12], "lower_trigger");
        assert_eq!(names[13], "PDC");
        assert_eq!(names[14], "upper_trigger");
        assert_eq!(names[15], "upper_0382");
        assert_eq!(names[25], "upper_2000");
        assert_eq!(names[26], "beyond_2atr");

        for (index, id) in LevelId::all().enumerate() {
            assert_eq!(id.canonical_index(), index);
            assert_eq!(names[index].parse::<LevelId>(), Ok(id));
        }

        assert!(LevelId::Lower(LadderRatio::R2000) < LevelId::Lower(LadderRatio::Trigger));
        assert!("upper_0300".parse::<LevelId>().is_err());
    }

    #[test]
    fn test_level_id_serde_uses_name() {
        let id = LevelId::Upper(LadderRatio::R0382);
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"upper_0382\"");
        assert_eq!(serde_json::from_str::<LevelId>("\"PDC\"").unwrap(), LevelId::Reference);
    }

    #[test]
    fn test_ladder_is_monotonic_and_symmetric() {
        for (reference, atr) in [(5000.0, 10.0), (100.0, 2.0), (0.5, 0.013), (42_000.0, 1234.5)] {
            let set = ladder(reference, atr);
            assert_eq!(set.levels.len(), 25);
            assert!(set.levels.windows(2).all(|pair| pair[0].value < pair[1].value));

            let neutral: Vec<&Level> = set
                .levels
                .iter()
                .filter(|level| level.side == LevelSide::Neutral)
                .collect();
            assert_eq!(neutral.len(), 1);
            assert_eq!(neutral[0].ratio, 0.0);
            assert_eq!(neutral[0].value, reference);

            for ratio in LadderRatio::ALL {
                let upper = set.get(LevelId::Upper(ratio)).unwrap().value;
                let lower = set.get(LevelId::Lower(ratio)).unwrap().value;
                assert!(((upper - reference) - (reference - lower)).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_ladder_values() {
        let set = ladder(100.0, 2.0);
        assert_eq!(set.get(LevelId::Upper(LadderRatio::R1000)).unwrap().value, 102.0);
        assert_eq!(set.get(LevelId::Lower(LadderRatio::R1000)).unwrap().value, 98.0);
        assert_eq!(set.overflow_bounds(), (96.0, 104.0));
        assert!(set.get(LevelId::BeyondUpper).is_none());
    }

    #[test]
    fn test_levels_unavailable() {
        let calculator = LevelCalculator::default();
        for (reference, atr) in [(100.0, 0.0), (100.0, 1e-12), (f64::NAN, 1.0), (100.0, f64::INFINITY)] {
            let error = calculator
                .calculate_levels(reference, atr, Timeframe::Hour1)
                .unwrap_err();
            assert!(matches!(error, LevelError::LevelsUnavailable { .. }));
            assert!(error.is_not_ready());
        }
    }

    #[test]
    fn test_subset_ladder() {
        let calculator = LevelCalculator::new([LadderRatio::R1000, LadderRatio::R0500]);
        let set = calculator.calculate_levels(10.0, 1.0, Timeframe::Min5).unwrap();
        let names: Vec<String> = set.levels.iter().map(|level| level.id.to_string()).collect();
        assert_eq!(
            names,
            vec!["lower_1000", "lower_0500", "PDC", "upper_0500", "upper_1000"]
        );
    }

    #[test]
    fn test_find_nearest_levels() {
        let set = ladder(100.0, 10.0);
        let (above, below) = find_nearest_levels(104.0, &set, 3);

        let above: Vec<LevelId> = above.iter().map(|level| level.id).collect();
        let below: Vec<LevelId> = below.iter().map(|level| level.id).collect();
        assert_eq!(
            above,
            vec![
                LevelId::Upper(LadderRatio::R0500),
                LevelId::Upper(LadderRatio::R0618),
                LevelId::Upper(LadderRatio::R0786),
            ]
        );
        assert_eq!(
            below,
            vec![
                LevelId::Upper(LadderRatio::R0382),
                LevelId::Upper(LadderRatio::Trigger),
                LevelId::Reference,
            ]
        );

        // A price sitting on a level excludes it from both sides
        let (above, below) = find_nearest_levels(100.0, &set, 1);
        assert_eq!(above[0].id, LevelId::Upper(LadderRatio::Trigger));
        assert_eq!(below[0].id, LevelId::Lower(LadderRatio::Trigger));
    }

    #[test]
    fn test_classify_zone() {
        struct TestCase {
            input: f64,
            expected: Zone,
        }

        let tests = vec![
            TestCase {
                // TC0
                input: 125.0,
                expected: Zone::BeyondUpper,
            },
            TestCase {
                // TC1
                input: 115.0,
                expected: Zone::UpperExtension,
            },
            TestCase {
                // TC2
                input: 110.0,
                expected: Zone::UpperCore,
            },
            TestCase {
                // TC3: on the reference
                input: 100.0,
                expected: Zone::LowerCore,
            },
            TestCase {
                // TC4
                input: 88.0,
                expected: Zone::LowerExtension,
            },
            TestCase {
                // TC5
                input: 80.0,
                expected: Zone::BeyondLower,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = classify_zone(test.input, 100.0, 10.0);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }

        assert_eq!(classify_zone(120.0, 100.0, 0.0), Zone::Neutral);
    }

    #[test]
    fn test_position_analysis() {
        let set = ladder(5000.0, 10.0);
        let analysis = set.position(5007.0, 2);

        assert_eq!(analysis.zone, Zone::UpperCore);
        assert!((analysis.atr_multiple - 0.7).abs() < 1e-9);
        assert!((analysis.percent_from_reference - 0.14).abs() < 1e-9);
        assert_eq!(analysis.nearest_above.len(), 2);
        assert_eq!(analysis.nearest_above[0].id, LevelId::Upper(LadderRatio::R0786));
        assert!((analysis.nearest_above[0].distance - 0.86).abs() < 1e-9);
        assert_eq!(analysis.nearest_below[0].id, LevelId::Upper(LadderRatio::R0618));
    }
}
