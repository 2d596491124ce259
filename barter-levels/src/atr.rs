use crate::{aggregation::Bar, error::LevelError, timeframe::Timeframe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Extra bars retained beyond the ATR period so Wilder smoothing has history to settle over.
pub const HISTORY_MARGIN: usize = 10;

/// Output of the ATR engine for one timeframe.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct AtrState {
    pub timeframe: Timeframe,
    pub period_length: usize,
    pub atr_value: f64,
    /// Close of the most recent closed bar, the zero point of the level ladder.
    pub reference_price: f64,
    /// Period end of the bar the state was computed from.
    pub computed_at: DateTime<Utc>,
}

/// True Range of a bar given the previous bar's close.
pub fn true_range(high: f64, low: f64, prev_close: f64) -> f64 {
    (high - low)
        .max((high - prev_close).abs())
        .max((prev_close - low).abs())
}

#[derive(Debug, Copy, Clone, PartialEq)]
struct BarPoint {
    period_end: DateTime<Utc>,
    high: f64,
    low: f64,
    close: f64,
}

/// Bounded per-timeframe bar history producing Wilder-smoothed ATR values.
#[derive(Debug, Clone)]
pub struct AtrSeries {
    timeframe: Timeframe,
    period_length: usize,
    history: VecDeque<BarPoint>,
}

impl AtrSeries {
    pub fn new(timeframe: Timeframe, period_length: usize) -> Self {
        let period_length = period_length.max(1);
        Self {
            timeframe,
            period_length,
            history: VecDeque::with_capacity(period_length + HISTORY_MARGIN),
        }
    }

    /// Number of closed bars needed before an ATR value is produced.
    fn required_bars(&self) -> usize {
        self.period_length + 1
    }

    pub fn add_bar(&mut self, period_end: DateTime<Utc>, high: f64, low: f64, close: f64) {
        if self.history.len() >= self.period_length + HISTORY_MARGIN {
            self.history.pop_front();
        }
        self.history.push_back(BarPoint {
            period_end,
            high,
            low,
            close,
        });
    }

    pub fn push(&mut self, bar: &Bar) {
        self.add_bar(bar.period_end, bar.high, bar.low, bar.close);
    }

    /// Compute the current ATR.
    ///
    /// The first value is the simple mean of the first `period_length` True Ranges in the
    /// retained history, each later True Range is folded in with Wilder smoothing.
    pub fn compute(&self) -> Result<AtrState, LevelError> {
        let required = self.required_bars();
        let Some(last) = self.history.back() else {
            return Err(self.insufficient(required));
        };
        if self.history.len() < required {
            return Err(self.insufficient(required));
        }

        let true_ranges = self
            .history
            .iter()
            .zip(self.history.iter().skip(1))
            .map(|(prev, bar)| true_range(bar.high, bar.low, prev.close));

        let period = self.period_length as f64;
        let mut seed_sum = 0.0;
        let mut atr = 0.0;
        for (index, tr) in true_ranges.enumerate() {
            if index < self.period_length {
                seed_sum += tr;
                if index + 1 == self.period_length {
                    atr = seed_sum / period;
                }
            } else {
                atr = (atr * (period - 1.0) + tr) / period;
            }
        }

        Ok(AtrState {
            timeframe: self.timeframe,
            period_length: self.period_length,
            atr_value: atr.max(0.0),
            reference_price: last.close,
            computed_at: last.period_end,
        })
    }

    fn insufficient(&self, required: usize) -> LevelError {
        LevelError::InsufficientData {
            timeframe: self.timeframe,
            available: self.history.len(),
            required,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn day(n: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_709_510_400, 0).unwrap() + TimeDelta::days(n)
    }

    #[test]
    fn test_true_range() {
        struct TestCase {
            input: (f64, f64, f64),
            expected: f64,
        }

        let tests = vec![
            TestCase {
                // TC0: range dominates
                input: (105.0, 100.0, 102.0),
                expected: 5.0,
            },
            TestCase {
                // TC1: gap up dominates
                input: (110.0, 108.0, 100.0),
                expected: 10.0,
            },
            TestCase {
                // TC2: gap down dominates
                input: (95.0, 92.0, 100.0),
                expected: 8.0,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let (high, low, prev_close) = test.input;
            let actual = true_range(high, low, prev_close);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_warm_up_requires_period_plus_one_bars() {
        let mut series = AtrSeries::new(Timeframe::Day1, 14);

        assert_eq!(
            series.compute(),
            Err(LevelError::InsufficientData {
                timeframe: Timeframe::Day1,
                available: 0,
                required: 15,
            })
        );

        for n in 0..14 {
            series.add_bar(day(n), 101.0, 99.0, 100.0);
        }
        assert!(series.compute().unwrap_err().is_not_ready());

        series.add_bar(day(14), 101.0, 99.0, 100.0);
        let state = series.compute().unwrap();
        assert_eq!(state.atr_value, 2.0);
        assert_eq!(state.reference_price, 100.0);
        assert_eq!(state.computed_at, day(14));
    }

    #[test]
    fn test_constant_price_series_has_zero_atr() {
        let mut series = AtrSeries::new(Timeframe::Hour1, 5);
        for n in 0..20 {
            series.add_bar(day(n), 50.0, 50.0, 50.0);
        }
        assert_eq!(series.compute().unwrap().atr_value, 0.0);
    }

    #[test]
    fn test_wilder_smoothing_after_seed() {
        let mut series = AtrSeries::new(Timeframe::Day1, 3);
        // TRs: 2, 2, 2 seed ATR = 2, then TR 8 => (2 * 2 + 8) / 3 = 4
        series.add_bar(day(0), 101.0, 99.0, 100.0);
        series.add_bar(day(1), 101.0, 99.0, 100.0);
        series.add_bar(day(2), 101.0, 99.0, 100.0);
        series.add_bar(day(3), 101.0, 99.0, 100.0);
        series.add_bar(day(4), 104.0, 96.0, 97.0);

        let state = series.compute().unwrap();
        assert!((state.atr_value - 4.0).abs() < 1e-12);
        assert_eq!(state.reference_price, 97.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut series = AtrSeries::new(Timeframe::Min5, 14);
        for n in 0..100 {
            series.add_bar(day(n), 10.0 + n as f64, 9.0 + n as f64, 9.5 + n as f64);
        }
        assert_eq!(series.history.len(), 14 + HISTORY_MARGIN);
        assert!(series.compute().unwrap().atr_value >= 0.0);
    }
}
