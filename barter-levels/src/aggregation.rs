//! Minute-bar buffering and multi-timeframe OHLCV resampling.
//!
//! Minute bars are stamped with the end of their minute. When the first minute of a new period
//! arrives, the previous period is folded (first/max/min/last/sum) into a closed bar and archived
//! per timeframe, so closed bars outlive the minutes they were built from. The trailing
//! in-progress period is never emitted.

use crate::{
    error::LevelError,
    timeframe::{Timeframe, minute_end},
};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

/// One week of minute bars.
pub const DEFAULT_BUFFER_CAPACITY: usize = 10_080;

/// Upper bound on closed bars (seeded or derived) retained per timeframe.
pub const MAX_CLOSED_BARS: usize = 1_000;

/// Closed OHLCV bar for one timeframe period.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Bar {
    pub timeframe: Timeframe,
    pub period_end: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Minute resolution OHLCV bar held in the aggregator buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct MinuteBar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl MinuteBar {
    /// Construct a minute bar, widening high/low so that `low <= {open, close} <= high`.
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        let (high, low) = if high < low { (low, high) } else { (high, low) };
        Self {
            timestamp,
            open,
            high: high.max(open).max(close),
            low: low.min(open).min(close),
            close,
            volume,
        }
    }

    fn merge(&mut self, high: f64, low: f64, close: f64, volume: f64) {
        self.high = self.high.max(high).max(close);
        self.low = self.low.min(low).min(close);
        self.close = close;
        self.volume += volume;
    }
}

/// Buffers minute bars (FIFO ring, bounded) and resamples them into configured timeframes.
#[derive(Debug, Clone)]
pub struct TimeframeAggregator {
    capacity: usize,
    timeframes: Vec<Timeframe>,
    minutes: VecDeque<MinuteBar>,
    closed: IndexMap<Timeframe, VecDeque<Bar>>,
    evicted_through: Option<DateTime<Utc>>,
    revision: u64,
}

impl TimeframeAggregator {
    pub fn new(timeframes: impl IntoIterator<Item = Timeframe>, capacity: usize) -> Self {
        let timeframes: Vec<Timeframe> = timeframes.into_iter().collect();
        let capacity = capacity.max(1);
        Self {
            capacity,
            closed: timeframes.iter().map(|tf| (*tf, VecDeque::new())).collect(),
            timeframes,
            minutes: VecDeque::with_capacity(capacity.min(DEFAULT_BUFFER_CAPACITY)),
            evicted_through: None,
            revision: 0,
        }
    }

    pub fn timeframes(&self) -> &[Timeframe] {
        &self.timeframes
    }

    /// Append a minute bar, evicting the oldest bar once capacity is exceeded.
    ///
    /// Timestamps are expected to be non-decreasing and mark the end of the minute.
    pub fn add_minute_bar(
        &mut self,
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) {
        self.push(MinuteBar::new(timestamp, open, high, low, close, volume));
    }

    /// Treat a single observation as an update of the minute bar containing `timestamp`.
    pub fn add_tick(
        &mut self,
        timestamp: DateTime<Utc>,
        price: f64,
        high: Option<f64>,
        low: Option<f64>,
        volume: Option<f64>,
    ) {
        let stamp = minute_end(timestamp);
        let high = high.unwrap_or(price);
        let low = low.unwrap_or(price);
        let volume = volume.unwrap_or(0.0);

        match self.minutes.back_mut() {
            Some(current) if current.timestamp == stamp => {
                current.merge(high, low, price, volume);
            }
            _ => self.push(MinuteBar::new(stamp, price, high, low, price, volume)),
        }
    }

    fn push(&mut self, bar: MinuteBar) {
        // Periods close before eviction so a full-buffer period is archived intact
        if let Some(previous) = self.minutes.back().map(|minute| minute.timestamp) {
            let closing: Vec<Bar> = self
                .timeframes
                .iter()
                .filter_map(|timeframe| self.closing_bar(*timeframe, previous, bar.timestamp))
                .collect();
            closing.into_iter().for_each(|closed| self.archive(closed));
        }

        if self.minutes.len() >= self.capacity {
            if let Some(evicted) = self.minutes.pop_front() {
                self.evicted_through = Some(evicted.timestamp);
            }
        }
        self.minutes.push_back(bar);
        self.revision += 1;
    }

    /// Fold the period ending with the `previous` minute if `next` starts a new one.
    fn closing_bar(
        &self,
        timeframe: Timeframe,
        previous: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Option<Bar> {
        let period_end = timeframe.period_end(previous);
        if timeframe.period_end(next) == period_end {
            return None;
        }

        // Period is longer than the buffer, its earliest minutes are gone
        if self
            .evicted_through
            .is_some_and(|evicted| timeframe.period_end(evicted) == period_end)
        {
            debug!(%timeframe, %period_end, "truncated period not archived");
            return None;
        }

        let mut minutes = self
            .minutes
            .iter()
            .rev()
            .take_while(|minute| timeframe.period_end(minute.timestamp) == period_end);

        let last = minutes.next()?;
        let mut bar = Bar {
            timeframe,
            period_end,
            open: last.open,
            high: last.high,
            low: last.low,
            close: last.close,
            volume: last.volume,
        };
        for minute in minutes {
            bar.open = minute.open;
            bar.high = bar.high.max(minute.high);
            bar.low = bar.low.min(minute.low);
            bar.volume += minute.volume;
        }
        Some(bar)
    }

    fn archive(&mut self, bar: Bar) {
        let Some(closed) = self.closed.get_mut(&bar.timeframe) else {
            return;
        };
        // Seeded history already covers this period
        if closed.back().is_some_and(|last| last.period_end >= bar.period_end) {
            return;
        }
        if closed.len() >= MAX_CLOSED_BARS {
            closed.pop_front();
        }
        closed.push_back(bar);
    }

    /// Load already-closed bars for `timeframe` (eg/ from a historical store). Bars for periods
    /// the aggregator has already closed itself are ignored.
    pub fn seed_history(
        &mut self,
        timeframe: Timeframe,
        bars: impl IntoIterator<Item = Bar>,
    ) -> Result<usize, LevelError> {
        let closed = self
            .closed
            .get_mut(&timeframe)
            .ok_or_else(|| LevelError::UnsupportedTimeframe(timeframe.to_string()))?;

        let mut merged: Vec<Bar> = closed.drain(..).collect();
        merged.extend(bars.into_iter().map(|bar| Bar { timeframe, ..bar }));
        // Stable sort keeps existing bars ahead of seeded duplicates
        merged.sort_by_key(|bar| bar.period_end);
        merged.dedup_by_key(|bar| bar.period_end);

        let start = merged.len().saturating_sub(MAX_CLOSED_BARS);
        closed.extend(merged.into_iter().skip(start));

        let total = closed.len();
        self.revision += 1;
        debug!(%timeframe, bars = total, "seeded bar history");
        Ok(total)
    }

    /// Closed bars for every configured timeframe.
    pub fn get_aggregated(&self) -> IndexMap<Timeframe, Vec<Bar>> {
        self.closed
            .iter()
            .map(|(timeframe, bars)| (*timeframe, bars.iter().cloned().collect()))
            .collect()
    }

    /// Closed bars for one timeframe, oldest first.
    pub fn closed_bars(&self, timeframe: Timeframe) -> Result<Vec<Bar>, LevelError> {
        self.get_history(timeframe, usize::MAX)
    }

    /// Most recent `n` closed bars for one timeframe, oldest first.
    pub fn get_history(&self, timeframe: Timeframe, n: usize) -> Result<Vec<Bar>, LevelError> {
        let closed = self
            .closed
            .get(&timeframe)
            .ok_or_else(|| LevelError::UnsupportedTimeframe(timeframe.to_string()))?;

        let start = closed.len().saturating_sub(n);
        Ok(closed.range(start..).cloned().collect())
    }

    /// Number of minute bars currently buffered.
    pub fn len(&self) -> usize {
        self.minutes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.minutes.is_empty()
    }

    /// Changes whenever a minute bar is started or history is seeded, ie/ whenever the set
    /// of closed bars may have changed.
    pub fn revision(&self) -> u64 {
        self.revision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    // 2024-03-04T00:00:00Z, a Monday
    fn midnight() -> DateTime<Utc> {
        DateTime::from_timestamp(1_709_510_400, 0).unwrap()
    }

    fn minute(n: i64) -> DateTime<Utc> {
        midnight() + TimeDelta::minutes(n)
    }

    #[test]
    fn test_resample_drops_trailing_partial_period() {
        let mut agg = TimeframeAggregator::new([Timeframe::Min5], 100);

        // Minutes ending 00:01..=00:05 form the period ending 00:05
        for i in 1..=5 {
            let price = 100.0 + i as f64;
            agg.add_minute_bar(minute(i), price, price + 1.0, price - 1.0, price, 10.0);
        }
        assert!(agg.closed_bars(Timeframe::Min5).unwrap().is_empty());

        // First minute of the next period closes the previous one
        agg.add_minute_bar(minute(6), 200.0, 201.0, 199.0, 200.0, 10.0);
        let bars = agg.closed_bars(Timeframe::Min5).unwrap();
        assert_eq!(bars.len(), 1);

        let bar = &bars[0];
        assert_eq!(bar.period_end, minute(5));
        assert_eq!(bar.open, 101.0);
        assert_eq!(bar.high, 106.0);
        assert_eq!(bar.low, 100.0);
        assert_eq!(bar.close, 105.0);
        assert_eq!(bar.volume, 50.0);
    }

    #[test]
    fn test_get_aggregated_covers_each_timeframe() {
        let mut agg = TimeframeAggregator::new([Timeframe::Min5, Timeframe::Min15], 1_000);
        for i in 1..=31 {
            agg.add_minute_bar(minute(i), 100.0, 101.0, 99.0, 100.0, 1.0);
        }

        let aggregated = agg.get_aggregated();
        assert_eq!(aggregated.len(), 2);
        assert_eq!(aggregated[&Timeframe::Min5].len(), 6);
        assert_eq!(aggregated[&Timeframe::Min15].len(), 2);
        assert_eq!(aggregated[&Timeframe::Min15][1].volume, 15.0);
    }

    #[test]
    fn test_unsupported_timeframe() {
        let agg = TimeframeAggregator::new([Timeframe::Min5], 10);
        assert_eq!(
            agg.closed_bars(Timeframe::Day1),
            Err(LevelError::UnsupportedTimeframe("1d".to_string()))
        );
        assert!(agg.get_history(Timeframe::Week1, 3).is_err());
    }

    #[test]
    fn test_ring_buffer_evicts_oldest_first() {
        let mut agg = TimeframeAggregator::new([Timeframe::Min5], 12);
        for i in 1..=20 {
            let price = i as f64;
            agg.add_minute_bar(minute(i), price, price, price, price, 1.0);
        }

        assert_eq!(agg.len(), 12);
        assert_eq!(agg.minutes.front().map(|bar| bar.timestamp), Some(minute(9)));
        assert_eq!(agg.minutes.back().map(|bar| bar.close), Some(20.0));

        // Periods archived on close survive the eviction of their minutes, 00:20 is still open
        let bars = agg.closed_bars(Timeframe::Min5).unwrap();
        let opens: Vec<f64> = bars.iter().map(|bar| bar.open).collect();
        assert_eq!(opens, vec![1.0, 6.0, 11.0]);
        assert_eq!(bars[2].period_end, minute(15));
        assert_eq!(bars[2].close, 15.0);
    }

    #[test]
    fn test_period_longer_than_buffer_is_not_archived() {
        let mut agg = TimeframeAggregator::new([Timeframe::Min5], 3);
        for i in 1..=11 {
            let price = i as f64;
            agg.add_minute_bar(minute(i), price, price, price, price, 1.0);
        }

        // Only the last three minutes of each period were buffered when it closed
        assert!(agg.closed_bars(Timeframe::Min5).unwrap().is_empty());
    }

    #[test]
    fn test_closed_bars_stay_contiguous_past_buffer_capacity() {
        let mut agg = TimeframeAggregator::new([Timeframe::Day1], 3 * 1_440);
        let seeded: Vec<Bar> = (0..15)
            .map(|n| Bar {
                timeframe: Timeframe::Day1,
                period_end: midnight() - TimeDelta::days(14 - n),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 0.0,
            })
            .collect();
        agg.seed_history(Timeframe::Day1, seeded).unwrap();

        // Eight full days of minutes plus the first minute of the ninth
        for i in 1..=8 * 1_440 + 1 {
            agg.add_minute_bar(minute(i), 100.0, 102.0, 98.0, 100.0, 1.0);
        }

        let bars = agg.closed_bars(Timeframe::Day1).unwrap();
        assert_eq!(bars.len(), 23);
        assert_eq!(bars[0].period_end, midnight() - TimeDelta::days(14));
        assert_eq!(bars[22].period_end, midnight() + TimeDelta::days(8));
        for pair in bars.windows(2) {
            assert_eq!(pair[1].period_end - pair[0].period_end, TimeDelta::days(1));
        }

        // Derived days are complete: 1440 minutes of volume each
        assert!(bars[15..].iter().all(|bar| bar.volume == 1_440.0));
    }

    #[test]
    fn test_seed_history_keeps_derived_bars_for_same_period() {
        let mut agg = TimeframeAggregator::new([Timeframe::Min5], 100);
        for i in 1..=6 {
            agg.add_minute_bar(minute(i), 100.0, 101.0, 99.0, 100.0, 1.0);
        }

        let seeded = [minute(0), minute(5)].map(|period_end| Bar {
            timeframe: Timeframe::Min5,
            period_end,
            open: 50.0,
            high: 50.0,
            low: 50.0,
            close: 50.0,
            volume: 0.0,
        });
        assert_eq!(agg.seed_history(Timeframe::Min5, seeded).unwrap(), 2);

        let bars = agg.closed_bars(Timeframe::Min5).unwrap();
        assert_eq!(bars[0].close, 50.0);
        assert_eq!(bars[1].period_end, minute(5));
        assert_eq!(bars[1].close, 100.0);
    }

    #[test]
    fn test_add_tick_merges_same_minute() {
        let mut agg = TimeframeAggregator::new([Timeframe::Min5], 100);
        let t = midnight() + TimeDelta::seconds(10);

        agg.add_tick(t, 100.0, None, None, Some(1.0));
        agg.add_tick(t + TimeDelta::seconds(20), 102.0, None, None, Some(2.0));
        agg.add_tick(t + TimeDelta::seconds(40), 99.0, None, None, None);
        assert_eq!(agg.len(), 1);

        agg.add_tick(t + TimeDelta::seconds(60), 101.0, None, None, None);
        assert_eq!(agg.len(), 2);
        assert_eq!(agg.minutes[0].high, 102.0);
        assert_eq!(agg.minutes[0].low, 99.0);
        assert_eq!(agg.minutes[0].close, 99.0);
        assert_eq!(agg.minutes[0].volume, 3.0);
        assert_eq!(agg.minutes[0].timestamp, minute(1));
    }

    #[test]
    fn test_get_history_returns_last_n() {
        let mut agg = TimeframeAggregator::new([Timeframe::Min5], 1_000);
        for i in 1..=51 {
            let price = i as f64;
            agg.add_minute_bar(minute(i), price, price, price, price, 1.0);
        }

        let history = agg.get_history(Timeframe::Min5, 3).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].period_end, minute(50));
        assert_eq!(history[0].period_end, minute(40));
    }

    #[test]
    fn test_seeded_history_precedes_derived_bars() {
        let mut agg = TimeframeAggregator::new([Timeframe::Day1], 10_000);
        let seeded: Vec<Bar> = (1..=3)
            .map(|day| Bar {
                timeframe: Timeframe::Day1,
                period_end: midnight() - TimeDelta::days(3 - day),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0 + day as f64,
                volume: 0.0,
            })
            .collect();

        assert_eq!(agg.seed_history(Timeframe::Day1, seeded).unwrap(), 3);
        assert_eq!(agg.closed_bars(Timeframe::Day1).unwrap().len(), 3);

        // A full day of minutes followed by the first minute of the next day
        for i in 1..=1_441 {
            agg.add_minute_bar(minute(i), 110.0, 111.0, 109.0, 110.0, 1.0);
        }

        let bars = agg.closed_bars(Timeframe::Day1).unwrap();
        assert_eq!(bars.len(), 4);
        assert_eq!(bars[2].close, 103.0);
        assert_eq!(bars[3].period_end, midnight() + TimeDelta::days(1));
        assert_eq!(bars[3].close, 110.0);
    }

    #[test]
    fn test_minute_bar_normalises_range() {
        let bar = MinuteBar::new(minute(1), 100.0, 98.0, 101.0, 102.0, 0.0);
        assert_eq!(bar.high, 102.0);
        assert_eq!(bar.low, 98.0);
    }
}
