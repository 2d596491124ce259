use crate::{aggregation::DEFAULT_BUFFER_CAPACITY, level::LadderRatio, timeframe::Timeframe};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{path::Path, str::FromStr};
use thiserror::Error;

/// Environment variable naming a JSON configuration file.
pub const ENV_CONFIG_PATH: &str = "LEVELS_CONFIG";
pub const ENV_INSTRUMENT: &str = "LEVELS_INSTRUMENT";
pub const ENV_TIMEFRAMES: &str = "LEVELS_TIMEFRAMES";
pub const ENV_ATR_PERIOD: &str = "LEVELS_ATR_PERIOD";
pub const ENV_TOLERANCE: &str = "LEVELS_TOLERANCE";
pub const ENV_BUFFER_CAPACITY: &str = "LEVELS_BUFFER_CAPACITY";
pub const ENV_RECENT_HITS: &str = "LEVELS_RECENT_HITS";

pub const DEFAULT_ATR_PERIOD: usize = 14;

/// Half a cent, suitable for two-decimal currency prices.
pub const DEFAULT_CROSSING_TOLERANCE: f64 = 0.005;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Error)]
pub enum ConfigError {
    #[error("at least one timeframe must be configured")]
    EmptyTimeframes,

    #[error("timeframe {0} configured more than once")]
    DuplicateTimeframe(Timeframe),

    #[error("ATR period for {timeframe} must be at least 1, got {period}")]
    InvalidAtrPeriod { timeframe: Timeframe, period: usize },

    #[error("ratio {0} is not a ladder ratio")]
    UnknownRatio(f64),

    #[error("ladder ratios must be strictly increasing")]
    UnorderedRatios,

    #[error("crossing tolerance must be finite and non-negative, got {0}")]
    InvalidTolerance(f64),

    #[error("{0} must be greater than zero")]
    InvalidCapacity(String),

    #[error("environment variable {name}={value} is invalid")]
    InvalidEnvVar { name: String, value: String },

    #[error("config json: {0}")]
    Json(String),

    #[error("config io: {0}")]
    Io(String),

    #[error("unsupported timeframe: {0}")]
    UnsupportedTimeframe(String),
}

/// ATR settings for one monitored timeframe.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct TimeframeConfig {
    pub timeframe: Timeframe,
    pub atr_period: usize,
}

impl TimeframeConfig {
    pub fn new(timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            atr_period: DEFAULT_ATR_PERIOD,
        }
    }

    pub fn with_atr_period(mut self, atr_period: usize) -> Self {
        self.atr_period = atr_period;
        self
    }
}

/// Initialisation parameters of a [`LevelPipeline`](crate::pipeline::LevelPipeline).
///
/// Immutable once the pipeline is constructed.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub instrument: SmolStr,
    pub timeframes: Vec<TimeframeConfig>,
    /// Ladder ratio magnitudes, each applied above and below the reference price.
    pub ratios: Vec<f64>,
    /// Price distance within which reaching a level counts as crossing it.
    pub crossing_tolerance: f64,
    /// Minute bars retained by the aggregator.
    pub buffer_capacity: usize,
    pub recent_hits_capacity: usize,
    /// Capacity of the [`LevelEvent`](crate::pipeline::LevelEvent) broadcast channel.
    pub event_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            instrument: SmolStr::new_static("SPX"),
            timeframes: [
                Timeframe::Min5,
                Timeframe::Min15,
                Timeframe::Hour1,
                Timeframe::Day1,
                Timeframe::Week1,
            ]
            .into_iter()
            .map(TimeframeConfig::new)
            .collect(),
            ratios: LadderRatio::ALL.iter().map(LadderRatio::value).collect(),
            crossing_tolerance: DEFAULT_CROSSING_TOLERANCE,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            recent_hits_capacity: 100,
            event_buffer: 1_024,
        }
    }
}

impl PipelineConfig {
    pub fn new(instrument: impl Into<SmolStr>) -> Self {
        Self {
            instrument: instrument.into(),
            ..Self::default()
        }
    }

    pub fn with_timeframes(mut self, timeframes: impl IntoIterator<Item = TimeframeConfig>) -> Self {
        self.timeframes = timeframes.into_iter().collect();
        self
    }

    pub fn with_crossing_tolerance(mut self, tolerance: f64) -> Self {
        self.crossing_tolerance = tolerance;
        self
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|error| ConfigError::Json(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path.as_ref()).map_err(|error| {
            ConfigError::Io(format!("{}: {error}", path.as_ref().display()))
        })?;
        Self::from_json_str(&json)
    }

    /// Build a configuration from the process environment.
    ///
    /// `LEVELS_CONFIG` optionally names a JSON file used as the base, individual `LEVELS_*`
    /// variables then override single fields.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// [`Self::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(ENV_CONFIG_PATH) {
            Some(path) => {
                let json = std::fs::read_to_string(&path)
                    .map_err(|error| ConfigError::Io(format!("{path}: {error}")))?;
                serde_json::from_str(&json).map_err(|error| ConfigError::Json(error.to_string()))?
            }
            None => Self::default(),
        };

        if let Some(instrument) = lookup(ENV_INSTRUMENT) {
            config.instrument = SmolStr::new(instrument.trim());
        }

        if let Some(value) = lookup(ENV_TIMEFRAMES) {
            let period = config
                .timeframes
                .first()
                .map_or(DEFAULT_ATR_PERIOD, |timeframe| timeframe.atr_period);

            config.timeframes = value
                .split(',')
                .filter(|label| !label.trim().is_empty())
                .map(|label| {
                    Timeframe::from_str(label)
                        .map(|timeframe| TimeframeConfig::new(timeframe).with_atr_period(period))
                        .map_err(|_| ConfigError::UnsupportedTimeframe(label.trim().to_string()))
                })
                .collect::<Result<_, _>>()?;
        }

        if let Some(period) = parse_env::<usize, _>(&lookup, ENV_ATR_PERIOD)? {
            config
                .timeframes
                .iter_mut()
                .for_each(|timeframe| timeframe.atr_period = period);
        }

        if let Some(tolerance) = parse_env(&lookup, ENV_TOLERANCE)? {
            config.crossing_tolerance = tolerance;
        }

        if let Some(capacity) = parse_env(&lookup, ENV_BUFFER_CAPACITY)? {
            config.buffer_capacity = capacity;
        }

        if let Some(capacity) = parse_env(&lookup, ENV_RECENT_HITS)? {
            config.recent_hits_capacity = capacity;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeframes.is_empty() {
            return Err(ConfigError::EmptyTimeframes);
        }

        for (index, entry) in self.timeframes.iter().enumerate() {
            if self.timeframes[..index]
                .iter()
                .any(|other| other.timeframe == entry.timeframe)
            {
                return Err(ConfigError::DuplicateTimeframe(entry.timeframe));
            }
            if entry.atr_period == 0 {
                return Err(ConfigError::InvalidAtrPeriod {
                    timeframe: entry.timeframe,
                    period: entry.atr_period,
                });
            }
        }

        self.ladder()?;

        if !self.crossing_tolerance.is_finite() || self.crossing_tolerance < 0.0 {
            return Err(ConfigError::InvalidTolerance(self.crossing_tolerance));
        }

        for (name, capacity) in [
            ("buffer_capacity", self.buffer_capacity),
            ("recent_hits_capacity", self.recent_hits_capacity),
            ("event_buffer", self.event_buffer),
        ] {
            if capacity == 0 {
                return Err(ConfigError::InvalidCapacity(name.to_string()));
            }
        }

        Ok(())
    }

    /// Resolve configured ratio magnitudes into [`LadderRatio`]s, rejecting unknown or
    /// unordered values.
    pub fn ladder(&self) -> Result<Vec<LadderRatio>, ConfigError> {
        let ladder = self
            .ratios
            .iter()
            .map(|ratio| LadderRatio::from_value(*ratio).ok_or(ConfigError::UnknownRatio(*ratio)))
            .collect::<Result<Vec<_>, _>>()?;

        if ladder.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(ConfigError::UnorderedRatios);
        }

        Ok(ladder)
    }

    pub fn timeframe_list(&self) -> Vec<Timeframe> {
        self.timeframes.iter().map(|entry| entry.timeframe).collect()
    }
}

fn parse_env<T, F>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidEnvVar {
                    name: name.to_string(),
                    value,
                })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.instrument, "SPX");
        assert_eq!(config.timeframes.len(), 5);
        assert!(config.timeframes.iter().all(|entry| entry.atr_period == 14));
        assert_eq!(config.ratios.len(), 12);
        assert_eq!(config.crossing_tolerance, 0.005);
        assert_eq!(config.buffer_capacity, 10_080);
        assert_eq!(config.recent_hits_capacity, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        struct TestCase {
            input: PipelineConfig,
            expected: Result<(), ConfigError>,
        }

        let tests = vec![
            TestCase {
                // TC0: no timeframes
                input: PipelineConfig::default().with_timeframes([]),
                expected: Err(ConfigError::EmptyTimeframes),
            },
            TestCase {
                // TC1: duplicate timeframe
                input: PipelineConfig::default().with_timeframes([
                    TimeframeConfig::new(Timeframe::Day1),
                    TimeframeConfig::new(Timeframe::Day1),
                ]),
                expected: Err(ConfigError::DuplicateTimeframe(Timeframe::Day1)),
            },
            TestCase {
                // TC2: zero ATR period
                input: PipelineConfig::default()
                    .with_timeframes([TimeframeConfig::new(Timeframe::Hour1).with_atr_period(0)]),
                expected: Err(ConfigError::InvalidAtrPeriod {
                    timeframe: Timeframe::Hour1,
                    period: 0,
                }),
            },
            TestCase {
                // TC3: ratio outside the ladder
                input: PipelineConfig {
                    ratios: vec![0.236, 0.3],
                    ..PipelineConfig::default()
                },
                expected: Err(ConfigError::UnknownRatio(0.3)),
            },
            TestCase {
                // TC4: ratios out of order
                input: PipelineConfig {
                    ratios: vec![0.5, 0.382],
                    ..PipelineConfig::default()
                },
                expected: Err(ConfigError::UnorderedRatios),
            },
            TestCase {
                // TC5: negative tolerance
                input: PipelineConfig::default().with_crossing_tolerance(-0.01),
                expected: Err(ConfigError::InvalidTolerance(-0.01)),
            },
            TestCase {
                // TC6: zero buffer
                input: PipelineConfig::default().with_buffer_capacity(0),
                expected: Err(ConfigError::InvalidCapacity("buffer_capacity".to_string())),
            },
            TestCase {
                // TC7: subset ladder is valid
                input: PipelineConfig {
                    ratios: vec![0.382, 0.618, 1.0],
                    ..PipelineConfig::default()
                },
                expected: Ok(()),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.validate();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_from_json_str_fills_defaults() {
        let config = PipelineConfig::from_json_str(
            r#"{"instrument":"ES","timeframes":[{"timeframe":"1d","atr_period":20}]}"#,
        )
        .unwrap();

        assert_eq!(config.instrument, "ES");
        assert_eq!(
            config.timeframes,
            vec![TimeframeConfig::new(Timeframe::Day1).with_atr_period(20)]
        );
        assert_eq!(config.crossing_tolerance, DEFAULT_CROSSING_TOLERANCE);
        assert_eq!(config.ladder().unwrap(), LadderRatio::ALL.to_vec());
    }

    #[test]
    fn test_from_json_str_rejects_malformed() {
        assert!(matches!(
            PipelineConfig::from_json_str("{not json"),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = PipelineConfig::from_lookup(lookup(&[
            (ENV_INSTRUMENT, "NDX"),
            (ENV_TIMEFRAMES, "5m, 1h"),
            (ENV_ATR_PERIOD, "10"),
            (ENV_TOLERANCE, "0.01"),
        ]))
        .unwrap();

        assert_eq!(config.instrument, "NDX");
        assert_eq!(config.timeframe_list(), vec![Timeframe::Min5, Timeframe::Hour1]);
        assert!(config.timeframes.iter().all(|entry| entry.atr_period == 10));
        assert_eq!(config.crossing_tolerance, 0.01);
    }

    #[test]
    fn test_from_lookup_rejects_malformed_values() {
        assert_eq!(
            PipelineConfig::from_lookup(lookup(&[(ENV_BUFFER_CAPACITY, "lots")])),
            Err(ConfigError::InvalidEnvVar {
                name: ENV_BUFFER_CAPACITY.to_string(),
                value: "lots".to_string(),
            })
        );
        assert_eq!(
            PipelineConfig::from_lookup(lookup(&[(ENV_TIMEFRAMES, "5m,2h")])),
            Err(ConfigError::UnsupportedTimeframe("2h".to_string()))
        );
    }
}
