use barter_levels::{
    Bar, JsonLinesStore, LevelError, LevelPipeline, PipelineConfig, PipelineStats, PriceTick,
    Timeframe, error::StoreError, movement::TransitionReport, spawn_writer,
};
use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// JSON-lines file hits, links and patterns are appended to.
const ENV_STORE_PATH: &str = "LEVELS_STORE_PATH";

/// Optional JSON-lines file of closed [`Bar`]s used to warm up ATR.
const ENV_HISTORY_PATH: &str = "LEVELS_HISTORY_PATH";

/// Set to "json" for JSON log output.
const ENV_LOG_FORMAT: &str = "LEVELS_LOG_FORMAT";

const DEFAULT_STORE_PATH: &str = "levels-hits.jsonl";

#[derive(Debug, Error)]
enum ReplayError {
    #[error(transparent)]
    Level(#[from] LevelError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("{path} line {line}: {source}")]
    History {
        path: String,
        line: usize,
        source: serde_json::Error,
    },
}

impl From<StoreError> for ReplayError {
    fn from(value: StoreError) -> Self {
        Self::Level(LevelError::Store(value))
    }
}

/// Printed to stdout once the input is exhausted.
#[derive(Debug, Serialize)]
struct ReplayReport {
    instrument: String,
    stats: PipelineStats,
    malformed_lines: u64,
    sessions: u64,
    active_chains: IndexMap<Timeframe, barter_levels::ChainSummary>,
    transitions: TransitionReport,
}

#[tokio::main]
async fn main() {
    init_logging();

    if let Err(error) = run().await {
        error!(%error, "replay failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ReplayError> {
    let config = PipelineConfig::from_env().map_err(LevelError::from)?;

    let store_path =
        std::env::var(ENV_STORE_PATH).unwrap_or_else(|_| DEFAULT_STORE_PATH.to_string());
    let store = Arc::new(JsonLinesStore::open(&store_path).await?);

    let mut pipeline = LevelPipeline::new(config)?;
    pipeline.restore_from(store.as_ref()).await?;

    if let Ok(history_path) = std::env::var(ENV_HISTORY_PATH) {
        seed_history(&mut pipeline, PathBuf::from(history_path)).await?;
    }

    let (persistence, writer) = spawn_writer(store);
    let mut pipeline = pipeline.with_persistence(persistence);

    info!(
        instrument = %pipeline.config().instrument,
        store = %store_path,
        "replaying ticks from stdin"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut malformed_lines = 0;
    let mut sessions = 0;
    let mut session_date: Option<NaiveDate> = None;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, draining persistence");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let tick = match serde_json::from_str::<PriceTick>(&line) {
            Ok(tick) => tick,
            Err(error) => {
                malformed_lines += 1;
                warn!(%error, %line, "skipping unreadable tick");
                continue;
            }
        };

        // New trading day starts a new movement session
        let date = tick.timestamp.date_naive();
        if session_date.is_some_and(|current| current != date) {
            pipeline.reset_session();
        }
        if session_date != Some(date) {
            sessions += 1;
            session_date = Some(date);
        }

        let outcome = match pipeline.ingest(&tick) {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(%error, "tick dropped");
                continue;
            }
        };

        for hit in &outcome.hits {
            info!(
                timeframe = %hit.timeframe,
                hit_id = %hit.id,
                level = %hit.level,
                direction = %hit.direction,
                price = hit.price_at_cross,
                "hit"
            );
        }
        for movement in &outcome.movements {
            info!(
                timeframe = %movement.timeframe,
                from = %movement.from_level,
                to = %movement.to_level,
                direction = %movement.direction,
                duration_secs = movement.duration_secs,
                velocity = movement.velocity,
                "movement"
            );
        }
        for (pattern, movement) in outcome.patterns() {
            info!(timeframe = %movement.timeframe, %pattern, "pattern");
        }
    }

    let report = ReplayReport {
        instrument: pipeline.config().instrument.to_string(),
        stats: pipeline.stats(),
        malformed_lines,
        sessions,
        active_chains: pipeline.active_chains(),
        transitions: pipeline.transition_statistics(None)?,
    };

    drop(pipeline);
    let summary = writer.join().await;
    info!(
        hits = summary.hits_written,
        links = summary.links_written,
        patterns = summary.patterns_written,
        failures = summary.failures,
        "persistence drained"
    );

    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{json}"),
        Err(error) => warn!(%error, "failed to serialise replay report"),
    }

    Ok(())
}

/// Load closed bars (one JSON [`Bar`] per line) into the pipeline, grouped by timeframe.
async fn seed_history(pipeline: &mut LevelPipeline, path: PathBuf) -> Result<(), ReplayError> {
    let contents = tokio::fs::read_to_string(&path).await?;

    let mut grouped: IndexMap<Timeframe, Vec<Bar>> = IndexMap::new();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let bar: Bar = serde_json::from_str(line).map_err(|source| ReplayError::History {
            path: path.display().to_string(),
            line: index + 1,
            source,
        })?;
        grouped.entry(bar.timeframe).or_default().push(bar);
    }

    for (timeframe, bars) in grouped {
        match pipeline.seed_history(timeframe, bars) {
            Ok(count) => info!(%timeframe, bars = count, "history seeded"),
            Err(LevelError::UnsupportedTimeframe(_)) => {
                warn!(%timeframe, "history for unconfigured timeframe ignored")
            }
            Err(error) => return Err(error.into()),
        }
    }

    Ok(())
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // Logs go to stderr, stdout carries the replay report
    match std::env::var(ENV_LOG_FORMAT).as_deref() {
        Ok("json") => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}
