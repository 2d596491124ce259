//! Persistence collaborator interface and the background writer that feeds it.
//!
//! In-memory pipeline state is authoritative. Writes are queued on an unbounded channel and
//! applied by a spawned [`WriterTask`], so a slow or failing store never blocks ingestion. A
//! failed write is logged with its full payload and the writer moves on to the next record.

use crate::{
    crossing::{Hit, HitId},
    error::StoreError,
    movement::Movement,
    timeframe::Timeframe,
};
use async_trait::async_trait;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{io::AsyncWriteExt, sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

/// Append-only sink for hits, hit links and pattern detections.
#[async_trait]
pub trait HitStore: Send + Sync {
    async fn store_hit(&self, hit: &Hit) -> Result<(), StoreError>;

    async fn store_pattern(&self, movement: &Movement) -> Result<(), StoreError>;

    /// Record that `to` followed `from` on the same timeframe.
    async fn store_link(&self, from: HitId, to: HitId) -> Result<(), StoreError> {
        let _ = (from, to);
        Ok(())
    }

    /// Most recent persisted hit per timeframe, used to resume chains after a restart.
    async fn latest_hits(&self) -> Result<Vec<Hit>, StoreError> {
        Ok(Vec::new())
    }
}

/// Record written by the persistence writer.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum StoreCommand {
    Hit(Hit),
    Link { from: HitId, to: HitId },
    Pattern(Movement),
}

fn latest_per_timeframe(hits: impl IntoIterator<Item = Hit>) -> Vec<Hit> {
    let mut latest: FnvHashMap<Timeframe, Hit> = FnvHashMap::default();
    for hit in hits {
        match latest.get(&hit.timeframe) {
            Some(existing) if existing.id >= hit.id => {}
            _ => {
                latest.insert(hit.timeframe, hit);
            }
        }
    }

    let mut latest: Vec<Hit> = latest.into_values().collect();
    latest.sort_by_key(|hit| hit.timeframe);
    latest
}

#[derive(Debug, Default)]
struct MemoryRecords {
    hits: Vec<Hit>,
    links: Vec<(HitId, HitId)>,
    patterns: Vec<Movement>,
}

/// [`HitStore`] keeping every record in memory. Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<MemoryRecords>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hits(&self) -> Vec<Hit> {
        self.records.lock().hits.clone()
    }

    pub fn links(&self) -> Vec<(HitId, HitId)> {
        self.records.lock().links.clone()
    }

    pub fn patterns(&self) -> Vec<Movement> {
        self.records.lock().patterns.clone()
    }
}

#[async_trait]
impl HitStore for MemoryStore {
    async fn store_hit(&self, hit: &Hit) -> Result<(), StoreError> {
        self.records.lock().hits.push(hit.clone());
        Ok(())
    }

    async fn store_pattern(&self, movement: &Movement) -> Result<(), StoreError> {
        self.records.lock().patterns.push(movement.clone());
        Ok(())
    }

    async fn store_link(&self, from: HitId, to: HitId) -> Result<(), StoreError> {
        self.records.lock().links.push((from, to));
        Ok(())
    }

    async fn latest_hits(&self) -> Result<Vec<Hit>, StoreError> {
        Ok(latest_per_timeframe(self.hits()))
    }
}

/// [`HitStore`] appending one JSON document per line to a file.
#[derive(Debug)]
pub struct JsonLinesStore {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonLinesStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        info!(path = %path.display(), "opened json lines hit store");
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, record: &StoreCommand) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Every readable record in the file, skipping lines that fail to parse.
    pub async fn records(&self) -> Result<Vec<StoreCommand>, StoreError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        Ok(contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(index, line)| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(error) => {
                    warn!(path = %self.path.display(), line = index + 1, %error, "skipping unreadable store record");
                    None
                }
            })
            .collect())
    }
}

#[async_trait]
impl HitStore for JsonLinesStore {
    async fn store_hit(&self, hit: &Hit) -> Result<(), StoreError> {
        self.append(&StoreCommand::Hit(hit.clone())).await
    }

    async fn store_pattern(&self, movement: &Movement) -> Result<(), StoreError> {
        self.append(&StoreCommand::Pattern(movement.clone())).await
    }

    async fn store_link(&self, from: HitId, to: HitId) -> Result<(), StoreError> {
        self.append(&StoreCommand::Link { from, to }).await
    }

    async fn latest_hits(&self) -> Result<Vec<Hit>, StoreError> {
        let hits = self
            .records()
            .await?
            .into_iter()
            .filter_map(|record| match record {
                StoreCommand::Hit(hit) => Some(hit),
                _ => None,
            });

        Ok(latest_per_timeframe(hits))
    }
}

/// Cloneable, non-blocking entry point to the persistence writer.
#[derive(Debug, Clone)]
pub struct PersistenceHandle {
    tx: mpsc::UnboundedSender<StoreCommand>,
}

impl PersistenceHandle {
    /// Queue `command`. Returns false if the writer has already stopped.
    pub fn send(&self, command: StoreCommand) -> bool {
        match self.tx.send(command) {
            Ok(()) => true,
            Err(mpsc::error::SendError(command)) => {
                warn!(?command, "persistence writer stopped, record dropped");
                false
            }
        }
    }

    pub fn store_hit(&self, hit: &Hit) -> bool {
        self.send(StoreCommand::Hit(hit.clone()))
    }

    pub fn store_link(&self, from: HitId, to: HitId) -> bool {
        self.send(StoreCommand::Link { from, to })
    }

    pub fn store_pattern(&self, movement: &Movement) -> bool {
        self.send(StoreCommand::Pattern(movement.clone()))
    }
}

/// Counts reported by a drained [`WriterTask`].
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct WriterSummary {
    pub hits_written: u64,
    pub links_written: u64,
    pub patterns_written: u64,
    pub failures: u64,
}

/// Spawned persistence writer. Runs until every [`PersistenceHandle`] is dropped.
#[derive(Debug)]
pub struct WriterTask {
    handle: JoinHandle<WriterSummary>,
}

impl WriterTask {
    /// Wait for queued records to be written.
    pub async fn join(self) -> WriterSummary {
        match self.handle.await {
            Ok(summary) => summary,
            Err(error) => {
                error!(%error, "persistence writer task failed");
                WriterSummary::default()
            }
        }
    }
}

/// Spawn the persistence writer for `store` on the current tokio runtime.
pub fn spawn_writer<Store>(store: Arc<Store>) -> (PersistenceHandle, WriterTask)
where
    Store: HitStore + ?Sized + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<StoreCommand>();

    let handle = tokio::spawn(async move {
        let mut summary = WriterSummary::default();

        while let Some(command) = rx.recv().await {
            let result = match &command {
                StoreCommand::Hit(hit) => store.store_hit(hit).await,
                StoreCommand::Link { from, to } => store.store_link(*from, *to).await,
                StoreCommand::Pattern(movement) => store.store_pattern(movement).await,
            };

            match (result, &command) {
                (Ok(()), StoreCommand::Hit(_)) => summary.hits_written += 1,
                (Ok(()), StoreCommand::Link { .. }) => summary.links_written += 1,
                (Ok(()), StoreCommand::Pattern(_)) => summary.patterns_written += 1,
                (Err(error), _) => {
                    summary.failures += 1;
                    warn!(%error, ?command, "persistence write failed, in-memory state retained");
                }
            }
        }

        debug!(?summary, "persistence writer drained");
        summary
    });

    (PersistenceHandle { tx }, WriterTask { handle })
}
