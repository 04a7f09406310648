//! Shared automaton state across instances
//!
//! Every phase transition is written under [`SYNC_KEY`]. Other instances
//! sharing the store receive the write through [`SyncStore::subscribe`] and
//! adopt it only when it is newer than the last snapshot they wrote or
//! adopted. Snapshots are ordered by timestamp, then origin, so every
//! instance settles on the same winner.

use super::state::AutomatonPhase;
use crate::error::GateResult;
use crate::transport::AbortOnDrop;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

pub const SYNC_KEY: &str = "gate-automaton-sync";

const UPDATE_CHANNEL_CAPACITY: usize = 32;
const FILE_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    /// Instance that wrote the snapshot
    pub origin: Uuid,
    pub phase: AutomatonPhase,
    pub opened_at: Option<DateTime<Utc>>,
    pub auto_close_remaining_s: u32,
    pub open_duration_elapsed_s: u64,
    pub timestamp: DateTime<Utc>,
}

/// Total order over snapshots written by any instance
pub type SyncVersion = (DateTime<Utc>, Uuid);

impl SyncSnapshot {
    pub fn version(&self) -> SyncVersion {
        (self.timestamp, self.origin)
    }

    /// Whether this snapshot wins over the last one seen
    pub fn supersedes(&self, last_seen: Option<SyncVersion>) -> bool {
        last_seen.map_or(true, |last| self.version() > last)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncUpdate {
    pub key: String,
    pub snapshot: SyncSnapshot,
}

/// Key-value slot shared by automaton instances
#[async_trait]
pub trait SyncStore: Send + Sync + Debug {
    async fn get(&self, key: &str) -> GateResult<Option<SyncSnapshot>>;

    async fn set(&self, key: &str, snapshot: &SyncSnapshot) -> GateResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<SyncUpdate>;
}

/// In-process store; clones share the same slots
#[derive(Debug, Clone)]
pub struct MemorySyncStore {
    inner: Arc<MemoryInner>,
}

#[derive(Debug)]
struct MemoryInner {
    entries: Mutex<HashMap<String, SyncSnapshot>>,
    updates: broadcast::Sender<SyncUpdate>,
}

impl MemorySyncStore {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(MemoryInner {
                entries: Mutex::new(HashMap::new()),
                updates,
            }),
        }
    }
}

impl Default for MemorySyncStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SyncStore for MemorySyncStore {
    async fn get(&self, key: &str) -> GateResult<Option<SyncSnapshot>> {
        Ok(self.inner.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, snapshot: &SyncSnapshot) -> GateResult<()> {
        self.inner
            .entries
            .lock()
            .await
            .insert(key.to_string(), snapshot.clone());
        // No receivers is fine
        let _ = self.inner.updates.send(SyncUpdate {
            key: key.to_string(),
            snapshot: snapshot.clone(),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SyncUpdate> {
        self.inner.updates.subscribe()
    }
}

/// JSON file shared by processes on one host
///
/// Writes go through a temporary file and a rename. A watcher task re-reads
/// the file every second and broadcasts entries changed by other processes.
#[derive(Debug)]
pub struct FileSyncStore {
    shared: Arc<FileShared>,
    _watcher: AbortOnDrop,
}

#[derive(Debug)]
struct FileShared {
    path: PathBuf,
    /// Last contents seen or written by this process
    known: Mutex<HashMap<String, SyncSnapshot>>,
    updates: broadcast::Sender<SyncUpdate>,
}

impl FileSyncStore {
    /// Open (or lazily create) the store file. Must be called inside a runtime.
    pub async fn open(path: impl Into<PathBuf>) -> GateResult<Self> {
        let path = path.into();
        let known = read_entries(&path).await?;
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let shared = Arc::new(FileShared {
            path,
            known: Mutex::new(known),
            updates,
        });

        let watcher = tokio::spawn(watch_file(Arc::clone(&shared)));
        Ok(Self {
            shared,
            _watcher: AbortOnDrop(watcher),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }
}

#[async_trait]
impl SyncStore for FileSyncStore {
    async fn get(&self, key: &str) -> GateResult<Option<SyncSnapshot>> {
        let entries = read_entries(&self.shared.path).await?;
        Ok(entries.get(key).cloned())
    }

    /// Read-modify-write of the whole file, serialized within this process
    /// only. Concurrent writers in other processes race on the rename and
    /// the last one wins; the file itself is never left half written.
    async fn set(&self, key: &str, snapshot: &SyncSnapshot) -> GateResult<()> {
        let mut known = self.shared.known.lock().await;
        let mut entries = read_entries(&self.shared.path).await?;
        entries.insert(key.to_string(), snapshot.clone());
        write_entries(&self.shared.path, &entries).await?;
        *known = entries;
        drop(known);

        let _ = self.shared.updates.send(SyncUpdate {
            key: key.to_string(),
            snapshot: snapshot.clone(),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SyncUpdate> {
        self.shared.updates.subscribe()
    }
}

async fn read_entries(path: &Path) -> GateResult<HashMap<String, SyncSnapshot>> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(e.into()),
    }
}

async fn write_entries(path: &Path, entries: &HashMap<String, SyncSnapshot>) -> GateResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    // Per-write temp name so concurrent writers never share one
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", Uuid::new_v4().simple()));
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, serde_json::to_vec_pretty(entries)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn watch_file(shared: Arc<FileShared>) {
    let mut interval = tokio::time::interval(FILE_POLL_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let entries = match read_entries(&shared.path).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %shared.path.display(), error = %e, "Failed to read sync store");
                continue;
            }
        };

        let mut known = shared.known.lock().await;
        for (key, snapshot) in &entries {
            if known.get(key) != Some(snapshot) {
                debug!(key = %key, origin = %snapshot.origin, "External sync update");
                let _ = shared.updates.send(SyncUpdate {
                    key: key.clone(),
                    snapshot: snapshot.clone(),
                });
            }
        }
        *known = entries;
    }
}
