use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::checkpoint::{decode_checkpoint, encode_checkpoint};
use crate::errors::{ForecastError, ForecastResult};
use crate::models::{Forecast, ItemDescriptor, ModelCheckpoint, Observation};

/// Logical key for a per-item checkpoint
pub fn item_key(item_id: &str) -> String {
    format!("items/{}", item_id)
}

/// Logical key for a category warm-start checkpoint
pub fn category_key(category: &str) -> String {
    format!("pretrained/{}", category)
}

/// Audit event kinds emitted by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ObservationRejected,
    ForecastGenerated,
    ModelRetrained,
    CheckpointQuarantined,
    RetrainFailed,
}

/// Outcome attached to an audit record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// A single audit trail entry.
///
/// `details` carries a typed summary serialized to JSON; raw model state is
/// never included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub item_id: Option<String>,
    pub outcome: AuditOutcome,
    pub details: serde_json::Value,
}

impl AuditRecord {
    /// Create a record stamped with the current time
    pub fn new(
        action: AuditAction,
        item_id: Option<String>,
        outcome: AuditOutcome,
        details: serde_json::Value,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            item_id,
            outcome,
            details,
        }
    }
}

/// Durable, append-only observation history.
///
/// Readers must see every append committed before the read call.
#[async_trait]
pub trait ObservationStore: Send + Sync {
    /// Append one observation
    async fn append(&self, observation: Observation) -> ForecastResult<()>;

    /// All observations for an item in `[from, to]`, oldest first
    async fn range(
        &self,
        item_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ForecastResult<Vec<Observation>>;

    /// The newest observation for an item
    async fn last(&self, item_id: &str) -> ForecastResult<Option<Observation>>;

    /// Every item id with at least one observation
    async fn list_items(&self) -> ForecastResult<Vec<String>>;
}

/// Checkpoint persistence with atomic publication
#[async_trait]
pub trait ModelStore: Send + Sync {
    /// Load and validate the checkpoint at `key`; `Ok(None)` when absent
    async fn load(&self, key: &str) -> ForecastResult<Option<ModelCheckpoint>>;

    /// Atomically publish a checkpoint at `key`
    async fn store(&self, key: &str, checkpoint: &ModelCheckpoint) -> ForecastResult<()>;

    /// Categories with a warm-start checkpoint available
    async fn list_categories(&self) -> ForecastResult<Vec<String>>;

    /// Move a corrupt checkpoint aside (`.bad` suffix) so the next
    /// materialization falls through to warm-start
    async fn quarantine(&self, key: &str, reason: &str) -> ForecastResult<()>;

    /// Remove a checkpoint (item garbage collection)
    async fn remove(&self, key: &str) -> ForecastResult<()>;
}

/// Latest-forecast persistence keyed by `(item_id, horizon_days)`
#[async_trait]
pub trait ForecastStore: Send + Sync {
    /// Insert or replace the forecast for its `(item, horizon)` slot
    async fn upsert(&self, forecast: Forecast) -> ForecastResult<()>;

    /// The most recently created forecast for an item, across horizons
    async fn get_latest(&self, item_id: &str) -> ForecastResult<Option<Forecast>>;

    /// Record the observed run-out date on the item's stored forecasts
    async fn set_actual(&self, item_id: &str, date: DateTime<Utc>) -> ForecastResult<()>;
}

/// Receives audit records for the host's audit trail
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log(&self, record: AuditRecord) -> ForecastResult<()>;
}

/// Supplies read-only item descriptors from the inventory subsystem.
///
/// The scheduler resolves descriptors through this seam when it retrains
/// items that arrive without one.
#[async_trait]
pub trait DescriptorProvider: Send + Sync {
    async fn descriptor(&self, item_id: &str) -> ForecastResult<Option<ItemDescriptor>>;
}

/// In-memory descriptor provider for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryDescriptorProvider {
    descriptors: DashMap<String, ItemDescriptor>,
}

impl MemoryDescriptorProvider {
    /// Create an empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an item's descriptor
    pub fn insert(&self, item_id: &str, descriptor: ItemDescriptor) {
        self.descriptors.insert(item_id.to_string(), descriptor);
    }
}

#[async_trait]
impl DescriptorProvider for MemoryDescriptorProvider {
    async fn descriptor(
        &self,
        item_id: &str,
    ) -> ForecastResult<Option<ItemDescriptor>> {
        Ok(self.descriptors.get(item_id).map(|entry| entry.clone()))
    }
}

/// Cooperative cancellation flag checked at I/O boundaries and between
/// per-item iterations
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    cancelled: Arc<AtomicBool>,
}

impl CancelSignal {
    /// Create a fresh, uncancelled signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; observed at the next checkpoint
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Error out if cancellation has been requested
    pub fn check(&self) -> ForecastResult<()> {
        if self.is_cancelled() {
            Err(ForecastError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Run a store operation, retrying retryable failures with the given backoff
/// schedule before giving up.
pub async fn with_store_retry<T, F, Fut>(backoff: &[Duration], mut op: F) -> ForecastResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ForecastResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < backoff.len() => {
                tracing::debug!(attempt, error = %err, "retrying store operation");
                tokio::time::sleep(backoff[attempt]).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// In-memory observation store for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryObservationStore {
    observations: DashMap<String, Vec<Observation>>,
}

impl MemoryObservationStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObservationStore for MemoryObservationStore {
    async fn append(&self, observation: Observation) -> ForecastResult<()> {
        let mut entry = self
            .observations
            .entry(observation.item_id.clone())
            .or_default();
        entry.push(observation);
        // Stable sort keeps arrival order for identical timestamps, so the
        // later record wins when the history is folded.
        entry.sort_by_key(|obs| obs.timestamp);
        Ok(())
    }

    async fn range(
        &self,
        item_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ForecastResult<Vec<Observation>> {
        Ok(self
            .observations
            .get(item_id)
            .map(|entry| {
                entry
                    .iter()
                    .filter(|obs| obs.timestamp >= from && obs.timestamp <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn last(&self, item_id: &str) -> ForecastResult<Option<Observation>> {
        Ok(self
            .observations
            .get(item_id)
            .and_then(|entry| entry.last().cloned()))
    }

    async fn list_items(&self) -> ForecastResult<Vec<String>> {
        let mut items: Vec<String> = self
            .observations
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        items.sort();
        Ok(items)
    }
}

/// In-memory model store for embedding and tests.
///
/// Checkpoints round-trip through the same binary envelope as the filesystem
/// store, so corruption and schema handling behave identically.
#[derive(Debug, Default)]
pub struct MemoryModelStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryModelStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the raw bytes at `key` (test hook for corruption scenarios)
    pub fn put_raw(&self, key: &str, bytes: Vec<u8>) {
        self.blobs.insert(key.to_string(), bytes);
    }

    /// Whether a quarantined blob exists for `key`
    pub fn is_quarantined(&self, key: &str) -> bool {
        self.blobs.contains_key(&format!("{}.bad", key))
    }
}

#[async_trait]
impl ModelStore for MemoryModelStore {
    async fn load(&self, key: &str) -> ForecastResult<Option<ModelCheckpoint>> {
        match self.blobs.get(key) {
            Some(bytes) => decode_checkpoint(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn store(&self, key: &str, checkpoint: &ModelCheckpoint) -> ForecastResult<()> {
        let bytes = encode_checkpoint(checkpoint)?;
        self.blobs.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn list_categories(&self) -> ForecastResult<Vec<String>> {
        let mut categories: Vec<String> = self
            .blobs
            .iter()
            .filter_map(|entry| {
                entry
                    .key()
                    .strip_prefix("pretrained/")
                    .filter(|rest| !rest.ends_with(".bad"))
                    .map(|rest| rest.to_string())
            })
            .collect();
        categories.sort();
        Ok(categories)
    }

    async fn quarantine(&self, key: &str, reason: &str) -> ForecastResult<()> {
        if let Some((_, bytes)) = self.blobs.remove(key) {
            tracing::warn!(key, reason, "quarantined checkpoint");
            self.blobs.insert(format!("{}.bad", key), bytes);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> ForecastResult<()> {
        self.blobs.remove(key);
        Ok(())
    }
}

/// Filesystem model store.
///
/// Layout under the root directory:
/// `pretrained/{category}.ckpt` for warm starts and `items/{item_id}.ckpt`
/// per item. Writes go to `{name}.ckpt.tmp`, are fsynced, then renamed over
/// the target, so a partial write never replaces a valid file.
#[derive(Debug, Clone)]
pub struct FsModelStore {
    root: PathBuf,
}

impl FsModelStore {
    /// Create a store rooted at `root`
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// The store's root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.ckpt", key))
    }
}

#[async_trait]
impl ModelStore for FsModelStore {
    async fn load(&self, key: &str) -> ForecastResult<Option<ModelCheckpoint>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => decode_checkpoint(key, &bytes).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ForecastError::store_unavailable(
                "model",
                format!("{}: {}", path.display(), err),
            )),
        }
    }

    async fn store(&self, key: &str, checkpoint: &ModelCheckpoint) -> ForecastResult<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension("ckpt.tmp");
        let bytes = encode_checkpoint(checkpoint)?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn list_categories(&self) -> ForecastResult<Vec<String>> {
        let dir = self.root.join("pretrained");
        let mut categories = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(categories),
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".ckpt") {
                categories.push(stem.to_string());
            }
        }
        categories.sort();
        Ok(categories)
    }

    async fn quarantine(&self, key: &str, reason: &str) -> ForecastResult<()> {
        let path = self.path_for(key);
        let quarantined = path.with_extension("ckpt.bad");
        match tokio::fs::rename(&path, &quarantined).await {
            Ok(()) => {
                tracing::warn!(key, reason, "quarantined checkpoint file");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn remove(&self, key: &str) -> ForecastResult<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory forecast store for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryForecastStore {
    forecasts: DashMap<(String, u32), Forecast>,
}

impl MemoryForecastStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// The forecast stored for an exact `(item, horizon)` slot
    pub fn get(&self, item_id: &str, horizon_days: u32) -> Option<Forecast> {
        self.forecasts
            .get(&(item_id.to_string(), horizon_days))
            .map(|entry| entry.clone())
    }
}

#[async_trait]
impl ForecastStore for MemoryForecastStore {
    async fn upsert(&self, forecast: Forecast) -> ForecastResult<()> {
        self.forecasts
            .insert((forecast.item_id.clone(), forecast.horizon_days), forecast);
        Ok(())
    }

    async fn get_latest(&self, item_id: &str) -> ForecastResult<Option<Forecast>> {
        Ok(self
            .forecasts
            .iter()
            .filter(|entry| entry.key().0 == item_id)
            .max_by_key(|entry| entry.created_at)
            .map(|entry| entry.clone()))
    }

    async fn set_actual(&self, item_id: &str, date: DateTime<Utc>) -> ForecastResult<()> {
        for mut entry in self.forecasts.iter_mut() {
            if entry.key().0 == item_id {
                entry.actual_runout_date = Some(date);
            }
        }
        Ok(())
    }
}

/// In-memory audit sink capturing records in arrival order
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all captured records
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    /// Count of records with the given action
    pub fn count(&self, action: AuditAction) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|record| record.action == action)
            .count()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn log(&self, record: AuditRecord) -> ForecastResult<()> {
        self.records.lock().push(record);
        Ok(())
    }
}
