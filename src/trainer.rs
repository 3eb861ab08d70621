use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::errors::{ForecastError, ForecastResult};
use crate::features::{FeatureBuilder, FeatureVector, FEATURE_WIDTH};
use crate::models::{
    CheckpointOwner, ItemDescriptor, ModelCheckpoint, ModelParameters, ModelState, Observation,
    StateCovariance, TrainingStats,
};
use crate::state_space::StateSpaceModel;
use crate::stores::{
    category_key, item_key, with_store_retry, AuditAction, AuditOutcome, AuditRecord, AuditSink,
    CancelSignal, ModelStore, ObservationStore,
};

/// Observations consulted when estimating the initial consumption rate.
const RECENT_WINDOW_OBS: usize = 14;

/// Maximum passes over history during a full retrain.
const MAX_RETRAIN_PASSES: usize = 3;

/// Relative MSE improvement below which retrain passes stop.
const RETRAIN_MSE_TOLERANCE: f64 = 0.01;

/// Mutable per-item registry entry.
///
/// Exactly one of these exists in memory per resident item; all access goes
/// through the per-item mutex, which serializes ingestion, forecasting, and
/// retraining for that item.
#[derive(Debug, Clone)]
pub struct ItemEntry {
    pub item_id: String,
    pub category: String,
    pub model_id: Uuid,
    pub model: StateSpaceModel,
    pub state: ModelState,
    pub covariance: StateCovariance,
    pub stats: TrainingStats,
    pub version: u64,
    pub quantity_max: f64,
    pub last_obs_ts: Option<DateTime<Utc>>,
    /// Newest observation timestamp covered by the last persisted checkpoint;
    /// the persist rate limit is measured in observation time, not wall clock
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    pub last_full_retrain_at: DateTime<Utc>,
    pub dirty: bool,
    /// Forces the next scheduler pass to retrain regardless of cadence
    pub retrain_due: bool,
    pub consecutive_retrain_failures: u32,
}

impl ItemEntry {
    fn to_checkpoint(&self, version: u64) -> ModelCheckpoint {
        ModelCheckpoint {
            model_id: self.model_id,
            owner: CheckpointOwner::Item(self.item_id.clone()),
            version,
            parameters: self.model.parameters().clone(),
            state: self.state,
            covariance: self.covariance,
            trained_at: self.last_full_retrain_at,
            feature_names: FeatureBuilder::feature_names(),
            stats: self.stats.clone(),
        }
    }
}

/// Read-only snapshot of an item's model, taken under the per-item lock
#[derive(Debug, Clone)]
pub struct ModelSnapshot {
    pub model: StateSpaceModel,
    pub state: ModelState,
    pub covariance: StateCovariance,
    pub stats: TrainingStats,
    pub version: u64,
    pub last_obs_ts: Option<DateTime<Utc>>,
}

/// Outcome of folding a history through the filter
pub(crate) struct FoldOutcome {
    pub(crate) model: StateSpaceModel,
    pub(crate) state: ModelState,
    pub(crate) covariance: StateCovariance,
    pub(crate) stats: TrainingStats,
    pub(crate) mse: f64,
}

/// Per-item model registry and online training driver.
///
/// Owns all mutable model state in the core. Each entry is guarded by its own
/// mutex; work on different items never contends. Cold items are lazily
/// reloaded from the model store, falling back to the category warm-start and
/// then to defaults.
pub struct OnlineTrainer {
    config: CoreConfig,
    features: FeatureBuilder,
    observations: Arc<dyn ObservationStore>,
    models: Arc<dyn ModelStore>,
    audit: Arc<dyn AuditSink>,
    registry: DashMap<String, Arc<Mutex<ItemEntry>>>,
    lru: SyncMutex<VecDeque<String>>,
}

impl OnlineTrainer {
    /// Create a trainer over the given collaborators
    pub fn new(
        config: CoreConfig,
        features: FeatureBuilder,
        observations: Arc<dyn ObservationStore>,
        models: Arc<dyn ModelStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config,
            features,
            observations,
            models,
            audit,
            registry: DashMap::new(),
            lru: SyncMutex::new(VecDeque::new()),
        }
    }

    /// The trainer's configuration
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// The trainer's feature builder
    pub fn features(&self) -> &FeatureBuilder {
        &self.features
    }

    /// Ingest one observation: validate, append to history, filter, adapt
    /// parameters, and persist (rate-limited).
    pub async fn on_observation(
        &self,
        observation: &Observation,
        descriptor: &ItemDescriptor,
    ) -> ForecastResult<()> {
        if let Err(err) = observation.validate().and_then(|_| descriptor.validate()) {
            self.audit_rejection(&observation.item_id, &err).await;
            return Err(err);
        }

        let entry = self.entry(&observation.item_id, descriptor).await?;
        let mut entry = entry.lock().await;
        entry.quantity_max = descriptor.quantity_max;

        // Out-of-order handling: observations older than the newest processed
        // timestamp are either rejected (outside the backfill window) or folded
        // in by re-filtering the whole history.
        if let Some(last_ts) = entry.last_obs_ts {
            if observation.timestamp < last_ts {
                let age = last_ts - observation.timestamp;
                if age > Duration::days(i64::from(self.config.backfill_window_days)) {
                    let err = ForecastError::invalid_observation(
                        &observation.item_id,
                        format!(
                            "Backfill {} days old exceeds the {}-day window",
                            age.num_days(),
                            self.config.backfill_window_days
                        ),
                    );
                    self.audit_rejection(&observation.item_id, &err).await;
                    return Err(err);
                }

                self.append_observation(observation).await?;
                return self
                    .refilter(&mut entry, descriptor, observation.timestamp)
                    .await;
            }
        }

        self.append_observation(observation).await?;

        let features = self.features.build(observation.timestamp, descriptor);
        match self.filter_step(&mut entry, &features, observation) {
            Ok(()) => {}
            Err(err @ ForecastError::NumericalFault { .. }) => {
                self.rewind_entry(&mut entry, descriptor).await?;
                entry.retrain_due = true;
                tracing::warn!(item_id = %observation.item_id, error = %err,
                    "discarded update after numerical fault; retrain scheduled");
                return Err(err);
            }
            Err(err) => return Err(err),
        }

        entry.last_obs_ts = Some(observation.timestamp);
        entry.dirty = true;

        let persist_due = entry
            .last_checkpoint_at
            .map(|covered| observation.timestamp - covered >= self.config.min_persist_interval())
            .unwrap_or(true);
        if persist_due {
            // A failed persist keeps the entry dirty; the write is retried on
            // the next observation.
            if let Err(err) = self.persist_entry(&mut entry).await {
                tracing::warn!(item_id = %entry.item_id, error = %err,
                    "checkpoint persist failed; will retry");
            }
        }

        Ok(())
    }

    /// One predict + update + gradient step on a locked entry
    fn filter_step(
        &self,
        entry: &mut ItemEntry,
        features: &FeatureVector,
        observation: &Observation,
    ) -> ForecastResult<()> {
        let (predicted, covariance_pred, y_hat) =
            entry
                .model
                .predict(&entry.state, &entry.covariance, features);
        let error = observation.quantity - y_hat;

        let update = entry.model.update(
            &entry.item_id,
            &predicted,
            &covariance_pred,
            observation.quantity,
            entry.quantity_max,
        )?;

        apply_gradient_step(
            entry.model.parameters_mut(),
            features,
            error,
            self.config.learning_rate,
            self.config.ewma_alpha,
        );

        entry.stats.record(error, observation.timestamp);
        entry.state = update.state;
        entry.covariance = update.covariance;
        Ok(())
    }

    /// Whether the entry is due for a full retrain at `now`
    pub fn needs_retrain(&self, entry: &ItemEntry, now: DateTime<Utc>) -> bool {
        if entry.retrain_due {
            return true;
        }

        if now - entry.last_full_retrain_at
            >= Duration::days(i64::from(self.config.retrain_interval_days))
        {
            return true;
        }

        let threshold = self.config.retrain_error_factor * entry.quantity_max;
        entry.stats.ewma_error.abs() > threshold
    }

    /// Whether the entry's retrains are paused after repeated failures.
    ///
    /// The pause lifts once the EWMA error crosses the retrain threshold
    /// again.
    pub fn retrain_paused(&self, entry: &ItemEntry) -> bool {
        entry.consecutive_retrain_failures >= self.config.max_retrain_failures
            && entry.stats.ewma_error.abs()
                <= self.config.retrain_error_factor * entry.quantity_max
    }

    /// Fully re-fit an item's model from its complete observation history.
    ///
    /// The rebuilt model starts from the category warm-start (or defaults) and
    /// folds the history for up to three passes, stopping early once the MSE
    /// improvement drops below one percent. The registry entry is replaced
    /// atomically under the per-item lock; on failure the prior entry remains
    /// active.
    pub async fn retrain(
        &self,
        item_id: &str,
        descriptor: &ItemDescriptor,
        cancel: &CancelSignal,
    ) -> ForecastResult<()> {
        let entry = self.entry(item_id, descriptor).await?;
        let mut entry = entry.lock().await;

        let result = self.retrain_locked(&mut entry, descriptor, cancel).await;
        match &result {
            Ok(()) => {
                entry.consecutive_retrain_failures = 0;
                entry.retrain_due = false;
            }
            Err(ForecastError::Cancelled) => {}
            Err(_) => entry.consecutive_retrain_failures += 1,
        }
        result
    }

    async fn retrain_locked(
        &self,
        entry: &mut ItemEntry,
        descriptor: &ItemDescriptor,
        cancel: &CancelSignal,
    ) -> ForecastResult<()> {
        cancel.check()?;
        let history = self.full_history(&entry.item_id).await?;
        if history.is_empty() {
            return Err(ForecastError::retrain_failed(
                &entry.item_id,
                "No observation history",
            ));
        }

        let category_start = self.load_category_start(&entry.category).await?;
        let (mut model, category_rate) = match &category_start {
            Some(checkpoint) => (
                StateSpaceModel::new(checkpoint.parameters.clone()),
                Some(checkpoint.state.rate),
            ),
            None => (StateSpaceModel::new(ModelParameters::defaults()), None),
        };

        let mut previous_mse: Option<f64> = None;
        let mut outcome = None;
        for _pass in 0..MAX_RETRAIN_PASSES {
            cancel.check()?;
            let (state, covariance) = StateSpaceModel::initialize(
                0.0,
                &[],
                category_rate,
                descriptor.quantity_max,
            );
            let folded = fold_history(
                &entry.item_id,
                model.clone(),
                state,
                covariance,
                TrainingStats::new(),
                &history,
                &self.features,
                descriptor,
                &self.config,
                Some(cancel),
            )
            .map_err(|err| match err {
                ForecastError::Cancelled => ForecastError::Cancelled,
                other => ForecastError::retrain_failed(&entry.item_id, other.to_string()),
            })?;

            model = folded.model.clone();
            let mse = folded.mse;
            outcome = Some(folded);

            if let Some(prev) = previous_mse {
                if prev <= f64::EPSILON || (prev - mse).abs() / prev < RETRAIN_MSE_TOLERANCE {
                    break;
                }
            }
            previous_mse = Some(mse);
        }

        let folded = outcome.expect("at least one retrain pass runs");
        entry.model = folded.model;
        entry.state = folded.state;
        entry.covariance = folded.covariance;
        entry.stats = folded.stats;
        entry.last_obs_ts = history.last().map(|obs| obs.timestamp);
        entry.last_full_retrain_at = Utc::now();
        entry.dirty = true;
        self.persist_entry(entry).await?;

        tracing::debug!(item_id = %entry.item_id, mse = folded.mse, "retrain complete");
        Ok(())
    }

    /// Re-filter after an in-window backfill arrived.
    ///
    /// Restarts from the item's own persisted checkpoint when it predates the
    /// incoming observation, folding only the stored suffix through the same
    /// predict/update loop, so online-learned parameters survive the replay.
    /// When no such checkpoint exists (or the latest one already covers newer
    /// observations), the whole history refolds from the category warm-start
    /// or defaults, which is the state an in-order ingestion from scratch
    /// would have produced.
    async fn refilter(
        &self,
        entry: &mut ItemEntry,
        descriptor: &ItemDescriptor,
        incoming_ts: DateTime<Utc>,
    ) -> ForecastResult<()> {
        let restart = self
            .load_checked(&item_key(&entry.item_id))
            .await?
            .filter(|checkpoint| {
                checkpoint
                    .stats
                    .last_update_at
                    .map(|covered| covered < incoming_ts)
                    .unwrap_or(false)
            });

        let folded = match restart {
            Some(checkpoint) => {
                let covered_until = checkpoint
                    .stats
                    .last_update_at
                    .expect("restart checkpoint carries a covered timestamp");
                let suffix = self
                    .observations
                    .range(
                        &entry.item_id,
                        covered_until + Duration::nanoseconds(1),
                        DateTime::<Utc>::MAX_UTC,
                    )
                    .await?;
                fold_history(
                    &entry.item_id,
                    StateSpaceModel::new(checkpoint.parameters),
                    checkpoint.state,
                    checkpoint.covariance,
                    checkpoint.stats,
                    &suffix,
                    &self.features,
                    descriptor,
                    &self.config,
                    None,
                )?
            }
            None => {
                let history = self.full_history(&entry.item_id).await?;
                let category_start = self.load_category_start(&entry.category).await?;
                let (model, category_rate) = match &category_start {
                    Some(checkpoint) => (
                        StateSpaceModel::new(checkpoint.parameters.clone()),
                        Some(checkpoint.state.rate),
                    ),
                    None => (StateSpaceModel::new(ModelParameters::defaults()), None),
                };

                let (state, covariance) =
                    StateSpaceModel::initialize(0.0, &[], category_rate, descriptor.quantity_max);
                fold_history(
                    &entry.item_id,
                    model,
                    state,
                    covariance,
                    TrainingStats::new(),
                    &history,
                    &self.features,
                    descriptor,
                    &self.config,
                    None,
                )?
            }
        };

        entry.model = folded.model;
        entry.state = folded.state;
        entry.covariance = folded.covariance;
        entry.last_obs_ts = folded.stats.last_update_at;
        entry.stats = folded.stats;
        entry.dirty = true;

        if let Err(err) = self.persist_entry(entry).await {
            tracing::warn!(item_id = %entry.item_id, error = %err,
                "checkpoint persist failed after refilter; will retry");
        }
        Ok(())
    }

    /// Take a consistent snapshot of an item's model for forecasting
    pub async fn snapshot(
        &self,
        item_id: &str,
        descriptor: &ItemDescriptor,
    ) -> ForecastResult<ModelSnapshot> {
        let entry = self.entry(item_id, descriptor).await?;
        let entry = entry.lock().await;
        Ok(ModelSnapshot {
            model: entry.model.clone(),
            state: entry.state,
            covariance: entry.covariance,
            stats: entry.stats.clone(),
            version: entry.version,
            last_obs_ts: entry.last_obs_ts,
        })
    }

    /// Run `f` with the item's locked entry (scheduler and test hook)
    pub async fn with_entry<T>(
        &self,
        item_id: &str,
        descriptor: &ItemDescriptor,
        f: impl FnOnce(&mut ItemEntry) -> T,
    ) -> ForecastResult<T> {
        let entry = self.entry(item_id, descriptor).await?;
        let mut entry = entry.lock().await;
        Ok(f(&mut entry))
    }

    /// Persist every dirty resident entry (shutdown and test hook)
    pub async fn flush_all(&self) -> ForecastResult<()> {
        let ids: Vec<String> = self.registry.iter().map(|e| e.key().clone()).collect();
        for item_id in ids {
            if let Some(entry) = self.registry.get(&item_id).map(|e| e.value().clone()) {
                let mut entry = entry.lock().await;
                if entry.dirty {
                    self.persist_entry(&mut entry).await?;
                }
            }
        }
        Ok(())
    }

    /// Drop an item from the registry and delete its checkpoint
    pub async fn remove_item(&self, item_id: &str) -> ForecastResult<()> {
        self.registry.remove(item_id);
        self.lru.lock().retain(|id| id.as_str() != item_id);
        self.models.remove(&item_key(item_id)).await
    }

    /// Number of items resident in the registry
    pub fn resident_items(&self) -> usize {
        self.registry.len()
    }

    /// Every item id known to the observation history
    pub async fn known_items(&self) -> ForecastResult<Vec<String>> {
        self.observations.list_items().await
    }

    /// Locate or materialize the registry entry for an item.
    ///
    /// Lookup order: resident entry, per-item checkpoint, category warm-start,
    /// defaults. Corrupt checkpoints are quarantined and fall through to the
    /// next source.
    async fn entry(
        &self,
        item_id: &str,
        descriptor: &ItemDescriptor,
    ) -> ForecastResult<Arc<Mutex<ItemEntry>>> {
        if let Some(existing) = self.registry.get(item_id) {
            let entry = existing.value().clone();
            drop(existing);
            self.touch_lru(item_id);
            return Ok(entry);
        }

        let materialized = self.materialize(item_id, descriptor).await?;
        let entry = self
            .registry
            .entry(item_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(materialized)))
            .value()
            .clone();
        self.touch_lru(item_id);
        self.evict_cold().await;
        Ok(entry)
    }

    async fn materialize(
        &self,
        item_id: &str,
        descriptor: &ItemDescriptor,
    ) -> ForecastResult<ItemEntry> {
        if let Some(checkpoint) = self.load_checked(&item_key(item_id)).await? {
            tracing::debug!(item_id, version = checkpoint.version, "loaded item checkpoint");
            return Ok(ItemEntry {
                item_id: item_id.to_string(),
                category: descriptor.category.clone(),
                model_id: checkpoint.model_id,
                model: StateSpaceModel::new(checkpoint.parameters),
                state: checkpoint.state,
                covariance: checkpoint.covariance,
                stats: checkpoint.stats.clone(),
                version: checkpoint.version,
                quantity_max: descriptor.quantity_max,
                last_obs_ts: checkpoint.stats.last_update_at,
                last_checkpoint_at: checkpoint.stats.last_update_at,
                last_full_retrain_at: checkpoint.trained_at,
                dirty: false,
                retrain_due: false,
                consecutive_retrain_failures: 0,
            });
        }

        let category_start = self.load_category_start(&descriptor.category).await?;
        let (parameters, category_rate) = match &category_start {
            Some(checkpoint) => (checkpoint.parameters.clone(), Some(checkpoint.state.rate)),
            None => (ModelParameters::defaults(), None),
        };

        let last = self.observations.last(item_id).await?;
        let current_quantity = last.as_ref().map(|obs| obs.quantity).unwrap_or(0.0);
        let recent = match &last {
            Some(obs) => {
                let from = obs.timestamp - Duration::days(RECENT_WINDOW_OBS as i64);
                let mut recent = self
                    .observations
                    .range(item_id, from, obs.timestamp)
                    .await?;
                let excess = recent.len().saturating_sub(RECENT_WINDOW_OBS);
                recent.drain(..excess);
                recent
            }
            None => Vec::new(),
        };

        let (state, covariance) = StateSpaceModel::initialize(
            current_quantity,
            &recent,
            category_rate,
            descriptor.quantity_max,
        );

        tracing::debug!(
            item_id,
            warm_start = category_start.is_some(),
            "materialized new model entry"
        );
        Ok(ItemEntry {
            item_id: item_id.to_string(),
            category: descriptor.category.clone(),
            model_id: Uuid::new_v4(),
            model: StateSpaceModel::new(parameters),
            state,
            covariance,
            stats: TrainingStats::new(),
            version: 0,
            quantity_max: descriptor.quantity_max,
            last_obs_ts: last.map(|obs| obs.timestamp),
            last_checkpoint_at: None,
            last_full_retrain_at: Utc::now(),
            dirty: false,
            retrain_due: false,
            consecutive_retrain_failures: 0,
        })
    }

    /// Load a checkpoint, quarantining it and falling through on corruption
    async fn load_checked(&self, key: &str) -> ForecastResult<Option<ModelCheckpoint>> {
        let backoff = self.config.retry_backoff();
        let io_timeout = self.config.io_timeout();
        let loaded = with_store_retry(&backoff, || async move {
            match tokio::time::timeout(io_timeout, self.models.load(key)).await {
                Ok(result) => result,
                Err(_) => Err(ForecastError::timeout("model_store.load")),
            }
        })
        .await;

        match loaded {
            Ok(found) => Ok(found),
            Err(ForecastError::CheckpointCorrupt { key: bad_key, detail }) => {
                self.models.quarantine(&bad_key, &detail).await?;
                let _ = self
                    .audit
                    .log(AuditRecord::new(
                        AuditAction::CheckpointQuarantined,
                        None,
                        AuditOutcome::Failure,
                        serde_json::json!({ "key": bad_key, "detail": detail }),
                    ))
                    .await;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn load_category_start(&self, category: &str) -> ForecastResult<Option<ModelCheckpoint>> {
        self.load_checked(&category_key(category)).await
    }

    /// Rewind a faulted entry to its last valid persisted source
    async fn rewind_entry(
        &self,
        entry: &mut ItemEntry,
        descriptor: &ItemDescriptor,
    ) -> ForecastResult<()> {
        let restored = self.materialize(&entry.item_id, descriptor).await?;
        let version = entry.version.max(restored.version);
        *entry = restored;
        entry.version = version;
        Ok(())
    }

    async fn append_observation(&self, observation: &Observation) -> ForecastResult<()> {
        let backoff = self.config.retry_backoff();
        let io_timeout = self.config.io_timeout();
        with_store_retry(&backoff, || async move {
            match tokio::time::timeout(io_timeout, self.observations.append(observation.clone()))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ForecastError::timeout("observation_store.append")),
            }
        })
        .await
    }

    async fn full_history(&self, item_id: &str) -> ForecastResult<Vec<Observation>> {
        self.observations
            .range(item_id, DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC)
            .await
    }

    /// Persist the entry with a strictly increased version
    async fn persist_entry(&self, entry: &mut ItemEntry) -> ForecastResult<()> {
        let next_version = entry.version + 1;
        let key = item_key(&entry.item_id);
        let checkpoint = entry.to_checkpoint(next_version);
        let backoff = self.config.retry_backoff();
        let io_timeout = self.config.io_timeout();
        let key_ref: &str = &key;
        let checkpoint_ref = &checkpoint;
        with_store_retry(&backoff, || async move {
            match tokio::time::timeout(io_timeout, self.models.store(key_ref, checkpoint_ref)).await
            {
                Ok(result) => result,
                Err(_) => Err(ForecastError::timeout("model_store.store")),
            }
        })
        .await?;

        entry.version = next_version;
        entry.dirty = false;
        entry.last_checkpoint_at = entry.last_obs_ts;
        Ok(())
    }

    async fn audit_rejection(&self, item_id: &str, err: &ForecastError) {
        let _ = self
            .audit
            .log(AuditRecord::new(
                AuditAction::ObservationRejected,
                Some(item_id.to_string()),
                AuditOutcome::Failure,
                serde_json::json!({ "reason": err.to_string() }),
            ))
            .await;
    }

    fn touch_lru(&self, item_id: &str) {
        let mut lru = self.lru.lock();
        lru.retain(|id| id.as_str() != item_id);
        lru.push_back(item_id.to_string());
    }

    /// Evict clean cold entries beyond the LRU capacity.
    ///
    /// Dirty entries are persisted first so eviction never loses state; an
    /// entry whose lock is currently held is left resident.
    async fn evict_cold(&self) {
        loop {
            let over = self.registry.len().saturating_sub(self.config.lru_capacity);
            if over == 0 {
                return;
            }

            let candidate = { self.lru.lock().pop_front() };
            let Some(item_id) = candidate else { return };

            let Some(entry) = self.registry.get(&item_id).map(|e| e.value().clone()) else {
                continue;
            };

            let Ok(mut guard) = entry.try_lock() else {
                self.touch_lru(&item_id);
                return;
            };

            if guard.dirty {
                if self.persist_entry(&mut guard).await.is_err() {
                    self.touch_lru(&item_id);
                    return;
                }
            }
            drop(guard);
            self.registry.remove(&item_id);
            tracing::debug!(item_id = %item_id, "evicted cold model entry");
        }
    }
}

/// Gradient step on the influence matrix `B`, minimizing the squared
/// innovation, followed by entry clipping and the EWMA stabilizer.
///
/// Only the observed row of `B` carries gradient signal (`H = [1,0,0,0]`);
/// the remaining parameters adapt during periodic retrains.
fn apply_gradient_step(
    parameters: &mut ModelParameters,
    features: &FeatureVector,
    error: f64,
    learning_rate: f64,
    ewma_alpha: f64,
) {
    let previous = parameters.influence;
    let mut updated = previous;
    for col in 0..FEATURE_WIDTH {
        let stepped = updated[(0, col)] + 2.0 * learning_rate * error * features[col];
        updated[(0, col)] = stepped.clamp(-1.0, 1.0);
    }
    parameters.influence = previous * (1.0 - ewma_alpha) + updated * ewma_alpha;
}

/// Fold an observation history through the filter in timestamp order,
/// applying the same predict/update/gradient loop as online ingestion.
///
/// `stats` is the starting accumulator: fresh for a rebuild from scratch, or
/// the persisted statistics when continuing from a checkpoint.
#[allow(clippy::too_many_arguments)]
pub(crate) fn fold_history(
    item_id: &str,
    mut model: StateSpaceModel,
    mut state: ModelState,
    mut covariance: StateCovariance,
    mut stats: TrainingStats,
    history: &[Observation],
    features: &FeatureBuilder,
    descriptor: &ItemDescriptor,
    config: &CoreConfig,
    cancel: Option<&CancelSignal>,
) -> ForecastResult<FoldOutcome> {
    let mut squared_error_sum = 0.0;

    for observation in history {
        if let Some(cancel) = cancel {
            cancel.check()?;
        }

        let feature_vec = features.build(observation.timestamp, descriptor);
        let (predicted, covariance_pred, y_hat) = model.predict(&state, &covariance, &feature_vec);
        let error = observation.quantity - y_hat;

        let update = model.update(
            item_id,
            &predicted,
            &covariance_pred,
            observation.quantity,
            descriptor.quantity_max,
        )?;

        apply_gradient_step(
            model.parameters_mut(),
            &feature_vec,
            error,
            config.learning_rate,
            config.ewma_alpha,
        );

        stats.record(error, observation.timestamp);
        squared_error_sum += error * error;
        state = update.state;
        covariance = update.covariance;
    }

    let mse = if history.is_empty() {
        0.0
    } else {
        squared_error_sum / history.len() as f64
    };

    Ok(FoldOutcome {
        model,
        state,
        covariance,
        stats,
        mse,
    })
}
