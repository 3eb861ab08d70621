use chrono::{NaiveDate, NaiveTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::errors::{ForecastError, ForecastResult};
use crate::stores::{
    AuditAction, AuditOutcome, AuditRecord, AuditSink, CancelSignal, DescriptorProvider,
};
use crate::trainer::OnlineTrainer;

/// Configuration for the clock-driven retrain scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Run retrain cycles only once per day at this wall-clock time;
    /// `None` runs a cycle on every tick.
    pub daily_time: Option<NaiveTime>,
    /// Tick granularity of the scheduler loop.
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            daily_time: None,
            tick_interval: Duration::from_secs(60),
        }
    }
}

/// Counts from one scheduler cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub scanned: usize,
    pub scheduled: usize,
    pub retrained: usize,
    pub failed: usize,
}

/// Clock-driven retrain driver.
///
/// On each tick the scheduler enumerates known items, selects those due for a
/// full retrain, and dispatches up to `max_parallel_retrains` of them onto
/// worker tasks. Each worker serializes with online ingestion only through
/// that item's lock; ingestion for other items is never blocked.
pub struct TrainingScheduler {
    config: SchedulerConfig,
    trainer: Arc<OnlineTrainer>,
    descriptors: Arc<dyn DescriptorProvider>,
    audit: Arc<dyn AuditSink>,
    last_daily_run: Mutex<Option<NaiveDate>>,
}

impl TrainingScheduler {
    /// Create a scheduler over a trainer and its collaborators
    pub fn new(
        config: SchedulerConfig,
        trainer: Arc<OnlineTrainer>,
        descriptors: Arc<dyn DescriptorProvider>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config,
            trainer,
            descriptors,
            audit,
            last_daily_run: Mutex::new(None),
        }
    }

    /// Run the scheduler loop until cancelled
    pub async fn run(&self, cancel: CancelSignal) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            if cancel.is_cancelled() {
                return;
            }

            if !self.tick_due() {
                continue;
            }

            match self.run_cycle(&cancel).await {
                Ok(outcome) => {
                    tracing::debug!(
                        scanned = outcome.scanned,
                        scheduled = outcome.scheduled,
                        retrained = outcome.retrained,
                        failed = outcome.failed,
                        "scheduler cycle complete"
                    );
                }
                Err(ForecastError::Cancelled) => return,
                Err(err) => {
                    tracing::warn!(error = %err, "scheduler cycle failed");
                }
            }
        }
    }

    /// Whether the current tick should run a cycle
    fn tick_due(&self) -> bool {
        let Some(daily_time) = self.config.daily_time else {
            return true;
        };

        let now = Utc::now();
        if now.time() < daily_time {
            return false;
        }

        let mut last = self.last_daily_run.lock();
        if *last == Some(now.date_naive()) {
            return false;
        }
        *last = Some(now.date_naive());
        true
    }

    /// One full scheduling cycle: scan, select, dispatch bounded retrains.
    ///
    /// Every due item is scheduled at most once per cycle. Outcomes are
    /// recorded to the audit sink as `model_retrained` or `retrain_failed`.
    pub async fn run_cycle(&self, cancel: &CancelSignal) -> ForecastResult<CycleOutcome> {
        cancel.check()?;
        let items = self.trainer.known_items().await?;
        let mut outcome = CycleOutcome {
            scanned: items.len(),
            ..CycleOutcome::default()
        };

        let now = Utc::now();
        let mut due = Vec::new();
        for item_id in items {
            cancel.check()?;
            let Some(descriptor) = self.descriptors.descriptor(&item_id).await? else {
                continue;
            };

            let should_run = self
                .trainer
                .with_entry(&item_id, &descriptor, |entry| {
                    self.trainer.needs_retrain(entry, now) && !self.trainer.retrain_paused(entry)
                })
                .await?;
            if should_run {
                due.push((item_id, descriptor));
            }
        }
        outcome.scheduled = due.len();

        let semaphore = Arc::new(Semaphore::new(
            self.trainer.config().max_parallel_retrains,
        ));
        let retrain_timeout = self.trainer.config().retrain_timeout();
        let mut workers = JoinSet::new();

        for (item_id, descriptor) in due {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ForecastError::Cancelled)?;
            let trainer = Arc::clone(&self.trainer);
            let audit = Arc::clone(&self.audit);
            let cancel = cancel.clone();

            workers.spawn(async move {
                let _permit = permit;
                let result = tokio::time::timeout(
                    retrain_timeout,
                    trainer.retrain(&item_id, &descriptor, &cancel),
                )
                .await
                .unwrap_or_else(|_| Err(ForecastError::timeout("trainer.retrain")));

                let succeeded = result.is_ok();
                let (action, audit_outcome, detail) = match &result {
                    Ok(()) => (AuditAction::ModelRetrained, AuditOutcome::Success, None),
                    Err(err) => (
                        AuditAction::RetrainFailed,
                        AuditOutcome::Failure,
                        Some(err.to_string()),
                    ),
                };
                let _ = audit
                    .log(AuditRecord::new(
                        action,
                        Some(item_id.clone()),
                        audit_outcome,
                        serde_json::json!({ "detail": detail }),
                    ))
                    .await;
                succeeded
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(true) => outcome.retrained += 1,
                Ok(false) => outcome.failed += 1,
                Err(err) => {
                    outcome.failed += 1;
                    tracing::warn!(error = %err, "retrain worker panicked");
                }
            }
        }

        Ok(outcome)
    }
}
