use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::{ForecastError, ForecastResult};
use crate::features::{FeatureBuilder, FeatureVector};
use crate::models::{Forecast, ItemDescriptor, Observation, ObservationSource};
use crate::state_space::RunoutPrediction;
use crate::stores::{
    with_store_retry, AuditAction, AuditOutcome, AuditRecord, AuditSink, CancelSignal,
    ForecastStore,
};
use crate::trainer::OnlineTrainer;

/// Public facade of the forecasting core.
///
/// Hosts embed this directly: observations come in through [`Self::ingest`],
/// forecasts and restock recommendations go out through [`Self::forecast`]
/// and friends. Operations are synchronous from the caller's perspective;
/// per-item work serializes on the trainer's per-item locks.
pub struct ForecastService {
    trainer: Arc<OnlineTrainer>,
    forecasts: Arc<dyn ForecastStore>,
    audit: Arc<dyn AuditSink>,
}

impl ForecastService {
    /// Create a service over a trainer and the forecast/audit collaborators
    pub fn new(
        trainer: Arc<OnlineTrainer>,
        forecasts: Arc<dyn ForecastStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            trainer,
            forecasts,
            audit,
        }
    }

    /// The trainer backing this service
    pub fn trainer(&self) -> &Arc<OnlineTrainer> {
        &self.trainer
    }

    /// Ingest one inventory observation for an item.
    ///
    /// Invalid observations (negative, NaN, or older than the backfill
    /// window) are rejected with a typed error and leave all state unchanged.
    pub async fn ingest(
        &self,
        item_id: &str,
        quantity: f64,
        timestamp: DateTime<Utc>,
        source: ObservationSource,
        descriptor: &ItemDescriptor,
    ) -> ForecastResult<()> {
        let observation = Observation::new(item_id, timestamp, quantity, source);
        self.trainer.on_observation(&observation, descriptor).await
    }

    /// Generate and persist a forecast over the next `horizon_days` days
    pub async fn forecast(
        &self,
        item_id: &str,
        horizon_days: u32,
        descriptor: &ItemDescriptor,
    ) -> ForecastResult<Forecast> {
        self.forecast_at(item_id, horizon_days, descriptor, Utc::now())
            .await
    }

    /// Generate a forecast with an explicit "now" anchor.
    ///
    /// The trajectory covers `[as_of + 1 day, as_of + horizon_days]`. The
    /// run-out probe uses the descriptor's minimum quantity as the threshold,
    /// the order-by date backs off by the configured lead time, and the
    /// recommended quantity refills to `quantity_max`. The record is persisted
    /// idempotently per `(item_id, horizon_days)`.
    pub async fn forecast_at(
        &self,
        item_id: &str,
        horizon_days: u32,
        descriptor: &ItemDescriptor,
        as_of: DateTime<Utc>,
    ) -> ForecastResult<Forecast> {
        let config = self.trainer.config().clone();
        if horizon_days == 0 || horizon_days > config.horizon_max_days {
            return Err(ForecastError::HorizonExceeded {
                requested: horizon_days,
                max: config.horizon_max_days,
            });
        }
        descriptor.validate()?;

        let snapshot = self.trainer.snapshot(item_id, descriptor).await?;

        let features = self.trainer.features();
        let features_series: Vec<FeatureVector> = (1..=i64::from(horizon_days))
            .map(|day| features.build(as_of + Duration::days(day), descriptor))
            .collect();

        let trajectory = snapshot
            .model
            .simulate(&snapshot.state, &snapshot.covariance, &features_series);
        let (lower95, upper95) = trajectory.band(config.band_z_score());
        let probe = RunoutPrediction::from_trajectory(&trajectory, descriptor.runout_threshold());

        let predicted_runout_date = probe
            .days_until
            .map(|days| as_of + Duration::days(i64::from(days)));
        let recommended_order_date = predicted_runout_date
            .map(|date| date - Duration::days(i64::from(config.order_lead_days)));
        let recommended_quantity = match probe.days_until {
            Some(days) => {
                let q_at_runout = trajectory.expected[days as usize - 1].max(0.0);
                (descriptor.quantity_max - q_at_runout)
                    .clamp(config.minimum_order_unit, descriptor.quantity_max)
            }
            None => 0.0,
        };

        let forecast = Forecast {
            forecast_id: Uuid::new_v4(),
            item_id: item_id.to_string(),
            created_at: as_of,
            model_version: snapshot.version,
            horizon_days,
            trajectory: trajectory.expected.iter().map(|q| q.max(0.0)).collect(),
            lower95,
            upper95,
            predicted_runout_date,
            confidence: probe.confidence,
            recommended_order_date,
            recommended_quantity,
            features_used: FeatureBuilder::feature_names(),
            actual_runout_date: None,
        };

        let backoff = config.retry_backoff();
        let io_timeout = config.io_timeout();
        let forecast_ref = &forecast;
        with_store_retry(&backoff, || async move {
            match tokio::time::timeout(io_timeout, self.forecasts.upsert(forecast_ref.clone()))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ForecastError::timeout("forecast_store.upsert")),
            }
        })
        .await?;

        let _ = self
            .audit
            .log(AuditRecord::new(
                AuditAction::ForecastGenerated,
                Some(item_id.to_string()),
                AuditOutcome::Success,
                serde_json::json!({
                    "horizon_days": horizon_days,
                    "predicted_runout_date": predicted_runout_date,
                    "confidence": probe.confidence,
                    "recommended_quantity": recommended_quantity,
                }),
            ))
            .await;

        Ok(forecast)
    }

    /// Forecast many items concurrently with bounded fan-out.
    ///
    /// Cancellation is checked between dispatch rounds; items that fail or
    /// exceed the per-item deadline are skipped with a warning rather than
    /// failing the batch.
    pub async fn batch_forecast(
        &self,
        items: &[(String, ItemDescriptor)],
        horizon_days: u32,
        cancel: &CancelSignal,
    ) -> ForecastResult<Vec<Forecast>> {
        let config = self.trainer.config();
        let mut results = Vec::with_capacity(items.len());

        for chunk in items.chunks(config.batch_fanout) {
            cancel.check()?;

            let futures = chunk.iter().map(|(item_id, descriptor)| async move {
                let outcome = tokio::time::timeout(
                    config.forecast_item_timeout(),
                    self.forecast(item_id, horizon_days, descriptor),
                )
                .await;
                match outcome {
                    Ok(result) => (item_id.clone(), result),
                    Err(_) => (
                        item_id.clone(),
                        Err(ForecastError::timeout("batch_forecast.item")),
                    ),
                }
            });

            for (item_id, outcome) in join_all(futures).await {
                match outcome {
                    Ok(forecast) => results.push(forecast),
                    Err(err) => {
                        tracing::warn!(item_id = %item_id, error = %err,
                            "batch forecast item failed");
                    }
                }
            }
        }

        Ok(results)
    }

    /// Item ids whose stored forecast predicts run-out within `within_days`
    /// with at least the configured confidence
    pub async fn low_stock(&self, within_days: u32) -> ForecastResult<Vec<String>> {
        self.low_stock_at(within_days, Utc::now()).await
    }

    /// [`Self::low_stock`] with an explicit "now" anchor
    pub async fn low_stock_at(
        &self,
        within_days: u32,
        now: DateTime<Utc>,
    ) -> ForecastResult<Vec<String>> {
        let config = self.trainer.config();
        let mut flagged = Vec::new();

        for item_id in self.trainer.known_items().await? {
            if let Some(forecast) = self.forecasts.get_latest(&item_id).await? {
                if forecast.runs_out_within(now, within_days)
                    && forecast.confidence >= config.low_stock_confidence
                {
                    flagged.push(item_id);
                }
            }
        }

        flagged.sort();
        Ok(flagged)
    }

    /// Record the observed run-out date on the item's stored forecasts for
    /// accuracy measurement
    pub async fn record_actual_runout(
        &self,
        item_id: &str,
        date: DateTime<Utc>,
    ) -> ForecastResult<()> {
        if self.forecasts.get_latest(item_id).await?.is_none() {
            return Err(ForecastError::unknown_item(item_id));
        }
        self.forecasts.set_actual(item_id, date).await
    }
}
