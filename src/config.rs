use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{ForecastError, ForecastResult};

/// Configuration for the forecasting core.
///
/// Every field has a production default; hosts typically deserialize a partial
/// TOML table and let the remainder fall through to [`CoreConfig::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Stabilizer weight applied to gradient-updated parameters.
    pub ewma_alpha: f64,

    /// Gradient step size on the influence matrix `B`.
    pub learning_rate: f64,

    /// Periodic full-retrain cadence in days.
    pub retrain_interval_days: u32,

    /// Early-retrain trigger: `|ewma_error|` exceeding this fraction of the
    /// item's `quantity_max` schedules a retrain before the cadence elapses.
    pub retrain_error_factor: f64,

    /// Rate limit on checkpoint writes, in seconds.
    pub min_persist_interval_sec: u64,

    /// Coverage of the trajectory uncertainty band (0.90, 0.95, or 0.99).
    pub default_confidence: f64,

    /// Clamp on requested forecast horizons, in days.
    pub horizon_max_days: u32,

    /// Offset from predicted run-out to the recommended order date, in days.
    pub order_lead_days: u32,

    /// Oldest acceptable backfill observation, in days before the newest
    /// processed observation.
    pub backfill_window_days: u32,

    /// Smallest quantity worth ordering.
    pub minimum_order_unit: f64,

    /// Bound on resident registry entries; cold clean entries are evicted
    /// and lazily reloaded from checkpoints.
    pub lru_capacity: usize,

    /// Maximum retrains dispatched concurrently by the scheduler.
    pub max_parallel_retrains: usize,

    /// Deadline for a single store I/O operation, in milliseconds.
    pub io_timeout_ms: u64,

    /// Deadline for a single item's full retrain, in milliseconds.
    pub retrain_timeout_ms: u64,

    /// Per-item deadline inside `batch_forecast`, in milliseconds.
    pub forecast_item_timeout_ms: u64,

    /// Bound on concurrent per-item work inside `batch_forecast`.
    pub batch_fanout: usize,

    /// Minimum confidence for an item to appear in `low_stock` results.
    pub low_stock_confidence: f64,

    /// Consecutive retrain failures after which retrains for an item pause
    /// until its error threshold is crossed again.
    pub max_retrain_failures: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            ewma_alpha: 0.3,
            learning_rate: 1e-3,
            retrain_interval_days: 7,
            retrain_error_factor: 0.5,
            min_persist_interval_sec: 60,
            default_confidence: 0.95,
            horizon_max_days: 90,
            order_lead_days: 3,
            backfill_window_days: 90,
            minimum_order_unit: 1.0,
            lru_capacity: 1024,
            max_parallel_retrains: 4,
            io_timeout_ms: 5_000,
            retrain_timeout_ms: 30_000,
            forecast_item_timeout_ms: 1_000,
            batch_fanout: 8,
            low_stock_confidence: 0.5,
            max_retrain_failures: 3,
        }
    }
}

impl CoreConfig {
    /// Parse a (possibly partial) TOML document into a config
    pub fn from_toml_str(input: &str) -> ForecastResult<Self> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the full config as TOML
    pub fn to_toml_string(&self) -> ForecastResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate configuration invariants
    pub fn validate(&self) -> ForecastResult<()> {
        if !(0.0..=1.0).contains(&self.ewma_alpha) {
            return Err(ForecastError::config("ewma_alpha must lie in [0, 1]"));
        }

        if self.learning_rate <= 0.0 || !self.learning_rate.is_finite() {
            return Err(ForecastError::config("learning_rate must be positive"));
        }

        if self.retrain_interval_days == 0 {
            return Err(ForecastError::config(
                "retrain_interval_days must be at least 1",
            ));
        }

        if !(0.5..1.0).contains(&self.default_confidence) {
            return Err(ForecastError::config(
                "default_confidence must lie in [0.5, 1.0)",
            ));
        }

        if self.horizon_max_days == 0 || self.horizon_max_days > 365 {
            return Err(ForecastError::config(
                "horizon_max_days must lie in [1, 365]",
            ));
        }

        if self.minimum_order_unit <= 0.0 {
            return Err(ForecastError::config("minimum_order_unit must be positive"));
        }

        if self.lru_capacity == 0 {
            return Err(ForecastError::config("lru_capacity must be at least 1"));
        }

        if self.max_parallel_retrains == 0 || self.batch_fanout == 0 {
            return Err(ForecastError::config(
                "parallelism bounds must be at least 1",
            ));
        }

        Ok(())
    }

    /// Two-sided z-score matching `default_confidence`
    pub fn band_z_score(&self) -> f64 {
        if self.default_confidence >= 0.99 {
            2.576
        } else if self.default_confidence >= 0.95 {
            1.96
        } else {
            1.645
        }
    }

    /// Deadline for one store I/O operation
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Deadline for one item's full retrain
    pub fn retrain_timeout(&self) -> Duration {
        Duration::from_millis(self.retrain_timeout_ms)
    }

    /// Per-item deadline inside batch forecasting
    pub fn forecast_item_timeout(&self) -> Duration {
        Duration::from_millis(self.forecast_item_timeout_ms)
    }

    /// Minimum wall-clock gap between checkpoint writes for one item
    pub fn min_persist_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.min_persist_interval_sec as i64)
    }

    /// Backoff schedule for retryable store failures
    pub fn retry_backoff(&self) -> [Duration; 3] {
        [
            Duration::from_millis(50),
            Duration::from_millis(200),
            Duration::from_millis(1_000),
        ]
    }
}
