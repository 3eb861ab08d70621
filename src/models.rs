use chrono::{DateTime, Utc};
use nalgebra::{RowSVector, SMatrix, SVector};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::errors::{ForecastError, ForecastResult};
use crate::features::FEATURE_WIDTH;

/// Dimension of the latent model state: quantity, rate, trend, seasonal.
pub const STATE_DIM: usize = 4;

/// Number of recent errors retained for the rolling MAE/RMSE window.
const ERROR_WINDOW: usize = 64;

/// Latent state vector type.
pub type StateVector = SVector<f64, STATE_DIM>;

/// State covariance matrix type.
pub type StateCovariance = SMatrix<f64, STATE_DIM, STATE_DIM>;

/// State transition matrix type.
pub type TransitionMatrix = SMatrix<f64, STATE_DIM, STATE_DIM>;

/// Feature-to-state influence matrix type.
pub type InfluenceMatrix = SMatrix<f64, STATE_DIM, FEATURE_WIDTH>;

/// Observation row type (`H` in the filter equations).
pub type ObservationRow = RowSVector<f64, STATE_DIM>;

/// Where an inventory observation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationSource {
    Sensor,
    Receipt,
    Manual,
    System,
}

/// An immutable inventory reading for a single item.
///
/// Observations are created by ingestion and never mutated. Per item they are
/// ordered by timestamp; when two share a timestamp the later-ingested record
/// wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub item_id: String,
    pub timestamp: DateTime<Utc>,
    pub quantity: f64,
    pub source: ObservationSource,
}

impl Observation {
    /// Create a new observation
    pub fn new<I: Into<String>>(
        item_id: I,
        timestamp: DateTime<Utc>,
        quantity: f64,
        source: ObservationSource,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            timestamp,
            quantity,
            source,
        }
    }

    /// Validate observation data integrity
    pub fn validate(&self) -> ForecastResult<()> {
        if self.item_id.trim().is_empty() {
            return Err(ForecastError::invalid_observation(
                &self.item_id,
                "Item id cannot be empty",
            ));
        }

        if !self.quantity.is_finite() {
            return Err(ForecastError::invalid_observation(
                &self.item_id,
                "Quantity must be a finite number",
            ));
        }

        if self.quantity < 0.0 {
            return Err(ForecastError::invalid_observation(
                &self.item_id,
                "Quantity cannot be negative",
            ));
        }

        Ok(())
    }
}

/// Read-only item attributes needed to build features and bound the model.
///
/// Supplied by the inventory subsystem alongside each observation or forecast
/// request; the core never stores descriptors durably.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDescriptor {
    pub category: String,
    pub perishable: bool,
    pub household_size: u32,
    pub expiry_date: Option<DateTime<Utc>>,
    pub quantity_min: f64,
    pub quantity_max: f64,
}

impl ItemDescriptor {
    /// Validate descriptor invariants
    pub fn validate(&self) -> ForecastResult<()> {
        if self.category.trim().is_empty() {
            return Err(ForecastError::config("Category cannot be empty"));
        }

        if self.household_size < 1 {
            return Err(ForecastError::config("Household size must be at least 1"));
        }

        if !self.quantity_max.is_finite() || self.quantity_max <= 0.0 {
            return Err(ForecastError::config("Maximum quantity must be positive"));
        }

        if self.quantity_min < 0.0 || self.quantity_min > self.quantity_max {
            return Err(ForecastError::config(
                "Minimum quantity must lie in [0, quantity_max]",
            ));
        }

        Ok(())
    }

    /// The run-out threshold used by forecast probes
    pub fn runout_threshold(&self) -> f64 {
        self.quantity_min
    }
}

/// Latent model state: estimated quantity, daily consumption rate, trend, and
/// seasonal offset.
///
/// Sign convention: positive `rate` reduces `quantity` by one rate unit per
/// day. `rate` and `trend` are projected to be non-negative after every
/// update; `seasonal` is unconstrained.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub quantity: f64,
    pub rate: f64,
    pub trend: f64,
    pub seasonal: f64,
}

impl ModelState {
    /// Create a state with the given quantity and rate, zero trend/seasonal
    pub fn new(quantity: f64, rate: f64) -> Self {
        Self {
            quantity,
            rate,
            trend: 0.0,
            seasonal: 0.0,
        }
    }

    /// View as a column vector for filter algebra
    pub fn as_vector(&self) -> StateVector {
        StateVector::new(self.quantity, self.rate, self.trend, self.seasonal)
    }

    /// Rebuild from a column vector produced by filter algebra
    pub fn from_vector(v: &StateVector) -> Self {
        Self {
            quantity: v[0],
            rate: v[1],
            trend: v[2],
            seasonal: v[3],
        }
    }

    /// Whether every component is a finite number
    pub fn is_finite(&self) -> bool {
        self.quantity.is_finite()
            && self.rate.is_finite()
            && self.trend.is_finite()
            && self.seasonal.is_finite()
    }
}

impl Default for ModelState {
    fn default() -> Self {
        Self::new(0.0, 0.0)
    }
}

/// Linear-Gaussian model parameters `(F, B, H, Q, R)`.
///
/// `H` is fixed at `[1, 0, 0, 0]`: only the quantity component is observed.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParameters {
    /// State transition matrix `F`
    pub transition: TransitionMatrix,
    /// Feature-to-state influence matrix `B`
    pub influence: InfluenceMatrix,
    /// Process noise covariance `Q`
    pub process_noise: StateCovariance,
    /// Observation noise variance `R`
    pub observation_noise: f64,
}

impl ModelParameters {
    /// The fixed observation row `H = [1, 0, 0, 0]`
    pub fn observation_row() -> ObservationRow {
        ObservationRow::new(1.0, 0.0, 0.0, 0.0)
    }

    /// Default parameters used when neither a per-item checkpoint nor a
    /// category warm-start exists.
    ///
    /// The transition is identity-like with a daily decrement of quantity by
    /// rate (and by the seasonal offset). Trend feeds the rate with a damped
    /// coupling and decays on its own, so a transient acceleration cannot run
    /// away over long simulation horizons; the seasonal component decays fast
    /// and is re-excited through `B`.
    pub fn defaults() -> Self {
        let mut transition = TransitionMatrix::identity();
        transition[(0, 1)] = -1.0;
        transition[(0, 3)] = -1.0;
        transition[(1, 2)] = 0.25;
        transition[(2, 2)] = 0.9;
        transition[(3, 3)] = 0.5;

        let mut influence = InfluenceMatrix::zeros();
        // Larger households consume slightly faster; weekends add a small
        // seasonal consumption bump.
        influence[(1, 4)] = 0.01;
        influence[(3, 3)] = 0.05;

        let process_noise =
            StateCovariance::from_diagonal(&StateVector::new(0.01, 0.001, 0.0001, 0.001));

        Self {
            transition,
            influence,
            process_noise,
            observation_noise: 0.0025,
        }
    }

    /// Whether every entry is a finite number
    pub fn is_finite(&self) -> bool {
        self.transition.iter().all(|v| v.is_finite())
            && self.influence.iter().all(|v| v.is_finite())
            && self.process_noise.iter().all(|v| v.is_finite())
            && self.observation_noise.is_finite()
            && self.observation_noise > 0.0
    }
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self::defaults()
    }
}

/// Rolling accuracy statistics for a trained model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingStats {
    pub mae: f64,
    pub rmse: f64,
    pub ewma_error: f64,
    pub forecast_bias: f64,
    pub observations_seen: u64,
    pub last_update_at: Option<DateTime<Utc>>,
    recent_errors: VecDeque<f64>,
}

impl TrainingStats {
    /// Smoothing weight for the EWMA innovation tracker
    const EWMA_WEIGHT: f64 = 0.2;

    /// Create empty statistics
    pub fn new() -> Self {
        Self {
            mae: 0.0,
            rmse: 0.0,
            ewma_error: 0.0,
            forecast_bias: 0.0,
            observations_seen: 0,
            last_update_at: None,
            recent_errors: VecDeque::new(),
        }
    }

    /// Fold one innovation into the rolling statistics
    pub fn record(&mut self, error: f64, at: DateTime<Utc>) {
        if self.recent_errors.len() == ERROR_WINDOW {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(error);

        let n = self.recent_errors.len() as f64;
        self.mae = self.recent_errors.iter().map(|e| e.abs()).sum::<f64>() / n;
        self.rmse = (self.recent_errors.iter().map(|e| e * e).sum::<f64>() / n).sqrt();
        self.forecast_bias = self.recent_errors.iter().sum::<f64>() / n;

        self.ewma_error = if self.observations_seen == 0 {
            error
        } else {
            (1.0 - Self::EWMA_WEIGHT) * self.ewma_error + Self::EWMA_WEIGHT * error
        };

        self.observations_seen += 1;
        self.last_update_at = Some(at);
    }

    /// Mean squared error over the rolling window
    pub fn mse(&self) -> f64 {
        self.rmse * self.rmse
    }
}

impl Default for TrainingStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a checkpoint belongs to a single item or to a category warm-start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "key")]
pub enum CheckpointOwner {
    Item(String),
    Category(String),
}

impl CheckpointOwner {
    /// The item or category key
    pub fn key(&self) -> &str {
        match self {
            Self::Item(k) | Self::Category(k) => k,
        }
    }

    /// Whether this is a category warm-start checkpoint
    pub fn is_category(&self) -> bool {
        matches!(self, Self::Category(_))
    }
}

/// A persisted, versioned snapshot of model parameters and state, sufficient
/// to resume filtering exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCheckpoint {
    pub model_id: Uuid,
    pub owner: CheckpointOwner,
    pub version: u64,
    pub parameters: ModelParameters,
    pub state: ModelState,
    pub covariance: StateCovariance,
    pub trained_at: DateTime<Utc>,
    pub feature_names: Vec<String>,
    pub stats: TrainingStats,
}

impl ModelCheckpoint {
    /// Create a first-version checkpoint for an owner
    pub fn new(
        owner: CheckpointOwner,
        parameters: ModelParameters,
        state: ModelState,
        covariance: StateCovariance,
        trained_at: DateTime<Utc>,
        feature_names: Vec<String>,
    ) -> Self {
        Self {
            model_id: Uuid::new_v4(),
            owner,
            version: 1,
            parameters,
            state,
            covariance,
            trained_at,
            feature_names,
            stats: TrainingStats::new(),
        }
    }
}

/// A forecast record: the predicted trajectory with uncertainty bands and the
/// restock recommendation derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub forecast_id: Uuid,
    pub item_id: String,
    pub created_at: DateTime<Utc>,
    pub model_version: u64,
    pub horizon_days: u32,
    pub trajectory: Vec<f64>,
    pub lower95: Vec<f64>,
    pub upper95: Vec<f64>,
    pub predicted_runout_date: Option<DateTime<Utc>>,
    pub confidence: f64,
    pub recommended_order_date: Option<DateTime<Utc>>,
    pub recommended_quantity: f64,
    pub features_used: Vec<String>,
    pub actual_runout_date: Option<DateTime<Utc>>,
}

impl Forecast {
    /// Days from `now` until the predicted run-out, if one was predicted
    pub fn days_until_runout(&self, now: DateTime<Utc>) -> Option<i64> {
        self.predicted_runout_date
            .map(|date| (date - now).num_days())
    }

    /// Whether the forecast predicts run-out within `within_days` of `now`
    pub fn runs_out_within(&self, now: DateTime<Utc>, within_days: u32) -> bool {
        self.days_until_runout(now)
            .map(|days| days >= 0 && days <= i64::from(within_days))
            .unwrap_or(false)
    }

    /// Signed error in days between prediction and the recorded actual
    /// run-out, when both are known
    pub fn runout_error_days(&self) -> Option<i64> {
        match (self.predicted_runout_date, self.actual_runout_date) {
            (Some(predicted), Some(actual)) => Some((predicted - actual).num_days()),
            _ => None,
        }
    }
}
