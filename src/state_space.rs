use nalgebra::{Cholesky, SymmetricEigen};

use crate::errors::{ForecastError, ForecastResult};
use crate::features::FeatureVector;
use crate::models::{
    ModelParameters, ModelState, Observation, StateCovariance, StateVector,
};

/// Ridge added to a singular innovation variance before inverting.
const RIDGE: f64 = 1e-6;

/// Floor used when a predicted quantity appears in a denominator.
const QUANTITY_EPS: f64 = 1e-9;

/// Drift bound: the quantity estimate is clamped to `[0, QMAX_FACTOR * quantity_max]`.
const QMAX_FACTOR: f64 = 10.0;

/// Result of one Kalman filter update
#[derive(Debug, Clone)]
pub struct FilterUpdate {
    pub state: ModelState,
    pub covariance: StateCovariance,
    /// Innovation `y_obs - y_hat`
    pub innovation: f64,
    /// Innovation variance `S = H·P'·Hᵀ + R`
    pub innovation_variance: f64,
}

/// A simulated quantity trajectory with per-step uncertainty
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    /// Expected quantity per future day, first entry is one day ahead
    pub expected: Vec<f64>,
    /// Standard deviation `sqrt(H·P_k·Hᵀ)` per future day
    pub std_dev: Vec<f64>,
}

impl Trajectory {
    /// Confidence band `expected ± z·std_dev`, clipped at zero
    pub fn band(&self, z: f64) -> (Vec<f64>, Vec<f64>) {
        let lower = self
            .expected
            .iter()
            .zip(&self.std_dev)
            .map(|(q, s)| (q - z * s).max(0.0))
            .collect();
        let upper = self
            .expected
            .iter()
            .zip(&self.std_dev)
            .map(|(q, s)| (q + z * s).max(0.0))
            .collect();
        (lower, upper)
    }
}

/// Outcome of probing a trajectory for the run-out day
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunoutPrediction {
    /// First future day (1-based) on which the expected quantity falls to the
    /// threshold, `None` if no crossing occurs within the probed horizon
    pub days_until: Option<u32>,
    /// Confidence in `[0, 1]`
    pub confidence: f64,
}

impl RunoutPrediction {
    /// Scan an already-simulated trajectory for the threshold crossing
    pub fn from_trajectory(trajectory: &Trajectory, threshold: f64) -> Self {
        for (index, (q_hat, sigma)) in trajectory
            .expected
            .iter()
            .zip(&trajectory.std_dev)
            .enumerate()
        {
            if *q_hat <= threshold {
                let confidence = (1.0 / (1.0 + sigma / q_hat.max(QUANTITY_EPS))).clamp(0.0, 1.0);
                return Self {
                    days_until: Some(index as u32 + 1),
                    confidence,
                };
            }
        }

        let confidence = match trajectory.expected.last() {
            Some(q_final) if threshold > 0.0 => 1.0 - (q_final / threshold).min(1.0) / 2.0,
            Some(_) => 0.5,
            None => 0.0,
        };
        Self {
            days_until: None,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// Linear-Gaussian state-space model over the `[q, r, t, s]` state.
///
/// The model itself is pure: every operation maps an input state and
/// covariance to outputs without shared mutable state. Per-item mutability
/// lives in the trainer's registry entries.
#[derive(Debug, Clone)]
pub struct StateSpaceModel {
    parameters: ModelParameters,
}

impl StateSpaceModel {
    /// Wrap a parameter set
    pub fn new(parameters: ModelParameters) -> Self {
        Self { parameters }
    }

    /// Borrow the parameter set
    pub fn parameters(&self) -> &ModelParameters {
        &self.parameters
    }

    /// Mutably borrow the parameter set (gradient steps go through here)
    pub fn parameters_mut(&mut self) -> &mut ModelParameters {
        &mut self.parameters
    }

    /// One prediction step:
    /// `state' = F·state + B·features`, `P' = F·P·Fᵀ + Q`, `y_hat = H·state'`.
    pub fn predict(
        &self,
        state: &ModelState,
        covariance: &StateCovariance,
        features: &FeatureVector,
    ) -> (ModelState, StateCovariance, f64) {
        let f = &self.parameters.transition;
        let predicted: StateVector = f * state.as_vector() + self.parameters.influence * features;
        let covariance_pred = f * covariance * f.transpose() + self.parameters.process_noise;
        let y_hat = predicted[0];
        (ModelState::from_vector(&predicted), covariance_pred, y_hat)
    }

    /// One Kalman update step against an observed quantity.
    ///
    /// `quantity_max` bounds the posterior quantity estimate at
    /// `[0, 10 * quantity_max]`; rate and trend are projected to be
    /// non-negative and the covariance is forced symmetric PSD.
    pub fn update(
        &self,
        item_id: &str,
        predicted: &ModelState,
        covariance_pred: &StateCovariance,
        y_obs: f64,
        quantity_max: f64,
    ) -> ForecastResult<FilterUpdate> {
        let innovation_variance = covariance_pred[(0, 0)] + self.parameters.observation_noise;
        let s_inv = invert_innovation_variance(item_id, innovation_variance)?;

        // K = P'·Hᵀ·S⁻¹; with H = [1 0 0 0] the gain is the first column of P'.
        let gain: StateVector = covariance_pred.column(0) * s_inv;

        let innovation = y_obs - predicted.quantity;
        let posterior: StateVector = predicted.as_vector() + gain * innovation;

        // P'' = (I - K·H)·P'
        let mut kh = StateCovariance::zeros();
        kh.set_column(0, &gain);
        let covariance = (StateCovariance::identity() - kh) * covariance_pred;
        let covariance = project_psd(covariance);

        let mut state = ModelState::from_vector(&posterior);
        state.rate = state.rate.max(0.0);
        state.trend = state.trend.max(0.0);
        state.quantity = state.quantity.clamp(0.0, QMAX_FACTOR * quantity_max);

        if !state.is_finite() || covariance.iter().any(|v| !v.is_finite()) {
            return Err(ForecastError::numerical_fault(
                item_id,
                "Filter update produced non-finite values",
            ));
        }

        Ok(FilterUpdate {
            state,
            covariance,
            innovation,
            innovation_variance,
        })
    }

    /// Propagate the model `features_series.len()` days ahead without
    /// observations, emitting the expected quantity and its standard
    /// deviation per day.
    pub fn simulate(
        &self,
        state: &ModelState,
        covariance: &StateCovariance,
        features_series: &[FeatureVector],
    ) -> Trajectory {
        let mut expected = Vec::with_capacity(features_series.len());
        let mut std_dev = Vec::with_capacity(features_series.len());

        let mut current = *state;
        let mut cov = *covariance;
        for features in features_series {
            let (next, next_cov, y_hat) = self.predict(&current, &cov, features);
            expected.push(y_hat);
            std_dev.push(next_cov[(0, 0)].max(0.0).sqrt());
            current = next;
            cov = next_cov;
        }

        Trajectory { expected, std_dev }
    }

    /// Simulate forward day by day and report the first day the expected
    /// quantity falls to `threshold`.
    ///
    /// At a crossing on day `k` the confidence is
    /// `1 / (1 + σ_k / max(q̂_k, ε))`; with no crossing within the horizon it
    /// is `1 - min(q̂_final / threshold, 1) / 2`.
    pub fn runout_probe(
        &self,
        state: &ModelState,
        covariance: &StateCovariance,
        features_series: &[FeatureVector],
        threshold: f64,
    ) -> RunoutPrediction {
        let trajectory = self.simulate(state, covariance, features_series);
        RunoutPrediction::from_trajectory(&trajectory, threshold)
    }

    /// Build the initial state and covariance for a freshly materialized item.
    ///
    /// With at least two recent observations the initial rate is the
    /// least-squares slope of quantity over time (sign flipped so that
    /// consumption is positive); otherwise the category default applies, and
    /// failing that the rate starts at zero.
    pub fn initialize(
        current_quantity: f64,
        recent: &[Observation],
        category_rate: Option<f64>,
        quantity_max: f64,
    ) -> (ModelState, StateCovariance) {
        let rate = estimate_initial_rate(recent)
            .or(category_rate)
            .unwrap_or(0.0)
            .max(0.0);

        let state = ModelState::new(current_quantity.max(0.0), rate);
        let covariance = StateCovariance::from_diagonal(&StateVector::new(
            0.25 * quantity_max * quantity_max,
            0.1,
            0.01,
            0.01,
        ));
        (state, covariance)
    }
}

/// Least-squares slope of quantity against days-since-first, sign flipped to
/// the consumption convention. `None` with fewer than two observations or a
/// degenerate time axis.
fn estimate_initial_rate(recent: &[Observation]) -> Option<f64> {
    if recent.len() < 2 {
        return None;
    }

    let origin = recent[0].timestamp;
    let n = recent.len() as f64;
    let xs: Vec<f64> = recent
        .iter()
        .map(|obs| (obs.timestamp - origin).num_seconds() as f64 / 86_400.0)
        .collect();

    let x_mean = xs.iter().sum::<f64>() / n;
    let y_mean = recent.iter().map(|obs| obs.quantity).sum::<f64>() / n;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (x, obs) in xs.iter().zip(recent) {
        numerator += (x - x_mean) * (obs.quantity - y_mean);
        denominator += (x - x_mean) * (x - x_mean);
    }

    if denominator.abs() < f64::EPSILON {
        return None;
    }

    Some((-numerator / denominator).max(0.0))
}

/// Invert the scalar innovation variance, falling back to a ridge when it is
/// singular or negative.
fn invert_innovation_variance(item_id: &str, s: f64) -> ForecastResult<f64> {
    if !s.is_finite() {
        return Err(ForecastError::numerical_fault(
            item_id,
            "Innovation variance is not finite",
        ));
    }

    if s > RIDGE {
        return Ok(1.0 / s);
    }

    let ridged = s + RIDGE;
    if ridged <= 0.0 {
        return Err(ForecastError::numerical_fault(
            item_id,
            "Innovation variance remained singular after ridge",
        ));
    }
    Ok(1.0 / ridged)
}

/// Force a covariance matrix symmetric positive semi-definite.
///
/// Symmetrizes with `(P + Pᵀ)/2`, then clamps negative eigenvalues to zero.
/// The eigendecomposition only runs when a Cholesky probe fails, which is the
/// only case in which a negative eigenvalue can exist.
pub fn project_psd(covariance: StateCovariance) -> StateCovariance {
    let symmetric = (covariance + covariance.transpose()) * 0.5;

    if Cholesky::new(symmetric).is_some() {
        return symmetric;
    }

    let mut eigen = SymmetricEigen::new(symmetric);
    for value in eigen.eigenvalues.iter_mut() {
        *value = value.max(0.0);
    }
    let recomposed = eigen.recompose();
    (recomposed + recomposed.transpose()) * 0.5
}
