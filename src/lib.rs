//! # Household Consumption Forecasting Core
//!
//! The forecasting engine of a household inventory assistant: given a stream
//! of timestamped inventory observations per item, it maintains a per-item
//! linear-Gaussian state-space model that estimates current quantity and
//! consumption dynamics, predicts the future quantity trajectory with
//! uncertainty bands, and produces a run-out date, an order-by date, and a
//! recommended restock quantity with a confidence score.
//!
//! ## Features
//!
//! - **Kalman filtering**: per-item predict/update over a
//!   quantity/rate/trend/seasonal state with enforced covariance invariants
//! - **Online adaptation**: per-observation gradient steps on the feature
//!   influence matrix, damped by an EWMA stabilizer
//! - **Category warm starts**: cold items clone pretrained category
//!   parameters so the first forecast is already informative
//! - **Crash-consistent checkpoints**: versioned binary envelopes published
//!   by write-temp-then-rename, with corrupt files quarantined
//! - **Non-blocking retraining**: a clock-driven scheduler re-fits stale
//!   models on a bounded worker pool, contending only on per-item locks
//! - **Multi-format export**: JSON, TOML, and CSV surfaces for observation
//!   and forecast collections
//!
//! ## Quick Start
//!
//! ```rust
//! use pantry_forecast::prelude::*;
//!
//! // Describe an item the way the inventory subsystem would
//! let descriptor = ItemDescriptorBuilder::new("Dairy")
//!     .perishable(true)
//!     .household_size(3)
//!     .quantity_bounds(0.5, 4.0)?
//!     .build()?;
//!
//! // Tune the core; unset knobs keep production defaults
//! let config = CoreConfigBuilder::new()
//!     .retrain_interval_days(7)
//!     .order_lead_days(3)
//!     .build()?;
//!
//! assert_eq!(descriptor.category, "Dairy");
//! assert_eq!(config.retrain_interval_days, 7);
//! # Ok::<(), pantry_forecast::ForecastError>(())
//! ```
//!
//! The host embeds [`service::ForecastService`] directly: `ingest` feeds
//! observations through the trainer, `forecast` simulates the trajectory and
//! derives the restock recommendation, and [`scheduler::TrainingScheduler`]
//! keeps models fresh in the background.

pub mod builders;
pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod features;
pub mod models;
pub mod pretrain;
pub mod scheduler;
pub mod serialization;
pub mod service;
pub mod state_space;
pub mod stores;
pub mod trainer;


#[cfg(test)]
mod scenario_tests;

// Re-export all public items from modules
#[allow(ambiguous_glob_reexports)]
pub use builders::*;
#[allow(ambiguous_glob_reexports)]
pub use checkpoint::*;
#[allow(ambiguous_glob_reexports)]
pub use config::*;
#[allow(ambiguous_glob_reexports)]
pub use errors::*;
#[allow(ambiguous_glob_reexports)]
pub use features::*;
#[allow(ambiguous_glob_reexports)]
pub use models::*;
#[allow(ambiguous_glob_reexports)]
pub use pretrain::*;
#[allow(ambiguous_glob_reexports)]
pub use scheduler::*;
#[allow(ambiguous_glob_reexports)]
pub use serialization::*;
#[allow(ambiguous_glob_reexports)]
pub use service::*;
#[allow(ambiguous_glob_reexports)]
pub use state_space::*;
#[allow(ambiguous_glob_reexports)]
pub use stores::*;
#[allow(ambiguous_glob_reexports)]
pub use trainer::*;

/// Convenience module for common imports
pub mod prelude {
    #[allow(ambiguous_glob_reexports)]
    pub use crate::builders::*;
    #[allow(ambiguous_glob_reexports)]
    pub use crate::checkpoint::*;
    #[allow(ambiguous_glob_reexports)]
    pub use crate::config::*;
    #[allow(ambiguous_glob_reexports)]
    pub use crate::errors::*;
    #[allow(ambiguous_glob_reexports)]
    pub use crate::features::*;
    #[allow(ambiguous_glob_reexports)]
    pub use crate::models::*;
    #[allow(ambiguous_glob_reexports)]
    pub use crate::pretrain::*;
    #[allow(ambiguous_glob_reexports)]
    pub use crate::scheduler::*;
    #[allow(ambiguous_glob_reexports)]
    pub use crate::serialization::*;
    #[allow(ambiguous_glob_reexports)]
    pub use crate::service::*;
    #[allow(ambiguous_glob_reexports)]
    pub use crate::state_space::*;
    #[allow(ambiguous_glob_reexports)]
    pub use crate::stores::*;
    #[allow(ambiguous_glob_reexports)]
    pub use crate::trainer::*;
}
