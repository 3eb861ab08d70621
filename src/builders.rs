use chrono::{DateTime, Utc};

use crate::config::CoreConfig;
use crate::errors::{ForecastError, ForecastResult};
use crate::models::ItemDescriptor;

/// Builder pattern for creating item descriptors with validation
#[derive(Debug, Clone)]
pub struct ItemDescriptorBuilder {
    category: Option<String>,
    perishable: bool,
    household_size: u32,
    expiry_date: Option<DateTime<Utc>>,
    quantity_min: Option<f64>,
    quantity_max: Option<f64>,
}

impl ItemDescriptorBuilder {
    /// Create a new descriptor builder for a category
    pub fn new<S: Into<String>>(category: S) -> Self {
        Self {
            category: Some(category.into()),
            perishable: false,
            household_size: 1,
            expiry_date: None,
            quantity_min: None,
            quantity_max: None,
        }
    }

    /// Mark the item as perishable
    pub fn perishable(mut self, perishable: bool) -> Self {
        self.perishable = perishable;
        self
    }

    /// Set the household size
    pub fn household_size(mut self, size: u32) -> Self {
        self.household_size = size;
        self
    }

    /// Set the expiry date
    pub fn expiry_date(mut self, date: DateTime<Utc>) -> Self {
        self.expiry_date = Some(date);
        self
    }

    /// Set both quantity bounds, validating their order
    pub fn quantity_bounds(mut self, min: f64, max: f64) -> ForecastResult<Self> {
        if min < 0.0 || min > max {
            return Err(ForecastError::config(
                "Minimum quantity must lie in [0, quantity_max]",
            ));
        }
        self.quantity_min = Some(min);
        self.quantity_max = Some(max);
        Ok(self)
    }

    /// Set the maximum quantity only; the minimum defaults to zero
    pub fn quantity_max(mut self, max: f64) -> Self {
        self.quantity_max = Some(max);
        self
    }

    /// Build the descriptor, validating all invariants
    pub fn build(self) -> ForecastResult<ItemDescriptor> {
        let category = self
            .category
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ForecastError::config("Category is required"))?;
        let quantity_max = self
            .quantity_max
            .ok_or_else(|| ForecastError::config("Maximum quantity is required"))?;

        let descriptor = ItemDescriptor {
            category,
            perishable: self.perishable,
            household_size: self.household_size,
            expiry_date: self.expiry_date,
            quantity_min: self.quantity_min.unwrap_or(0.0),
            quantity_max,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

/// Builder pattern for tuning the core configuration
#[derive(Debug, Clone, Default)]
pub struct CoreConfigBuilder {
    config: CoreConfig,
}

impl CoreConfigBuilder {
    /// Start from the production defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the EWMA stabilizer weight
    pub fn ewma_alpha(mut self, alpha: f64) -> Self {
        self.config.ewma_alpha = alpha;
        self
    }

    /// Set the gradient learning rate
    pub fn learning_rate(mut self, rate: f64) -> Self {
        self.config.learning_rate = rate;
        self
    }

    /// Set the full-retrain cadence in days
    pub fn retrain_interval_days(mut self, days: u32) -> Self {
        self.config.retrain_interval_days = days;
        self
    }

    /// Set the forecast horizon clamp
    pub fn horizon_max_days(mut self, days: u32) -> Self {
        self.config.horizon_max_days = days;
        self
    }

    /// Set the order lead time in days
    pub fn order_lead_days(mut self, days: u32) -> Self {
        self.config.order_lead_days = days;
        self
    }

    /// Set the backfill acceptance window in days
    pub fn backfill_window_days(mut self, days: u32) -> Self {
        self.config.backfill_window_days = days;
        self
    }

    /// Set the checkpoint write rate limit in seconds
    pub fn min_persist_interval_sec(mut self, seconds: u64) -> Self {
        self.config.min_persist_interval_sec = seconds;
        self
    }

    /// Set the registry LRU capacity
    pub fn lru_capacity(mut self, capacity: usize) -> Self {
        self.config.lru_capacity = capacity;
        self
    }

    /// Set the scheduler's retrain parallelism bound
    pub fn max_parallel_retrains(mut self, max: usize) -> Self {
        self.config.max_parallel_retrains = max;
        self
    }

    /// Build the configuration, validating all invariants
    pub fn build(self) -> ForecastResult<CoreConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
