use chrono::{DateTime, Datelike, FixedOffset, Utc};
use nalgebra::SVector;

use crate::models::ItemDescriptor;

/// Width of the feature vector; a compile-time constant of the core.
pub const FEATURE_WIDTH: usize = 8;

/// Fixed-width feature vector type.
pub type FeatureVector = SVector<f64, FEATURE_WIDTH>;

/// Turns a timestamp and item descriptor into a fixed-width feature vector.
///
/// Stateless and pure: the same timestamp, descriptor, and timezone always
/// produce the same vector. Calendar fields resolve in the timezone supplied
/// at construction.
///
/// | idx | name           | range  |
/// |-----|----------------|--------|
/// | 0   | dow            | [0,1]  |
/// | 1   | dom            | [0,1]  |
/// | 2   | moy            | [0,1]  |
/// | 3   | weekend        | {0,1}  |
/// | 4   | household      | [0,1]  |
/// | 5   | perishable     | {0,1}  |
/// | 6   | days_to_expiry | [0,1]  |
/// | 7   | reserved       | {0}    |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureBuilder {
    timezone: FixedOffset,
}

impl FeatureBuilder {
    /// Create a builder resolving calendar fields in the given timezone
    pub fn new(timezone: FixedOffset) -> Self {
        Self { timezone }
    }

    /// Create a builder resolving calendar fields in UTC
    pub fn utc() -> Self {
        Self::new(FixedOffset::east_opt(0).unwrap())
    }

    /// The timezone calendar fields resolve in
    pub fn timezone(&self) -> FixedOffset {
        self.timezone
    }

    /// Build the feature vector for a timestamp and descriptor
    pub fn build(&self, timestamp: DateTime<Utc>, descriptor: &ItemDescriptor) -> FeatureVector {
        let local = timestamp.with_timezone(&self.timezone);

        let dow = local.weekday().num_days_from_monday() as f64 / 6.0;
        let dom = (local.day() as f64 - 1.0) / 30.0;
        let moy = (local.month() as f64 - 1.0) / 11.0;
        let weekend = if local.weekday().num_days_from_monday() >= 5 {
            1.0
        } else {
            0.0
        };
        let household = f64::from(descriptor.household_size.min(10)) / 10.0;
        let perishable = if descriptor.perishable { 1.0 } else { 0.0 };
        let days_to_expiry = descriptor
            .expiry_date
            .map(|expiry| {
                let days = (expiry - timestamp).num_days().clamp(0, 30);
                days as f64 / 30.0
            })
            .unwrap_or(0.0);

        FeatureVector::from_column_slice(&[
            dow,
            dom,
            moy,
            weekend,
            household,
            perishable,
            days_to_expiry,
            0.0,
        ])
    }

    /// Names of the feature slots, index-aligned with [`Self::build`]
    pub fn feature_names() -> Vec<String> {
        [
            "dow",
            "dom",
            "moy",
            "weekend",
            "household",
            "perishable",
            "days_to_expiry",
            "reserved",
        ]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
    }
}

impl Default for FeatureBuilder {
    fn default() -> Self {
        Self::utc()
    }
}
