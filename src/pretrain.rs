use chrono::{DateTime, Datelike, Duration, TimeZone, Utc, Weekday};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Bernoulli, Distribution, Uniform};
use rayon::prelude::*;
use std::sync::Arc;

use crate::config::CoreConfig;
use crate::errors::{ForecastError, ForecastResult};
use crate::features::FeatureBuilder;
use crate::models::{
    CheckpointOwner, ItemDescriptor, ModelCheckpoint, ModelParameters, Observation,
    ObservationSource, TrainingStats,
};
use crate::state_space::StateSpaceModel;
use crate::stores::{category_key, ModelStore};
use crate::trainer::fold_history;

/// Days of synthetic history generated per category.
const SYNTHETIC_DAYS: usize = 60;

/// Probability of a weekend guest event.
const GUEST_PROBABILITY: f64 = 0.3;

/// Consumption multiplier during a guest event.
const GUEST_MULTIPLIER: f64 = 1.5;

/// Training passes over the synthetic stream.
const TRAIN_PASSES: usize = 3;

/// Consumption profile for one synthetic category
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryProfile {
    pub category: String,
    /// Quantity restocked every Saturday
    pub base_weekly_qty: f64,
    /// Baseline units consumed per day
    pub base_daily: f64,
    pub perishable: bool,
    pub shelf_life_days: u32,
    pub quantity_min: f64,
    pub quantity_max: f64,
}

impl CategoryProfile {
    fn descriptor(&self) -> ItemDescriptor {
        ItemDescriptor {
            category: self.category.clone(),
            perishable: self.perishable,
            household_size: 2,
            expiry_date: None,
            quantity_min: self.quantity_min,
            quantity_max: self.quantity_max,
        }
    }
}

/// The fixed category set pretrained at setup
pub fn default_categories() -> Vec<CategoryProfile> {
    let profile = |category: &str,
                   base_weekly_qty: f64,
                   base_daily: f64,
                   perishable: bool,
                   shelf_life_days: u32,
                   quantity_min: f64,
                   quantity_max: f64| CategoryProfile {
        category: category.to_string(),
        base_weekly_qty,
        base_daily,
        perishable,
        shelf_life_days,
        quantity_min,
        quantity_max,
    };

    vec![
        profile("Dairy", 4.0, 0.5, true, 7, 0.5, 4.0),
        profile("Produce", 6.0, 0.9, true, 5, 1.0, 6.0),
        profile("Bakery", 2.0, 0.3, true, 4, 0.5, 2.0),
        profile("Pantry", 10.0, 0.6, false, 180, 2.0, 10.0),
        profile("Beverages", 12.0, 1.2, false, 90, 2.0, 12.0),
        profile("Frozen", 8.0, 0.4, false, 60, 1.0, 8.0),
        profile("Household", 6.0, 0.2, false, 365, 1.0, 6.0),
    ]
}

/// One-shot generator of category-level warm-start checkpoints.
///
/// For each category it synthesizes a 60-day consumption history (weekly
/// Saturday restocks, mid-week perishable top-ups, day-of-week multipliers,
/// occasional weekend guests), trains a fresh state-space model on the
/// stream, and persists the result as `pretrained/{category}.ckpt`.
/// Deterministic for a given seed.
#[derive(Debug, Clone)]
pub struct SyntheticPretrainer {
    config: CoreConfig,
    features: FeatureBuilder,
    seed: u64,
}

impl SyntheticPretrainer {
    /// Create a pretrainer with the given seed
    pub fn new(config: CoreConfig, features: FeatureBuilder, seed: u64) -> Self {
        Self {
            config,
            features,
            seed,
        }
    }

    /// Anchor of the synthetic calendar; a Saturday, so day zero restocks.
    fn anchor() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 6, 12, 0, 0).unwrap()
    }

    /// Generate the synthetic observation stream for a category
    pub fn generate_history(&self, profile: &CategoryProfile) -> Vec<Observation> {
        let mut rng = StdRng::seed_from_u64(self.seed ^ category_hash(&profile.category));
        let noise = Uniform::new(0.8, 1.2);
        let guests = Bernoulli::new(GUEST_PROBABILITY).expect("valid probability");

        let anchor = Self::anchor();
        let mut current = profile.base_weekly_qty;
        let mut history = Vec::with_capacity(SYNTHETIC_DAYS);

        for day in 0..SYNTHETIC_DAYS {
            let timestamp = anchor + Duration::days(day as i64);
            let weekday = timestamp.weekday();

            if weekday == Weekday::Sat {
                current = profile.base_weekly_qty;
            } else if weekday == Weekday::Wed
                && profile.perishable
                && profile.shelf_life_days <= 7
                && current < 0.5 * profile.quantity_min
            {
                current = profile.base_weekly_qty;
            }

            let dow_multiplier = match weekday {
                Weekday::Sat | Weekday::Sun => 1.3,
                Weekday::Fri => 1.1,
                _ => 1.0,
            };
            let mut consumption = profile.base_daily * dow_multiplier * noise.sample(&mut rng);
            let is_weekend = matches!(weekday, Weekday::Sat | Weekday::Sun);
            if is_weekend && guests.sample(&mut rng) {
                consumption *= GUEST_MULTIPLIER;
            }

            current = (current - consumption).max(0.0);
            history.push(Observation::new(
                format!("synthetic-{}", profile.category.to_lowercase()),
                timestamp,
                current,
                ObservationSource::System,
            ));
        }

        history
    }

    /// Train a fresh model on the category's synthetic stream
    pub fn train_category(&self, profile: &CategoryProfile) -> ForecastResult<ModelCheckpoint> {
        let descriptor = profile.descriptor();
        let history = self.generate_history(profile);

        let mut model = StateSpaceModel::new(ModelParameters::defaults());
        let mut outcome = None;
        for _pass in 0..TRAIN_PASSES {
            let (state, covariance) =
                StateSpaceModel::initialize(0.0, &[], None, profile.quantity_max);
            let folded = fold_history(
                &profile.category,
                model.clone(),
                state,
                covariance,
                TrainingStats::new(),
                &history,
                &self.features,
                &descriptor,
                &self.config,
                None,
            )?;
            model = folded.model.clone();
            outcome = Some(folded);
        }

        let folded = outcome.expect("at least one training pass runs");
        let trained_at = history
            .last()
            .map(|obs| obs.timestamp)
            .unwrap_or_else(Self::anchor);

        let mut checkpoint = ModelCheckpoint::new(
            CheckpointOwner::Category(profile.category.clone()),
            folded.model.parameters().clone(),
            folded.state,
            folded.covariance,
            trained_at,
            FeatureBuilder::feature_names(),
        );
        checkpoint.stats = folded.stats;
        Ok(checkpoint)
    }

    /// Train every category in parallel and persist the warm-start
    /// checkpoints. Returns the category names persisted.
    pub async fn run(
        &self,
        models: Arc<dyn ModelStore>,
        profiles: Vec<CategoryProfile>,
    ) -> ForecastResult<Vec<String>> {
        let this = self.clone();
        let checkpoints = tokio::task::spawn_blocking(move || {
            profiles
                .par_iter()
                .map(|profile| this.train_category(profile))
                .collect::<ForecastResult<Vec<_>>>()
        })
        .await
        .map_err(|err| ForecastError::retrain_failed("pretrain", err.to_string()))??;

        let mut persisted = Vec::with_capacity(checkpoints.len());
        for checkpoint in checkpoints {
            let category = checkpoint.owner.key().to_string();
            models
                .store(&category_key(&category), &checkpoint)
                .await?;
            tracing::debug!(category = %category, "persisted category warm-start");
            persisted.push(category);
        }
        persisted.sort();
        Ok(persisted)
    }
}

/// FNV-1a over the category name; stable across platforms so a given seed
/// always reproduces the same streams.
fn category_hash(category: &str) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in category.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
