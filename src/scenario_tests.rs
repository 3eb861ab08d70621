use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

use crate::{
    checkpoint::{decode_checkpoint, encode_checkpoint},
    config::CoreConfig,
    errors::ForecastError,
    features::FeatureBuilder,
    models::*,
    pretrain::{default_categories, SyntheticPretrainer},
    scheduler::{SchedulerConfig, TrainingScheduler},
    service::ForecastService,
    state_space::StateSpaceModel,
    stores::*,
    trainer::OnlineTrainer,
};

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[allow(dead_code)]
    struct Harness {
        observations: Arc<MemoryObservationStore>,
        models: Arc<MemoryModelStore>,
        forecasts: Arc<MemoryForecastStore>,
        audit: Arc<MemoryAuditSink>,
        trainer: Arc<OnlineTrainer>,
        service: Arc<ForecastService>,
    }

    fn harness(config: CoreConfig) -> Harness {
        harness_with_models(config, Arc::new(MemoryModelStore::new()))
    }

    fn harness_with_models(config: CoreConfig, models: Arc<MemoryModelStore>) -> Harness {
        let observations = Arc::new(MemoryObservationStore::new());
        let forecasts = Arc::new(MemoryForecastStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let trainer = Arc::new(OnlineTrainer::new(
            config,
            FeatureBuilder::utc(),
            observations.clone() as Arc<dyn ObservationStore>,
            models.clone() as Arc<dyn ModelStore>,
            audit.clone() as Arc<dyn AuditSink>,
        ));
        let service = Arc::new(ForecastService::new(
            trainer.clone(),
            forecasts.clone() as Arc<dyn ForecastStore>,
            audit.clone() as Arc<dyn AuditSink>,
        ));
        Harness {
            observations,
            models,
            forecasts,
            audit,
            trainer,
            service,
        }
    }

    fn descriptor(category: &str, quantity_min: f64, quantity_max: f64) -> ItemDescriptor {
        ItemDescriptor {
            category: category.to_string(),
            perishable: false,
            household_size: 2,
            expiry_date: None,
            quantity_min,
            quantity_max,
        }
    }

    async fn ingest_series(
        harness: &Harness,
        item: &str,
        desc: &ItemDescriptor,
        t0: DateTime<Utc>,
        quantities: &[f64],
    ) {
        for (day, quantity) in quantities.iter().enumerate() {
            harness
                .service
                .ingest(
                    item,
                    *quantity,
                    t0 + Duration::days(day as i64),
                    ObservationSource::Sensor,
                    desc,
                )
                .await
                .unwrap();
        }
    }

    // ── S1: steady consumption ──────────────────────────────────────────

    #[tokio::test]
    async fn s1_steady_consumption_predicts_runout_and_order() {
        let harness = harness(CoreConfig::default());
        let desc = descriptor("Dairy", 0.5, 4.0);
        // Sunday start so the last observation lands on a Saturday
        let t0 = Utc.with_ymd_and_hms(2024, 1, 7, 12, 0, 0).unwrap();

        let quantities: Vec<f64> = (0..14).map(|day| 4.0 - 0.25 * day as f64).collect();
        ingest_series(&harness, "milk", &desc, t0, &quantities).await;

        let as_of = t0 + Duration::days(13);
        let forecast = harness
            .service
            .forecast_at("milk", 30, &desc, as_of)
            .await
            .unwrap();

        let runout = forecast.predicted_runout_date.expect("runout predicted");
        let days_from_start = (runout - t0).num_days();
        assert!(
            (13..=15).contains(&days_from_start),
            "runout {} days from start",
            days_from_start
        );
        assert!(
            forecast.confidence >= 0.7,
            "confidence {}",
            forecast.confidence
        );
        assert_eq!(
            forecast.recommended_order_date,
            Some(runout - Duration::days(3))
        );
        assert!(
            (3.0..=4.0).contains(&forecast.recommended_quantity),
            "recommended {}",
            forecast.recommended_quantity
        );
    }

    // ── S2: restock spike ───────────────────────────────────────────────

    #[tokio::test]
    async fn s2_restock_resets_runout_horizon() {
        let harness = harness(CoreConfig::default());
        let desc = descriptor("Dairy", 0.5, 4.0);
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        // 10 days draining 4.0 -> 1.0, a restock to 4.0, 5 days 4.0 -> 3.0
        let mut quantities: Vec<f64> = (0..10).map(|day| 4.0 - day as f64 / 3.0).collect();
        quantities.push(4.0);
        quantities.extend((1..=5).map(|day| 4.0 - 0.2 * day as f64));
        ingest_series(&harness, "juice", &desc, t0, &quantities).await;

        let as_of = t0 + Duration::days(15);
        let forecast = harness
            .service
            .forecast_at("juice", 10, &desc, as_of)
            .await
            .unwrap();

        match forecast.predicted_runout_date {
            None => {}
            Some(runout) => {
                let days = (runout - as_of).num_days();
                assert!(days >= 10, "post-restock runout only {} days out", days);
            }
        }
        assert!(
            forecast.confidence >= 0.5,
            "confidence {}",
            forecast.confidence
        );
    }

    // ── S3: cold start with category warm-start ─────────────────────────

    #[tokio::test]
    async fn s3_category_warm_start_gives_informative_first_forecast() {
        let models = Arc::new(MemoryModelStore::new());
        let pretrainer =
            SyntheticPretrainer::new(CoreConfig::default(), FeatureBuilder::utc(), 42);
        pretrainer
            .run(models.clone(), default_categories())
            .await
            .unwrap();

        let warm = harness_with_models(CoreConfig::default(), models);
        let desc = descriptor("Dairy", 0.0, 4.0);
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        warm.service
            .ingest("yogurt", 0.5, t0, ObservationSource::Receipt, &desc)
            .await
            .unwrap();

        let snapshot = warm.trainer.snapshot("yogurt", &desc).await.unwrap();
        assert!(
            snapshot.state.rate > 0.0,
            "warm-started rate {} should be positive after one observation",
            snapshot.state.rate
        );

        let warm_forecast = warm
            .service
            .forecast_at("yogurt", 14, &desc, t0)
            .await
            .unwrap();
        assert!(warm_forecast.predicted_runout_date.is_some());

        // Without the category checkpoint the same single observation yields
        // an uninformative zero-rate model.
        let cold = harness(CoreConfig::default());
        cold.service
            .ingest("yogurt", 0.5, t0, ObservationSource::Receipt, &desc)
            .await
            .unwrap();
        let cold_snapshot = cold.trainer.snapshot("yogurt", &desc).await.unwrap();
        assert_relative_eq!(cold_snapshot.state.rate, 0.0);
        let cold_forecast = cold
            .service
            .forecast_at("yogurt", 14, &desc, t0)
            .await
            .unwrap();
        assert!(cold_forecast.predicted_runout_date.is_none());
    }

    // ── S4: out-of-order backfill ───────────────────────────────────────

    #[tokio::test]
    async fn s4_backfill_matches_in_order_ingestion() {
        let desc = descriptor("Pantry", 0.0, 4.0);
        let t0 = Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap();
        let day = |d: i64| t0 + Duration::days(d);

        let shuffled = harness(CoreConfig::default());
        for (d, q) in [(10, 2.0), (11, 1.8), (8, 3.0)] {
            shuffled
                .service
                .ingest("rice", q, day(d), ObservationSource::Manual, &desc)
                .await
                .unwrap();
        }

        let ordered = harness(CoreConfig::default());
        for (d, q) in [(8, 3.0), (10, 2.0), (11, 1.8)] {
            ordered
                .service
                .ingest("rice", q, day(d), ObservationSource::Manual, &desc)
                .await
                .unwrap();
        }

        let a = shuffled.trainer.snapshot("rice", &desc).await.unwrap();
        let b = ordered.trainer.snapshot("rice", &desc).await.unwrap();

        assert_relative_eq!(a.state.quantity, b.state.quantity, max_relative = 1e-6);
        assert_relative_eq!(a.state.rate, b.state.rate, max_relative = 1e-6);
        assert_relative_eq!(a.state.seasonal, b.state.seasonal, max_relative = 1e-6);
        let cov_gap = (a.covariance - b.covariance).abs().max();
        assert!(cov_gap <= 1e-9, "covariance gap {}", cov_gap);
    }

    #[tokio::test]
    async fn backfill_refilters_suffix_from_item_checkpoint() {
        // A long persist rate limit keeps the latest checkpoint lagging behind
        // the newest observations, so the backfill finds a restart point that
        // predates it and only the suffix refolds.
        let config = CoreConfig {
            min_persist_interval_sec: 5 * 86_400,
            ..CoreConfig::default()
        };
        let desc = descriptor("Pantry", 0.0, 4.0);
        let t0 = Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap();

        let shuffled = harness(config.clone());
        for (hours, q) in [(0, 4.0), (24, 3.6), (48, 3.2)] {
            shuffled
                .service
                .ingest(
                    "rice",
                    q,
                    t0 + Duration::hours(hours),
                    ObservationSource::Manual,
                    &desc,
                )
                .await
                .unwrap();
        }
        // Lands between the checkpointed first observation and the rest
        shuffled
            .service
            .ingest(
                "rice",
                3.8,
                t0 + Duration::hours(12),
                ObservationSource::Manual,
                &desc,
            )
            .await
            .unwrap();

        let ordered = harness(config);
        for (hours, q) in [(0, 4.0), (12, 3.8), (24, 3.6), (48, 3.2)] {
            ordered
                .service
                .ingest(
                    "rice",
                    q,
                    t0 + Duration::hours(hours),
                    ObservationSource::Manual,
                    &desc,
                )
                .await
                .unwrap();
        }

        let a = shuffled.trainer.snapshot("rice", &desc).await.unwrap();
        let b = ordered.trainer.snapshot("rice", &desc).await.unwrap();

        assert_relative_eq!(a.state.quantity, b.state.quantity, max_relative = 1e-9);
        assert_relative_eq!(a.state.rate, b.state.rate, max_relative = 1e-9);
        let cov_gap = (a.covariance - b.covariance).abs().max();
        assert!(cov_gap <= 1e-9, "covariance gap {}", cov_gap);
        // Continued statistics cover the full history, not just the suffix
        assert_eq!(a.stats.observations_seen, 4);
        assert_eq!(a.stats.observations_seen, b.stats.observations_seen);
    }

    #[tokio::test]
    async fn backfill_older_than_window_is_rejected() {
        let harness = harness(CoreConfig::default());
        let desc = descriptor("Pantry", 0.0, 4.0);
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        harness
            .service
            .ingest("rice", 2.0, t0, ObservationSource::Manual, &desc)
            .await
            .unwrap();

        let stale = t0 - Duration::days(120);
        let err = harness
            .service
            .ingest("rice", 3.0, stale, ObservationSource::Manual, &desc)
            .await
            .unwrap_err();
        assert!(matches!(err, ForecastError::InvalidObservation { .. }));
        assert!(harness.audit.count(AuditAction::ObservationRejected) >= 1);
    }

    // ── S5: corrupt checkpoint ──────────────────────────────────────────

    #[tokio::test]
    async fn s5_corrupt_checkpoint_is_quarantined_and_cold_started() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("items")).unwrap();
        std::fs::write(dir.path().join("items/x.ckpt"), b"\x00\x17random junk bytes").unwrap();

        let observations = Arc::new(MemoryObservationStore::new());
        let forecasts = Arc::new(MemoryForecastStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let fs_models = Arc::new(FsModelStore::new(dir.path()));
        let trainer = Arc::new(OnlineTrainer::new(
            CoreConfig::default(),
            FeatureBuilder::utc(),
            observations as Arc<dyn ObservationStore>,
            fs_models.clone() as Arc<dyn ModelStore>,
            audit.clone() as Arc<dyn AuditSink>,
        ));
        let service = ForecastService::new(
            trainer.clone(),
            forecasts as Arc<dyn ForecastStore>,
            audit.clone() as Arc<dyn AuditSink>,
        );

        let desc = descriptor("Pantry", 0.0, 4.0);
        let t0 = Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap();
        service
            .ingest("x", 2.0, t0, ObservationSource::Sensor, &desc)
            .await
            .unwrap();

        assert!(dir.path().join("items/x.ckpt.bad").exists());
        assert!(audit.count(AuditAction::CheckpointQuarantined) >= 1);

        // The replacement model is a plain cold start
        let snapshot = trainer.snapshot("x", &desc).await.unwrap();
        assert_relative_eq!(snapshot.state.rate, 0.0);
        let forecast = service.forecast_at("x", 14, &desc, t0).await.unwrap();
        assert!(forecast.predicted_runout_date.is_none());

        // Ingestion re-published a valid checkpoint alongside the quarantined one
        assert!(dir.path().join("items/x.ckpt").exists());
    }

    // ── S6: scheduler contract ──────────────────────────────────────────

    #[tokio::test]
    async fn s6_one_tick_schedules_each_stale_item_once() {
        let harness = harness(CoreConfig::default());
        let providers = Arc::new(MemoryDescriptorProvider::new());
        let desc = descriptor("Pantry", 0.0, 4.0);
        let t0 = Utc::now() - Duration::days(12);

        for n in 0..10 {
            let item = format!("item-{}", n);
            providers.insert(&item, desc.clone());
            let quantities: Vec<f64> = (0..10).map(|day| 4.0 - 0.3 * day as f64).collect();
            ingest_series(&harness, &item, &desc, t0, &quantities).await;
            harness
                .trainer
                .with_entry(&item, &desc, |entry| {
                    entry.last_full_retrain_at = Utc::now() - Duration::days(8);
                })
                .await
                .unwrap();
        }

        let scheduler = TrainingScheduler::new(
            SchedulerConfig::default(),
            harness.trainer.clone(),
            providers.clone() as Arc<dyn DescriptorProvider>,
            harness.audit.clone() as Arc<dyn AuditSink>,
        );

        let outcome = scheduler.run_cycle(&CancelSignal::new()).await.unwrap();
        assert_eq!(outcome.scanned, 10);
        assert_eq!(outcome.scheduled, 10);
        assert_eq!(outcome.retrained, 10);
        assert_eq!(outcome.failed, 0);
        assert_eq!(harness.audit.count(AuditAction::ModelRetrained), 10);

        // Freshly retrained items are not rescheduled on the next cycle
        let second = scheduler.run_cycle(&CancelSignal::new()).await.unwrap();
        assert_eq!(second.scheduled, 0);
    }

    #[tokio::test]
    async fn scheduler_cycle_honors_cancellation() {
        let harness = harness(CoreConfig::default());
        let providers = Arc::new(MemoryDescriptorProvider::new());
        let scheduler = TrainingScheduler::new(
            SchedulerConfig::default(),
            harness.trainer.clone(),
            providers as Arc<dyn DescriptorProvider>,
            harness.audit.clone() as Arc<dyn AuditSink>,
        );

        let cancel = CancelSignal::new();
        cancel.cancel();
        assert!(matches!(
            scheduler.run_cycle(&cancel).await.unwrap_err(),
            ForecastError::Cancelled
        ));
    }

    // ── P1 + P2: covariance and state bound invariants ─────────────────

    proptest! {
        #[test]
        fn filter_invariants_hold_for_any_observation_sequence(
            quantities in proptest::collection::vec(0.0f64..20.0, 1..40)
        ) {
            let desc = descriptor("Pantry", 0.0, 4.0);
            let builder = FeatureBuilder::utc();
            let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

            let model = StateSpaceModel::new(ModelParameters::defaults());
            let (mut state, mut covariance) =
                StateSpaceModel::initialize(quantities[0], &[], None, desc.quantity_max);

            for (day, y) in quantities.iter().enumerate() {
                let features = builder.build(t0 + Duration::days(day as i64), &desc);
                let (predicted, cov_pred, _) = model.predict(&state, &covariance, &features);
                let update = model
                    .update("prop", &predicted, &cov_pred, *y, desc.quantity_max)
                    .unwrap();
                state = update.state;
                covariance = update.covariance;

                let asymmetry = (covariance - covariance.transpose()).abs().max();
                prop_assert!(asymmetry <= 1e-9, "asymmetry {}", asymmetry);

                let min_eigen = nalgebra::SymmetricEigen::new(covariance)
                    .eigenvalues
                    .iter()
                    .fold(f64::INFINITY, |a, b| a.min(*b));
                prop_assert!(min_eigen >= -1e-9, "min eigenvalue {}", min_eigen);

                prop_assert!(state.rate >= 0.0);
                prop_assert!(state.trend >= 0.0);
                prop_assert!(state.quantity >= 0.0);
                prop_assert!(state.quantity <= 10.0 * desc.quantity_max);
            }
        }

        // ── P3: checkpoint round-trip fidelity ─────────────────────────

        #[test]
        fn checkpoint_round_trip_preserves_every_float(
            quantity in 0.0f64..1e6,
            rate in 0.0f64..1e3,
            noise in 1e-9f64..1.0,
            diag in proptest::collection::vec(1e-6f64..10.0, 4),
        ) {
            let mut parameters = ModelParameters::defaults();
            parameters.observation_noise = noise;

            let mut covariance = StateCovariance::zeros();
            for (i, v) in diag.iter().enumerate() {
                covariance[(i, i)] = *v;
            }

            let checkpoint = ModelCheckpoint::new(
                CheckpointOwner::Item("prop".to_string()),
                parameters,
                ModelState { quantity, rate, trend: 0.0, seasonal: -rate },
                covariance,
                Utc.with_ymd_and_hms(2024, 5, 5, 5, 5, 5).unwrap(),
                FeatureBuilder::feature_names(),
            );

            let decoded =
                decode_checkpoint("prop", &encode_checkpoint(&checkpoint).unwrap()).unwrap();
            prop_assert_eq!(decoded, checkpoint);
        }
    }

    // ── P4: idempotent forecast ─────────────────────────────────────────

    #[tokio::test]
    async fn p4_consecutive_forecasts_are_identical() {
        let harness = harness(CoreConfig::default());
        let desc = descriptor("Dairy", 0.5, 4.0);
        let t0 = Utc.with_ymd_and_hms(2024, 1, 7, 12, 0, 0).unwrap();

        let quantities: Vec<f64> = (0..7).map(|day| 4.0 - 0.25 * day as f64).collect();
        ingest_series(&harness, "milk", &desc, t0, &quantities).await;

        let as_of = t0 + Duration::days(6);
        let first = harness
            .service
            .forecast_at("milk", 21, &desc, as_of)
            .await
            .unwrap();
        let second = harness
            .service
            .forecast_at("milk", 21, &desc, as_of)
            .await
            .unwrap();

        assert_eq!(first.trajectory, second.trajectory);
        assert_eq!(first.lower95, second.lower95);
        assert_eq!(first.upper95, second.upper95);
        assert_eq!(first.predicted_runout_date, second.predicted_runout_date);
        assert_eq!(first.confidence, second.confidence);

        // Idempotent per (item, horizon): one stored record, the latest
        let stored = harness.forecasts.get("milk", 21).unwrap();
        assert_eq!(stored.forecast_id, second.forecast_id);
    }

    // ── P5: monotone checkpoint versions ────────────────────────────────

    #[tokio::test]
    async fn p5_every_persist_strictly_increases_version() {
        let config = CoreConfig {
            min_persist_interval_sec: 0,
            ..CoreConfig::default()
        };
        let harness = harness(config);
        let desc = descriptor("Pantry", 0.0, 4.0);
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        let mut last_version = 0;
        for day in 0..6 {
            harness
                .service
                .ingest(
                    "rice",
                    4.0 - 0.5 * day as f64,
                    t0 + Duration::days(day),
                    ObservationSource::Sensor,
                    &desc,
                )
                .await
                .unwrap();

            let checkpoint = harness
                .models
                .load(&item_key("rice"))
                .await
                .unwrap()
                .expect("checkpoint persisted");
            assert!(
                checkpoint.version > last_version,
                "version {} did not increase past {}",
                checkpoint.version,
                last_version
            );
            last_version = checkpoint.version;
        }
    }

    // ── P6: warm-start fallback chain ───────────────────────────────────

    #[tokio::test]
    async fn p6_fallback_order_is_item_category_defaults() {
        let models = Arc::new(MemoryModelStore::new());
        let pretrainer =
            SyntheticPretrainer::new(CoreConfig::default(), FeatureBuilder::utc(), 42);
        pretrainer
            .run(models.clone(), default_categories())
            .await
            .unwrap();

        let desc = descriptor("Dairy", 0.0, 4.0);
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        // Build a per-item checkpoint, then delete it
        let first = harness_with_models(CoreConfig::default(), models.clone());
        first
            .service
            .ingest("cheese", 2.0, t0, ObservationSource::Sensor, &desc)
            .await
            .unwrap();
        first.trainer.flush_all().await.unwrap();
        models.remove(&item_key("cheese")).await.unwrap();

        // A fresh trainer falls back to the category warm-start
        let second = harness_with_models(CoreConfig::default(), models.clone());
        let snapshot = second.trainer.snapshot("cheese", &desc).await.unwrap();
        assert!(snapshot.state.rate > 0.0, "category warm-start applies");

        // Without the category checkpoint either, defaults apply
        models.remove(&category_key("Dairy")).await.unwrap();
        let third = harness_with_models(CoreConfig::default(), models);
        let snapshot = third.trainer.snapshot("cheese", &desc).await.unwrap();
        assert_relative_eq!(snapshot.state.rate, 0.0);
    }

    // ── P7: concurrent and sequential execution agree ──────────────────

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn p7_interleaved_ingest_matches_sequential_per_item_order() {
        let desc = descriptor("Pantry", 0.0, 6.0);
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let series = |n: usize| -> Vec<f64> {
            (0..10)
                .map(|day| 6.0 - (0.1 + 0.04 * (n % 5) as f64) * day as f64)
                .collect()
        };

        let sequential = harness(CoreConfig::default());
        for n in 0..100 {
            let item = format!("item-{}", n);
            ingest_series(&sequential, &item, &desc, t0, &series(n)).await;
        }
        sequential.trainer.flush_all().await.unwrap();

        let concurrent = harness(CoreConfig::default());
        let mut tasks = Vec::new();
        for n in 0..100 {
            let service = concurrent.service.clone();
            let desc = desc.clone();
            let quantities = series(n);
            tasks.push(tokio::spawn(async move {
                let item = format!("item-{}", n);
                for (day, q) in quantities.iter().enumerate() {
                    service
                        .ingest(
                            &item,
                            *q,
                            t0 + Duration::days(day as i64),
                            ObservationSource::Sensor,
                            &desc,
                        )
                        .await
                        .unwrap();
                    if day == 4 {
                        // Interleave reads with writes across items
                        let _ = service
                            .forecast_at(&item, 7, &desc, t0 + Duration::days(day as i64))
                            .await
                            .unwrap();
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        concurrent.trainer.flush_all().await.unwrap();

        for n in 0..100 {
            let item = format!("item-{}", n);
            let a = sequential
                .models
                .load(&item_key(&item))
                .await
                .unwrap()
                .expect("sequential checkpoint");
            let b = concurrent
                .models
                .load(&item_key(&item))
                .await
                .unwrap()
                .expect("concurrent checkpoint");

            assert_eq!(a.version, b.version, "{} version", item);
            assert_relative_eq!(a.state.quantity, b.state.quantity, max_relative = 1e-9);
            assert_relative_eq!(a.state.rate, b.state.rate, max_relative = 1e-9);
            let cov_gap = (a.covariance - b.covariance).abs().max();
            assert!(cov_gap <= 1e-9, "{} covariance gap {}", item, cov_gap);
        }
    }

    // ── P8: cancellation leaves stores consistent ───────────────────────

    #[tokio::test]
    async fn p8_cancelled_batch_forecast_writes_nothing() {
        let harness = harness(CoreConfig::default());
        let desc = descriptor("Pantry", 0.0, 4.0);
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        let items: Vec<(String, ItemDescriptor)> = (0..5)
            .map(|n| (format!("item-{}", n), desc.clone()))
            .collect();
        for (item, _) in &items {
            ingest_series(&harness, item, &desc, t0, &[4.0, 3.5, 3.0]).await;
        }

        let cancel = CancelSignal::new();
        cancel.cancel();
        assert!(matches!(
            harness
                .service
                .batch_forecast(&items, 14, &cancel)
                .await
                .unwrap_err(),
            ForecastError::Cancelled
        ));
        for (item, _) in &items {
            assert!(harness.forecasts.get_latest(item).await.unwrap().is_none());
        }

        // The same batch completes when left alone
        let forecasts = harness
            .service
            .batch_forecast(&items, 14, &CancelSignal::new())
            .await
            .unwrap();
        assert_eq!(forecasts.len(), items.len());
        for (item, _) in &items {
            assert!(harness.forecasts.get_latest(item).await.unwrap().is_some());
        }
    }

    // ── Facade edges ────────────────────────────────────────────────────

    #[tokio::test]
    async fn horizon_beyond_maximum_is_rejected() {
        let harness = harness(CoreConfig::default());
        let desc = descriptor("Pantry", 0.0, 4.0);

        let err = harness
            .service
            .forecast("rice", 91, &desc)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ForecastError::HorizonExceeded { requested: 91, max: 90 }
        ));
    }

    #[tokio::test]
    async fn invalid_observations_leave_state_untouched() {
        let harness = harness(CoreConfig::default());
        let desc = descriptor("Pantry", 0.0, 4.0);
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        ingest_series(&harness, "rice", &desc, t0, &[4.0, 3.5]).await;
        let before = harness.trainer.snapshot("rice", &desc).await.unwrap();

        for bad in [-1.0, f64::NAN, f64::INFINITY] {
            let err = harness
                .service
                .ingest("rice", bad, t0 + Duration::days(2), ObservationSource::Manual, &desc)
                .await
                .unwrap_err();
            assert!(matches!(err, ForecastError::InvalidObservation { .. }));
        }

        let after = harness.trainer.snapshot("rice", &desc).await.unwrap();
        assert_eq!(before.state, after.state);
        assert_eq!(before.stats.observations_seen, after.stats.observations_seen);
        assert_eq!(harness.audit.count(AuditAction::ObservationRejected), 3);
    }

    #[tokio::test]
    async fn low_stock_filters_by_window_and_confidence() {
        let harness = harness(CoreConfig::default());
        let t0 = Utc.with_ymd_and_hms(2024, 1, 7, 12, 0, 0).unwrap();
        let as_of = t0 + Duration::days(13);

        // Draining item: runs out within days
        let draining = descriptor("Dairy", 0.5, 4.0);
        let quantities: Vec<f64> = (0..14).map(|day| 4.0 - 0.25 * day as f64).collect();
        ingest_series(&harness, "milk", &draining, t0, &quantities).await;
        harness
            .service
            .forecast_at("milk", 30, &draining, as_of)
            .await
            .unwrap();

        // Stable item: no predicted runout
        let stable = descriptor("Pantry", 0.0, 4.0);
        ingest_series(&harness, "salt", &stable, t0, &[4.0, 4.0, 4.0, 4.0]).await;
        harness
            .service
            .forecast_at("salt", 30, &stable, as_of)
            .await
            .unwrap();

        let flagged = harness.service.low_stock_at(7, as_of).await.unwrap();
        assert_eq!(flagged, vec!["milk".to_string()]);

        // Closing the loop for accuracy measurement
        let actual = as_of + Duration::days(2);
        harness
            .service
            .record_actual_runout("milk", actual)
            .await
            .unwrap();
        let stored = harness.forecasts.get_latest("milk").await.unwrap().unwrap();
        assert_eq!(stored.actual_runout_date, Some(actual));
    }

    #[tokio::test]
    async fn record_actual_runout_requires_a_forecast() {
        let harness = harness(CoreConfig::default());
        let err = harness
            .service
            .record_actual_runout("ghost", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, ForecastError::UnknownItem { .. }));
    }

    #[tokio::test]
    async fn numerical_fault_rewinds_and_schedules_retrain() {
        let harness = harness(CoreConfig::default());
        let desc = descriptor("Pantry", 0.0, 4.0);
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        ingest_series(&harness, "rice", &desc, t0, &[4.0, 3.5, 3.0]).await;

        // Poison the in-memory parameters so the next update goes non-finite
        harness
            .trainer
            .with_entry("rice", &desc, |entry| {
                entry.model.parameters_mut().transition[(0, 0)] = f64::NAN;
            })
            .await
            .unwrap();

        let err = harness
            .service
            .ingest("rice", 2.5, t0 + Duration::days(3), ObservationSource::Sensor, &desc)
            .await
            .unwrap_err();
        assert!(matches!(err, ForecastError::NumericalFault { .. }));

        // The entry was rewound to the persisted checkpoint and flagged
        let healthy = harness
            .trainer
            .with_entry("rice", &desc, |entry| {
                (
                    entry.model.parameters().transition[(0, 0)].is_finite(),
                    entry.retrain_due,
                )
            })
            .await
            .unwrap();
        assert!(healthy.0);
        assert!(healthy.1);
    }
}
