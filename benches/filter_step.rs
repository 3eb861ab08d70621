use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use pantry_forecast::prelude::*;

fn filter_step(c: &mut Criterion) {
    let model = StateSpaceModel::new(ModelParameters::defaults());
    let builder = FeatureBuilder::utc();
    let descriptor = ItemDescriptor {
        category: "Dairy".to_string(),
        perishable: true,
        household_size: 3,
        expiry_date: None,
        quantity_min: 0.5,
        quantity_max: 4.0,
    };
    let ts = Utc.with_ymd_and_hms(2024, 1, 6, 12, 0, 0).unwrap();
    let features = builder.build(ts, &descriptor);
    let (state, covariance) = StateSpaceModel::initialize(4.0, &[], None, 4.0);

    c.bench_function("predict_update", |b| {
        b.iter(|| {
            let (predicted, cov_pred, _) =
                model.predict(black_box(&state), black_box(&covariance), &features);
            model
                .update("bench", &predicted, &cov_pred, black_box(3.75), 4.0)
                .unwrap()
        })
    });

    c.bench_function("build_features", |b| {
        b.iter(|| builder.build(black_box(ts), &descriptor))
    });
}

criterion_group!(benches, filter_step);
criterion_main!(benches);
