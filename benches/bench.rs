use casapipe::{
    clean::{robust_rms, IterationStats, Mask},
    consolidate, ShardFailure, ShardReturn,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::Array2;
use serde_json::{json, Value};

const NUM_SHARDS: usize = 64;
const IMAGE_SIZE: usize = 512;

fn summary(shard: usize) -> Value {
    let spws: serde_json::Map<String, Value> = (0..16)
        .map(|spw| {
            (
                spw.to_string(),
                json!({"flagged": shard * spw, "total": 1_000_000}),
            )
        })
        .collect();
    json!({
        "flagged": shard * 1000,
        "total": 16_000_000,
        "spw": spws,
        "field": {"NGC253": {"flagged": shard, "total": 8_000_000}},
    })
}

fn bench_consolidate_summaries(crt: &mut Criterion) {
    let shards: Vec<String> = (0..NUM_SHARDS)
        .map(|i| format!("/data/ds1.mms/SUBMSS/ds1.mms.{i:04}"))
        .collect();
    let results: Vec<Result<ShardReturn, ShardFailure>> = (0..NUM_SHARDS)
        .map(|i| Ok(ShardReturn::from(summary(i))))
        .collect();
    crt.bench_function(&format!("consolidate - {NUM_SHARDS} flag summaries"), |bch| {
        bch.iter(|| consolidate(black_box(results.clone()), black_box(&shards)))
    });
}

fn bench_consolidate_flags(crt: &mut Criterion) {
    let shards: Vec<String> = (0..NUM_SHARDS).map(|i| format!("shard{i}")).collect();
    let results: Vec<Result<ShardReturn, ShardFailure>> = (0..NUM_SHARDS)
        .map(|i| {
            if i % 7 == 0 {
                Err(ShardFailure {
                    shard: shards[i].clone(),
                    cause: "engine failed".into(),
                })
            } else {
                Ok(ShardReturn::Bool(true))
            }
        })
        .collect();
    crt.bench_function(&format!("consolidate - {NUM_SHARDS} flags"), |bch| {
        bch.iter(|| consolidate(black_box(results.clone()), black_box(&shards)))
    });
}

fn residual() -> Array2<f32> {
    let mut residual = Array2::from_shape_fn((IMAGE_SIZE, IMAGE_SIZE), |(y, x)| {
        (((x * 7919 + y * 104_729) % 1000) as f32 / 500.0) - 1.0
    });
    residual[[IMAGE_SIZE / 2, IMAGE_SIZE / 2]] = 100.0;
    residual
}

fn bench_robust_rms(crt: &mut Criterion) {
    let values: Vec<f64> = residual().iter().map(|&v| v as f64).collect();
    crt.bench_function(&format!("robust_rms - {IMAGE_SIZE}x{IMAGE_SIZE}"), |bch| {
        bch.iter(|| robust_rms(black_box(&values)))
    });
}

fn bench_iteration_stats(crt: &mut Criterion) {
    let residual = residual();
    let model = Array2::<f32>::zeros((IMAGE_SIZE, IMAGE_SIZE));
    let mask = Mask::central_quarter((IMAGE_SIZE, IMAGE_SIZE));
    crt.bench_function(
        &format!("iteration stats - masked {IMAGE_SIZE}x{IMAGE_SIZE}"),
        |bch| {
            bch.iter(|| {
                IterationStats::compute(
                    1,
                    0.1,
                    "bench.iter1.residual",
                    black_box(model.view()),
                    black_box(residual.view()),
                    Some(&mask),
                )
            })
        },
    );
}

criterion_group!(
    name = benches;
    config = Criterion::default().sample_size(20);
    targets =
        bench_consolidate_summaries,
        bench_consolidate_flags,
        bench_robust_rms,
        bench_iteration_stats,
);
criterion_main!(benches);
