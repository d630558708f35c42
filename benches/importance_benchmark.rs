use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::Array2;
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sfpdesign::bayes::bayes_estimate_weighted_batch;
use sfpdesign::loss::{LossSpec, build_loss_matrix};
use sfpdesign::score::{RiskSpec, ScoreSpec};

/// Rate vectors hold 3 test nodes and 2 supply nodes.
const NUM_NODES: usize = 5;
const NUM_SCENARIOS: usize = 100;

fn random_draws(num_draws: usize) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(0x5EED + num_draws as u64);
    Array2::from_shape_fn((num_draws, NUM_NODES), |_| rng.sample(Standard))
}

fn random_weights(num_draws: usize) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(0xBEEF + num_draws as u64);
    let mut weights = Array2::from_shape_fn((num_draws, NUM_SCENARIOS), |_| {
        rng.gen_range(0.01..1.0)
    });
    for mut column in weights.columns_mut() {
        let scale = num_draws as f64 / column.sum();
        column.mapv_inplace(|w| w * scale);
    }
    weights
}

fn benchmark_loss_matrix(c: &mut Criterion) {
    let spec = LossSpec::new(
        ScoreSpec::AbsDiff { under_est_wt: 1.0 },
        RiskSpec::Parabolic { threshold: 0.1 },
    )
    .unwrap();

    let mut group = c.benchmark_group("loss_matrix");
    group.sample_size(10);
    for num_draws in [250_usize, 500, 1000] {
        let draws = random_draws(num_draws);
        group.throughput(Throughput::Elements((num_draws * num_draws) as u64));
        group.bench_with_input(BenchmarkId::new("build", num_draws), &draws, |b, input| {
            b.iter(|| {
                let matrix = build_loss_matrix(black_box(input.view()), &spec, None).unwrap();
                black_box(matrix);
            });
        });
    }
    group.finish();
}

fn benchmark_weighted_estimates(c: &mut Criterion) {
    let score = ScoreSpec::AbsDiff { under_est_wt: 1.0 };

    let mut group = c.benchmark_group("weighted_bayes_estimate");
    for num_draws in [1000_usize, 4000, 16000] {
        let draws = random_draws(num_draws);
        let weights = random_weights(num_draws);
        group.throughput(Throughput::Elements((num_draws * NUM_SCENARIOS) as u64));
        group.bench_with_input(
            BenchmarkId::new("batch", num_draws),
            &(draws, weights),
            |b, (draws, weights)| {
                b.iter(|| {
                    let estimates = bayes_estimate_weighted_batch(
                        black_box(draws.view()),
                        black_box(weights.view()),
                        &score,
                    )
                    .unwrap();
                    black_box(estimates);
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    importance_benchmark,
    benchmark_loss_matrix,
    benchmark_weighted_estimates
);
criterion_main!(importance_benchmark);
