// Measures one likelihood evaluation and its score as the number of groups
// grows, for a random intercept and slope model.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use mixedlm::likelihood::{self, Criterion as Objective};
use mixedlm::{MixedLmParams, ObservationSet, ParamLayout};
use ndarray::{Array1, Array2, array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// Observations per simulated group.
const GROUP_SIZE: usize = 10;
/// Group counts benchmarked.
const GROUP_COUNTS: [usize; 4] = [10, 50, 200, 1000];

fn simulate(n_groups: usize) -> ObservationSet {
    let mut rng = StdRng::seed_from_u64(4021);
    let noise = Normal::new(0.0, 1.0).unwrap();
    let n = n_groups * GROUP_SIZE;
    let mut exog = Array2::ones((n, 2));
    let mut exog_re = Array2::ones((n, 2));
    let mut endog = Array1::zeros(n);
    let mut groups = Vec::with_capacity(n);
    for g in 0..n_groups {
        let intercept = noise.sample(&mut rng);
        let slope = 0.5 * noise.sample(&mut rng);
        for i in 0..GROUP_SIZE {
            let row = g * GROUP_SIZE + i;
            let x: f64 = rng.r#gen::<f64>() * 2.0 - 1.0;
            exog[[row, 1]] = x;
            exog_re[[row, 1]] = x;
            endog[row] = 1.0 + 2.0 * x + intercept + slope * x + noise.sample(&mut rng);
            groups.push(g);
        }
    }
    ObservationSet::builder(endog, exog, &groups)
        .exog_re(exog_re)
        .build()
        .unwrap()
}

fn bench_likelihood(c: &mut Criterion) {
    let params = MixedLmParams::new(
        array![1.0, 2.0],
        array![[1.0, 0.2], [0.2, 0.25]],
        Array1::zeros(0),
    );
    let criterion = Objective::new(true);
    let layout = ParamLayout::new(2, 2, 0, true, false);

    let mut group = c.benchmark_group("likelihood");
    for &n_groups in &GROUP_COUNTS {
        let data = simulate(n_groups);
        group.throughput(Throughput::Elements((n_groups * GROUP_SIZE) as u64));
        group.bench_with_input(BenchmarkId::new("loglike", n_groups), &data, |b, data| {
            b.iter(|| {
                let eval =
                    likelihood::evaluate(black_box(data), &criterion, &params, true).unwrap();
                black_box(eval.loglike())
            })
        });
        group.bench_with_input(BenchmarkId::new("score", n_groups), &data, |b, data| {
            b.iter(|| {
                let eval =
                    likelihood::evaluate(black_box(data), &criterion, &params, true).unwrap();
                black_box(eval.score(&layout).unwrap())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_likelihood);
criterion_main!(benches);
