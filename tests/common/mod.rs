//! Seeded synthetic data shared by the integration tests.

use mixedlm::{ObservationSet, VarianceComponentDesign};
use ndarray::{Array1, Array2, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// Response, designs and labels for one simulated model.
pub struct Simulated {
    pub endog: Array1<f64>,
    pub exog: Array2<f64>,
    pub exog_re: Array2<f64>,
    pub groups: Vec<usize>,
}

impl Simulated {
    pub fn with_exog_re(&self) -> ObservationSet {
        ObservationSet::builder(self.endog.clone(), self.exog.clone(), &self.groups)
            .exog_re(self.exog_re.clone())
            .build()
            .unwrap()
    }

    /// One variance component per column of `exog_re`, named `a`, `b`, ...
    pub fn as_variance_components(&self) -> ObservationSet {
        let names = ["a", "b", "c", "d"];
        let mut builder =
            ObservationSet::builder(self.endog.clone(), self.exog.clone(), &self.groups);
        for (j, name) in names.iter().take(self.exog_re.ncols()).enumerate() {
            builder = builder.variance_component(*name, self.column_blocks(j));
        }
        builder.build().unwrap()
    }

    /// Per-group single-column blocks of column `j` of `exog_re`.
    pub fn column_blocks(&self, j: usize) -> VarianceComponentDesign {
        let mut rows_of: Vec<(usize, Vec<usize>)> = Vec::new();
        for (row, &g) in self.groups.iter().enumerate() {
            match rows_of.iter_mut().find(|(label, _)| *label == g) {
                Some((_, rows)) => rows.push(row),
                None => rows_of.push((g, vec![row])),
            }
        }
        rows_of
            .into_iter()
            .map(|(g, rows)| {
                let block =
                    Array2::from_shape_fn((rows.len(), 1), |(i, _)| self.exog_re[[rows[i], j]]);
                (g.to_string(), block)
            })
            .collect()
    }
}

/// Random intercepts and slopes: `n_groups` groups of `group_size`, an
/// intercept plus `k_fe - 1` standard normal covariates, and `k_re` random
/// effects on the leading columns of the design.
pub fn random_slopes(
    seed: u64,
    n_groups: usize,
    group_size: usize,
    k_fe: usize,
    k_re: usize,
) -> Simulated {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let n = n_groups * group_size;

    let mut exog = Array2::ones((n, k_fe));
    for v in exog.slice_mut(s![.., 1..]).iter_mut() {
        *v = normal.sample(&mut rng);
    }
    let mut exog_re = Array2::ones((n, k_re));
    for v in exog_re.slice_mut(s![.., 1..]).iter_mut() {
        *v = normal.sample(&mut rng);
    }
    let beta = Array1::from_shape_fn(k_fe, |j| 1.0 - 0.5 * j as f64);

    let mut endog = exog.dot(&beta);
    let mut groups = Vec::with_capacity(n);
    for g in 0..n_groups {
        let effects: Vec<f64> = (0..k_re)
            .map(|j| normal.sample(&mut rng) / (1.0 + j as f64))
            .collect();
        for i in 0..group_size {
            let row = g * group_size + i;
            for (j, effect) in effects.iter().enumerate() {
                endog[row] += exog_re[[row, j]] * effect;
            }
            endog[row] += normal.sample(&mut rng);
            groups.push(g);
        }
    }

    Simulated {
        endog,
        exog,
        exog_re,
        groups,
    }
}

/// Balanced one-way layout `y = mu + b_g + e` with an intercept-only mean.
pub fn one_way(seed: u64, n_groups: usize, group_size: usize, sd_group: f64) -> Simulated {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let n = n_groups * group_size;
    let mu = 2.0 + rng.r#gen::<f64>();

    let mut endog = Array1::zeros(n);
    let mut groups = Vec::with_capacity(n);
    for g in 0..n_groups {
        let effect = sd_group * normal.sample(&mut rng);
        for i in 0..group_size {
            endog[g * group_size + i] = mu + effect + normal.sample(&mut rng);
            groups.push(g);
        }
    }

    Simulated {
        endog,
        exog: Array2::ones((n, 1)),
        exog_re: Array2::ones((n, 1)),
        groups,
    }
}

/// Random intercept and slope on one standard normal covariate, drawn with
/// covariance `[[1.0, 0.4], [0.4, 0.5]]`. Fixed effects are `[1.0, -0.5]`.
pub fn correlated_slopes(seed: u64, n_groups: usize, group_size: usize) -> Simulated {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let n = n_groups * group_size;
    let slope_sd = (0.5f64 - 0.4 * 0.4).sqrt();

    let mut exog = Array2::ones((n, 2));
    for v in exog.column_mut(1).iter_mut() {
        *v = normal.sample(&mut rng);
    }
    let mut endog = exog.dot(&Array1::from(vec![1.0, -0.5]));
    let mut groups = Vec::with_capacity(n);
    for g in 0..n_groups {
        let z0: f64 = normal.sample(&mut rng);
        let z1: f64 = normal.sample(&mut rng);
        let (intercept, slope) = (z0, 0.4 * z0 + slope_sd * z1);
        for i in 0..group_size {
            let row = g * group_size + i;
            endog[row] += intercept + slope * exog[[row, 1]] + normal.sample(&mut rng);
            groups.push(g);
        }
    }

    Simulated {
        endog,
        exog_re: exog.clone(),
        exog,
        groups,
    }
}
