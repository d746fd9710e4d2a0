//! Random-effects predictions and profile likelihoods.

use crate::data::ObservationSet;
use crate::estimate::{self, EstimationError, FitOptions};
use crate::likelihood::Evaluation;
use crate::model::MixedLmResults;
use crate::params::{MixedLmParams, psd_cholesky};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Conditional mean and covariance of one group's random effects, in the
/// column order of that group's combined random design.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRandomEffects {
    pub group: String,
    pub mean: Array1<f64>,
    pub cov: Array2<f64>,
}

/// BLUPs `G Zᵀ V⁻¹ r` and conditional covariances `scale (G - G Zᵀ V⁻¹ Z G)`.
pub fn random_effects(evaluation: &Evaluation) -> Vec<GroupRandomEffects> {
    let scale = evaluation.scale();
    evaluation
        .group_terms()
        .iter()
        .map(|group| {
            let gm = group.g.dot(&group.m);
            GroupRandomEffects {
                group: group.label.clone(),
                mean: group.g.dot(&group.u),
                cov: (&group.g - &gm.dot(&group.g)) * scale,
            }
        })
        .collect()
}

/// Grid for `profile_re`, in scaled variance units around the estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileOptions {
    pub num_low: usize,
    pub dist_low: f64,
    pub num_high: usize,
    pub dist_high: f64,
    pub gtol: f64,
    pub max_iter: usize,
}

impl Default for ProfileOptions {
    fn default() -> Self {
        Self {
            num_low: 5,
            dist_low: 1.0,
            num_high: 5,
            dist_high: 1.0,
            gtol: 1e-6,
            max_iter: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfilePoint {
    /// Scaled variance of the profiled random effect.
    pub variance: f64,
    pub llf: f64,
}

fn steps(from: f64, to: f64, n: usize) -> impl Iterator<Item = f64> {
    (0..=n).map(move |i| {
        if n == 0 {
            to
        } else {
            from + (to - from) * i as f64 / n as f64
        }
    })
}

/// Profile log-likelihood for the variance of random effect `re_ix`.
///
/// The variance is held at each grid value while every other free parameter
/// is refitted. The grid runs `num_low` steps from `variance - dist_low` up to
/// the estimate, then `num_high` steps up to `variance + dist_high`.
pub fn profile_re(
    data: &ObservationSet,
    results: &MixedLmResults,
    re_ix: usize,
    options: &ProfileOptions,
) -> Result<Vec<ProfilePoint>, EstimationError> {
    let k_re = data.k_re();
    if re_ix >= k_re {
        return Err(EstimationError::DimensionMismatch {
            context: "index of the profiled random effect".to_string(),
            expected: k_re.saturating_sub(1),
            found: re_ix,
        });
    }

    // Move the profiled effect to the first column so its variance is the
    // leading entry of both cov_re and its factor.
    let mut order = vec![re_ix];
    order.extend((0..k_re).filter(|&j| j != re_ix));
    let permuted = data.permute_re(&order)?;
    let params = results.params();
    let cov = Array2::from_shape_fn((k_re, k_re), |(i, j)| params.cov_re[[order[i], order[j]]]);
    let mut free = match results.free() {
        Some(free) => MixedLmParams::new(
            free.fe_params.clone(),
            Array2::from_shape_fn((k_re, k_re), |(i, j)| free.cov_re[[order[i], order[j]]]),
            free.vcomp.clone(),
        ),
        None => MixedLmParams::new(
            Array1::ones(data.k_fe()),
            Array2::ones((k_re, k_re)),
            Array1::ones(data.k_vc()),
        ),
    };
    free.cov_re[[0, 0]] = 0.0;

    let scale = results.scale();
    let estimate = cov[[0, 0]];
    let low = estimate - options.dist_low / scale;
    if !(low > 0.0) {
        return Err(EstimationError::InvalidProfileRange { low });
    }
    let high = estimate + options.dist_high / scale;
    let grid: Vec<f64> = steps(low, estimate, options.num_low)
        .chain(steps(estimate, high, options.num_high).skip(1))
        .collect();
    log::info!(
        "Profiling random effect {re_ix} over {} values in [{:.4e}, {:.4e}] (scaled).",
        grid.len(),
        low * scale,
        high * scale
    );

    let factor = psd_cholesky(&cov)?;
    let mut out = Vec::with_capacity(grid.len());
    for value in grid {
        let mut start_factor = factor.clone();
        start_factor[[0, 0]] = value.sqrt();
        let start = MixedLmParams::new(
            params.fe_params.clone(),
            start_factor.dot(&start_factor.t()),
            params.vcomp.clone(),
        );
        let fit_options = FitOptions {
            reml: results.reml(),
            gtol: options.gtol,
            max_iter: options.max_iter,
            free: Some(free.clone()),
            start_params: Some(start),
            cov_penalty: results.cov_penalty().cloned(),
            fe_penalty: results.fe_penalty().cloned(),
            ..FitOptions::default()
        };
        let refit = estimate::fit(&permuted, results.use_sqrt(), &fit_options)?;
        out.push(ProfilePoint {
            variance: value * refit.scale(),
            llf: refit.llf(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::likelihood::{Criterion, evaluate};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn grid_steps_include_both_ends() {
        let v: Vec<f64> = steps(1.0, 2.0, 4).collect();
        assert_eq!(v, vec![1.0, 1.25, 1.5, 1.75, 2.0]);
        assert_eq!(steps(1.0, 2.0, 0).collect::<Vec<_>>(), vec![2.0]);
    }

    #[test]
    fn blups_shrink_group_means_toward_zero() {
        let endog = array![1.0, 1.2, 0.8, -1.0, -0.9, -1.1];
        let exog = Array2::zeros((6, 0));
        let data = ObservationSet::builder(endog, exog, &["a", "a", "a", "b", "b", "b"])
            .build()
            .unwrap();
        let params = MixedLmParams::new(Array1::zeros(0), array![[2.0]], Array1::zeros(0));
        let eval = evaluate(&data, &Criterion::new(false), &params, false).unwrap();
        let effects = random_effects(&eval);

        // Random intercept: mean = m γ ȳ / (1 + m γ), cov = scale γ / (1 + m γ).
        let shrink = 3.0 * 2.0 / (1.0 + 3.0 * 2.0);
        assert_abs_diff_eq!(effects[0].mean[0], shrink * 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(effects[1].mean[0], shrink * -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(
            effects[0].cov[[0, 0]],
            eval.scale() * 2.0 / 7.0,
            epsilon = 1e-12
        );
    }
}
