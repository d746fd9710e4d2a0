//! Starting values for the optimizer.

use crate::data::ObservationSet;
use crate::estimate::EstimationError;
use crate::params::MixedLmParams;
use ndarray::{Array1, Array2};
use ndarray_linalg::Solve;

/// Ordinary least squares fit of the fixed effects, ignoring the grouping.
pub fn ols(data: &ObservationSet) -> Result<Array1<f64>, EstimationError> {
    if data.k_fe() == 0 {
        return Ok(Array1::zeros(0));
    }
    let x = data.exog();
    let xtx = x.t().dot(&x);
    let xty = x.t().dot(&data.endog());
    xtx.solve(&xty)
        .map_err(EstimationError::LinearSystemSolveFailed)
}

/// OLS fixed effects, identity `cov_re`, unit variance components.
///
/// Unit variance components rather than zero: with the square-root
/// parametrization a zero root is a stationary point of the likelihood.
pub fn default_start(data: &ObservationSet) -> Result<MixedLmParams, EstimationError> {
    Ok(MixedLmParams::new(
        ols(data)?,
        Array2::eye(data.k_re()),
        Array1::ones(data.k_vc()),
    ))
}

/// The default start and rescaled variants of its covariance. Used to retry
/// a fit whose first start could not be evaluated.
pub fn start_candidates(data: &ObservationSet) -> Result<Vec<MixedLmParams>, EstimationError> {
    let base = default_start(data)?;
    Ok([1.0_f64, 0.1, 10.0]
        .iter()
        .map(|&factor| {
            MixedLmParams::new(
                base.fe_params.clone(),
                &base.cov_re * factor,
                &base.vcomp * factor,
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn ols_recovers_an_exact_line() {
        let exog = array![[1.0, 0.0], [1.0, 1.0], [1.0, 2.0], [1.0, 3.0]];
        let endog = exog.dot(&array![2.0, -0.5]);
        let data = ObservationSet::builder(endog, exog, &[0, 0, 1, 1])
            .build()
            .unwrap();
        assert_abs_diff_eq!(ols(&data).unwrap(), array![2.0, -0.5], epsilon = 1e-10);

        let start = default_start(&data).unwrap();
        assert_eq!(start.cov_re, Array2::<f64>::eye(1));
        assert_eq!(start_candidates(&data).unwrap().len(), 3);
    }
}
