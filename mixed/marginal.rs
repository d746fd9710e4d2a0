//! Per-group marginal covariance `V = I + Z G Zᵀ`.
//!
//! With `G = Λ Λᵀ` the low-rank path factors the small matrix
//! `C = I + Λᵀ Zᵀ Z Λ` instead of `V`:
//!
//! - `log|V| = log|C|`
//! - `V⁻¹ a = a - Z Λ C⁻¹ Λᵀ Zᵀ a`
//!
//! `C` is positive definite whenever `G` is positive semi-definite, so a
//! singular `G` (a variance on the boundary) stays on the cheap path. Groups
//! with no more rows than random-effects columns factor `V` directly, and so
//! does any group whose low-rank result is numerically unusable. Callers
//! only pass PSD `G`; `likelihood::evaluate` rejects anything else first.

use crate::diagnostics::{self, DiagnosticCategory, SINGULAR_FALLBACK_COUNT};
use crate::estimate::EstimationError;
use crate::params::psd_cholesky;
use ndarray::{Array1, Array2, ArrayView2, s};
use ndarray_linalg::{Cholesky, Inverse, UPLO};

/// Assembles `blockdiag(psi, vc_0 I_{q_0}, vc_1 I_{q_1}, ...)`.
///
/// Used both for the covariance itself and for expanding derivative
/// directions into the random-effects space of one group.
pub fn block_diagonal(psi: &Array2<f64>, vc: &Array1<f64>, vc_sizes: &[usize]) -> Array2<f64> {
    let k_re = psi.nrows();
    let q = k_re + vc_sizes.iter().sum::<usize>();
    let mut g = Array2::<f64>::zeros((q, q));
    g.slice_mut(s![..k_re, ..k_re]).assign(psi);
    let mut offset = k_re;
    for (j, &size) in vc_sizes.iter().enumerate() {
        for t in offset..offset + size {
            g[[t, t]] = vc[j];
        }
        offset += size;
    }
    g
}

enum Strategy {
    Identity,
    LowRank { z_lambda: Array2<f64>, c_inv: Array2<f64> },
    Dense { v_inv: Array2<f64> },
}

/// Solves against the marginal covariance of one group.
pub struct GroupSolver {
    strategy: Strategy,
    log_det: f64,
}

impl GroupSolver {
    pub fn new(
        label: &str,
        design: ArrayView2<'_, f64>,
        g: &Array2<f64>,
    ) -> Result<Self, EstimationError> {
        let n = design.nrows();
        let q = design.ncols();
        if q == 0 {
            return Ok(Self {
                strategy: Strategy::Identity,
                log_det: 0.0,
            });
        }

        if q < n {
            match Self::low_rank(design, g) {
                Some(solver) => return Ok(solver),
                None => {
                    let (emit, count) = diagnostics::should_emit(&SINGULAR_FALLBACK_COUNT);
                    if emit {
                        diagnostics::warn(
                            DiagnosticCategory::SingularFallback,
                            &format!(
                                "Group '{label}': low-rank covariance solve failed; using a dense factorisation (occurrence {count})."
                            ),
                        );
                    }
                }
            }
        }
        Self::dense(label, design, g)
    }

    fn low_rank(design: ArrayView2<'_, f64>, g: &Array2<f64>) -> Option<Self> {
        let lambda = psd_cholesky(g).ok()?;
        let z_lambda = design.dot(&lambda);
        let q = lambda.ncols();
        let c = Array2::<f64>::eye(q) + z_lambda.t().dot(&z_lambda);
        let factor = c.cholesky(UPLO::Lower).ok()?;
        let log_det = 2.0 * factor.diag().iter().map(|d| d.ln()).sum::<f64>();
        let c_inv = c.inv().ok()?;
        if !log_det.is_finite() || c_inv.iter().any(|v| !v.is_finite()) {
            return None;
        }
        Some(Self {
            strategy: Strategy::LowRank { z_lambda, c_inv },
            log_det,
        })
    }

    fn dense(
        label: &str,
        design: ArrayView2<'_, f64>,
        g: &Array2<f64>,
    ) -> Result<Self, EstimationError> {
        let n = design.nrows();
        let v = Array2::<f64>::eye(n) + design.dot(g).dot(&design.t());
        let singular = || EstimationError::SingularCovariance {
            group: label.to_string(),
        };
        let factor = v.cholesky(UPLO::Lower).map_err(|_| singular())?;
        let log_det = 2.0 * factor.diag().iter().map(|d| d.ln()).sum::<f64>();
        let v_inv = v.inv().map_err(|_| singular())?;
        if !log_det.is_finite() || v_inv.iter().any(|x| !x.is_finite()) {
            return Err(singular());
        }
        Ok(Self {
            strategy: Strategy::Dense { v_inv },
            log_det,
        })
    }

    pub fn log_det(&self) -> f64 {
        self.log_det
    }

    pub fn used_fallback(&self) -> bool {
        matches!(self.strategy, Strategy::Dense { .. })
    }

    /// `V⁻¹ a` for every column of `a`.
    pub fn solve(&self, a: &Array2<f64>) -> Array2<f64> {
        match &self.strategy {
            Strategy::Identity => a.clone(),
            Strategy::LowRank { z_lambda, c_inv } => {
                a - &z_lambda.dot(&c_inv.dot(&z_lambda.t().dot(a)))
            }
            Strategy::Dense { v_inv } => v_inv.dot(a),
        }
    }

    /// `V⁻¹ a`.
    pub fn solve_vec(&self, a: &Array1<f64>) -> Array1<f64> {
        match &self.strategy {
            Strategy::Identity => a.clone(),
            Strategy::LowRank { z_lambda, c_inv } => {
                a - &z_lambda.dot(&c_inv.dot(&z_lambda.t().dot(a)))
            }
            Strategy::Dense { v_inv } => v_inv.dot(a),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use ndarray_linalg::Determinant;

    fn dense_reference(z: &Array2<f64>, g: &Array2<f64>) -> (f64, Array2<f64>) {
        let v = Array2::<f64>::eye(z.nrows()) + z.dot(g).dot(&z.t());
        let (_, ln_det) = v.sln_det().unwrap();
        (ln_det, v.inv().unwrap())
    }

    #[test]
    fn low_rank_and_dense_paths_agree() {
        let z = array![[1.0, 0.3], [1.0, -1.2], [1.0, 0.8], [1.0, 2.0], [1.0, -0.1]];
        let g = block_diagonal(&array![[0.9, 0.2], [0.2, 0.4]], &Array1::zeros(0), &[]);
        let solver = GroupSolver::new("g", z.view(), &g).unwrap();
        assert!(!solver.used_fallback());

        let (ln_det, v_inv) = dense_reference(&z, &g);
        assert_abs_diff_eq!(solver.log_det(), ln_det, epsilon = 1e-10);
        let rhs = array![[1.0, 0.0], [2.0, 1.0], [-1.0, 0.5], [0.0, 3.0], [0.5, -2.0]];
        assert_abs_diff_eq!(solver.solve(&rhs), v_inv.dot(&rhs), epsilon = 1e-10);
    }

    #[test]
    fn singular_covariance_stays_on_the_low_rank_path() {
        let z = array![[1.0, 0.0, 1.0], [1.0, 1.0, 0.0], [1.0, 2.0, 1.0], [1.0, 3.0, 0.0]];
        let g = block_diagonal(&array![[1.0, 1.0], [1.0, 1.0]], &array![0.0], &[1]);
        let solver = GroupSolver::new("g", z.view(), &g).unwrap();
        assert!(!solver.used_fallback());
        let (ln_det, v_inv) = dense_reference(&z, &g);
        assert_abs_diff_eq!(solver.log_det(), ln_det, epsilon = 1e-10);
        let rhs = array![1.0, -1.0, 0.5, 2.0];
        assert_abs_diff_eq!(solver.solve_vec(&rhs), v_inv.dot(&rhs), epsilon = 1e-10);
    }

    #[test]
    fn small_groups_factor_the_marginal_covariance_directly() {
        // Three random-effects columns on two rows: Z Zᵀ is rank deficient.
        let z = array![[1.0, 0.5, 0.5], [1.0, -1.0, -1.0]];
        let g = array![[0.7, 0.1, 0.0], [0.1, 0.4, 0.2], [0.0, 0.2, 0.3]];
        let solver = GroupSolver::new("g", z.view(), &g).unwrap();
        assert!(solver.used_fallback());
        let (ln_det, v_inv) = dense_reference(&z, &g);
        assert_abs_diff_eq!(solver.log_det(), ln_det, epsilon = 1e-10);
        let rhs = array![0.3, -1.1];
        assert_abs_diff_eq!(solver.solve_vec(&rhs), v_inv.dot(&rhs), epsilon = 1e-10);
    }

    #[test]
    fn unfactorable_marginal_covariance_is_singular() {
        let z = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        let hopeless = array![[-5.0, 0.0], [0.0, -5.0]];
        assert!(matches!(
            GroupSolver::new("bad", z.view(), &hopeless),
            Err(EstimationError::SingularCovariance { .. })
        ));
    }

    #[test]
    fn block_diagonal_places_variance_components() {
        let g = block_diagonal(&array![[2.0]], &array![3.0, 4.0], &[2, 1]);
        assert_eq!(
            g,
            array![
                [2.0, 0.0, 0.0, 0.0],
                [0.0, 3.0, 0.0, 0.0],
                [0.0, 0.0, 3.0, 0.0],
                [0.0, 0.0, 0.0, 4.0]
            ]
        );
    }
}
