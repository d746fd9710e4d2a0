//! # Parameter Packing
//!
//! The optimizer works on a flat vector while the likelihood works on a
//! structured parameter object. `ParamLayout` converts between the two for a
//! fixed `(k_fe, k_re, k_vc, use_sqrt, with_fe)` configuration.
//!
//! Flat layout: `[fe_params (if with_fe), lower triangle of cov_re or of its
//! Cholesky factor (row-major, i >= j), square roots of vcomp]`.

use crate::estimate::EstimationError;
use ndarray::{Array1, Array2, s};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Fixed effects, the unscaled random-effects covariance, and the unscaled
/// variance components of a mixed model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixedLmParams {
    pub fe_params: Array1<f64>,
    pub cov_re: Array2<f64>,
    pub vcomp: Array1<f64>,
    /// The factor `L` with `cov_re = L Lᵀ` this object was unpacked from.
    /// Derivatives in the square-root parametrization are taken at this
    /// exact factor, so sign flips in the flat vector are preserved.
    #[serde(skip)]
    cov_re_sqrt: Option<Array2<f64>>,
    #[serde(skip)]
    vcomp_sqrt: Option<Array1<f64>>,
}

impl MixedLmParams {
    pub fn new(fe_params: Array1<f64>, cov_re: Array2<f64>, vcomp: Array1<f64>) -> Self {
        Self {
            fe_params,
            cov_re,
            vcomp,
            cov_re_sqrt: None,
            vcomp_sqrt: None,
        }
    }

    pub fn k_fe(&self) -> usize {
        self.fe_params.len()
    }

    pub fn k_re(&self) -> usize {
        self.cov_re.nrows()
    }

    pub fn k_vc(&self) -> usize {
        self.vcomp.len()
    }

    /// Replaces the fixed effects, keeping any cached factors.
    pub fn with_fe_params(mut self, fe_params: Array1<f64>) -> Self {
        self.fe_params = fe_params;
        self
    }

    /// `[fe_params, lower triangle of cov_re, vcomp]`.
    pub fn natural_vector(&self) -> Array1<f64> {
        let k_re = self.k_re();
        let mut out = Vec::with_capacity(self.k_fe() + k_re * (k_re + 1) / 2 + self.k_vc());
        out.extend(self.fe_params.iter().copied());
        for (i, j) in lower_triangle_indices(k_re) {
            out.push(self.cov_re[[i, j]]);
        }
        out.extend(self.vcomp.iter().copied());
        Array1::from_vec(out)
    }

    /// Lower-triangular `L` with `cov_re = L Lᵀ`.
    pub fn cov_re_factor(&self) -> Result<Array2<f64>, EstimationError> {
        match &self.cov_re_sqrt {
            Some(l) => Ok(l.clone()),
            None => psd_cholesky(&self.cov_re),
        }
    }

    /// Square roots of the variance components in the sign they were unpacked with.
    pub fn vcomp_root(&self) -> Array1<f64> {
        match &self.vcomp_sqrt {
            Some(v) => v.clone(),
            None => self.vcomp.mapv(|g| g.max(0.0).sqrt()),
        }
    }
}

/// Row-major lower-triangle coordinates `(i, j)`, `i >= j`, of a `k × k` matrix.
pub fn lower_triangle_indices(k: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::with_capacity(k * (k + 1) / 2);
    for i in 0..k {
        for j in 0..=i {
            out.push((i, j));
        }
    }
    out
}

/// Cholesky factorisation of a symmetric positive semi-definite matrix.
///
/// Pivots that vanish produce zero columns instead of failing, so singular
/// covariances (e.g. a variance on the boundary) can still be packed. A
/// clearly negative pivot, or a non-zero residual in a zeroed column, means
/// the matrix is not PSD and is reported as `InvalidCovariance`.
pub fn psd_cholesky(a: &Array2<f64>) -> Result<Array2<f64>, EstimationError> {
    let k = a.nrows();
    if a.ncols() != k {
        return Err(EstimationError::DimensionMismatch {
            context: "columns of a covariance matrix".to_string(),
            expected: k,
            found: a.ncols(),
        });
    }
    let magnitude = a.diag().iter().fold(1.0_f64, |m, &d| m.max(d.abs()));
    let pivot_tol = 1e-12 * magnitude;
    let resid_tol = 1e-7 * magnitude;

    let mut l = Array2::<f64>::zeros((k, k));
    for j in 0..k {
        let mut d = a[[j, j]];
        for t in 0..j {
            d -= l[[j, t]] * l[[j, t]];
        }
        if !d.is_finite() || d < -resid_tol {
            return Err(EstimationError::InvalidCovariance(format!(
                "pivot {j} of the covariance factorisation is {d:.3e}; the matrix is not positive semi-definite"
            )));
        }
        if d <= pivot_tol {
            for i in (j + 1)..k {
                let mut r = a[[i, j]];
                for t in 0..j {
                    r -= l[[i, t]] * l[[j, t]];
                }
                if r.abs() > resid_tol {
                    return Err(EstimationError::InvalidCovariance(format!(
                        "entry ({i}, {j}) is inconsistent with a zero variance in position {j}"
                    )));
                }
            }
            continue;
        }
        let pivot = d.sqrt();
        l[[j, j]] = pivot;
        for i in (j + 1)..k {
            let mut r = a[[i, j]];
            for t in 0..j {
                r -= l[[i, t]] * l[[j, t]];
            }
            l[[i, j]] = r / pivot;
        }
    }
    Ok(l)
}

/// Converts between flat optimizer vectors and `MixedLmParams`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamLayout {
    pub k_fe: usize,
    pub k_re: usize,
    pub k_vc: usize,
    pub use_sqrt: bool,
    pub with_fe: bool,
}

impl ParamLayout {
    pub fn new(k_fe: usize, k_re: usize, k_vc: usize, use_sqrt: bool, with_fe: bool) -> Self {
        Self {
            k_fe,
            k_re,
            k_vc,
            use_sqrt,
            with_fe,
        }
    }

    pub fn n_cov(&self) -> usize {
        self.k_re * (self.k_re + 1) / 2
    }

    pub fn len(&self) -> usize {
        self.fe_range().len() + self.n_cov() + self.k_vc
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fe_range(&self) -> Range<usize> {
        if self.with_fe { 0..self.k_fe } else { 0..0 }
    }

    pub fn cov_range(&self) -> Range<usize> {
        let start = self.fe_range().end;
        start..start + self.n_cov()
    }

    pub fn vc_range(&self) -> Range<usize> {
        let start = self.cov_range().end;
        start..start + self.k_vc
    }

    fn check_shapes(&self, params: &MixedLmParams) -> Result<(), EstimationError> {
        if self.with_fe && params.k_fe() != self.k_fe {
            return Err(EstimationError::DimensionMismatch {
                context: "number of fixed-effects parameters".to_string(),
                expected: self.k_fe,
                found: params.k_fe(),
            });
        }
        if params.cov_re.nrows() != self.k_re || params.cov_re.ncols() != self.k_re {
            return Err(EstimationError::DimensionMismatch {
                context: "dimension of cov_re".to_string(),
                expected: self.k_re,
                found: params.cov_re.nrows().max(params.cov_re.ncols()),
            });
        }
        if params.k_vc() != self.k_vc {
            return Err(EstimationError::DimensionMismatch {
                context: "number of variance components".to_string(),
                expected: self.k_vc,
                found: params.k_vc(),
            });
        }
        Ok(())
    }

    pub fn pack(&self, params: &MixedLmParams) -> Result<Array1<f64>, EstimationError> {
        self.check_shapes(params)?;
        let mut out = Array1::<f64>::zeros(self.len());
        if self.with_fe {
            out.slice_mut(s![self.fe_range()]).assign(&params.fe_params);
        }
        let source = if self.use_sqrt {
            params.cov_re_factor()?
        } else {
            params.cov_re.clone()
        };
        let offset = self.cov_range().start;
        for (m, (i, j)) in lower_triangle_indices(self.k_re).into_iter().enumerate() {
            out[offset + m] = source[[i, j]];
        }
        out.slice_mut(s![self.vc_range()]).assign(&params.vcomp_root());
        Ok(out)
    }

    pub fn unpack(&self, flat: &Array1<f64>) -> Result<MixedLmParams, EstimationError> {
        if flat.len() != self.len() {
            return Err(EstimationError::DimensionMismatch {
                context: "length of the packed parameter vector".to_string(),
                expected: self.len(),
                found: flat.len(),
            });
        }
        let fe_params = if self.with_fe {
            flat.slice(s![self.fe_range()]).to_owned()
        } else {
            Array1::zeros(self.k_fe)
        };

        let offset = self.cov_range().start;
        let mut block = Array2::<f64>::zeros((self.k_re, self.k_re));
        for (m, (i, j)) in lower_triangle_indices(self.k_re).into_iter().enumerate() {
            block[[i, j]] = flat[offset + m];
        }
        let (cov_re, cov_re_sqrt) = if self.use_sqrt {
            (block.dot(&block.t()), Some(block))
        } else {
            for i in 0..self.k_re {
                for j in 0..i {
                    block[[j, i]] = block[[i, j]];
                }
            }
            (block, None)
        };

        let roots = flat.slice(s![self.vc_range()]).to_owned();
        Ok(MixedLmParams {
            fe_params,
            cov_re,
            vcomp: roots.mapv(|v| v * v),
            cov_re_sqrt,
            vcomp_sqrt: Some(roots),
        })
    }

    /// Packs a free-parameter pattern as a 0/1 mask in this layout. Entries
    /// are read directly from `free` without factorisation or square roots.
    pub fn pack_pattern(&self, free: &MixedLmParams) -> Result<Array1<f64>, EstimationError> {
        self.check_shapes(free)?;
        let mut natural = Vec::with_capacity(self.len());
        if self.with_fe {
            natural.extend(free.fe_params.iter().copied());
        }
        for (i, j) in lower_triangle_indices(self.k_re) {
            natural.push(free.cov_re[[i, j]]);
        }
        natural.extend(free.vcomp.iter().copied());
        Ok(Array1::from_vec(natural).mapv(|v| if v != 0.0 { 1.0 } else { 0.0 }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn sample_params() -> MixedLmParams {
        MixedLmParams::new(
            array![1.0, -2.0],
            array![[2.0, 0.5], [0.5, 1.5]],
            array![0.25, 4.0],
        )
    }

    #[test]
    fn pack_unpack_round_trips_in_every_configuration() {
        let params = sample_params();
        for use_sqrt in [false, true] {
            for with_fe in [false, true] {
                let layout = ParamLayout::new(2, 2, 2, use_sqrt, with_fe);
                let flat = layout.pack(&params).unwrap();
                assert_eq!(flat.len(), layout.len());
                let back = layout.unpack(&flat).unwrap();
                assert_abs_diff_eq!(back.cov_re, params.cov_re, epsilon = 1e-12);
                assert_abs_diff_eq!(back.vcomp, params.vcomp, epsilon = 1e-12);
                if with_fe {
                    assert_abs_diff_eq!(back.fe_params, params.fe_params, epsilon = 1e-12);
                } else {
                    assert!(back.fe_params.iter().all(|&v| v == 0.0));
                }
            }
        }
    }

    #[test]
    fn packed_layout_orders_lower_triangle_row_major() {
        let layout = ParamLayout::new(1, 2, 1, false, true);
        let flat = layout.pack(&MixedLmParams::new(
            array![7.0],
            array![[1.0, 2.0], [2.0, 3.0]],
            array![9.0],
        ))
        .unwrap();
        assert_eq!(flat, array![7.0, 1.0, 2.0, 3.0, 3.0]);
    }

    #[test]
    fn wrong_length_names_expected_and_found() {
        let layout = ParamLayout::new(2, 2, 0, true, true);
        match layout.unpack(&Array1::zeros(4)) {
            Err(EstimationError::DimensionMismatch {
                expected, found, ..
            }) => {
                assert_eq!(expected, 5);
                assert_eq!(found, 4);
            }
            other => panic!("expected a dimension mismatch, got {other:?}"),
        }
    }

    #[test]
    fn negative_factor_entries_survive_unpacking() {
        let layout = ParamLayout::new(0, 2, 1, true, false);
        let flat = array![-1.0, 0.5, -2.0, -0.3];
        let params = layout.unpack(&flat).unwrap();
        let repacked = layout.pack(&params).unwrap();
        assert_eq!(repacked, flat);
        assert_abs_diff_eq!(params.vcomp[0], 0.09, epsilon = 1e-15);
    }

    #[test]
    fn semidefinite_covariances_factor_with_zero_columns() {
        let a = array![[1.0, 1.0, 0.0], [1.0, 1.0, 0.0], [0.0, 0.0, 2.0]];
        let l = psd_cholesky(&a).unwrap();
        assert_abs_diff_eq!(l.dot(&l.t()), a, epsilon = 1e-12);
        assert_eq!(l[[1, 1]], 0.0);

        let indefinite = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(matches!(
            psd_cholesky(&indefinite),
            Err(EstimationError::InvalidCovariance(_))
        ));
    }

    #[test]
    fn free_pattern_is_a_plain_mask() {
        let layout = ParamLayout::new(1, 2, 1, true, true);
        let free = MixedLmParams::new(array![1.0], Array2::eye(2), array![0.0]);
        assert_eq!(
            layout.pack_pattern(&free).unwrap(),
            array![1.0, 1.0, 0.0, 1.0, 0.0]
        );
    }
}
