//! # Log-Likelihood, Score and Hessian
//!
//! The residual scale is always concentrated out, so for `V_i = I + Z_i G Z_iᵀ`
//! the criterion depends on the data only through
//!
//! - `qf  = Σ r_iᵀ V_i⁻¹ r_i`
//! - `xvx = Σ X_iᵀ V_i⁻¹ X_i`
//! - `log|V_i|`
//!
//! and on `n_eff`, which is `n` under ML and `n - k_fe` under REML.
//!
//! Derivatives with respect to the covariance are computed as directional
//! derivatives along symmetric directions `A` in the random-effects space.
//! Every packed coordinate (natural entries, Cholesky factor entries, square
//! roots of variance components) maps to such a direction, plus a second-order
//! direction when the coordinate map is not linear. The per-group quantities
//! that all directions share are
//!
//! - `M = Zᵀ V⁻¹ Z`
//! - `u = Zᵀ V⁻¹ r`
//! - `W = Zᵀ V⁻¹ X`

use crate::data::ObservationSet;
use crate::estimate::EstimationError;
use crate::marginal::{GroupSolver, block_diagonal};
use crate::params::{MixedLmParams, ParamLayout, lower_triangle_indices};
use crate::penalty::{FePenalty, PenaltySpec, PsdPenalty};
use ndarray::{Array1, Array2, Axis, s};
use ndarray_linalg::{Cholesky, Inverse, Solve, UPLO};
use std::f64::consts::PI;

/// Which likelihood is evaluated: ML or REML, plus any active penalties.
#[derive(Debug, Clone, PartialEq)]
pub struct Criterion {
    pub reml: bool,
    pub cov_penalty: Option<PsdPenalty>,
    pub fe_penalty: Option<FePenalty>,
}

impl Criterion {
    pub fn new(reml: bool) -> Self {
        Self {
            reml,
            cov_penalty: None,
            fe_penalty: None,
        }
    }

    /// Resolves and validates penalty specifications for a model with `k_fe`
    /// fixed effects.
    pub fn with_penalties(
        reml: bool,
        cov_penalty: Option<&PenaltySpec>,
        fe_penalty: Option<&PenaltySpec>,
        k_fe: usize,
    ) -> Result<Self, EstimationError> {
        let cov_penalty = match cov_penalty {
            Some(spec) => spec.resolve_cov()?,
            None => None,
        };
        let fe_penalty = match fe_penalty {
            Some(spec) => Some(spec.resolve_fe(k_fe)?),
            None => None,
        };
        Ok(Self {
            reml,
            cov_penalty,
            fe_penalty,
        })
    }
}

/// Per-group quantities shared by the score, the Hessian and the BLUPs.
#[derive(Debug, Clone)]
pub struct GroupTerms {
    pub label: String,
    pub log_det: f64,
    /// `blockdiag(cov_re, vcomp_j I)` restricted to this group's columns.
    pub g: Array2<f64>,
    pub vc_sizes: Vec<usize>,
    pub m: Array2<f64>,
    pub u: Array1<f64>,
    pub w: Array2<f64>,
    pub used_fallback: bool,
}

/// A symmetric direction in covariance space.
#[derive(Debug, Clone)]
struct CovDirection {
    psi: Array2<f64>,
    vc: Array1<f64>,
}

impl CovDirection {
    fn zeros(k_re: usize, k_vc: usize) -> Self {
        Self {
            psi: Array2::zeros((k_re, k_re)),
            vc: Array1::zeros(k_vc),
        }
    }
}

/// The fully evaluated criterion at one parameter point.
#[derive(Debug, Clone)]
pub struct Evaluation {
    params: MixedLmParams,
    criterion: Criterion,
    profiled: bool,
    n_obs: usize,
    n_eff: f64,
    qf: f64,
    xvx: Array2<f64>,
    xvx_inv: Array2<f64>,
    /// `Σ X_iᵀ V_i⁻¹ r_i`
    s: Array1<f64>,
    psi_inv: Option<Array2<f64>>,
    groups: Vec<GroupTerms>,
    loglike: f64,
}

/// `tr(a b)`
fn trace_product(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    a.iter().zip(b.t().iter()).map(|(x, y)| x * y).sum()
}

fn check_shapes(data: &ObservationSet, params: &MixedLmParams) -> Result<(), EstimationError> {
    let checks = [
        ("number of fixed-effects parameters", data.k_fe(), params.k_fe()),
        ("dimension of cov_re", data.k_re(), params.k_re()),
        ("columns of cov_re", data.k_re(), params.cov_re.ncols()),
        ("number of variance components", data.k_vc(), params.k_vc()),
    ];
    for (context, expected, found) in checks {
        if expected != found {
            return Err(EstimationError::DimensionMismatch {
                context: context.to_string(),
                expected,
                found,
            });
        }
    }
    Ok(())
}

/// Rejects covariance parameters outside the PSD cone. The direct
/// parametrization can propose them even though `I + Z G Zᵀ` would still
/// factor. Parameters unpacked from a Cholesky factor pass through the
/// cached factor.
fn check_covariance(params: &MixedLmParams) -> Result<(), EstimationError> {
    if let Some(d) = params.cov_re.diag().iter().find(|d| !(**d >= 0.0)) {
        return Err(EstimationError::InvalidCovariance(format!(
            "cov_re has a diagonal entry of {d:.3e}"
        )));
    }
    if let Some(v) = params.vcomp.iter().find(|v| !(**v >= 0.0)) {
        return Err(EstimationError::InvalidCovariance(format!(
            "a variance component is {v:.3e}"
        )));
    }
    params.cov_re_factor().map(|_| ())
}

/// Evaluates the criterion at `params`.
///
/// With `profile_fe` the fixed effects in `params` are ignored and replaced by
/// their GLS estimate, giving the profile log-likelihood of the covariance
/// parameters. Profiling is unavailable while a fixed-effects penalty is active.
pub fn evaluate(
    data: &ObservationSet,
    criterion: &Criterion,
    params: &MixedLmParams,
    profile_fe: bool,
) -> Result<Evaluation, EstimationError> {
    check_shapes(data, params)?;
    check_covariance(params)?;
    if profile_fe && criterion.fe_penalty.is_some() {
        return Err(EstimationError::InvalidPenalty(
            "the fixed effects cannot be profiled out while a fixed-effects penalty is active"
                .to_string(),
        ));
    }

    let n_obs = data.n_obs();
    let k_fe = data.k_fe();
    let k_re = data.k_re();
    let n_eff = if criterion.reml {
        n_obs as f64 - k_fe as f64
    } else {
        n_obs as f64
    };
    if n_eff <= 0.0 {
        return Err(EstimationError::DimensionMismatch {
            context: "observations beyond the number of fixed effects".to_string(),
            expected: k_fe + 1,
            found: n_obs,
        });
    }

    let mut psi_inv = None;
    let mut penalty_value = 0.0;
    if let Some(pen) = criterion.cov_penalty.filter(|_| k_re > 0) {
        let factor = params.cov_re.cholesky(UPLO::Lower).map_err(|_| {
            EstimationError::InvalidCovariance(
                "the PSD penalty requires a positive definite cov_re".to_string(),
            )
        })?;
        let log_det = 2.0 * factor.diag().iter().map(|d| d.ln()).sum::<f64>();
        penalty_value += pen.weight * log_det;
        psi_inv = Some(
            params
                .cov_re
                .inv()
                .map_err(EstimationError::LinearSystemSolveFailed)?,
        );
    }

    // First pass: everything that does not depend on the fixed effects.
    struct Solved {
        log_det: f64,
        g: Array2<f64>,
        vx: Array2<f64>,
        vz: Array2<f64>,
        vy: Array1<f64>,
        used_fallback: bool,
    }
    let mut solved = Vec::with_capacity(data.groups().len());
    let mut xvx = Array2::<f64>::zeros((k_fe, k_fe));
    let mut xvy = Array1::<f64>::zeros(k_fe);
    for group in data.groups() {
        let g = block_diagonal(&params.cov_re, &params.vcomp, &group.vc_sizes);
        let solver = GroupSolver::new(&group.label, group.design.view(), &g)?;
        let vx = solver.solve(&group.exog);
        let vz = solver.solve(&group.design);
        let vy = solver.solve_vec(&group.endog);
        xvx += &group.exog.t().dot(&vx);
        xvy += &vx.t().dot(&group.endog);
        solved.push(Solved {
            log_det: solver.log_det(),
            g,
            vx,
            vz,
            vy,
            used_fallback: solver.used_fallback(),
        });
    }

    let fe_params = if profile_fe && k_fe > 0 {
        xvx.solve(&xvy)
            .map_err(EstimationError::LinearSystemSolveFailed)?
    } else {
        params.fe_params.clone()
    };

    let (xvx_inv, xvx_log_det) = if k_fe > 0 {
        let factor = xvx
            .cholesky(UPLO::Lower)
            .map_err(EstimationError::LinearSystemSolveFailed)?;
        let log_det = 2.0 * factor.diag().iter().map(|d| d.ln()).sum::<f64>();
        let inv = xvx.inv().map_err(EstimationError::LinearSystemSolveFailed)?;
        (inv, log_det)
    } else {
        (Array2::zeros((0, 0)), 0.0)
    };

    // Second pass: residual terms at the chosen fixed effects.
    let mut qf = 0.0;
    let mut s_vec = Array1::<f64>::zeros(k_fe);
    let mut log_det_sum = 0.0;
    let mut groups = Vec::with_capacity(solved.len());
    for (group, solved) in data.groups().iter().zip(solved) {
        let resid = &group.endog - &group.exog.dot(&fe_params);
        let v_resid = &solved.vy - &solved.vx.dot(&fe_params);
        qf += resid.dot(&v_resid);
        s_vec += &solved.vx.t().dot(&resid);
        log_det_sum += solved.log_det;
        groups.push(GroupTerms {
            label: group.label.clone(),
            log_det: solved.log_det,
            g: solved.g,
            vc_sizes: group.vc_sizes.clone(),
            m: group.design.t().dot(&solved.vz),
            u: solved.vz.t().dot(&resid),
            w: group.design.t().dot(&solved.vx),
            used_fallback: solved.used_fallback,
        });
    }
    if !(qf.is_finite() && qf > 0.0) {
        return Err(EstimationError::NonFiniteLikelihood(format!(
            "the weighted residual sum of squares is {qf:.6e}"
        )));
    }

    let mut loglike = -0.5 * log_det_sum - 0.5 * n_eff * qf.ln() - 0.5 * n_eff * (2.0 * PI).ln()
        + 0.5 * n_eff * n_eff.ln()
        - 0.5 * n_eff;
    if criterion.reml {
        loglike -= 0.5 * xvx_log_det;
    }
    if let Some(pen) = &criterion.fe_penalty {
        loglike -= pen.value(&fe_params);
    }
    loglike += penalty_value;
    if !loglike.is_finite() {
        return Err(EstimationError::NonFiniteLikelihood(format!(
            "log-likelihood evaluated to {loglike}"
        )));
    }

    Ok(Evaluation {
        params: params.clone().with_fe_params(fe_params),
        criterion: criterion.clone(),
        profiled: profile_fe,
        n_obs,
        n_eff,
        qf,
        xvx,
        xvx_inv,
        s: s_vec,
        psi_inv,
        groups,
        loglike,
    })
}

impl Evaluation {
    pub fn loglike(&self) -> f64 {
        self.loglike
    }

    /// Parameters at which the criterion was evaluated, with the GLS fixed
    /// effects substituted when profiled.
    pub fn params(&self) -> &MixedLmParams {
        &self.params
    }

    pub fn fe_params(&self) -> &Array1<f64> {
        &self.params.fe_params
    }

    /// Concentrated residual variance `qf / n_eff`.
    pub fn scale(&self) -> f64 {
        self.qf / self.n_eff
    }

    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    pub fn is_profiled(&self) -> bool {
        self.profiled
    }

    pub fn group_terms(&self) -> &[GroupTerms] {
        &self.groups
    }

    /// `Σ X_iᵀ V_i⁻¹ X_i`
    pub fn xvx(&self) -> &Array2<f64> {
        &self.xvx
    }

    /// `Σ X_iᵀ V_i⁻¹ r_i` at the evaluated fixed effects.
    pub fn xvr(&self) -> &Array1<f64> {
        &self.s
    }

    pub fn n_fallback_groups(&self) -> usize {
        self.groups.iter().filter(|g| g.used_fallback).count()
    }

    fn k_fe(&self) -> usize {
        self.params.k_fe()
    }

    fn k_re(&self) -> usize {
        self.params.k_re()
    }

    fn k_vc(&self) -> usize {
        self.params.k_vc()
    }

    fn expand(&self, group: &GroupTerms, dir: &CovDirection) -> Array2<f64> {
        block_diagonal(&dir.psi, &dir.vc, &group.vc_sizes)
    }

    /// First-order directions for the covariance coordinates of `layout`,
    /// in packed order.
    fn directions(
        &self,
        use_sqrt: bool,
        natural_vc: bool,
    ) -> Result<Vec<CovDirection>, EstimationError> {
        let (k_re, k_vc) = (self.k_re(), self.k_vc());
        let mut out = Vec::with_capacity(k_re * (k_re + 1) / 2 + k_vc);
        let factor = if use_sqrt {
            Some(self.params.cov_re_factor()?)
        } else {
            None
        };
        for (a, b) in lower_triangle_indices(k_re) {
            let mut dir = CovDirection::zeros(k_re, k_vc);
            match &factor {
                Some(l) => {
                    // d(L Lᵀ)/dL_ab = E_ab Lᵀ + L E_ba
                    for t in 0..k_re {
                        dir.psi[[a, t]] += l[[t, b]];
                        dir.psi[[t, a]] += l[[t, b]];
                    }
                }
                None => {
                    dir.psi[[a, b]] = 1.0;
                    dir.psi[[b, a]] = 1.0;
                }
            }
            out.push(dir);
        }
        let roots = self.params.vcomp_root();
        for j in 0..k_vc {
            let mut dir = CovDirection::zeros(k_re, k_vc);
            dir.vc[j] = if natural_vc { 1.0 } else { 2.0 * roots[j] };
            out.push(dir);
        }
        Ok(out)
    }

    /// Second-order direction for the packed covariance coordinates `m` and
    /// `n`, when the coordinate map has curvature there.
    fn second_order(&self, use_sqrt: bool, m: usize, n: usize) -> Option<CovDirection> {
        let (k_re, k_vc) = (self.k_re(), self.k_vc());
        let n_cov = k_re * (k_re + 1) / 2;
        if m < n_cov && n < n_cov {
            if !use_sqrt {
                return None;
            }
            let tri = lower_triangle_indices(k_re);
            let ((a, b), (c, d)) = (tri[m], tri[n]);
            if b != d {
                return None;
            }
            let mut dir = CovDirection::zeros(k_re, k_vc);
            dir.psi[[a, c]] += 1.0;
            dir.psi[[c, a]] += 1.0;
            Some(dir)
        } else if m >= n_cov && m == n {
            let mut dir = CovDirection::zeros(k_re, k_vc);
            dir.vc[m - n_cov] = 2.0;
            Some(dir)
        } else {
            None
        }
    }

    /// `−½M + (n_eff/2qf) u uᵀ + [REML] ½ W xvx⁻¹ Wᵀ` for one group.
    fn gamma(&self, group: &GroupTerms) -> Array2<f64> {
        let mut gamma = group.m.mapv(|v| -0.5 * v);
        let coef = 0.5 * self.n_eff / self.qf;
        let u = group.u.view().insert_axis(Axis(1));
        gamma += &(u.dot(&u.t()) * coef);
        if self.criterion.reml && self.k_fe() > 0 {
            gamma += &(group.w.dot(&self.xvx_inv).dot(&group.w.t()) * 0.5);
        }
        gamma
    }

    fn first_derivatives(&self, dirs: &[CovDirection]) -> Array1<f64> {
        let mut out = Array1::<f64>::zeros(dirs.len());
        for group in &self.groups {
            let gamma = self.gamma(group);
            for (m, dir) in dirs.iter().enumerate() {
                out[m] += trace_product(&self.expand(group, dir), &gamma);
            }
        }
        if let (Some(pen), Some(psi_inv)) = (&self.criterion.cov_penalty, &self.psi_inv) {
            for (m, dir) in dirs.iter().enumerate() {
                out[m] += pen.weight * trace_product(psi_inv, &dir.psi);
            }
        }
        out
    }

    fn fe_gradient(&self) -> Array1<f64> {
        let mut grad = &self.s * (self.n_eff / self.qf);
        if let Some(pen) = &self.criterion.fe_penalty {
            grad -= &pen.gradient(self.fe_params());
        }
        grad
    }

    fn fe_hessian(&self) -> Array2<f64> {
        let s_col = self.s.view().insert_axis(Axis(1));
        let mut hess = &self.xvx * (-self.n_eff / self.qf)
            + &(s_col.dot(&s_col.t()) * (2.0 * self.n_eff / (self.qf * self.qf)));
        if let Some(pen) = &self.criterion.fe_penalty {
            let diag = pen.hessian_diag(self.fe_params());
            for j in 0..diag.len() {
                hess[[j, j]] -= diag[j];
            }
        }
        hess
    }

    /// Second derivatives along every pair of `dirs`, and the mixed
    /// fixed-effects/covariance block, holding the directions fixed.
    fn second_derivatives(&self, dirs: &[CovDirection]) -> (Array2<f64>, Array2<f64>) {
        let nd = dirs.len();
        let k_fe = self.k_fe();
        let reml = self.criterion.reml && k_fe > 0;
        let mut hess = Array2::<f64>::zeros((nd, nd));
        let mut cross = Array2::<f64>::zeros((k_fe, nd));
        let mut q = Array1::<f64>::zeros(nd);
        let mut r: Vec<Array2<f64>> = vec![Array2::zeros((k_fe, k_fe)); nd];
        let mut wmw: Vec<Array2<f64>> = vec![Array2::zeros((k_fe, k_fe)); nd * nd];
        let ratio = self.n_eff / self.qf;

        for group in &self.groups {
            let expanded: Vec<Array2<f64>> = dirs.iter().map(|d| self.expand(group, d)).collect();
            let au: Vec<Array1<f64>> = expanded.iter().map(|a| a.dot(&group.u)).collect();
            let ma: Vec<Array2<f64>> = expanded.iter().map(|a| group.m.dot(a)).collect();
            let aw: Vec<Array2<f64>> = expanded.iter().map(|a| a.dot(&group.w)).collect();
            for i in 0..nd {
                q[i] += group.u.dot(&au[i]);
                let wau = group.w.t().dot(&au[i]);
                cross.column_mut(i).scaled_add(-ratio, &wau);
                if reml {
                    r[i] += &group.w.t().dot(&aw[i]);
                }
                let m_au = group.m.dot(&au[i]);
                for j in 0..=i {
                    let value = 0.5 * trace_product(&ma[j], &ma[i]) - ratio * au[j].dot(&m_au);
                    hess[[i, j]] += value;
                    if reml {
                        wmw[i * nd + j] += &aw[j].t().dot(&group.m).dot(&aw[i]);
                    }
                }
            }
        }

        let coef = 0.5 * self.n_eff / (self.qf * self.qf);
        for i in 0..nd {
            for j in 0..=i {
                let mut value = hess[[i, j]] + coef * q[i] * q[j];
                if reml {
                    let rb = self.xvx_inv.dot(&r[j]);
                    let ra = self.xvx_inv.dot(&r[i]);
                    value += 0.5 * trace_product(&rb, &ra);
                    value -= trace_product(&self.xvx_inv, &wmw[i * nd + j]);
                }
                if let (Some(pen), Some(psi_inv)) = (&self.criterion.cov_penalty, &self.psi_inv) {
                    let pb = psi_inv.dot(&dirs[j].psi);
                    let pa = psi_inv.dot(&dirs[i].psi);
                    value -= pen.weight * trace_product(&pb, &pa);
                }
                hess[[i, j]] = value;
                hess[[j, i]] = value;
            }
        }

        let s_coef = self.n_eff / (self.qf * self.qf);
        for i in 0..nd {
            cross.column_mut(i).scaled_add(s_coef * q[i], &self.s);
        }
        (hess, cross)
    }

    /// Hessian of the covariance block in the given coordinates, including
    /// the curvature of the coordinate map.
    fn cov_hessian(
        &self,
        use_sqrt: bool,
        natural_vc: bool,
    ) -> Result<(Array2<f64>, Array2<f64>), EstimationError> {
        let dirs = self.directions(use_sqrt, natural_vc)?;
        let (mut hess, cross) = self.second_derivatives(&dirs);
        if !natural_vc {
            let nd = dirs.len();
            let mut extra = Vec::new();
            let mut slots = Vec::new();
            for i in 0..nd {
                for j in 0..=i {
                    if let Some(dir) = self.second_order(use_sqrt, i, j) {
                        extra.push(dir);
                        slots.push((i, j));
                    }
                }
            }
            let firsts = self.first_derivatives(&extra);
            for ((i, j), value) in slots.into_iter().zip(firsts.iter()) {
                hess[[i, j]] += value;
                if i != j {
                    hess[[j, i]] += value;
                }
            }
        }
        Ok((hess, cross))
    }

    fn schur_complement(
        &self,
        h_tt: &Array2<f64>,
        h_bt: &Array2<f64>,
    ) -> Result<Array2<f64>, EstimationError> {
        if self.k_fe() == 0 {
            return Ok(h_tt.clone());
        }
        let h_bb = self.fe_hessian();
        let h_bb_inv = h_bb.inv().map_err(EstimationError::LinearSystemSolveFailed)?;
        Ok(h_tt - &h_bt.t().dot(&h_bb_inv).dot(h_bt))
    }

    /// Analytic gradient with respect to the packed coordinates of `layout`.
    ///
    /// Without fixed effects in the layout this is the gradient of the profile
    /// log-likelihood when the evaluation was profiled.
    pub fn score(&self, layout: &ParamLayout) -> Result<Array1<f64>, EstimationError> {
        let mut out = Array1::<f64>::zeros(layout.len());
        if layout.with_fe {
            out.slice_mut(s![layout.fe_range()])
                .assign(&self.fe_gradient());
        }
        let dirs = self.directions(layout.use_sqrt, false)?;
        let cov_start = layout.cov_range().start;
        out.slice_mut(s![cov_start..])
            .assign(&self.first_derivatives(&dirs));
        Ok(out)
    }

    /// Analytic Hessian with respect to the packed coordinates of `layout`.
    ///
    /// Without fixed effects in the layout this is the Hessian of the profile
    /// log-likelihood, the Schur complement of the full Hessian.
    pub fn hessian(&self, layout: &ParamLayout) -> Result<Array2<f64>, EstimationError> {
        let (h_tt, h_bt) = self.cov_hessian(layout.use_sqrt, false)?;
        if !layout.with_fe {
            return self.schur_complement(&h_tt, &h_bt);
        }
        let k_fe = self.k_fe();
        let mut out = Array2::<f64>::zeros((layout.len(), layout.len()));
        out.slice_mut(s![..k_fe, ..k_fe]).assign(&self.fe_hessian());
        out.slice_mut(s![..k_fe, k_fe..]).assign(&h_bt);
        out.slice_mut(s![k_fe.., ..k_fe]).assign(&h_bt.t());
        out.slice_mut(s![k_fe.., k_fe..]).assign(&h_tt);
        Ok(out)
    }

    /// Curvature in natural coordinates `[fe, lower(cov_re), vcomp]` used for
    /// the covariance of the estimates.
    ///
    /// The matrix is block diagonal: the fixed-effects block of the full
    /// Hessian, and the profile Hessian of the covariance parameters.
    pub fn hessian_natural(&self) -> Result<Array2<f64>, EstimationError> {
        let (h_tt, h_bt) = self.cov_hessian(false, true)?;
        let profile = self.schur_complement(&h_tt, &h_bt)?;
        let k_fe = self.k_fe();
        let dim = k_fe + profile.nrows();
        let mut out = Array2::<f64>::zeros((dim, dim));
        out.slice_mut(s![..k_fe, ..k_fe]).assign(&self.fe_hessian());
        out.slice_mut(s![k_fe.., k_fe..]).assign(&profile);
        Ok(out)
    }
}
