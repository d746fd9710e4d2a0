use crate::data::ObservationSet;
use crate::estimate::{self, EstimationError, FitOptions, FitStatus, IterationRecord};
use crate::inference::{self, GroupRandomEffects, ProfileOptions, ProfilePoint};
use crate::likelihood::{self, Criterion};
use crate::params::{MixedLmParams, ParamLayout};
use crate::penalty::PenaltySpec;
use crate::regularize::{self, RegularizationOptions, RegularizationPathPoint};
use ndarray::{Array1, Array2, s};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// A linear mixed-effects model over a fixed observation set.
#[derive(Debug, Clone)]
pub struct MixedLm {
    data: ObservationSet,
    use_sqrt: bool,
}

impl MixedLm {
    /// Creates a model that optimises over the Cholesky factor of `cov_re`.
    pub fn new(data: ObservationSet) -> Self {
        Self {
            data,
            use_sqrt: true,
        }
    }

    /// Chooses between the Cholesky-factor and the direct parametrization of `cov_re`.
    pub fn with_use_sqrt(mut self, use_sqrt: bool) -> Self {
        self.use_sqrt = use_sqrt;
        self
    }

    pub fn data(&self) -> &ObservationSet {
        &self.data
    }

    pub fn use_sqrt(&self) -> bool {
        self.use_sqrt
    }

    pub fn k_fe(&self) -> usize {
        self.data.k_fe()
    }

    pub fn k_re(&self) -> usize {
        self.data.k_re()
    }

    pub fn k_vc(&self) -> usize {
        self.data.k_vc()
    }

    /// Packing layout for this model's dimensions.
    pub fn layout(&self, with_fe: bool) -> ParamLayout {
        ParamLayout::new(self.k_fe(), self.k_re(), self.k_vc(), self.use_sqrt, with_fe)
    }

    /// Log-likelihood at `params`; with `profile_fe` the fixed effects are
    /// replaced by their GLS estimate.
    pub fn loglike(
        &self,
        criterion: &Criterion,
        params: &MixedLmParams,
        profile_fe: bool,
    ) -> Result<f64, EstimationError> {
        Ok(likelihood::evaluate(&self.data, criterion, params, profile_fe)?.loglike())
    }

    /// Gradient in the packed coordinates of `self.layout(!profile_fe)`.
    pub fn score(
        &self,
        criterion: &Criterion,
        params: &MixedLmParams,
        profile_fe: bool,
    ) -> Result<Array1<f64>, EstimationError> {
        likelihood::evaluate(&self.data, criterion, params, profile_fe)?
            .score(&self.layout(!profile_fe))
    }

    /// Hessian in the packed coordinates of `self.layout(!profile_fe)`.
    pub fn hessian(
        &self,
        criterion: &Criterion,
        params: &MixedLmParams,
        profile_fe: bool,
    ) -> Result<Array2<f64>, EstimationError> {
        likelihood::evaluate(&self.data, criterion, params, profile_fe)?
            .hessian(&self.layout(!profile_fe))
    }

    pub fn fit(&self, options: &FitOptions) -> Result<MixedLmResults, EstimationError> {
        estimate::fit(&self.data, self.use_sqrt, options)
    }

    pub fn fit_regularized(
        &self,
        penalty: &PenaltySpec,
        options: &RegularizationOptions,
    ) -> Result<MixedLmResults, EstimationError> {
        regularize::fit_regularized(&self.data, self.use_sqrt, penalty, options)
    }

    pub fn regularization_path(
        &self,
        alphas: &[f64],
        options: &RegularizationOptions,
    ) -> Result<Vec<RegularizationPathPoint>, EstimationError> {
        regularize::regularization_path(&self.data, self.use_sqrt, alphas, options)
    }

    pub fn profile_re(
        &self,
        results: &MixedLmResults,
        re_ix: usize,
        options: &ProfileOptions,
    ) -> Result<Vec<ProfilePoint>, EstimationError> {
        inference::profile_re(&self.data, results, re_ix, options)
    }
}

/// The outcome of a fit, in a form that round-trips through TOML.
///
/// Covariance parameters are stored unscaled; the accessors without an
/// `_unscaled` suffix multiply by `scale`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixedLmResults {
    pub(crate) params: MixedLmParams,
    pub(crate) scale: f64,
    pub(crate) llf: f64,
    pub(crate) reml: bool,
    pub(crate) cov_penalty: Option<PenaltySpec>,
    pub(crate) fe_penalty: Option<PenaltySpec>,
    /// Covariance of `[fe_params, lower(cov_re), vcomp]`, unscaled covariance entries.
    pub(crate) cov_params: Array2<f64>,
    pub(crate) status: FitStatus,
    /// Optimizer iterations; zero when the optimizer aborted without a solution.
    pub(crate) iterations: usize,
    /// Objective evaluations, line-search trials included.
    #[serde(default)]
    pub(crate) evaluations: usize,
    /// Evaluations that failed and were answered with the barrier cost.
    #[serde(default)]
    pub(crate) failed_evaluations: usize,
    /// Groups whose marginal covariance needed the dense factorisation at the optimum.
    #[serde(default)]
    pub(crate) n_fallback_groups: usize,
    pub(crate) gradient_norm: f64,
    pub(crate) history: Option<Vec<IterationRecord>>,
    pub(crate) random_effects: Vec<GroupRandomEffects>,
    pub(crate) free: Option<MixedLmParams>,
    pub(crate) use_sqrt: bool,
}

impl MixedLmResults {
    pub fn params(&self) -> &MixedLmParams {
        &self.params
    }

    pub fn fe_params(&self) -> &Array1<f64> {
        &self.params.fe_params
    }

    /// Random-effects covariance on the data scale.
    pub fn cov_re(&self) -> Array2<f64> {
        &self.params.cov_re * self.scale
    }

    /// Random-effects covariance relative to the residual variance.
    pub fn cov_re_unscaled(&self) -> &Array2<f64> {
        &self.params.cov_re
    }

    /// Variance components on the data scale.
    pub fn vcomp(&self) -> Array1<f64> {
        &self.params.vcomp * self.scale
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn llf(&self) -> f64 {
        self.llf
    }

    pub fn reml(&self) -> bool {
        self.reml
    }

    pub fn use_sqrt(&self) -> bool {
        self.use_sqrt
    }

    pub fn cov_penalty(&self) -> Option<&PenaltySpec> {
        self.cov_penalty.as_ref()
    }

    pub fn fe_penalty(&self) -> Option<&PenaltySpec> {
        self.fe_penalty.as_ref()
    }

    pub fn free(&self) -> Option<&MixedLmParams> {
        self.free.as_ref()
    }

    pub fn cov_params(&self) -> &Array2<f64> {
        &self.cov_params
    }

    pub fn status(&self) -> FitStatus {
        self.status
    }

    pub fn converged(&self) -> bool {
        self.status == FitStatus::Converged
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    pub fn failed_evaluations(&self) -> usize {
        self.failed_evaluations
    }

    pub fn n_fallback_groups(&self) -> usize {
        self.n_fallback_groups
    }

    pub fn gradient_norm(&self) -> f64 {
        self.gradient_norm
    }

    pub fn history(&self) -> Option<&[IterationRecord]> {
        self.history.as_deref()
    }

    pub fn random_effects(&self) -> &[GroupRandomEffects] {
        &self.random_effects
    }

    /// `[fe_params, lower(cov_re), vcomp]` with the covariance entries on the data scale.
    pub fn natural_params(&self) -> Array1<f64> {
        let mut natural = self.params.natural_vector();
        let k_fe = self.params.k_fe();
        natural.slice_mut(s![k_fe..]).mapv_inplace(|v| v * self.scale);
        natural
    }

    /// Standard errors of the fixed effects.
    pub fn bse_fe(&self) -> Array1<f64> {
        let k_fe = self.params.k_fe();
        self.cov_params.diag().slice(s![..k_fe]).mapv(f64::sqrt)
    }

    /// Standard errors of the covariance parameters on the data scale.
    pub fn bse_re(&self) -> Array1<f64> {
        let k_fe = self.params.k_fe();
        self.cov_params
            .diag()
            .slice(s![k_fe..])
            .mapv(|v| self.scale * v.sqrt())
    }

    /// `bse_fe` followed by `bse_re`, aligned with `natural_params`.
    pub fn bse(&self) -> Array1<f64> {
        self.bse_fe().into_iter().chain(self.bse_re()).collect()
    }

    /// `natural_params / bse`.
    pub fn tvalues(&self) -> Array1<f64> {
        self.natural_params() / self.bse()
    }

    /// Returns the results only if the optimizer converged.
    pub fn into_converged(self) -> Result<Self, EstimationError> {
        if self.converged() {
            Ok(self)
        } else {
            Err(EstimationError::ConvergenceFailure {
                iterations: self.iterations,
                gradient_norm: self.gradient_norm,
            })
        }
    }

    /// Saves the results to a human-readable TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads results from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let results = toml::from_str(&toml_string)?;
        Ok(results)
    }
}

/// Errors from saving or loading results and options.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write a file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Failed to serialize to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}
