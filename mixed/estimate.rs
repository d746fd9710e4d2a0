//! # Model Estimation
//!
//! This module drives the quasi-Newton optimisation of the ML or REML
//! criterion and turns the optimum into a `MixedLmResults`.
//!
//! ### Workflow
//!
//! 1. **Validation:** penalties, tolerances and the free-parameter pattern
//!    are checked before any evaluation, so configuration errors never reach
//!    the optimizer.
//! 2. **Start:** the caller's parameters, or OLS fixed effects with an
//!    identity covariance.
//! 3. **Optimisation:** BFGS (`wolfe_bfgs`) on the negative log-likelihood.
//!    Without a fixed-effects penalty the fixed effects are profiled out and
//!    only the covariance parameters are searched.
//! 4. **Results:** GLS fixed effects, scale, covariance of the estimates from
//!    the curvature at the optimum, and per-group random effects.

use crate::data::ObservationSet;
use crate::diagnostics::{self, DiagnosticCategory, NONFINITE_COST_COUNT};
use crate::inference;
use crate::likelihood::{self, Criterion, Evaluation};
use crate::model::{MixedLmResults, ModelError};
use crate::params::{MixedLmParams, ParamLayout};
use crate::penalty::{Penalty, PenaltySpec};
use crate::seeding;
use ndarray::{Array1, Array2};
use ndarray_linalg::Inverse;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::fs;
use std::path::Path;
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsError};

/// A comprehensive error type for the model estimation process.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Dimension mismatch in {context}: expected {expected}, found {found}.")]
    DimensionMismatch {
        context: String,
        expected: usize,
        found: usize,
    },

    #[error(
        "The optimizer did not converge within {iterations} iterations. Final gradient norm was {gradient_norm:.3e}."
    )]
    ConvergenceFailure {
        iterations: usize,
        gradient_norm: f64,
    },

    #[error("The marginal covariance of group '{group}' is singular.")]
    SingularCovariance { group: String },

    #[error("Invalid penalty: {0}")]
    InvalidPenalty(String),

    #[error(
        "The lower end of the profile range is {low:.6e} on the unscaled variance scale; it must be positive."
    )]
    InvalidProfileRange { low: f64 },

    #[error("The observation set contains no observations, so no group can be formed.")]
    EmptyGroup,

    #[error("Variance component '{component}' refers to group '{group}', which has no observations.")]
    UnknownGroup { component: String, group: String },

    #[error("Invalid covariance: {0}")]
    InvalidCovariance(String),

    #[error("The log-likelihood is not finite: {0}")]
    NonFiniteLikelihood(String),

    #[error("A linear system solve failed. The information matrix may be singular. Error: {0}")]
    LinearSystemSolveFailed(ndarray_linalg::error::LinalgError),

    #[error("Invalid fit configuration: {0}")]
    InvalidConfiguration(String),

    #[error("ML/REML optimization failed: {0}")]
    RemlOptimizationFailed(String),

    #[error("An internal error occurred during model layout: {0}")]
    LayoutError(String),
}

/// How an optimisation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    Converged,
    MaxIterationsReached,
    LineSearchFailed,
    Failed,
}

/// One objective evaluation, kept when `full_output` is requested.
///
/// The history is an evaluation log rather than a list of accepted iterates:
/// line-search trials appear in it too. An evaluation that failed records the
/// reason in `failure`, with `llf` and `gradient_norm` set to NaN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub evaluation: usize,
    pub llf: f64,
    pub gradient_norm: f64,
    pub params: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Settings for `MixedLm::fit`. Every field has a default, so a TOML file
/// only needs to name what it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    pub reml: bool,
    /// Convergence tolerance on the gradient norm.
    pub gtol: f64,
    pub max_iter: usize,
    /// Non-zero entries mark parameters that are estimated; the rest stay at
    /// their starting values.
    pub free: Option<MixedLmParams>,
    pub start_params: Option<MixedLmParams>,
    /// Keep a log of every objective evaluation in the results.
    pub full_output: bool,
    pub cov_penalty: Option<PenaltySpec>,
    pub fe_penalty: Option<PenaltySpec>,
    /// Turn a non-converged fit into `ConvergenceFailure` instead of a warning.
    pub require_convergence: bool,
    /// Warning categories silenced for the duration of the fit.
    pub suppress: Vec<DiagnosticCategory>,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            reml: true,
            gtol: 1e-6,
            max_iter: 200,
            free: None,
            start_params: None,
            full_output: false,
            cov_penalty: None,
            fe_penalty: None,
            require_convergence: false,
            suppress: Vec::new(),
        }
    }
}

impl FitOptions {
    pub fn from_toml_str(text: &str) -> Result<Self, ModelError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

/// The optimum reached by `optimize`, before results are assembled.
pub(crate) struct FitOutcome {
    pub evaluation: Evaluation,
    pub status: FitStatus,
    pub iterations: usize,
    pub evaluations: usize,
    pub failed_evaluations: usize,
    pub gradient_norm: f64,
    pub history: Option<Vec<IterationRecord>>,
}

/// Negative log-likelihood and its gradient as seen by the optimizer.
struct Objective<'a> {
    data: &'a ObservationSet,
    criterion: &'a Criterion,
    layout: ParamLayout,
    mask: Array1<f64>,
    profile: bool,
    full_output: bool,
    history: RefCell<Vec<IterationRecord>>,
    best: RefCell<Option<(f64, Array1<f64>)>>,
    evaluations: Cell<usize>,
    failures: Cell<usize>,
}

impl Objective<'_> {
    fn evaluate_at(&self, x: &Array1<f64>) -> Result<(Evaluation, Array1<f64>), EstimationError> {
        let params = self.layout.unpack(x)?;
        let eval = likelihood::evaluate(self.data, self.criterion, &params, self.profile)?;
        let score = eval.score(&self.layout)? * &self.mask;
        Ok((eval, score))
    }

    fn cost_and_grad(&self, x: &Array1<f64>) -> (f64, Array1<f64>) {
        let count = self.evaluations.get() + 1;
        self.evaluations.set(count);

        let failure = match self.evaluate_at(x) {
            Ok((eval, score)) if score.iter().all(|g| g.is_finite()) => {
                let llf = eval.loglike();
                let gradient_norm = score.dot(&score).sqrt();
                log::debug!("[eval {count:>4}] llf = {llf:.8}, |grad| = {gradient_norm:.3e}");
                if self.full_output {
                    self.history.borrow_mut().push(IterationRecord {
                        evaluation: count,
                        llf,
                        gradient_norm,
                        params: x.to_vec(),
                        failure: None,
                    });
                }
                let mut best = self.best.borrow_mut();
                if best.as_ref().is_none_or(|(b, _)| llf > *b) {
                    *best = Some((llf, x.clone()));
                }
                return (-llf, -score);
            }
            Ok(_) => "non-finite gradient".to_string(),
            Err(e) => e.to_string(),
        };

        self.failures.set(self.failures.get() + 1);
        let (emit, occurrence) = diagnostics::should_emit(&NONFINITE_COST_COUNT);
        if emit {
            log::warn!(
                "Objective could not be evaluated ({failure}); returning a large finite cost (occurrence {occurrence})."
            );
        }
        if self.full_output {
            self.history.borrow_mut().push(IterationRecord {
                evaluation: count,
                llf: f64::NAN,
                gradient_norm: f64::NAN,
                params: x.to_vec(),
                failure: Some(failure),
            });
        }
        // Push the search back toward the best point seen so far.
        let toward_best = match self.best.borrow().as_ref() {
            Some((_, best_x)) => (x - best_x) * &self.mask,
            None => Array1::zeros(x.len()),
        };
        (1e10, toward_best)
    }
}

fn validate(data: &ObservationSet, options: &FitOptions) -> Result<Criterion, EstimationError> {
    if !(options.gtol.is_finite() && options.gtol > 0.0) {
        return Err(EstimationError::InvalidConfiguration(format!(
            "gtol must be positive, got {}",
            options.gtol
        )));
    }
    if let Some(spec) = &options.fe_penalty {
        if spec.penalty == Penalty::L1 {
            return Err(EstimationError::InvalidPenalty(
                "the L1 penalty is not smooth; use fit_regularized".to_string(),
            ));
        }
    }
    Criterion::with_penalties(
        options.reml,
        options.cov_penalty.as_ref(),
        options.fe_penalty.as_ref(),
        data.k_fe(),
    )
}

/// Finds an evaluable starting point in packed coordinates.
fn starting_point(
    objective: &Objective<'_>,
    options: &FitOptions,
) -> Result<Array1<f64>, EstimationError> {
    if let Some(start) = &options.start_params {
        let x0 = objective.layout.pack(start)?;
        objective.evaluate_at(&x0)?;
        return Ok(x0);
    }
    let mut last_error = None;
    for candidate in seeding::start_candidates(objective.data)? {
        let x0 = objective.layout.pack(&candidate)?;
        match objective.evaluate_at(&x0) {
            Ok(_) => return Ok(x0),
            Err(e) => {
                log::debug!("Start candidate rejected: {e}");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        EstimationError::RemlOptimizationFailed("no starting point could be evaluated".to_string())
    }))
}

/// Runs BFGS on the criterion and classifies how it ended.
pub(crate) fn optimize(
    data: &ObservationSet,
    criterion: &Criterion,
    use_sqrt: bool,
    options: &FitOptions,
) -> Result<FitOutcome, EstimationError> {
    let profile = criterion.fe_penalty.is_none();
    let layout = ParamLayout::new(data.k_fe(), data.k_re(), data.k_vc(), use_sqrt, !profile);
    let mask = match &options.free {
        Some(free) => layout.pack_pattern(free)?,
        None => Array1::ones(layout.len()),
    };

    let objective = Objective {
        data,
        criterion,
        layout,
        mask,
        profile,
        full_output: options.full_output,
        history: RefCell::new(Vec::new()),
        best: RefCell::new(None),
        evaluations: Cell::new(0),
        failures: Cell::new(0),
    };
    let x0 = starting_point(&objective, options)?;
    log::info!(
        "Starting {} optimisation over {} parameters ({} groups, {} observations).",
        if criterion.reml { "REML" } else { "ML" },
        layout.len(),
        data.groups().len(),
        data.n_obs()
    );

    let (final_x, iterations, mut status) = if layout.is_empty() {
        (x0, 0, FitStatus::Converged)
    } else {
        let run = Bfgs::new(x0, |x: &Array1<f64>| objective.cost_and_grad(x))
            .with_tolerance(options.gtol)
            .with_max_iterations(options.max_iter)
            .run();
        match run {
            Ok(solution) => (solution.final_point, solution.iterations, FitStatus::Converged),
            Err(BfgsError::MaxIterationsReached { last_solution, .. }) => {
                let solution = *last_solution;
                (
                    solution.final_point,
                    solution.iterations,
                    FitStatus::MaxIterationsReached,
                )
            }
            Err(BfgsError::LineSearchFailed { last_solution, .. }) => {
                let solution = *last_solution;
                (
                    solution.final_point,
                    solution.iterations,
                    FitStatus::LineSearchFailed,
                )
            }
            Err(e) => {
                log::warn!("BFGS aborted: {e:?}. Falling back to the best point evaluated.");
                let best = objective.best.borrow().clone();
                match best {
                    // No solution was reported, so no iterations are counted.
                    Some((_, x)) => (x, 0, FitStatus::Failed),
                    None => {
                        return Err(EstimationError::RemlOptimizationFailed(format!(
                            "BFGS failed before any successful evaluation: {e:?}"
                        )));
                    }
                }
            }
        }
    };

    // The reported point may be a rejected trial; prefer the best evaluated one.
    let (evaluation, score) = match objective.evaluate_at(&final_x) {
        Ok(found) => found,
        Err(e) => {
            let best = objective.best.borrow().clone();
            let (_, best_x) = best.ok_or(e)?;
            status = FitStatus::Failed;
            objective.evaluate_at(&best_x)?
        }
    };
    let gradient_norm = score.dot(&score).sqrt();
    if status != FitStatus::Converged && gradient_norm <= options.gtol {
        status = FitStatus::Converged;
    }

    let evaluations = objective.evaluations.get();
    let failed_evaluations = objective.failures.get();
    log::info!(
        "Optimisation finished after {} iterations ({} evaluations, {} failed): status {:?}, llf {:.6}, |grad| {:.3e}.",
        iterations,
        evaluations,
        failed_evaluations,
        status,
        evaluation.loglike(),
        gradient_norm
    );
    if evaluation.n_fallback_groups() > 0 {
        log::info!(
            "{} groups used the dense covariance factorisation at the optimum.",
            evaluation.n_fallback_groups()
        );
    }

    if status != FitStatus::Converged {
        if options.require_convergence {
            return Err(EstimationError::ConvergenceFailure {
                iterations,
                gradient_norm,
            });
        }
        diagnostics::warn(
            DiagnosticCategory::Convergence,
            &format!(
                "The fit did not converge ({status:?}); gradient norm {gradient_norm:.3e} exceeds gtol {:.1e}. Results are from the best iterate.",
                options.gtol
            ),
        );
    }

    let history = options
        .full_output
        .then(|| objective.history.borrow().clone());
    Ok(FitOutcome {
        evaluation,
        status,
        iterations,
        evaluations,
        failed_evaluations,
        gradient_norm,
        history,
    })
}

/// Inverse negative curvature in natural coordinates, restricted to the
/// entries of `estimated`. Other rows and columns hold `fill`.
pub(crate) fn covariance_of_estimates(
    evaluation: &Evaluation,
    estimated: &[bool],
    fill: f64,
) -> Result<Array2<f64>, EstimationError> {
    let hess = evaluation.hessian_natural()?;
    let dim = hess.nrows();
    if estimated.len() != dim {
        return Err(EstimationError::DimensionMismatch {
            context: "length of the estimated-parameter pattern".to_string(),
            expected: dim,
            found: estimated.len(),
        });
    }
    let index: Vec<usize> = (0..dim).filter(|&i| estimated[i]).collect();
    let mut pcov = Array2::from_elem((dim, dim), fill);
    if index.is_empty() {
        return Ok(pcov);
    }
    let sub = Array2::from_shape_fn((index.len(), index.len()), |(a, b)| {
        -hess[[index[a], index[b]]]
    });
    match sub.inv() {
        Ok(inv) => {
            if inv.diag().iter().any(|&v| !(v.is_finite() && v >= 0.0)) {
                diagnostics::warn(
                    DiagnosticCategory::Hessian,
                    "The Hessian at the optimum is not negative definite; standard errors are unreliable.",
                );
            }
            for (a, &i) in index.iter().enumerate() {
                for (b, &j) in index.iter().enumerate() {
                    pcov[[i, j]] = inv[[a, b]];
                }
            }
        }
        Err(e) => {
            diagnostics::warn(
                DiagnosticCategory::Hessian,
                &format!(
                    "The Hessian at the optimum is singular ({e}); the covariance of the estimates is unavailable."
                ),
            );
            pcov.fill(f64::NAN);
        }
    }
    Ok(pcov)
}

/// Which natural coordinates `[fe, lower(cov_re), vcomp]` were estimated.
pub(crate) fn estimated_pattern(
    data: &ObservationSet,
    free: Option<&MixedLmParams>,
    profiled: bool,
) -> Result<Vec<bool>, EstimationError> {
    let layout = ParamLayout::new(data.k_fe(), data.k_re(), data.k_vc(), false, true);
    let mut pattern: Vec<bool> = match free {
        Some(free) => layout.pack_pattern(free)?.iter().map(|&v| v != 0.0).collect(),
        None => vec![true; layout.len()],
    };
    if profiled {
        for entry in pattern.iter_mut().take(data.k_fe()) {
            *entry = true;
        }
    }
    Ok(pattern)
}

/// Fits the model by maximising the ML or REML criterion.
pub fn fit(
    data: &ObservationSet,
    use_sqrt: bool,
    options: &FitOptions,
) -> Result<MixedLmResults, EstimationError> {
    let suppression = diagnostics::suppress(&options.suppress);
    let criterion = validate(data, options)?;
    let outcome = optimize(data, &criterion, use_sqrt, options)?;

    let profiled = outcome.evaluation.is_profiled();
    let pattern = estimated_pattern(data, options.free.as_ref(), profiled)?;
    let cov_params = covariance_of_estimates(&outcome.evaluation, &pattern, 0.0)?;
    let random_effects = inference::random_effects(&outcome.evaluation);
    let evaluation = &outcome.evaluation;

    let results = MixedLmResults {
        params: evaluation.params().clone(),
        scale: evaluation.scale(),
        llf: evaluation.loglike(),
        reml: options.reml,
        cov_penalty: options.cov_penalty.clone(),
        fe_penalty: options.fe_penalty.clone(),
        cov_params,
        status: outcome.status,
        iterations: outcome.iterations,
        evaluations: outcome.evaluations,
        failed_evaluations: outcome.failed_evaluations,
        n_fallback_groups: evaluation.n_fallback_groups(),
        gradient_norm: outcome.gradient_norm,
        history: outcome.history,
        random_effects,
        free: options.free.clone(),
        use_sqrt,
    };
    drop(suppression);
    Ok(results)
}
