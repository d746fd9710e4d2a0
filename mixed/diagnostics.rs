//! Diagnostics for mixed-model fitting
//!
//! Two concerns live here:
//!
//! 1. Warning control. Fallback and convergence warnings are rate-limited with
//!    atomic counters so a fit over thousands of groups does not flood the log,
//!    and whole categories can be silenced for the duration of a call with a
//!    scoped guard that restores the previous state on every exit path.
//!
//! 2. Derivative checks. Central finite differences of the log-likelihood
//!    verify the analytic score and Hessian.

use crate::estimate::EstimationError;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

// =============================================================================
// Rate-Limited Warnings
// =============================================================================

/// Print interval for rate-limited diagnostics
pub const DIAG_PRINT_INTERVAL: usize = 50;

pub static SINGULAR_FALLBACK_COUNT: AtomicUsize = AtomicUsize::new(0);
pub static NONFINITE_COST_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Returns (should_print, count): prints on first occurrence, then every DIAG_PRINT_INTERVAL
pub fn should_emit(counter: &AtomicUsize) -> (bool, usize) {
    let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
    let should_print = count == 1 || count % DIAG_PRINT_INTERVAL == 0;
    (should_print, count)
}

/// Approximate floating-point equality.
pub fn approx_f64(a: f64, b: f64, rel: f64, abs: f64) -> bool {
    (a - b).abs() <= abs + rel * a.abs().max(b.abs())
}

// =============================================================================
// Scoped Suppression
// =============================================================================

/// A class of warnings that can be silenced for the duration of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticCategory {
    /// The optimizer stopped before meeting its gradient tolerance.
    Convergence,
    /// A group fell back from the low-rank solve to a dense factorisation.
    SingularFallback,
    /// The Hessian at the optimum was not negative definite.
    Hessian,
}

impl DiagnosticCategory {
    fn bit(self) -> u8 {
        match self {
            DiagnosticCategory::Convergence => 1,
            DiagnosticCategory::SingularFallback => 2,
            DiagnosticCategory::Hessian => 4,
        }
    }
}

thread_local! {
    static SUPPRESSED: Cell<u8> = const { Cell::new(0) };
}

/// Restores the previous suppression state when dropped.
#[must_use = "suppression ends when the guard is dropped"]
pub struct SuppressionGuard {
    previous: u8,
}

impl Drop for SuppressionGuard {
    fn drop(&mut self) {
        SUPPRESSED.with(|s| s.set(self.previous));
    }
}

/// Silences the given categories on this thread until the guard is dropped.
pub fn suppress(categories: &[DiagnosticCategory]) -> SuppressionGuard {
    let added = categories.iter().fold(0u8, |acc, c| acc | c.bit());
    let previous = SUPPRESSED.with(|s| {
        let previous = s.get();
        s.set(previous | added);
        previous
    });
    SuppressionGuard { previous }
}

pub fn is_suppressed(category: DiagnosticCategory) -> bool {
    SUPPRESSED.with(|s| s.get() & category.bit() != 0)
}

/// Logs a warning unless its category is suppressed on this thread.
pub fn warn(category: DiagnosticCategory, message: &str) {
    if !is_suppressed(category) {
        log::warn!("{message}");
    }
}

// =============================================================================
// Finite-Difference Checks
// =============================================================================

/// Central-difference gradient of `f` at `x`, with steps scaled to `|x_j|`.
pub fn finite_difference_gradient<F>(f: F, x: &Array1<f64>) -> Result<Array1<f64>, EstimationError>
where
    F: Fn(&Array1<f64>) -> Result<f64, EstimationError>,
{
    let mut grad = Array1::zeros(x.len());
    for j in 0..x.len() {
        let h = 1e-5 * x[j].abs().max(1.0);
        let mut up = x.clone();
        let mut dn = x.clone();
        up[j] += h;
        dn[j] -= h;
        grad[j] = (f(&up)? - f(&dn)?) / (2.0 * h);
    }
    Ok(grad)
}

/// Central-difference Hessian of `f` at `x`, symmetrised.
pub fn finite_difference_hessian<F>(f: F, x: &Array1<f64>) -> Result<Array2<f64>, EstimationError>
where
    F: Fn(&Array1<f64>) -> Result<f64, EstimationError>,
{
    let k = x.len();
    let steps: Vec<f64> = x.iter().map(|v| 1e-4 * v.abs().max(1.0)).collect();
    let mut hess = Array2::zeros((k, k));
    let at = |i: usize, si: f64, j: usize, sj: f64| -> Result<f64, EstimationError> {
        let mut p = x.clone();
        p[i] += si * steps[i];
        p[j] += sj * steps[j];
        f(&p)
    };
    for i in 0..k {
        for j in 0..=i {
            let value = (at(i, 1.0, j, 1.0)? - at(i, 1.0, j, -1.0)? - at(i, -1.0, j, 1.0)?
                + at(i, -1.0, j, -1.0)?)
                / (4.0 * steps[i] * steps[j]);
            hess[[i, j]] = value;
            hess[[j, i]] = value;
        }
    }
    Ok(hess)
}

/// Largest discrepancy between an analytic and a numerical derivative.
#[derive(Clone, Debug)]
pub struct GradientCheck {
    pub max_abs_error: f64,
    pub max_rel_error: f64,
    pub worst_index: usize,
    pub passed: bool,
}

impl fmt::Display for GradientCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] max |err| = {:.3e}, max rel err = {:.3e} (coordinate {})",
            if self.passed { "OK" } else { "MISMATCH" },
            self.max_abs_error,
            self.max_rel_error,
            self.worst_index
        )
    }
}

/// Compares two derivative arrays elementwise with `approx_f64` tolerances.
pub fn compare_gradients(analytic: &[f64], numeric: &[f64], rel: f64, abs: f64) -> GradientCheck {
    let mut check = GradientCheck {
        max_abs_error: 0.0,
        max_rel_error: 0.0,
        worst_index: 0,
        passed: analytic.len() == numeric.len(),
    };
    for (i, (&a, &n)) in analytic.iter().zip(numeric.iter()).enumerate() {
        let err = (a - n).abs();
        let rel_err = err / a.abs().max(n.abs()).max(f64::MIN_POSITIVE);
        if err > check.max_abs_error {
            check.max_abs_error = err;
            check.worst_index = i;
        }
        check.max_rel_error = check.max_rel_error.max(rel_err);
        if !approx_f64(a, n, rel, abs) {
            check.passed = false;
        }
    }
    check
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn suppression_is_scoped_and_nested() {
        assert!(!is_suppressed(DiagnosticCategory::Convergence));
        {
            let outer = suppress(&[DiagnosticCategory::Convergence]);
            {
                let inner = suppress(&[DiagnosticCategory::Hessian]);
                assert!(is_suppressed(DiagnosticCategory::Convergence));
                assert!(is_suppressed(DiagnosticCategory::Hessian));
                drop(inner);
            }
            assert!(is_suppressed(DiagnosticCategory::Convergence));
            assert!(!is_suppressed(DiagnosticCategory::Hessian));
            drop(outer);
        }
        assert!(!is_suppressed(DiagnosticCategory::Convergence));
    }

    #[test]
    fn suppression_is_restored_when_unwinding() {
        let result = std::panic::catch_unwind(|| {
            let guard = suppress(&[DiagnosticCategory::SingularFallback]);
            assert!(is_suppressed(DiagnosticCategory::SingularFallback));
            panic!("abort while suppressed {}", guard.previous);
        });
        assert!(result.is_err());
        assert!(!is_suppressed(DiagnosticCategory::SingularFallback));
    }

    #[test]
    fn rate_limiter_emits_first_and_every_interval() {
        let counter = AtomicUsize::new(0);
        let emitted: Vec<usize> = (0..120)
            .filter_map(|_| match should_emit(&counter) {
                (true, n) => Some(n),
                (false, _) => None,
            })
            .collect();
        assert_eq!(emitted, vec![1, 50, 100]);
    }

    #[test]
    fn finite_differences_of_a_quadratic() {
        let f = |x: &Array1<f64>| -> Result<f64, EstimationError> {
            Ok(x[0] * x[0] + 3.0 * x[0] * x[1] - 2.0 * x[1] * x[1])
        };
        let x = array![0.5, -1.5];
        let g = finite_difference_gradient(f, &x).unwrap();
        let check = compare_gradients(
            &[2.0 * 0.5 + 3.0 * -1.5, 3.0 * 0.5 + 6.0],
            g.as_slice().unwrap(),
            1e-6,
            1e-8,
        );
        assert!(check.passed, "{check}");
        let h = finite_difference_hessian(f, &x).unwrap();
        let check = compare_gradients(&[2.0, 3.0, 3.0, -4.0], h.as_slice().unwrap(), 1e-5, 1e-6);
        assert!(check.passed, "{check}");
    }
}
