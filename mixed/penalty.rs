//! Penalties on the covariance structure and on the fixed effects.

use crate::estimate::EstimationError;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// The family of a penalty.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Penalty {
    /// `Σ w_j |β_j|`, fitted by coordinate descent.
    L1,
    /// `Σ w_j β_j²`.
    L2,
    /// `Σ w_j δ² (sqrt(1 + (β_j/δ)²) - 1)`.
    PseudoHuber { delta: f64 },
    /// Rewards `log|cov_re|`, keeping the random-effects covariance positive definite.
    Psd,
}

/// A scalar weight applied uniformly, or one weight per fixed-effects coefficient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PenaltyWeight {
    Scalar(f64),
    PerCoefficient(Vec<f64>),
}

impl From<f64> for PenaltyWeight {
    fn from(w: f64) -> Self {
        PenaltyWeight::Scalar(w)
    }
}

impl From<Vec<f64>> for PenaltyWeight {
    fn from(w: Vec<f64>) -> Self {
        PenaltyWeight::PerCoefficient(w)
    }
}

impl From<Array1<f64>> for PenaltyWeight {
    fn from(w: Array1<f64>) -> Self {
        PenaltyWeight::PerCoefficient(w.to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PenaltySpec {
    pub penalty: Penalty,
    pub weight: PenaltyWeight,
}

impl PenaltySpec {
    pub fn psd(weight: f64) -> Self {
        Self {
            penalty: Penalty::Psd,
            weight: PenaltyWeight::Scalar(weight),
        }
    }

    pub fn l1(weight: impl Into<PenaltyWeight>) -> Self {
        Self {
            penalty: Penalty::L1,
            weight: weight.into(),
        }
    }

    pub fn l2(weight: impl Into<PenaltyWeight>) -> Self {
        Self {
            penalty: Penalty::L2,
            weight: weight.into(),
        }
    }

    pub fn pseudo_huber(delta: f64, weight: impl Into<PenaltyWeight>) -> Self {
        Self {
            penalty: Penalty::PseudoHuber { delta },
            weight: weight.into(),
        }
    }

    /// Validates a covariance penalty. A zero weight resolves to no penalty.
    pub fn resolve_cov(&self) -> Result<Option<PsdPenalty>, EstimationError> {
        if self.penalty != Penalty::Psd {
            return Err(EstimationError::InvalidPenalty(format!(
                "{:?} cannot be applied to the random-effects covariance; only the PSD penalty can",
                self.penalty
            )));
        }
        let weight = match self.weight {
            PenaltyWeight::Scalar(w) => w,
            PenaltyWeight::PerCoefficient(_) => {
                return Err(EstimationError::InvalidPenalty(
                    "the PSD penalty takes a single scalar weight".to_string(),
                ));
            }
        };
        if !weight.is_finite() || weight < 0.0 {
            return Err(EstimationError::InvalidPenalty(format!(
                "the PSD penalty weight must be finite and non-negative, got {weight}"
            )));
        }
        Ok((weight > 0.0).then_some(PsdPenalty { weight }))
    }

    /// Validates a fixed-effects penalty for a model with `k_fe` coefficients.
    pub fn resolve_fe(&self, k_fe: usize) -> Result<FePenalty, EstimationError> {
        match self.penalty {
            Penalty::Psd => {
                return Err(EstimationError::InvalidPenalty(
                    "the PSD penalty applies to the covariance, not the fixed effects".to_string(),
                ));
            }
            Penalty::PseudoHuber { delta } if !(delta.is_finite() && delta > 0.0) => {
                return Err(EstimationError::InvalidPenalty(format!(
                    "the pseudo-Huber delta must be positive, got {delta}"
                )));
            }
            _ => {}
        }
        let weights = match &self.weight {
            PenaltyWeight::Scalar(w) => Array1::from_elem(k_fe, *w),
            PenaltyWeight::PerCoefficient(w) => {
                if w.len() != k_fe {
                    return Err(EstimationError::DimensionMismatch {
                        context: "length of the penalty weight vector".to_string(),
                        expected: k_fe,
                        found: w.len(),
                    });
                }
                Array1::from_vec(w.clone())
            }
        };
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(EstimationError::InvalidPenalty(
                "penalty weights must be finite and non-negative".to_string(),
            ));
        }
        Ok(FePenalty {
            penalty: self.penalty,
            weights,
        })
    }
}

/// A resolved covariance penalty: `+ weight · log|cov_re|` in the log-likelihood.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PsdPenalty {
    pub weight: f64,
}

/// A resolved fixed-effects penalty with one weight per coefficient.
#[derive(Debug, Clone, PartialEq)]
pub struct FePenalty {
    pub penalty: Penalty,
    pub weights: Array1<f64>,
}

impl FePenalty {
    pub fn is_smooth(&self) -> bool {
        !matches!(self.penalty, Penalty::L1)
    }

    pub fn value(&self, beta: &Array1<f64>) -> f64 {
        beta.iter()
            .zip(self.weights.iter())
            .map(|(&b, &w)| match self.penalty {
                Penalty::L1 => w * b.abs(),
                Penalty::L2 => w * b * b,
                Penalty::PseudoHuber { delta } => {
                    w * delta * delta * ((1.0 + (b / delta).powi(2)).sqrt() - 1.0)
                }
                Penalty::Psd => 0.0,
            })
            .sum()
    }

    /// Gradient of `value`. For L1 this is a subgradient that is zero at the kink.
    pub fn gradient(&self, beta: &Array1<f64>) -> Array1<f64> {
        Array1::from_shape_fn(beta.len(), |j| {
            let (b, w) = (beta[j], self.weights[j]);
            match self.penalty {
                Penalty::L1 if b == 0.0 => 0.0,
                Penalty::L1 => w * b.signum(),
                Penalty::L2 => 2.0 * w * b,
                Penalty::PseudoHuber { delta } => w * b / (1.0 + (b / delta).powi(2)).sqrt(),
                Penalty::Psd => 0.0,
            }
        })
    }

    /// Diagonal of the Hessian of `value`.
    pub fn hessian_diag(&self, beta: &Array1<f64>) -> Array1<f64> {
        Array1::from_shape_fn(beta.len(), |j| {
            let (b, w) = (beta[j], self.weights[j]);
            match self.penalty {
                Penalty::L2 => 2.0 * w,
                Penalty::PseudoHuber { delta } => w * (1.0 + (b / delta).powi(2)).powf(-1.5),
                Penalty::L1 | Penalty::Psd => 0.0,
            }
        })
    }
}
