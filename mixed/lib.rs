#![deny(unused_variables)]

//! Likelihood engine for linear mixed-effects models.
//!
//! The crate fits models of the form `y_i = X_i β + Z_i b_i + ε_i` where
//! observations are partitioned into independent groups. Random effects are
//! described either by a shared covariance block (`cov_re`) or by named scalar
//! variance components, and both run through the same likelihood machinery.

pub mod data;
pub mod diagnostics;
pub mod estimate;
pub mod inference;
pub mod likelihood;
pub mod marginal;
pub mod model;
pub mod params;
pub mod penalty;
pub mod regularize;
pub mod seeding;

pub use data::{ObservationSet, VarianceComponentDesign};
pub use estimate::{EstimationError, FitOptions, FitStatus, IterationRecord};
pub use inference::{GroupRandomEffects, ProfileOptions, ProfilePoint};
pub use likelihood::Criterion;
pub use model::{MixedLm, MixedLmResults, ModelError};
pub use params::{MixedLmParams, ParamLayout};
pub use penalty::{Penalty, PenaltySpec, PenaltyWeight};
pub use regularize::{RegularizationOptions, RegularizationPathPoint};
