//! # Observation Sets
//!
//! This module owns the immutable inputs of a mixed model: the response, the
//! fixed-effects design, the random-effects design, optional named variance
//! component designs, and the grouping of observations.
//!
//! - Groups are ordered by first appearance in the input and rows inside a
//!   group keep their input order, so every evaluation walks the data in the
//!   same sequence.
//! - When neither a random-effects design nor any variance component is
//!   supplied, a random intercept (a single column of ones) is used.
//! - Each group carries its combined random design `[Z_i | Zvc_i1 | Zvc_i2 ...]`
//!   so the likelihood code can treat shared covariance blocks and variance
//!   components uniformly.

use crate::estimate::EstimationError;
use ahash::AHashMap;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, concatenate};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Per-group design sub-matrices for one named variance component, keyed by
/// group label. Groups that are absent contribute no columns.
pub type VarianceComponentDesign = AHashMap<String, Array2<f64>>;

/// The observations belonging to one group, with their design rows.
#[derive(Debug, Clone)]
pub struct GroupData {
    pub label: String,
    /// Row indices into the original observation order.
    pub rows: Vec<usize>,
    pub endog: Array1<f64>,
    pub exog: Array2<f64>,
    /// Concatenation of the random-effects design and every variance component block.
    pub design: Array2<f64>,
    /// Number of design columns contributed by each variance component, in name order.
    pub vc_sizes: Vec<usize>,
}

impl GroupData {
    pub fn n_obs(&self) -> usize {
        self.endog.len()
    }
}

/// The validated, grouped observation set consumed by the likelihood engine.
#[derive(Debug, Clone)]
pub struct ObservationSet {
    endog: Array1<f64>,
    exog: Array2<f64>,
    exog_re: Array2<f64>,
    labels: Vec<String>,
    vc_names: Vec<String>,
    exog_vc: BTreeMap<String, VarianceComponentDesign>,
    groups: Vec<GroupData>,
    group_index: AHashMap<String, usize>,
}

/// Collects the optional parts of an observation set before validation.
pub struct ObservationSetBuilder {
    endog: Array1<f64>,
    exog: Array2<f64>,
    labels: Vec<String>,
    exog_re: Option<Array2<f64>>,
    exog_vc: BTreeMap<String, VarianceComponentDesign>,
}

impl ObservationSetBuilder {
    /// Sets the random-effects design. Each column gets its own row and
    /// column in `cov_re`.
    pub fn exog_re(mut self, exog_re: Array2<f64>) -> Self {
        self.exog_re = Some(exog_re);
        self
    }

    /// Adds a named variance component with one design block per group.
    pub fn variance_component(
        mut self,
        name: impl Into<String>,
        per_group: VarianceComponentDesign,
    ) -> Self {
        self.exog_vc.insert(name.into(), per_group);
        self
    }

    pub fn build(self) -> Result<ObservationSet, EstimationError> {
        let n = self.endog.len();
        if n == 0 {
            return Err(EstimationError::EmptyGroup);
        }
        if self.exog.nrows() != n {
            return Err(EstimationError::DimensionMismatch {
                context: "rows of the fixed-effects design".to_string(),
                expected: n,
                found: self.exog.nrows(),
            });
        }
        if self.labels.len() != n {
            return Err(EstimationError::DimensionMismatch {
                context: "length of the group vector".to_string(),
                expected: n,
                found: self.labels.len(),
            });
        }

        let exog_re = match self.exog_re {
            Some(z) => z,
            None if self.exog_vc.is_empty() => Array2::ones((n, 1)),
            None => Array2::zeros((n, 0)),
        };
        if exog_re.nrows() != n {
            return Err(EstimationError::DimensionMismatch {
                context: "rows of the random-effects design".to_string(),
                expected: n,
                found: exog_re.nrows(),
            });
        }

        ObservationSet::assemble(self.endog, self.exog, exog_re, self.labels, self.exog_vc)
    }
}

impl ObservationSet {
    /// Starts building an observation set from the response, the fixed-effects
    /// design and one group label per observation.
    pub fn builder<G: ToString>(
        endog: Array1<f64>,
        exog: Array2<f64>,
        groups: &[G],
    ) -> ObservationSetBuilder {
        ObservationSetBuilder {
            endog,
            exog,
            labels: groups.iter().map(ToString::to_string).collect(),
            exog_re: None,
            exog_vc: BTreeMap::new(),
        }
    }

    fn assemble(
        endog: Array1<f64>,
        exog: Array2<f64>,
        exog_re: Array2<f64>,
        labels: Vec<String>,
        exog_vc: BTreeMap<String, VarianceComponentDesign>,
    ) -> Result<Self, EstimationError> {
        let mut group_index: AHashMap<String, usize> = AHashMap::new();
        let mut members: Vec<(String, Vec<usize>)> = Vec::new();
        for (row, label) in labels.iter().enumerate() {
            let next = members.len();
            let ix = *group_index.entry(label.clone()).or_insert(next);
            if ix == next {
                members.push((label.clone(), Vec::new()));
            }
            members[ix].1.push(row);
        }

        for (name, per_group) in &exog_vc {
            for label in per_group.keys() {
                if !group_index.contains_key(label) {
                    return Err(EstimationError::UnknownGroup {
                        component: name.clone(),
                        group: label.clone(),
                    });
                }
            }
        }

        let vc_names: Vec<String> = exog_vc.keys().cloned().collect();
        let mut groups = Vec::with_capacity(members.len());
        for (label, rows) in members {
            let group_endog = endog.select(Axis(0), &rows);
            let group_exog = exog.select(Axis(0), &rows);
            let group_re = exog_re.select(Axis(0), &rows);

            let mut blocks: Vec<Array2<f64>> = vec![group_re];
            let mut vc_sizes = Vec::with_capacity(vc_names.len());
            for name in &vc_names {
                match exog_vc[name].get(&label) {
                    Some(block) => {
                        if block.nrows() != rows.len() {
                            return Err(EstimationError::DimensionMismatch {
                                context: format!(
                                    "rows of variance component '{name}' for group '{label}'"
                                ),
                                expected: rows.len(),
                                found: block.nrows(),
                            });
                        }
                        vc_sizes.push(block.ncols());
                        blocks.push(block.clone());
                    }
                    None => vc_sizes.push(0),
                }
            }
            let views: Vec<ArrayView2<f64>> = blocks.iter().map(|b| b.view()).collect();
            let design = concatenate(Axis(1), &views).map_err(|e| {
                EstimationError::LayoutError(format!(
                    "failed to assemble the random design for group '{label}': {e}"
                ))
            })?;

            groups.push(GroupData {
                label,
                rows,
                endog: group_endog,
                exog: group_exog,
                design,
                vc_sizes,
            });
        }

        Ok(Self {
            endog,
            exog,
            exog_re,
            labels,
            vc_names,
            exog_vc,
            groups,
            group_index,
        })
    }

    pub fn n_obs(&self) -> usize {
        self.endog.len()
    }

    pub fn k_fe(&self) -> usize {
        self.exog.ncols()
    }

    pub fn k_re(&self) -> usize {
        self.exog_re.ncols()
    }

    pub fn k_vc(&self) -> usize {
        self.vc_names.len()
    }

    pub fn endog(&self) -> ArrayView1<'_, f64> {
        self.endog.view()
    }

    pub fn exog(&self) -> ArrayView2<'_, f64> {
        self.exog.view()
    }

    pub fn exog_re(&self) -> ArrayView2<'_, f64> {
        self.exog_re.view()
    }

    pub fn vc_names(&self) -> &[String] {
        &self.vc_names
    }

    pub fn groups(&self) -> &[GroupData] {
        &self.groups
    }

    /// Group labels in evaluation order (first appearance in the input).
    pub fn group_labels(&self) -> Vec<&str> {
        self.groups.iter().map(|g| g.label.as_str()).collect()
    }

    /// Rows of the original input that belong to `label`.
    pub fn row_indices(&self, label: &str) -> Option<&[usize]> {
        self.group_index
            .get(label)
            .map(|&ix| self.groups[ix].rows.as_slice())
    }

    /// Returns a copy whose random-effects design columns are reordered by
    /// `order`, so column `j` of the result is column `order[j]` of `self`.
    pub fn permute_re(&self, order: &[usize]) -> Result<Self, EstimationError> {
        let k_re = self.k_re();
        let mut seen = vec![false; k_re];
        if order.len() != k_re {
            return Err(EstimationError::DimensionMismatch {
                context: "length of the random-effects permutation".to_string(),
                expected: k_re,
                found: order.len(),
            });
        }
        for &j in order {
            if j >= k_re || seen[j] {
                return Err(EstimationError::LayoutError(format!(
                    "{order:?} is not a permutation of the {k_re} random-effects columns"
                )));
            }
            seen[j] = true;
        }
        let exog_re = self.exog_re.select(Axis(1), order);
        Self::assemble(
            self.endog.clone(),
            self.exog.clone(),
            exog_re,
            self.labels.clone(),
            self.exog_vc.clone(),
        )
    }
}

/// A comprehensive error type for loading observation sets from disk.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to read CSV input: {0}")]
    CsvError(#[from] csv::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error("Row {row}, column '{column}': '{value}' is not a number.")]
    NotNumeric {
        row: usize,
        column: String,
        value: String,
    },
    #[error("The input file must contain at least one 'exog_fe*' column.")]
    NoFixedEffects,
    #[error("The observations could not be assembled into a model: {0}")]
    InvalidObservations(#[from] EstimationError),
}

/// Loads an observation set from a CSV file with the columns `endog`,
/// `groups`, `exog_fe*` and optionally `exog_re*`.
///
/// The group column is kept as text, so `1` and `1.0` name different groups.
pub fn load_csv(path: impl AsRef<Path>) -> Result<ObservationSet, DataError> {
    let mut reader = csv::Reader::from_path(path.as_ref())?;
    let headers = reader.headers()?.clone();

    let find = |name: &str| -> Result<usize, DataError> {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| DataError::ColumnNotFound(name.to_string()))
    };
    let endog_col = find("endog")?;
    let groups_col = find("groups")?;
    let fe_cols: Vec<usize> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| h.trim().starts_with("exog_fe"))
        .map(|(i, _)| i)
        .collect();
    let re_cols: Vec<usize> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| h.trim().starts_with("exog_re"))
        .map(|(i, _)| i)
        .collect();
    if fe_cols.is_empty() {
        return Err(DataError::NoFixedEffects);
    }

    let mut endog = Vec::new();
    let mut labels = Vec::new();
    let mut fe_values = Vec::new();
    let mut re_values = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let parse = |col: usize| -> Result<f64, DataError> {
            let raw = record.get(col).unwrap_or("").trim();
            raw.parse::<f64>().map_err(|_| DataError::NotNumeric {
                row: row + 1,
                column: headers.get(col).unwrap_or("?").to_string(),
                value: raw.to_string(),
            })
        };
        endog.push(parse(endog_col)?);
        labels.push(record.get(groups_col).unwrap_or("").trim().to_string());
        for &c in &fe_cols {
            fe_values.push(parse(c)?);
        }
        for &c in &re_cols {
            re_values.push(parse(c)?);
        }
    }

    let n = endog.len();
    let exog = Array2::from_shape_vec((n, fe_cols.len()), fe_values)
        .map_err(|e| EstimationError::LayoutError(e.to_string()))?;
    let mut builder = ObservationSet::builder(Array1::from_vec(endog), exog, &labels);
    if !re_cols.is_empty() {
        let exog_re = Array2::from_shape_vec((n, re_cols.len()), re_values)
            .map_err(|e| EstimationError::LayoutError(e.to_string()))?;
        builder = builder.exog_re(exog_re);
    }
    log::info!(
        "Loaded {} observations with {} fixed and {} random-effects columns.",
        n,
        fe_cols.len(),
        re_cols.len().max(1)
    );
    Ok(builder.build()?)
}
