//! Per-biomarker fixed-effect design and subject grouping.

use crate::data::columns::ColumnMapping;
use crate::data::table::{LongitudinalTable, Variable, VariableType};
use crate::data::time_basis::{BasisTerm, OnsetPolicy, PiecewiseTime, TimeBasisBuilder};
use crate::error::{CplmmError, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Name of the intercept column.
pub const INTERCEPT: &str = "(Intercept)";

/// Minimum number of subjects with repeated measurements.
const MIN_REPEATED_SUBJECTS: usize = 2;

/// Minimum visits for a subject to count as repeated.
const MIN_VISITS_PER_SUBJECT: usize = 2;

/// Subject-level random-effect structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RandomEffects {
    /// Random intercept per subject.
    #[default]
    Intercept,
    /// Correlated random intercept and slope on `years_since_onset`.
    InterceptAndSlope,
}

impl RandomEffects {
    /// Number of random effects per subject.
    pub fn n_terms(&self) -> usize {
        match self {
            Self::Intercept => 1,
            Self::InterceptAndSlope => 2,
        }
    }
}

/// Fixed and random structure shared by every biomarker of a panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSpec {
    /// Piecewise time terms, in column order.
    pub basis: Vec<BasisTerm>,
    /// Random-effect structure.
    pub random_effects: RandomEffects,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            basis: vec![BasisTerm::YearsSinceOnset, BasisTerm::PostOnset],
            random_effects: RandomEffects::Intercept,
        }
    }
}

impl ModelSpec {
    /// Model with the given piecewise terms and a random intercept.
    pub fn with_basis(basis: &[BasisTerm]) -> Self {
        Self {
            basis: basis.to_vec(),
            ..Self::default()
        }
    }

    /// Check the basis is non-empty and has no repeated term.
    pub fn validate(&self) -> Result<()> {
        if self.basis.is_empty() {
            return Err(CplmmError::InvalidParameter(
                "Model needs at least one piecewise time term".to_string(),
            ));
        }
        let distinct: BTreeSet<&str> = self.basis.iter().map(|t| t.name()).collect();
        if distinct.len() != self.basis.len() {
            return Err(CplmmError::InvalidParameter(format!(
                "Repeated piecewise time term in {:?}",
                self.basis
            )));
        }
        Ok(())
    }
}

/// Design for one biomarker: fixed effects, response and subject grouping.
///
/// Rows of one subject are contiguous and in time order.
#[derive(Debug, Clone)]
pub struct BiomarkerDesign {
    biomarker: String,
    matrix: DMatrix<f64>,
    response: DVector<f64>,
    coefficient_names: Vec<String>,
    group_ids: Vec<String>,
    group_rows: Vec<Vec<usize>>,
    slope: Vec<f64>,
    random_effects: RandomEffects,
    reference_levels: HashMap<String, String>,
}

impl BiomarkerDesign {
    /// Create a design directly from components.
    ///
    /// `groups` holds the subject id of every row; `slope` is the random-slope
    /// covariate per row (ignored for random intercepts).
    pub fn from_parts(
        biomarker: &str,
        matrix: DMatrix<f64>,
        response: Vec<f64>,
        coefficient_names: Vec<String>,
        groups: Vec<String>,
        slope: Vec<f64>,
        random_effects: RandomEffects,
    ) -> Result<Self> {
        let n = matrix.nrows();
        for len in [response.len(), groups.len(), slope.len()] {
            if len != n {
                return Err(CplmmError::DimensionMismatch {
                    expected: n,
                    actual: len,
                });
            }
        }
        if coefficient_names.len() != matrix.ncols() {
            return Err(CplmmError::DimensionMismatch {
                expected: matrix.ncols(),
                actual: coefficient_names.len(),
            });
        }

        let mut group_ids: Vec<String> = Vec::new();
        let mut group_rows: Vec<Vec<usize>> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (row, g) in groups.iter().enumerate() {
            let idx = *index.entry(g.as_str()).or_insert_with(|| {
                group_ids.push(g.clone());
                group_rows.push(Vec::new());
                group_ids.len() - 1
            });
            group_rows[idx].push(row);
        }

        Ok(Self {
            biomarker: biomarker.to_string(),
            matrix,
            response: DVector::from_vec(response),
            coefficient_names,
            group_ids,
            group_rows,
            slope,
            random_effects,
            reference_levels: HashMap::new(),
        })
    }

    /// Biomarker this design was built for.
    pub fn biomarker(&self) -> &str {
        &self.biomarker
    }

    /// Fixed-effect design matrix (rows × coefficients).
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Response vector.
    pub fn response(&self) -> &DVector<f64> {
        &self.response
    }

    /// Get coefficient names.
    pub fn coefficient_names(&self) -> &[String] {
        &self.coefficient_names
    }

    /// Get the index of a coefficient by name.
    pub fn coefficient_index(&self, name: &str) -> Option<usize> {
        self.coefficient_names.iter().position(|n| n == name)
    }

    /// Subject ids, one per group.
    pub fn group_ids(&self) -> &[String] {
        &self.group_ids
    }

    /// Row indices of each group.
    pub fn group_rows(&self) -> &[Vec<usize>] {
        &self.group_rows
    }

    /// Random-slope covariate per row.
    pub fn slope(&self) -> &[f64] {
        &self.slope
    }

    /// Random-effect structure.
    pub fn random_effects(&self) -> RandomEffects {
        self.random_effects
    }

    /// Number of observations (rows).
    pub fn n_observations(&self) -> usize {
        self.matrix.nrows()
    }

    /// Number of coefficients (columns).
    pub fn n_coefficients(&self) -> usize {
        self.matrix.ncols()
    }

    /// Number of subjects.
    pub fn n_groups(&self) -> usize {
        self.group_rows.len()
    }

    /// Get the reference level for a categorical covariate.
    pub fn reference_level(&self, variable: &str) -> Option<&str> {
        self.reference_levels.get(variable).map(|s| s.as_str())
    }
}

/// Builds [`BiomarkerDesign`]s from a shared table.
///
/// Column mapping and model are validated once at construction; the piecewise
/// basis of every subject is computed once and reused for all biomarkers.
/// Subjects whose anchor cannot be resolved (a converter without an onset)
/// are left out of every design.
pub struct DesignAssembler<'a> {
    table: &'a LongitudinalTable,
    covariates: &'a [String],
    model: &'a ModelSpec,
    bases: Vec<Option<Vec<PiecewiseTime>>>,
    excluded: Vec<String>,
}

impl<'a> DesignAssembler<'a> {
    pub fn new(
        table: &'a LongitudinalTable,
        mapping: &'a ColumnMapping,
        model: &'a ModelSpec,
        policy: OnsetPolicy,
    ) -> Result<Self> {
        mapping.validate_table(table)?;
        model.validate()?;

        let builder = TimeBasisBuilder::new(policy);
        let mut bases = Vec::with_capacity(table.n_subjects());
        let mut excluded = Vec::new();
        for subject in table.subjects() {
            match builder.for_subject(subject, table) {
                Ok(basis) => bases.push(Some(basis)),
                Err(CplmmError::InvalidTime(msg)) => {
                    log::debug!("{}", msg);
                    excluded.push(subject.id().to_string());
                    bases.push(None);
                }
                Err(other) => return Err(other),
            }
        }
        if !excluded.is_empty() {
            log::warn!(
                "Excluding {} subject(s) without a time anchor: {}",
                excluded.len(),
                excluded.join(", ")
            );
        }

        Ok(Self {
            table,
            covariates: &mapping.covariates,
            model,
            bases,
            excluded,
        })
    }

    /// Subjects left out of every design because their anchor is unresolved.
    pub fn excluded_subjects(&self) -> &[String] {
        &self.excluded
    }

    /// Assemble the design for one biomarker.
    ///
    /// Rows missing the response or any covariate are dropped for this
    /// biomarker only. Columns: basis terms, covariates (categoricals
    /// dummy-coded against their alphabetically first retained level),
    /// intercept.
    pub fn assemble(&self, biomarker: &str) -> Result<BiomarkerDesign> {
        match self.table.column_type(biomarker) {
            None => return Err(CplmmError::MissingColumn(biomarker.to_string())),
            Some(VariableType::Categorical) => {
                return Err(CplmmError::InvalidParameter(format!(
                    "Biomarker '{}' is not numeric",
                    biomarker
                )))
            }
            Some(VariableType::Continuous) => {}
        }

        // Retained (row, basis) pairs, grouped by subject.
        let mut retained: Vec<(usize, usize, PiecewiseTime)> = Vec::new();
        let mut repeated_subjects = 0;
        for (s_idx, subject) in self.table.subjects().iter().enumerate() {
            let Some(basis) = &self.bases[s_idx] else {
                continue;
            };
            let kept: Vec<(usize, usize)> = subject
                .rows()
                .iter()
                .enumerate()
                .filter(|(_, &row)| {
                    let obs = self.table.observation(row);
                    obs.value(biomarker).as_continuous().is_some_and(f64::is_finite)
                        && self.covariates.iter().all(|c| !obs.value(c).is_missing())
                })
                .map(|(pos, &row)| (pos, row))
                .collect();
            if kept.is_empty() {
                continue;
            }

            if kept.len() >= MIN_VISITS_PER_SUBJECT {
                repeated_subjects += 1;
            }
            retained.extend(kept.into_iter().map(|(pos, row)| (s_idx, row, basis[pos])));
        }

        if repeated_subjects < MIN_REPEATED_SUBJECTS {
            return Err(CplmmError::EmptyDesign {
                biomarker: biomarker.to_string(),
                reason: format!(
                    "{} subject(s) with at least {} observations, need {}",
                    repeated_subjects, MIN_VISITS_PER_SUBJECT, MIN_REPEATED_SUBJECTS
                ),
            });
        }

        let n = retained.len();
        let mut coefficient_names = Vec::new();
        let mut columns: Vec<Vec<f64>> = Vec::new();
        let mut reference_levels = HashMap::new();

        for term in &self.model.basis {
            coefficient_names.push(term.name().to_string());
            columns.push(retained.iter().map(|(_, _, b)| b.term(*term)).collect());
        }

        for covariate in self.covariates {
            let values: Vec<&Variable> = retained
                .iter()
                .map(|(_, row, _)| self.table.observation(*row).value(covariate))
                .collect();
            match self.table.column_type(covariate) {
                Some(VariableType::Continuous) => {
                    coefficient_names.push(covariate.clone());
                    columns.push(values.iter().map(|v| v.as_continuous().unwrap_or(0.0)).collect());
                }
                Some(VariableType::Categorical) | None => {
                    let levels: BTreeSet<&str> =
                        values.iter().filter_map(|v| v.as_categorical()).collect();
                    let mut levels = levels.into_iter();
                    if let Some(reference) = levels.next() {
                        reference_levels.insert(covariate.clone(), reference.to_string());
                    }
                    for level in levels {
                        coefficient_names.push(format!("{}{}", covariate, level));
                        columns.push(
                            values
                                .iter()
                                .map(|v| if v.as_categorical() == Some(level) { 1.0 } else { 0.0 })
                                .collect(),
                        );
                    }
                }
            }
        }

        coefficient_names.push(INTERCEPT.to_string());
        columns.push(vec![1.0; n]);

        let n_coef = columns.len();
        if n <= n_coef {
            return Err(CplmmError::EmptyDesign {
                biomarker: biomarker.to_string(),
                reason: format!("{} observations for {} fixed effects", n, n_coef),
            });
        }

        let matrix = DMatrix::from_fn(n, n_coef, |row, col| columns[col][row]);
        let response = retained
            .iter()
            .map(|(_, row, _)| {
                self.table
                    .observation(*row)
                    .value(biomarker)
                    .as_continuous()
                    .unwrap_or(f64::NAN)
            })
            .collect();
        let groups = retained
            .iter()
            .map(|(s_idx, _, _)| self.table.subjects()[*s_idx].id().to_string())
            .collect();
        let slope = retained.iter().map(|(_, _, b)| b.years_since_onset).collect();

        let mut design = BiomarkerDesign::from_parts(
            biomarker,
            matrix,
            response,
            coefficient_names,
            groups,
            slope,
            self.model.random_effects,
        )?;
        design.reference_levels = reference_levels;
        Ok(design)
    }
}
