//! Longitudinal observation table.
//!
//! One row per (subject, visit). The subject, time, status and onset roles are
//! resolved through a [`ColumnMapping`]; every other column is kept as a typed
//! value column (biomarker or covariate).

use crate::data::columns::ColumnMapping;
use crate::data::subject::{Cohort, Subject};
use crate::error::{CplmmError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

/// A cell value that can be categorical, continuous, or missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Variable {
    /// Categorical variable with string levels.
    Categorical(String),
    /// Continuous numeric variable.
    Continuous(f64),
    /// Missing value.
    Missing,
}

impl Variable {
    /// Check if this is a missing value.
    pub fn is_missing(&self) -> bool {
        matches!(self, Variable::Missing)
    }

    /// Try to get as categorical string.
    pub fn as_categorical(&self) -> Option<&str> {
        match self {
            Variable::Categorical(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as continuous f64.
    pub fn as_continuous(&self) -> Option<f64> {
        match self {
            Variable::Continuous(v) => Some(*v),
            _ => None,
        }
    }
}

/// Column type, inferred at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableType {
    Categorical,
    Continuous,
}

/// Clinical status at a visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Normal,
    Abnormal,
}

impl Status {
    /// Classify a raw label; anything other than the normal label is abnormal.
    pub fn from_label(label: &str, normal_label: &str) -> Self {
        if label.trim() == normal_label {
            Status::Normal
        } else {
            Status::Abnormal
        }
    }
}

/// A single visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Subject identifier.
    pub subject_id: String,
    /// Age (or any comparable time scale) at collection.
    pub time: f64,
    /// Status at this visit.
    pub status: Status,
    /// Onset anchor recorded for the subject, if any.
    pub onset: Option<f64>,
    /// Biomarker and covariate cells by column name.
    pub values: BTreeMap<String, Variable>,
}

impl Observation {
    /// Create an observation with no value cells.
    pub fn new(subject_id: &str, time: f64, status: Status, onset: Option<f64>) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            time,
            status,
            onset,
            values: BTreeMap::new(),
        }
    }

    /// Add a value cell.
    pub fn with_value(mut self, column: &str, value: Variable) -> Self {
        self.values.insert(column.to_string(), value);
        self
    }

    /// Get a cell, treating absent cells as missing.
    pub fn value(&self, column: &str) -> &Variable {
        self.values.get(column).unwrap_or(&Variable::Missing)
    }
}

/// Read-only longitudinal table shared by every biomarker fit.
#[derive(Debug, Clone)]
pub struct LongitudinalTable {
    observations: Vec<Observation>,
    column_names: Vec<String>,
    column_types: HashMap<String, VariableType>,
    subjects: Vec<Subject>,
}

fn is_missing_token(raw: &str) -> bool {
    matches!(raw, "" | "NA" | "na" | "NaN" | "nan")
}

impl LongitudinalTable {
    /// Build a table from observations.
    ///
    /// Value columns are the union of the observations' cells in first-seen
    /// order (cells within an observation are name-ordered). A column is
    /// continuous when every present cell is continuous.
    /// Fails on non-finite times, inconsistent onset anchors within a subject,
    /// or a status trajectory that reverts from abnormal to normal.
    pub fn new(observations: Vec<Observation>) -> Result<Self> {
        Self::build(observations, None)
    }

    fn build(observations: Vec<Observation>, column_order: Option<Vec<String>>) -> Result<Self> {
        if observations.is_empty() {
            return Err(CplmmError::InvalidParameter(
                "Longitudinal table has no observations".to_string(),
            ));
        }

        for (row, obs) in observations.iter().enumerate() {
            if !obs.time.is_finite() {
                return Err(CplmmError::InvalidTime(format!(
                    "non-finite time {} at row {} (subject '{}')",
                    obs.time, row, obs.subject_id
                )));
            }
        }

        let column_names = match column_order {
            Some(order) => order,
            None => {
                let mut names: Vec<String> = Vec::new();
                let mut seen = HashSet::new();
                for obs in &observations {
                    for name in obs.values.keys() {
                        if seen.insert(name.clone()) {
                            names.push(name.clone());
                        }
                    }
                }
                names
            }
        };

        let mut column_types = HashMap::new();
        for name in &column_names {
            let all_numeric = observations.iter().all(|obs| {
                matches!(obs.value(name), Variable::Continuous(_) | Variable::Missing)
            });
            let var_type = if all_numeric {
                VariableType::Continuous
            } else {
                VariableType::Categorical
            };
            column_types.insert(name.clone(), var_type);
        }

        // Group rows by subject in first-appearance order.
        let mut order: Vec<String> = Vec::new();
        let mut rows_by_subject: HashMap<String, Vec<usize>> = HashMap::new();
        for (row, obs) in observations.iter().enumerate() {
            rows_by_subject
                .entry(obs.subject_id.clone())
                .or_insert_with(|| {
                    order.push(obs.subject_id.clone());
                    Vec::new()
                })
                .push(row);
        }

        let subjects = order
            .into_iter()
            .map(|id| {
                let rows = rows_by_subject.remove(&id).unwrap_or_default();
                Subject::from_rows(id, rows, &observations)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            observations,
            column_names,
            column_types,
            subjects,
        })
    }

    /// Load a tab-separated table, resolving roles through `mapping`.
    ///
    /// Missing cells are empty, `NA`, `na`, `NaN` or `nan`. Time cells must be
    /// numeric; onset cells may be missing.
    pub fn from_tsv<P: AsRef<Path>>(path: P, mapping: &ColumnMapping) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .flexible(true)
            .from_path(path)?;

        let header: Vec<String> = reader.headers()?.iter().map(|s| s.trim().to_string()).collect();
        mapping.validate_header(&header)?;

        let position = |name: &str| header.iter().position(|h| h == name);
        let subject_idx = position(&mapping.subject)
            .ok_or_else(|| CplmmError::MissingColumn(mapping.subject.clone()))?;
        let time_idx = position(&mapping.time)
            .ok_or_else(|| CplmmError::MissingColumn(mapping.time.clone()))?;
        let status_idx = position(&mapping.status)
            .ok_or_else(|| CplmmError::MissingColumn(mapping.status.clone()))?;
        let onset_idx = match &mapping.onset {
            Some(name) => Some(position(name).ok_or_else(|| CplmmError::MissingColumn(name.clone()))?),
            None => None,
        };
        let role_indices: HashSet<usize> = [Some(subject_idx), Some(time_idx), Some(status_idx), onset_idx]
            .into_iter()
            .flatten()
            .collect();
        let value_columns: Vec<(usize, &String)> = header
            .iter()
            .enumerate()
            .filter(|(i, _)| !role_indices.contains(i))
            .collect();

        // First pass: raw strings, so column types can be inferred like a whole column.
        let mut raw_rows: Vec<(String, f64, Status, Option<f64>, Vec<String>)> = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            let field = |i: usize| record.get(i).map(str::trim).unwrap_or("");

            let subject = field(subject_idx);
            if subject.is_empty() {
                return Err(CplmmError::InvalidParameter(format!(
                    "Missing subject id at data row {}",
                    row + 1
                )));
            }

            let time_raw = field(time_idx);
            let time = time_raw.parse::<f64>().map_err(|_| {
                CplmmError::InvalidTime(format!(
                    "time '{}' at data row {} is not numeric",
                    time_raw,
                    row + 1
                ))
            })?;

            let status_raw = field(status_idx);
            if status_raw.is_empty() {
                return Err(CplmmError::InvalidParameter(format!(
                    "Missing status at data row {}",
                    row + 1
                )));
            }
            let status = Status::from_label(status_raw, &mapping.normal_label);

            let onset = match onset_idx {
                Some(i) if !is_missing_token(field(i)) => {
                    let raw = field(i);
                    Some(raw.parse::<f64>().map_err(|_| {
                        CplmmError::InvalidTime(format!(
                            "onset '{}' at data row {} is not numeric",
                            raw,
                            row + 1
                        ))
                    })?)
                }
                _ => None,
            };

            let values = value_columns.iter().map(|(i, _)| field(*i).to_string()).collect();
            raw_rows.push((subject.to_string(), time, status, onset, values));
        }

        if raw_rows.is_empty() {
            return Err(CplmmError::InvalidParameter(
                "No observations in longitudinal table".to_string(),
            ));
        }

        let numeric: Vec<bool> = (0..value_columns.len())
            .map(|c| {
                raw_rows.iter().all(|(.., values)| {
                    let v = values[c].as_str();
                    is_missing_token(v) || v.parse::<f64>().is_ok()
                })
            })
            .collect();

        let observations = raw_rows
            .into_iter()
            .map(|(subject, time, status, onset, values)| {
                let mut obs = Observation::new(&subject, time, status, onset);
                for (c, raw) in values.into_iter().enumerate() {
                    let var = if is_missing_token(&raw) {
                        Variable::Missing
                    } else if numeric[c] {
                        raw.parse::<f64>().map(Variable::Continuous).unwrap_or(Variable::Missing)
                    } else {
                        Variable::Categorical(raw)
                    };
                    obs.values.insert(value_columns[c].1.clone(), var);
                }
                obs
            })
            .collect();

        let column_order = value_columns.iter().map(|(_, name)| (*name).clone()).collect();
        Self::build(observations, Some(column_order))
    }

    /// Write the table as tab-separated text with role columns first.
    ///
    /// Abnormal status is written as `Abnormal`; missing cells as `NA`.
    pub fn write_tsv<W: std::io::Write>(&self, writer: W, mapping: &ColumnMapping) -> Result<()> {
        let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_writer(writer);

        let mut header = vec![mapping.subject.clone(), mapping.time.clone(), mapping.status.clone()];
        if let Some(onset) = &mapping.onset {
            header.push(onset.clone());
        }
        header.extend(self.column_names.iter().cloned());
        writer.write_record(&header)?;

        for obs in &self.observations {
            let status = match obs.status {
                Status::Normal => mapping.normal_label.clone(),
                Status::Abnormal => "Abnormal".to_string(),
            };
            let mut record = vec![obs.subject_id.clone(), obs.time.to_string(), status];
            if mapping.onset.is_some() {
                record.push(obs.onset.map_or_else(|| "NA".to_string(), |o| o.to_string()));
            }
            for name in &self.column_names {
                record.push(match obs.value(name) {
                    Variable::Continuous(v) => v.to_string(),
                    Variable::Categorical(c) => c.clone(),
                    Variable::Missing => "NA".to_string(),
                });
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Write the table to a TSV file.
    pub fn to_tsv<P: AsRef<Path>>(&self, path: P, mapping: &ColumnMapping) -> Result<()> {
        let file = std::fs::File::create(path)?;
        self.write_tsv(std::io::BufWriter::new(file), mapping)
    }

    /// All observations in record order.
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    /// Observation at a row index.
    pub fn observation(&self, row: usize) -> &Observation {
        &self.observations[row]
    }

    /// Subjects in first-appearance order.
    pub fn subjects(&self) -> &[Subject] {
        &self.subjects
    }

    /// Value column names (biomarkers and covariates).
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// Number of observations.
    pub fn n_observations(&self) -> usize {
        self.observations.len()
    }

    /// Number of subjects.
    pub fn n_subjects(&self) -> usize {
        self.subjects.len()
    }

    /// Get the type of a column.
    pub fn column_type(&self, column: &str) -> Option<VariableType> {
        self.column_types.get(column).copied()
    }

    /// Check if a value column exists.
    pub fn has_column(&self, column: &str) -> bool {
        self.column_types.contains_key(column)
    }

    /// Keep only the subjects of one cohort.
    pub fn subset_cohort(&self, cohort: Cohort) -> Result<Self> {
        let observations: Vec<Observation> = self
            .subjects
            .iter()
            .filter(|s| s.cohort() == cohort)
            .flat_map(|s| s.rows().iter().map(|&r| self.observations[r].clone()))
            .collect();
        Self::build(observations, Some(self.column_names.clone()))
    }
}
