//! Per-biomarker fit outcomes in insertion order.

use crate::error::{CplmmError, Result};
use crate::model::lmm::FitResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Why a biomarker produced no fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    EmptyDesign(String),
    SingularDesign { rank: usize, n_columns: usize },
    InvalidTime(String),
    Numerical(String),
    Other(String),
}

impl SkipReason {
    /// Short label used in result tables.
    pub fn label(&self) -> &'static str {
        match self {
            Self::EmptyDesign(_) => "empty_design",
            Self::SingularDesign { .. } => "singular_design",
            Self::InvalidTime(_) => "invalid_time",
            Self::Numerical(_) => "numerical",
            Self::Other(_) => "error",
        }
    }
}

impl From<&CplmmError> for SkipReason {
    fn from(err: &CplmmError) -> Self {
        match err {
            CplmmError::EmptyDesign { reason, .. } => Self::EmptyDesign(reason.clone()),
            CplmmError::SingularDesign { rank, n_columns, .. } => Self::SingularDesign {
                rank: *rank,
                n_columns: *n_columns,
            },
            CplmmError::InvalidTime(msg) => Self::InvalidTime(msg.clone()),
            CplmmError::Numerical(msg) => Self::Numerical(msg.clone()),
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyDesign(reason) => write!(f, "insufficient data: {}", reason),
            Self::SingularDesign { rank, n_columns } => {
                write!(f, "rank-deficient design (rank {} < {})", rank, n_columns)
            }
            Self::InvalidTime(msg) => write!(f, "invalid time: {}", msg),
            Self::Numerical(msg) => write!(f, "numerical failure: {}", msg),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Stored outcome for one biomarker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FitOutcome {
    Fitted(FitResult),
    Skipped(SkipReason),
}

impl FitOutcome {
    pub fn fit(&self) -> Option<&FitResult> {
        match self {
            Self::Fitted(fit) => Some(fit),
            Self::Skipped(_) => None,
        }
    }
}

/// Fit outcomes keyed by biomarker id.
///
/// Iteration follows first insertion. Re-inserting an id replaces its outcome
/// in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoefficientStore {
    entries: Vec<(String, FitOutcome)>,
    index: HashMap<String, usize>,
}

impl CoefficientStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fit under its biomarker id.
    pub fn insert(&mut self, fit: FitResult) {
        let id = fit.biomarker_id.clone();
        self.put(id, FitOutcome::Fitted(fit));
    }

    /// Record that a biomarker was skipped.
    pub fn record_skip(&mut self, biomarker_id: &str, reason: SkipReason) {
        self.put(biomarker_id.to_string(), FitOutcome::Skipped(reason));
    }

    /// Store an arbitrary outcome.
    pub fn put(&mut self, biomarker_id: String, outcome: FitOutcome) {
        match self.index.get(&biomarker_id) {
            Some(&i) => self.entries[i].1 = outcome,
            None => {
                self.index.insert(biomarker_id.clone(), self.entries.len());
                self.entries.push((biomarker_id, outcome));
            }
        }
    }

    /// Fit for a biomarker; `NotFound` when absent or skipped.
    pub fn get(&self, biomarker_id: &str) -> Result<&FitResult> {
        match self.outcome(biomarker_id) {
            Some(FitOutcome::Fitted(fit)) => Ok(fit),
            Some(FitOutcome::Skipped(reason)) => Err(CplmmError::NotFound(format!(
                "{} (skipped: {})",
                biomarker_id, reason
            ))),
            None => Err(CplmmError::NotFound(biomarker_id.to_string())),
        }
    }

    pub fn outcome(&self, biomarker_id: &str) -> Option<&FitOutcome> {
        self.index.get(biomarker_id).map(|&i| &self.entries[i].1)
    }

    pub fn contains(&self, biomarker_id: &str) -> bool {
        self.index.contains_key(biomarker_id)
    }

    /// Outcomes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FitOutcome)> {
        self.entries.iter().map(|(id, outcome)| (id.as_str(), outcome))
    }

    /// Successful fits in insertion order.
    pub fn fits(&self) -> impl Iterator<Item = &FitResult> {
        self.entries.iter().filter_map(|(_, outcome)| outcome.fit())
    }

    /// Fold another store in, its entries following this one's.
    pub fn merge(&mut self, other: CoefficientStore) {
        for (id, outcome) in other.entries {
            self.put(id, outcome);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn n_converged(&self) -> usize {
        self.fits().filter(|f| f.converged).count()
    }

    pub fn n_skipped(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, o)| matches!(o, FitOutcome::Skipped(_)))
            .count()
    }
}
