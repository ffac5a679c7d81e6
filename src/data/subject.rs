//! Per-subject view over the longitudinal table.

use crate::data::table::{Observation, Status};
use crate::error::{CplmmError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Subject classification by status trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cohort {
    /// Normal at some visits and abnormal at later ones.
    StatusChange,
    /// Normal at every visit (never converts).
    Normal,
    /// Abnormal at every visit.
    Abnormal,
}

impl Cohort {
    /// Get the descriptive name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StatusChange => "status_change",
            Self::Normal => "normal",
            Self::Abnormal => "abnormal",
        }
    }
}

/// A subject: its rows in time order, onset anchor and cohort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    id: String,
    rows: Vec<usize>,
    onset: Option<f64>,
    cohort: Cohort,
}

impl Subject {
    /// Build a subject from its row indices into `observations`.
    ///
    /// Rows are ordered by time; equal times keep record order. The status
    /// trajectory must be monotone (never abnormal → normal), and every row that
    /// carries an onset anchor must carry the same one.
    pub fn from_rows(id: String, mut rows: Vec<usize>, observations: &[Observation]) -> Result<Self> {
        if rows.is_empty() {
            return Err(CplmmError::InvalidParameter(format!(
                "Subject '{}' has no observations",
                id
            )));
        }

        // Stable sort keeps record order for duplicate times.
        rows.sort_by(|&a, &b| {
            observations[a]
                .time
                .partial_cmp(&observations[b].time)
                .unwrap_or(Ordering::Equal)
        });

        let mut seen_abnormal = false;
        for &r in &rows {
            match observations[r].status {
                Status::Abnormal => seen_abnormal = true,
                Status::Normal if seen_abnormal => {
                    return Err(CplmmError::StatusReversion {
                        subject: id,
                        time: observations[r].time,
                    });
                }
                Status::Normal => {}
            }
        }

        let mut onset = None;
        for &r in &rows {
            if let Some(value) = observations[r].onset {
                if !value.is_finite() {
                    return Err(CplmmError::InvalidTime(format!(
                        "non-finite onset anchor for subject '{}'",
                        id
                    )));
                }
                match onset {
                    None => onset = Some(value),
                    Some(existing) if existing != value => {
                        return Err(CplmmError::InvalidTime(format!(
                            "subject '{}' has inconsistent onset anchors {} and {}",
                            id, existing, value
                        )));
                    }
                    Some(_) => {}
                }
            }
        }

        let any_normal = rows.iter().any(|&r| observations[r].status == Status::Normal);
        let cohort = match (any_normal, seen_abnormal) {
            (true, true) => Cohort::StatusChange,
            (true, false) => Cohort::Normal,
            _ => Cohort::Abnormal,
        };

        Ok(Self {
            id,
            rows,
            onset,
            cohort,
        })
    }

    /// Subject identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Row indices in time order.
    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    /// Recorded onset anchor, if any.
    pub fn onset(&self) -> Option<f64> {
        self.onset
    }

    /// Cohort derived from the status trajectory.
    pub fn cohort(&self) -> Cohort {
        self.cohort
    }

    /// Whether the subject is ever abnormal.
    pub fn converts(&self) -> bool {
        self.cohort != Cohort::Normal
    }

    /// Number of visits.
    pub fn n_observations(&self) -> usize {
        self.rows.len()
    }
}
