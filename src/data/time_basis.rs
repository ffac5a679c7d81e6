//! Piecewise-linear time basis anchored at disease onset.
//!
//! For each visit the basis carries the signed time since onset and the
//! change-point terms built from it:
//!
//! - `years_since_onset = t - anchor`
//! - `pre_onset  = max(anchor - t, 0)`
//! - `post_onset = max(t - anchor, 0)`
//!
//! With the hinge parametrization (`years_since_onset + post_onset`) the
//! `post_onset` coefficient is the slope change at onset. The split
//! parametrization (`pre_onset + post_onset`) estimates the two slopes
//! separately, the pre-onset one with flipped sign.

use crate::data::subject::Subject;
use crate::data::table::LongitudinalTable;
use crate::error::{CplmmError, Result};
use serde::{Deserialize, Serialize};

/// A piecewise time covariate that can enter the fixed-effect design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BasisTerm {
    YearsSinceOnset,
    PreOnset,
    PostOnset,
}

impl BasisTerm {
    /// Coefficient name used in designs and fit results.
    pub fn name(&self) -> &'static str {
        match self {
            Self::YearsSinceOnset => "years_since_onset",
            Self::PreOnset => "pre_onset",
            Self::PostOnset => "post_onset",
        }
    }
}

/// How onset anchors are resolved for subjects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnsetPolicy {
    /// Never-abnormal subjects are anchored at their last visit; converting
    /// subjects must carry a recorded onset.
    #[default]
    MaxObservedForNormals,
    /// Every subject must carry a recorded onset.
    Strict,
}

/// Derived time covariates for one visit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PiecewiseTime {
    pub years_since_onset: f64,
    pub pre_onset: f64,
    pub post_onset: f64,
}

impl PiecewiseTime {
    fn new(time: f64, anchor: f64) -> Self {
        let years_since_onset = time - anchor;
        Self {
            years_since_onset,
            pre_onset: (-years_since_onset).max(0.0),
            post_onset: years_since_onset.max(0.0),
        }
    }

    /// Value of a basis term.
    pub fn term(&self, term: BasisTerm) -> f64 {
        match term {
            BasisTerm::YearsSinceOnset => self.years_since_onset,
            BasisTerm::PreOnset => self.pre_onset,
            BasisTerm::PostOnset => self.post_onset,
        }
    }

    /// Strictly after the anchor.
    pub fn is_post_onset(&self) -> bool {
        self.years_since_onset > 0.0
    }
}

/// Builds piecewise time covariates under an onset policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeBasisBuilder {
    policy: OnsetPolicy,
}

impl TimeBasisBuilder {
    pub fn new(policy: OnsetPolicy) -> Self {
        Self { policy }
    }

    /// Compute the basis for each time relative to `anchor`.
    pub fn build(anchor: f64, times: &[f64]) -> Result<Vec<PiecewiseTime>> {
        if !anchor.is_finite() {
            return Err(CplmmError::InvalidTime(format!(
                "onset anchor {} is not finite",
                anchor
            )));
        }
        times
            .iter()
            .map(|&t| {
                if t.is_finite() {
                    Ok(PiecewiseTime::new(t, anchor))
                } else {
                    Err(CplmmError::InvalidTime(format!("time {} is not finite", t)))
                }
            })
            .collect()
    }

    /// Resolve the onset anchor for a subject given its visit times.
    pub fn anchor(&self, subject: &Subject, times: &[f64]) -> Result<f64> {
        if times.is_empty() {
            return Err(CplmmError::InvalidTime(format!(
                "subject '{}' has no visit times",
                subject.id()
            )));
        }

        if self.policy == OnsetPolicy::MaxObservedForNormals && !subject.converts() {
            let max_time = times.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            if let Some(recorded) = subject.onset() {
                if recorded != max_time {
                    log::debug!(
                        "Subject '{}' never converts: anchoring at last visit {} instead of recorded onset {}",
                        subject.id(),
                        max_time,
                        recorded
                    );
                }
            }
            return Ok(max_time);
        }

        subject.onset().ok_or_else(|| {
            CplmmError::InvalidTime(format!(
                "subject '{}' ({}) has no onset anchor",
                subject.id(),
                subject.cohort().name()
            ))
        })
    }

    /// Basis for a subject's visits, in the subject's row order.
    pub fn for_subject(
        &self,
        subject: &Subject,
        table: &LongitudinalTable,
    ) -> Result<Vec<PiecewiseTime>> {
        let times: Vec<f64> = subject
            .rows()
            .iter()
            .map(|&r| table.observation(r).time)
            .collect();
        let anchor = self.anchor(subject, &times)?;
        Self::build(anchor, &times)
    }
}
