//! Result types for change-point Wald testing.

use crate::error::Result;
use crate::model::SkipReason;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Confidence level based on statistical evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    /// Very high confidence (q < 0.001)
    VeryHigh,
    /// High confidence (q < 0.01)
    High,
    /// Moderate confidence (q < 0.05)
    Moderate,
    /// Low confidence (q < 0.10)
    Low,
    /// Suggestive (q < 0.20)
    Suggestive,
    /// Not significant
    NotSignificant,
}

impl Confidence {
    /// Classify based on adjusted p-value (q-value).
    pub fn from_qvalue(q: f64) -> Self {
        if q < 0.001 {
            Self::VeryHigh
        } else if q < 0.01 {
            Self::High
        } else if q < 0.05 {
            Self::Moderate
        } else if q < 0.10 {
            Self::Low
        } else if q < 0.20 {
            Self::Suggestive
        } else {
            Self::NotSignificant
        }
    }

    /// Get the descriptive name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::VeryHigh => "very_high",
            Self::High => "high",
            Self::Moderate => "moderate",
            Self::Low => "low",
            Self::Suggestive => "suggestive",
            Self::NotSignificant => "not_significant",
        }
    }

    /// Check if significant at alpha = 0.05.
    pub fn is_significant(&self) -> bool {
        matches!(self, Self::VeryHigh | Self::High | Self::Moderate)
    }
}

/// Sign of an estimated effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Increase,
    Decrease,
    Flat,
}

impl Direction {
    pub fn from_estimate(estimate: f64) -> Self {
        if estimate > 0.0 {
            Self::Increase
        } else if estimate < 0.0 {
            Self::Decrease
        } else {
            Self::Flat
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Increase => "increase",
            Self::Decrease => "decrease",
            Self::Flat => "flat",
        }
    }
}

/// Whether a row took part in multiple-testing correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Tested,
    NotConverged,
    Skipped(SkipReason),
    /// Coefficient missing from this fit, or its variance is not positive.
    Untestable(String),
}

impl TestStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tested => "tested",
            Self::NotConverged => "not_converged",
            Self::Skipped(reason) => reason.label(),
            Self::Untestable(_) => "untestable",
        }
    }

    pub fn is_tested(&self) -> bool {
        matches!(self, Self::Tested)
    }
}

/// Wald test outcome for one biomarker and hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaldRecord {
    pub biomarker_id: String,
    /// Hypothesis label, e.g. `post_onset` or `pre_onset - post_onset`.
    pub hypothesis: String,
    pub estimate: Option<f64>,
    pub std_error: Option<f64>,
    /// Wald chi-square statistic (1 df).
    pub statistic: Option<f64>,
    pub p_value: Option<f64>,
    /// BH-adjusted p-value; present only for tested rows.
    pub q_value: Option<f64>,
    pub direction: Option<Direction>,
    pub converged: bool,
    pub status: TestStatus,
}

impl WaldRecord {
    /// Row that did not enter the correction.
    pub fn not_tested(biomarker_id: &str, hypothesis: &str, converged: bool, status: TestStatus) -> Self {
        Self {
            biomarker_id: biomarker_id.to_string(),
            hypothesis: hypothesis.to_string(),
            estimate: None,
            std_error: None,
            statistic: None,
            p_value: None,
            q_value: None,
            direction: None,
            converged,
            status,
        }
    }

    /// Confidence class from the q-value; not-tested rows are not significant.
    pub fn confidence(&self) -> Confidence {
        self.q_value
            .map(Confidence::from_qvalue)
            .unwrap_or(Confidence::NotSignificant)
    }

    pub fn is_significant_at(&self, alpha: f64) -> bool {
        self.q_value.map_or(false, |q| q < alpha)
    }
}

/// Rows of a panel test, in store order per hypothesis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultTable {
    pub records: Vec<WaldRecord>,
}

impl ResultTable {
    pub fn new(records: Vec<WaldRecord>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn extend(&mut self, records: Vec<WaldRecord>) {
        self.records.extend(records);
    }

    pub fn iter(&self) -> impl Iterator<Item = &WaldRecord> {
        self.records.iter()
    }

    /// Row for a biomarker under a hypothesis.
    pub fn get(&self, biomarker_id: &str, hypothesis: &str) -> Option<&WaldRecord> {
        self.records
            .iter()
            .find(|r| r.biomarker_id == biomarker_id && r.hypothesis == hypothesis)
    }

    /// Rows for one hypothesis.
    pub fn for_hypothesis<'a>(&'a self, hypothesis: &'a str) -> impl Iterator<Item = &'a WaldRecord> + 'a {
        self.records.iter().filter(move |r| r.hypothesis == hypothesis)
    }

    /// Rows sorted by q-value; rows without one go last.
    pub fn sorted_by_qvalue(&self) -> Vec<&WaldRecord> {
        let mut sorted: Vec<_> = self.records.iter().collect();
        sorted.sort_by(|a, b| match (a.q_value, b.q_value) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        sorted
    }

    /// Significant rows at a threshold.
    pub fn significant(&self, alpha: f64) -> Vec<&WaldRecord> {
        self.records.iter().filter(|r| r.is_significant_at(alpha)).collect()
    }

    pub fn summary(&self) -> ResultSummary {
        let count_q = |alpha: f64| self.records.iter().filter(|r| r.is_significant_at(alpha)).count();
        ResultSummary {
            total: self.len(),
            tested: self.records.iter().filter(|r| r.status.is_tested()).count(),
            not_converged: self
                .records
                .iter()
                .filter(|r| r.status == TestStatus::NotConverged)
                .count(),
            skipped: self
                .records
                .iter()
                .filter(|r| matches!(r.status, TestStatus::Skipped(_)))
                .count(),
            significant_001: count_q(0.001),
            significant_01: count_q(0.01),
            significant_05: count_q(0.05),
            significant_10: count_q(0.10),
        }
    }

    /// Write rows as tab-separated text.
    pub fn write_tsv<W: Write>(&self, mut writer: W) -> Result<()> {
        writeln!(
            writer,
            "biomarker\thypothesis\testimate\tstd_error\tstatistic\tp_value\tq_value\tconverged\tstatus\tdirection\tconfidence"
        )?;

        let fmt = |v: Option<f64>, sci: bool| match v {
            Some(x) if sci => format!("{:.4e}", x),
            Some(x) => format!("{:.6}", x),
            None => "NA".to_string(),
        };

        for r in &self.records {
            writeln!(
                writer,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                r.biomarker_id,
                r.hypothesis,
                fmt(r.estimate, false),
                fmt(r.std_error, false),
                fmt(r.statistic, false),
                fmt(r.p_value, true),
                fmt(r.q_value, true),
                r.converged,
                r.status.label(),
                r.direction.map_or("NA", |d| d.name()),
                r.confidence().name()
            )?;
        }

        Ok(())
    }

    /// Write results to TSV file.
    pub fn to_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        self.write_tsv(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Write results to a JSON file.
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }
}

/// Summary statistics for a result table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSummary {
    pub total: usize,
    pub tested: usize,
    pub not_converged: usize,
    pub skipped: usize,
    pub significant_001: usize,
    pub significant_01: usize,
    pub significant_05: usize,
    pub significant_10: usize,
}

impl std::fmt::Display for ResultSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Rows: {} ({} tested)", self.total, self.tested)?;
        writeln!(f, "Not converged: {}", self.not_converged)?;
        writeln!(f, "Skipped: {}", self.skipped)?;
        writeln!(f, "Significant at q < 0.001: {}", self.significant_001)?;
        writeln!(f, "Significant at q < 0.01:  {}", self.significant_01)?;
        writeln!(f, "Significant at q < 0.05:  {}", self.significant_05)?;
        writeln!(f, "Significant at q < 0.10:  {}", self.significant_10)?;
        Ok(())
    }
}
