//! Synthetic longitudinal cohorts for benchmarking and testing.
//!
//! Generates biomarker trajectories with a known slope change at onset, for
//! validating the change-point model end to end.

use crate::config::AnalysisConfig;
use crate::data::{ColumnMapping, LongitudinalTable, Observation, Status, Variable};
use crate::error::{CplmmError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Configuration for synthetic data generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticConfig {
    /// Name/identifier for this dataset.
    pub name: String,
    /// Subjects that are normal at baseline and abnormal later.
    pub n_converters: usize,
    /// Subjects that stay normal.
    pub n_normals: usize,
    /// Subjects that are abnormal at every visit.
    pub n_abnormals: usize,
    /// Visits per subject (at least 3).
    pub visits_per_subject: usize,
    /// Years between visits.
    pub visit_interval: f64,
    /// Number of biomarkers.
    pub n_biomarkers: usize,
    /// Number of biomarkers with a slope change at onset.
    pub n_changing: usize,
    /// Absolute slope change for changing biomarkers; signs alternate.
    pub slope_change: f64,
    /// Common slope before onset.
    pub pre_slope: f64,
    /// Standard deviation of subject-level offsets.
    pub subject_sd: f64,
    /// Residual standard deviation.
    pub noise_sd: f64,
    /// Probability that a biomarker cell is missing.
    pub missing_rate: f64,
    /// Random seed for reproducibility.
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "synthetic".to_string(),
            n_converters: 40,
            n_normals: 30,
            n_abnormals: 20,
            visits_per_subject: 5,
            visit_interval: 1.5,
            n_biomarkers: 50,
            n_changing: 5,
            slope_change: 0.5,
            pre_slope: 0.05,
            subject_sd: 1.0,
            noise_sd: 0.3,
            missing_rate: 0.02,
            seed: 42,
        }
    }
}

impl SyntheticConfig {
    /// Create a new config with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Set cohort sizes.
    pub fn with_subjects(mut self, converters: usize, normals: usize, abnormals: usize) -> Self {
        self.n_converters = converters;
        self.n_normals = normals;
        self.n_abnormals = abnormals;
        self
    }

    /// Set panel size and effects.
    pub fn with_biomarkers(mut self, n: usize, n_changing: usize, slope_change: f64) -> Self {
        self.n_biomarkers = n;
        self.n_changing = n_changing.min(n);
        self.slope_change = slope_change;
        self
    }

    /// Set visit schedule.
    pub fn with_visits(mut self, visits: usize, interval: f64) -> Self {
        self.visits_per_subject = visits;
        self.visit_interval = interval;
        self
    }

    /// Set noise levels.
    pub fn with_noise(mut self, subject_sd: f64, noise_sd: f64) -> Self {
        self.subject_sd = subject_sd;
        self.noise_sd = noise_sd;
        self
    }

    pub fn with_missing_rate(mut self, rate: f64) -> Self {
        self.missing_rate = rate.clamp(0.0, 0.9);
        self
    }

    /// Set random seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Small, low-noise panel for quick checks.
    pub fn small() -> Self {
        Self {
            name: "small".to_string(),
            n_converters: 16,
            n_normals: 8,
            n_abnormals: 8,
            n_biomarkers: 6,
            n_changing: 2,
            slope_change: 1.0,
            noise_sd: 0.2,
            missing_rate: 0.0,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.visits_per_subject < 3 {
            return Err(CplmmError::InvalidParameter(
                "visits_per_subject must be at least 3".to_string(),
            ));
        }
        if !(self.visit_interval > 0.0) {
            return Err(CplmmError::InvalidParameter(
                "visit_interval must be positive".to_string(),
            ));
        }
        if self.n_converters + self.n_normals + self.n_abnormals == 0 || self.n_biomarkers == 0 {
            return Err(CplmmError::InvalidParameter(
                "At least one subject and one biomarker are required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Known effects used to generate the data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruth {
    /// Biomarkers with a slope change at onset.
    pub changing: Vec<String>,
    /// Slope change per changing biomarker.
    pub slope_changes: HashMap<String, f64>,
    /// Biomarkers without a change.
    pub null_biomarkers: Vec<String>,
}

impl GroundTruth {
    pub fn is_changing(&self, biomarker: &str) -> bool {
        self.slope_changes.contains_key(biomarker)
    }

    /// True slope change (0.0 for null biomarkers).
    pub fn slope_change(&self, biomarker: &str) -> f64 {
        self.slope_changes.get(biomarker).copied().unwrap_or(0.0)
    }

    /// Write ground truth to TSV format.
    pub fn to_tsv(&self) -> String {
        let mut lines = vec!["biomarker\tslope_change\tis_changing".to_string()];
        for b in &self.changing {
            lines.push(format!("{}\t{:.4}\ttrue", b, self.slope_change(b)));
        }
        for b in &self.null_biomarkers {
            lines.push(format!("{}\t0.0\tfalse", b));
        }
        lines.join("\n")
    }
}

/// Result of synthetic data generation.
#[derive(Debug, Clone)]
pub struct SyntheticData {
    pub table: LongitudinalTable,
    pub ground_truth: GroundTruth,
    pub config: SyntheticConfig,
}

impl SyntheticData {
    /// Column mapping matching the generated table.
    pub fn mapping(&self) -> ColumnMapping {
        ColumnMapping::default()
    }

    /// Write table, ground truth and configs to a directory.
    pub fn write_to_dir(&self, dir: &std::path::Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;

        self.table.to_tsv(dir.join("table.tsv"), &self.mapping())?;
        std::fs::write(dir.join("ground_truth.tsv"), self.ground_truth.to_tsv())?;
        std::fs::write(dir.join("synthetic.yaml"), serde_yaml::to_string(&self.config)?)?;

        let analysis = AnalysisConfig {
            name: self.config.name.clone(),
            columns: self.mapping(),
            ..AnalysisConfig::default()
        };
        std::fs::write(dir.join("analysis.yaml"), analysis.to_yaml()?)?;

        Ok(())
    }
}

/// Simple deterministic RNG (xorshift64).
struct Rng {
    state: u64,
}

impl Rng {
    fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() as f64) / (u64::MAX as f64)
    }

    fn uniform(&mut self, low: f64, high: f64) -> f64 {
        low + (high - low) * self.next_f64()
    }

    /// Generate a value from approximate normal distribution (Box-Muller).
    fn next_normal(&mut self, mean: f64, std: f64) -> f64 {
        let u1 = self.next_f64().max(1e-10);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std * z
    }
}

/// Kind of subject trajectory to simulate.
#[derive(Clone, Copy, PartialEq)]
enum Trajectory {
    Converter,
    Normal,
    Abnormal,
}

/// Generate a synthetic longitudinal panel.
///
/// Ages are rounded to 0.01 years so the table survives a TSV round trip
/// unchanged.
pub fn generate_synthetic(config: &SyntheticConfig) -> Result<SyntheticData> {
    config.validate()?;
    let mut rng = Rng::new(config.seed);

    let biomarkers: Vec<String> = (1..=config.n_biomarkers).map(|i| format!("BM{:03}", i)).collect();
    let mut slope_changes = HashMap::new();
    for (i, b) in biomarkers.iter().take(config.n_changing).enumerate() {
        let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
        slope_changes.insert(b.clone(), sign * config.slope_change);
    }

    let trajectories = std::iter::repeat(Trajectory::Converter)
        .take(config.n_converters)
        .chain(std::iter::repeat(Trajectory::Normal).take(config.n_normals))
        .chain(std::iter::repeat(Trajectory::Abnormal).take(config.n_abnormals));

    let round = |x: f64| (x * 100.0).round() / 100.0;
    let n_visits = config.visits_per_subject;
    let mut observations = Vec::new();

    for (s, trajectory) in trajectories.enumerate() {
        let id = format!("SUB{:04}", s + 1);
        let baseline = round(rng.uniform(60.0, 75.0));
        let sex = if rng.next_f64() < 0.5 { "F" } else { "M" };
        let times: Vec<f64> = (0..n_visits)
            .map(|v| round(baseline + v as f64 * config.visit_interval + rng.uniform(0.0, 0.2)))
            .collect();
        let last = times[n_visits - 1];

        // Onset strictly after the first visit and no later than the last.
        let onset = match trajectory {
            Trajectory::Converter => Some(round(rng.uniform(times[1], times[n_visits - 2]).max(times[0] + 0.01))),
            Trajectory::Abnormal => Some(round(baseline - rng.uniform(0.5, 3.0))),
            Trajectory::Normal => None,
        };
        let anchor = onset.unwrap_or(last);

        let offsets: Vec<f64> = biomarkers
            .iter()
            .map(|_| rng.next_normal(0.0, config.subject_sd))
            .collect();

        for &t in &times {
            let status = match (trajectory, onset) {
                (Trajectory::Normal, _) => Status::Normal,
                (_, Some(o)) if t >= o => Status::Abnormal,
                _ => Status::Normal,
            };
            let yso = t - anchor;
            let mut obs = Observation::new(&id, t, status, onset)
                .with_value("SEX", Variable::Categorical(sex.to_string()))
                .with_value("BASELINE_AGE", Variable::Continuous(baseline));

            for (b, name) in biomarkers.iter().enumerate() {
                let value = if rng.next_f64() < config.missing_rate {
                    Variable::Missing
                } else {
                    let change = slope_changes.get(name).copied().unwrap_or(0.0);
                    let y = 10.0
                        + offsets[b]
                        + 0.02 * (baseline - 67.5)
                        + config.pre_slope * yso
                        + change * yso.max(0.0)
                        + rng.next_normal(0.0, config.noise_sd);
                    Variable::Continuous(y)
                };
                obs = obs.with_value(name, value);
            }
            observations.push(obs);
        }
    }

    let table = LongitudinalTable::new(observations)?;
    let changing: Vec<String> = biomarkers.iter().take(config.n_changing).cloned().collect();
    let null_biomarkers = biomarkers.iter().skip(config.n_changing).cloned().collect();

    Ok(SyntheticData {
        table,
        ground_truth: GroundTruth {
            changing,
            slope_changes,
            null_biomarkers,
        },
        config: config.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Cohort;

    #[test]
    fn test_default_config() {
        let config = SyntheticConfig::default();
        assert_eq!(config.n_biomarkers, 50);
        assert_eq!(config.visits_per_subject, 5);
        assert_eq!(config.seed, 42);
    }

    #[test]
    fn test_generate_synthetic() {
        let config = SyntheticConfig::small().with_seed(12345);
        let data = generate_synthetic(&config).unwrap();

        assert_eq!(data.table.n_subjects(), 32);
        assert_eq!(data.table.n_observations(), 32 * 5);
        assert_eq!(data.ground_truth.changing.len(), 2);
        assert_eq!(data.ground_truth.null_biomarkers.len(), 4);
        assert!(data.ground_truth.is_changing("BM001"));
        assert_eq!(data.ground_truth.slope_change("BM002"), -1.0);
    }

    #[test]
    fn test_cohorts_match_trajectories() {
        let data = generate_synthetic(&SyntheticConfig::small()).unwrap();
        let count = |c: Cohort| data.table.subjects().iter().filter(|s| s.cohort() == c).count();
        assert_eq!(count(Cohort::StatusChange), 16);
        assert_eq!(count(Cohort::Normal), 8);
        assert_eq!(count(Cohort::Abnormal), 8);
    }

    #[test]
    fn test_deterministic_generation() {
        let config = SyntheticConfig::small().with_seed(999);
        let a = generate_synthetic(&config).unwrap();
        let b = generate_synthetic(&config).unwrap();
        assert_eq!(a.table.observations(), b.table.observations());
    }

    #[test]
    fn test_invalid_config() {
        let config = SyntheticConfig::small().with_visits(2, 1.0);
        assert!(generate_synthetic(&config).is_err());
    }

    #[test]
    fn test_write_to_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data = generate_synthetic(&SyntheticConfig::small()).unwrap();
        data.write_to_dir(dir.path()).unwrap();

        let reloaded = LongitudinalTable::from_tsv(dir.path().join("table.tsv"), &data.mapping()).unwrap();
        assert_eq!(reloaded.n_observations(), data.table.n_observations());
        let analysis = AnalysisConfig::from_yaml_file(dir.path().join("analysis.yaml")).unwrap();
        assert_eq!(analysis.name, "small");
    }
}
