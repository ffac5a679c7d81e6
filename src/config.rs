//! Analysis configuration, serializable to YAML.

use crate::data::{ColumnMapping, ModelSpec, OnsetPolicy};
use crate::error::{CplmmError, Result};
use crate::model::LmmConfig;
use crate::test::{Hypothesis, WaldTester};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Everything needed to run a panel analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Name of the analysis.
    pub name: String,
    pub columns: ColumnMapping,
    pub model: ModelSpec,
    pub fitter: LmmConfig,
    pub onset_policy: OnsetPolicy,
    /// Hypotheses in `coef` or `coef - coef` form.
    pub hypotheses: Vec<String>,
    /// Significance threshold on adjusted p-values.
    pub alpha: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            name: "cplmm".to_string(),
            columns: ColumnMapping::default(),
            model: ModelSpec::default(),
            fitter: LmmConfig::default(),
            onset_policy: OnsetPolicy::default(),
            hypotheses: vec!["post_onset".to_string()],
            alpha: 0.05,
        }
    }
}

impl AnalysisConfig {
    /// Load from YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Save to YAML string.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(CplmmError::from)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hypotheses.is_empty() {
            return Err(CplmmError::InvalidParameter(
                "At least one hypothesis is required".to_string(),
            ));
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(CplmmError::InvalidParameter(format!(
                "alpha must be in (0, 1), got {}",
                self.alpha
            )));
        }
        self.model.validate()?;
        self.fitter.validate()?;
        self.parsed_hypotheses()?;
        Ok(())
    }

    pub fn parsed_hypotheses(&self) -> Result<Vec<Hypothesis>> {
        self.hypotheses.iter().map(|h| Hypothesis::parse(h)).collect()
    }

    pub fn wald_tester(&self) -> Result<WaldTester> {
        WaldTester::new(self.parsed_hypotheses()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BasisTerm, RandomEffects};
    use crate::model::EstimationMethod;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_is_valid() {
        let config = AnalysisConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.model.basis, vec![BasisTerm::YearsSinceOnset, BasisTerm::PostOnset]);
    }

    #[test]
    fn test_yaml_round_trip() {
        let mut config = AnalysisConfig::default();
        config.name = "plasma".to_string();
        config.model = ModelSpec::with_basis(&[BasisTerm::PreOnset, BasisTerm::PostOnset]);
        config.model.random_effects = RandomEffects::InterceptAndSlope;
        config.fitter.method = EstimationMethod::Ml;
        config.hypotheses = vec!["pre_onset - post_onset".to_string()];

        let yaml = config.to_yaml().unwrap();
        let parsed = AnalysisConfig::from_yaml(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "name: small\ncolumns:\n  subject: ID\n  covariates: []\nalpha: 0.1\n";
        let config = AnalysisConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.name, "small");
        assert_eq!(config.columns.subject, "ID");
        assert_eq!(config.columns.time, "PROCEDURE_AGE");
        assert!(config.columns.covariates.is_empty());
        assert_eq!(config.fitter, LmmConfig::default());
        assert_eq!(config.alpha, 0.1);
    }

    #[test]
    fn test_validation() {
        assert!(AnalysisConfig::from_yaml("alpha: 1.5\n").is_err());
        assert!(AnalysisConfig::from_yaml("hypotheses: []\n").is_err());
        assert!(AnalysisConfig::from_yaml("hypotheses: ['a - ']\n").is_err());
        assert!(AnalysisConfig::from_yaml("model:\n  basis: []\n").is_err());
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "name: from_file").unwrap();
        writeln!(file, "onset_policy: strict").unwrap();
        let config = AnalysisConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.name, "from_file");
        assert_eq!(config.onset_policy, OnsetPolicy::Strict);
    }
}
