//! Wald tests on stored fits with panel-wide BH correction.
//!
//! For every biomarker in store order the statistic is `W = estimate² / variance`,
//! referred to a chi-square distribution with one degree of freedom. Adjusted
//! p-values are computed once over all testable rows; non-converged, skipped
//! and untestable rows keep their place in the output with no p or q value.

use crate::correct::correct_bh;
use crate::data::{Direction, ResultTable, TestStatus, WaldRecord};
use crate::error::{CplmmError, Result};
use crate::model::{CoefficientStore, FitOutcome, FitResult};
use regex::Regex;
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// A linear hypothesis on the fixed effects of one fit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Hypothesis {
    /// `β = 0`
    Coefficient(String),
    /// `β_plus − β_minus = 0`
    Contrast { plus: String, minus: String },
}

impl Default for Hypothesis {
    fn default() -> Self {
        Self::Coefficient("post_onset".to_string())
    }
}

fn hypothesis_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*([^\s-]+)\s*(?:-\s*([^\s-]+))?\s*$").expect("hypothesis pattern is valid")
    })
}

impl Hypothesis {
    /// Parse `"name"` or `"name - other"`.
    pub fn parse(text: &str) -> Result<Self> {
        let caps = hypothesis_pattern().captures(text).ok_or_else(|| {
            CplmmError::InvalidParameter(format!(
                "Cannot parse hypothesis '{}': expected 'coef' or 'coef - coef'",
                text
            ))
        })?;
        let plus = caps[1].to_string();
        match caps.get(2) {
            Some(minus) => Ok(Self::Contrast {
                plus,
                minus: minus.as_str().to_string(),
            }),
            None => Ok(Self::Coefficient(plus)),
        }
    }

    /// Coefficient names the hypothesis refers to.
    pub fn coefficients(&self) -> Vec<&str> {
        match self {
            Self::Coefficient(name) => vec![name.as_str()],
            Self::Contrast { plus, minus } => vec![plus.as_str(), minus.as_str()],
        }
    }

    /// Estimate and variance under one fit, `None` if a coefficient is absent.
    pub fn evaluate(&self, fit: &FitResult) -> Option<(f64, f64)> {
        match self {
            Self::Coefficient(name) => {
                let i = fit.coefficient_index(name)?;
                Some((fit.coefficients[i], fit.covariance[(i, i)]))
            }
            Self::Contrast { plus, minus } => {
                let i = fit.coefficient_index(plus)?;
                let j = fit.coefficient_index(minus)?;
                let estimate = fit.coefficients[i] - fit.coefficients[j];
                let variance =
                    fit.covariance[(i, i)] + fit.covariance[(j, j)] - 2.0 * fit.covariance[(i, j)];
                Some((estimate, variance))
            }
        }
    }
}

impl fmt::Display for Hypothesis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Coefficient(name) => write!(f, "{}", name),
            Self::Contrast { plus, minus } => write!(f, "{} - {}", plus, minus),
        }
    }
}

impl FromStr for Hypothesis {
    type Err = CplmmError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Upper tail of χ²₁ at `statistic`.
pub fn chi_square_sf(statistic: f64) -> Result<f64> {
    let dist = ChiSquared::new(1.0).map_err(|e| CplmmError::Numerical(e.to_string()))?;
    Ok(dist.sf(statistic))
}

/// Wald statistic and p-value, `None` when the variance is unusable.
pub fn wald_statistic(estimate: f64, variance: f64) -> Result<Option<(f64, f64)>> {
    if !estimate.is_finite() || !variance.is_finite() || variance <= 0.0 {
        return Ok(None);
    }
    let statistic = estimate * estimate / variance;
    Ok(Some((statistic, chi_square_sf(statistic)?)))
}

/// Fill q-values of tested rows with one BH pass.
pub fn correct_records(records: &mut [WaldRecord]) {
    let tested: Vec<usize> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| r.status.is_tested() && r.p_value.is_some())
        .map(|(i, _)| i)
        .collect();
    let p_values: Vec<f64> = tested.iter().filter_map(|&i| records[i].p_value).collect();
    let ids: Vec<String> = tested.iter().map(|&i| records[i].biomarker_id.clone()).collect();

    let corrected = correct_bh(&p_values, &ids);
    for (&i, q) in tested.iter().zip(corrected.q_values) {
        records[i].q_value = Some(q);
    }
}

/// Test one hypothesis across the store.
///
/// Rows follow store order. Returns `InvalidParameter` when some fit exists
/// but none carries the referenced coefficients.
pub fn test_hypothesis(hypothesis: &Hypothesis, store: &CoefficientStore) -> Result<Vec<WaldRecord>> {
    let label = hypothesis.to_string();

    let mut any_fit = false;
    let mut known = false;
    for fit in store.fits() {
        any_fit = true;
        if hypothesis.evaluate(fit).is_some() {
            known = true;
            break;
        }
    }
    if any_fit && !known {
        let available = store
            .fits()
            .next()
            .map(|f| f.coefficient_names.clone())
            .unwrap_or_default();
        return Err(CplmmError::InvalidParameter(format!(
            "Coefficient '{}' not found. Available: {:?}",
            label, available
        )));
    }

    let mut records = Vec::with_capacity(store.len());
    for (id, outcome) in store.iter() {
        let fit = match outcome {
            FitOutcome::Skipped(reason) => {
                records.push(WaldRecord::not_tested(
                    id,
                    &label,
                    false,
                    TestStatus::Skipped(reason.clone()),
                ));
                continue;
            }
            FitOutcome::Fitted(fit) => fit,
        };

        let Some((estimate, variance)) = hypothesis.evaluate(fit) else {
            records.push(WaldRecord::not_tested(
                id,
                &label,
                fit.converged,
                TestStatus::Untestable(format!("'{}' not in this fit", label)),
            ));
            continue;
        };

        let mut record = WaldRecord::not_tested(id, &label, fit.converged, TestStatus::Tested);
        record.estimate = Some(estimate);
        record.direction = Some(Direction::from_estimate(estimate));
        if variance.is_finite() && variance > 0.0 {
            record.std_error = Some(variance.sqrt());
        }

        if !fit.converged {
            record.status = TestStatus::NotConverged;
        } else {
            match wald_statistic(estimate, variance)? {
                Some((statistic, p_value)) => {
                    record.statistic = Some(statistic);
                    record.p_value = Some(p_value);
                }
                None => {
                    record.status = TestStatus::Untestable(format!("variance {} is not positive", variance));
                }
            }
        }
        records.push(record);
    }

    correct_records(&mut records);

    let n_tested = records.iter().filter(|r| r.status.is_tested()).count();
    log::info!(
        "Wald test '{}': {} of {} biomarkers tested",
        label,
        n_tested,
        records.len()
    );

    Ok(records)
}

/// Test a single coefficient across the store.
pub fn test_wald(coefficient: &str, store: &CoefficientStore) -> Result<Vec<WaldRecord>> {
    test_hypothesis(&Hypothesis::Coefficient(coefficient.to_string()), store)
}

/// Runs a fixed set of hypotheses over a store.
#[derive(Debug, Clone)]
pub struct WaldTester {
    hypotheses: Vec<Hypothesis>,
}

impl Default for WaldTester {
    fn default() -> Self {
        Self {
            hypotheses: vec![Hypothesis::default()],
        }
    }
}

impl WaldTester {
    pub fn new(hypotheses: Vec<Hypothesis>) -> Result<Self> {
        if hypotheses.is_empty() {
            return Err(CplmmError::InvalidParameter(
                "At least one hypothesis is required".to_string(),
            ));
        }
        Ok(Self { hypotheses })
    }

    /// Parse hypothesis strings.
    pub fn from_strings<S: AsRef<str>>(hypotheses: &[S]) -> Result<Self> {
        let parsed = hypotheses
            .iter()
            .map(|h| Hypothesis::parse(h.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Self::new(parsed)
    }

    pub fn hypotheses(&self) -> &[Hypothesis] {
        &self.hypotheses
    }

    /// Test one coefficient; see [`test_wald`].
    pub fn test(&self, coefficient: &str, store: &CoefficientStore) -> Result<Vec<WaldRecord>> {
        test_wald(coefficient, store)
    }

    /// Test every hypothesis, each corrected independently.
    pub fn test_all(&self, store: &CoefficientStore) -> Result<ResultTable> {
        let mut table = ResultTable::default();
        for hypothesis in &self.hypotheses {
            table.extend(test_hypothesis(hypothesis, store)?);
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EstimationMethod, SkipReason};
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    fn fit(id: &str, post: f64, se: f64, converged: bool) -> FitResult {
        let names = vec!["years_since_onset".to_string(), "post_onset".to_string()];
        let covariance = DMatrix::from_row_slice(2, 2, &[0.04, 0.01, 0.01, se * se]);
        FitResult {
            biomarker_id: id.to_string(),
            coefficient_names: names,
            coefficients: vec![0.5, post],
            std_errors: vec![0.2, se],
            covariance,
            random_effect_covariance: DMatrix::from_element(1, 1, 1.0),
            residual_variance: 1.0,
            log_likelihood: -20.0,
            method: EstimationMethod::Reml,
            iterations: 10,
            converged,
            n_observations: 40,
            n_subjects: 10,
            aic: 0.0,
            bic: 0.0,
            mse: 1.0,
            icc: 0.5,
        }
    }

    fn store() -> CoefficientStore {
        let mut store = CoefficientStore::new();
        store.insert(fit("A", 1.0, 0.5, true));
        store.insert(fit("B", 0.1, 0.5, true));
        store.insert(fit("C", 2.0, 0.5, false));
        store.record_skip(
            "D",
            SkipReason::SingularDesign {
                rank: 2,
                n_columns: 3,
            },
        );
        store.insert(fit("E", -1.5, 0.5, true));
        store
    }

    #[test]
    fn test_parse_hypothesis() {
        assert_eq!(
            Hypothesis::parse("post_onset").unwrap(),
            Hypothesis::Coefficient("post_onset".into())
        );
        assert_eq!(
            Hypothesis::parse(" pre_onset - post_onset ").unwrap(),
            Hypothesis::Contrast {
                plus: "pre_onset".into(),
                minus: "post_onset".into()
            }
        );
        assert_eq!(
            "pre_onset - post_onset".parse::<Hypothesis>().unwrap().to_string(),
            "pre_onset - post_onset"
        );
        assert!(Hypothesis::parse("").is_err());
        assert!(Hypothesis::parse("a - b - c").is_err());
    }

    #[test]
    fn test_wald_statistic_and_pvalue() {
        let (w, p) = wald_statistic(1.0, 0.25).unwrap().unwrap();
        assert_relative_eq!(w, 4.0, epsilon = 1e-12);
        // P(χ²₁ > 4) = 2·(1 − Φ(2))
        assert_relative_eq!(p, 0.0455002638963584, epsilon = 1e-9);
        assert!(wald_statistic(1.0, 0.0).unwrap().is_none());
        assert!(wald_statistic(1.0, f64::NAN).unwrap().is_none());
    }

    #[test]
    fn test_rows_follow_store_order() {
        let records = test_wald("post_onset", &store()).unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.biomarker_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C", "D", "E"]);
    }

    #[test]
    fn test_excluded_rows_not_corrected() {
        let records = test_wald("post_onset", &store()).unwrap();

        let c = &records[2];
        assert_eq!(c.status, TestStatus::NotConverged);
        assert!(c.p_value.is_none() && c.q_value.is_none());
        assert_eq!(c.estimate, Some(2.0));

        let d = &records[3];
        assert_eq!(d.status.label(), "singular_design");
        assert!(d.p_value.is_none() && d.q_value.is_none());

        // Three tested rows form the BH family.
        let p: Vec<f64> = [0, 1, 4].iter().map(|&i| records[i].p_value.unwrap()).collect();
        let ids: Vec<String> = vec!["A".into(), "B".into(), "E".into()];
        let expected = correct_bh(&p, &ids);
        for (k, &i) in [0, 1, 4].iter().enumerate() {
            assert_relative_eq!(records[i].q_value.unwrap(), expected.q_values[k], epsilon = 1e-15);
        }
    }

    #[test]
    fn test_direction() {
        let records = test_wald("post_onset", &store()).unwrap();
        assert_eq!(records[0].direction, Some(Direction::Increase));
        assert_eq!(records[4].direction, Some(Direction::Decrease));
    }

    #[test]
    fn test_contrast_uses_covariance() {
        let h = Hypothesis::parse("years_since_onset - post_onset").unwrap();
        let f = fit("A", 1.0, 0.5, true);
        let (estimate, variance) = h.evaluate(&f).unwrap();
        assert_relative_eq!(estimate, -0.5, epsilon = 1e-12);
        // 0.04 + 0.25 - 2 * 0.01
        assert_relative_eq!(variance, 0.27, epsilon = 1e-12);
    }

    #[test]
    fn test_unknown_coefficient() {
        let result = test_wald("pre_onset", &store());
        assert!(matches!(result, Err(CplmmError::InvalidParameter(_))));
    }

    #[test]
    fn test_tester_runs_each_hypothesis() {
        let tester = WaldTester::from_strings(&["post_onset", "years_since_onset - post_onset"]).unwrap();
        let table = tester.test_all(&store()).unwrap();
        assert_eq!(table.len(), 10);
        assert_eq!(table.for_hypothesis("post_onset").count(), 5);
        assert!(WaldTester::new(vec![]).is_err());
    }
}
