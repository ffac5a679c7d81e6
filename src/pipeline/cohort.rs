//! Three-cohort slope comparison.
//!
//! Subjects are split by status trajectory and each cohort is fitted
//! separately for every biomarker:
//!
//! | cohort         | basis                      | slopes                      |
//! |----------------|----------------------------|-----------------------------|
//! | status change  | `pre_onset`, `post_onset`  | β1 = −pre, β3 = post        |
//! | normal         | `pre_onset`                | β2 = −pre                   |
//! | abnormal       | `post_onset`               | β4 = post                   |
//!
//! Two Wald tests follow. The first compares β1 with β3 inside the
//! status-change fit, using the fit's own covariance between the two terms.
//! The second compares β2 with β4 across the independent normal and abnormal
//! fits. Each test is BH-corrected over the biomarkers whose fits converged.

use crate::config::AnalysisConfig;
use crate::correct::correct_bh;
use crate::data::{
    BasisTerm, Cohort, ColumnMapping, Direction, LongitudinalTable, ModelSpec, RandomEffects,
    TestStatus, INTERCEPT,
};
use crate::error::{CplmmError, Result};
use crate::model::{CoefficientStore, FitOutcome, FitResult, SkipReason};
use crate::pipeline::runner::fit_panel;
use crate::test::wald::wald_statistic;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const PRE: &str = "pre_onset";
const POST: &str = "post_onset";

/// Piecewise model fitted within one cohort.
pub fn cohort_model(cohort: Cohort, random_effects: RandomEffects) -> ModelSpec {
    let basis: &[BasisTerm] = match cohort {
        Cohort::StatusChange => &[BasisTerm::PreOnset, BasisTerm::PostOnset],
        Cohort::Normal => &[BasisTerm::PreOnset],
        Cohort::Abnormal => &[BasisTerm::PostOnset],
    };
    ModelSpec {
        basis: basis.to_vec(),
        random_effects,
    }
}

/// Per-cohort fit outcomes for a shared biomarker list.
#[derive(Debug, Clone)]
pub struct CohortFits {
    pub biomarkers: Vec<String>,
    pub status_change: CoefficientStore,
    pub normal: CoefficientStore,
    pub abnormal: CoefficientStore,
}

impl CohortFits {
    pub fn store(&self, cohort: Cohort) -> &CoefficientStore {
        match cohort {
            Cohort::StatusChange => &self.status_change,
            Cohort::Normal => &self.normal,
            Cohort::Abnormal => &self.abnormal,
        }
    }
}

/// Fit every biomarker within each cohort.
///
/// A cohort with no subjects records every biomarker as skipped.
pub fn fit_cohorts(table: &LongitudinalTable, config: &AnalysisConfig) -> Result<CohortFits> {
    config.validate()?;
    config.columns.validate_table(table)?;

    let biomarkers = config.columns.resolve_biomarkers(table);
    let mapping = ColumnMapping {
        biomarkers: Some(biomarkers.clone()),
        ..config.columns.clone()
    };

    let mut stores = Vec::with_capacity(3);
    for cohort in [Cohort::StatusChange, Cohort::Normal, Cohort::Abnormal] {
        let n_subjects = table.subjects().iter().filter(|s| s.cohort() == cohort).count();
        if n_subjects == 0 {
            log::warn!("No subjects in the {} cohort", cohort.name());
            let mut store = CoefficientStore::new();
            for b in &biomarkers {
                store.record_skip(
                    b,
                    SkipReason::EmptyDesign(format!("no subjects in the {} cohort", cohort.name())),
                );
            }
            stores.push(store);
            continue;
        }

        log::info!("Fitting the {} cohort ({} subjects)", cohort.name(), n_subjects);
        let subset = table.subset_cohort(cohort)?;
        let model = cohort_model(cohort, config.model.random_effects);
        stores.push(fit_panel(
            &subset,
            &mapping,
            &model,
            &config.fitter,
            config.onset_policy,
        )?);
    }

    let mut stores = stores.into_iter();
    match (stores.next(), stores.next(), stores.next()) {
        (Some(status_change), Some(normal), Some(abnormal)) => Ok(CohortFits {
            biomarkers,
            status_change,
            normal,
            abnormal,
        }),
        _ => Err(CplmmError::Numerical("cohort fits incomplete".to_string())),
    }
}

/// Which slope test to rank by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlopeTestKind {
    /// β1 vs β3 within converting subjects.
    #[default]
    StatusChange,
    /// β2 (normal) vs β4 (abnormal).
    NormalVsAbnormal,
}

/// A slope and its standard error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Slope {
    pub estimate: f64,
    pub std_error: f64,
}

/// Fit quality of one cohort model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitMetrics {
    pub aic: f64,
    pub bic: f64,
    pub mse: f64,
}

impl From<&FitResult> for FitMetrics {
    fn from(fit: &FitResult) -> Self {
        Self {
            aic: fit.aic,
            bic: fit.bic,
            mse: fit.mse,
        }
    }
}

/// Outcome of one slope-difference test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlopeTest {
    /// Difference of the two slopes.
    pub estimate: Option<f64>,
    pub std_error: Option<f64>,
    pub statistic: Option<f64>,
    pub p_value: Option<f64>,
    pub q_value: Option<f64>,
    pub status: TestStatus,
}

impl SlopeTest {
    fn not_tested(status: TestStatus) -> Self {
        Self {
            estimate: None,
            std_error: None,
            statistic: None,
            p_value: None,
            q_value: None,
            status,
        }
    }

    fn from_difference(estimate: f64, variance: f64) -> Result<Self> {
        let std_error = (variance.is_finite() && variance > 0.0).then(|| variance.sqrt());
        Ok(match wald_statistic(estimate, variance)? {
            Some((statistic, p_value)) => Self {
                estimate: Some(estimate),
                std_error,
                statistic: Some(statistic),
                p_value: Some(p_value),
                q_value: None,
                status: TestStatus::Tested,
            },
            None => Self {
                estimate: Some(estimate),
                std_error,
                statistic: None,
                p_value: None,
                q_value: None,
                status: TestStatus::Untestable(format!("variance {} is not positive", variance)),
            },
        })
    }

    /// Direction of the slope difference.
    pub fn direction(&self) -> Option<Direction> {
        self.estimate.map(Direction::from_estimate)
    }
}

/// Slopes and tests for one biomarker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlopeComparison {
    pub biomarker_id: String,
    /// Intercept of the status-change fit, when that fit converged.
    pub intercept: Option<f64>,
    /// β1: status-change cohort, before onset.
    pub beta1: Option<Slope>,
    /// β2: normal cohort.
    pub beta2: Option<Slope>,
    /// β3: status-change cohort, after onset.
    pub beta3: Option<Slope>,
    /// β4: abnormal cohort.
    pub beta4: Option<Slope>,
    pub status_change_fit: Option<FitMetrics>,
    pub normal_fit: Option<FitMetrics>,
    pub abnormal_fit: Option<FitMetrics>,
    /// β1 − β3.
    pub test1: SlopeTest,
    /// β2 − β4.
    pub test2: SlopeTest,
}

impl SlopeComparison {
    pub fn test(&self, kind: SlopeTestKind) -> &SlopeTest {
        match kind {
            SlopeTestKind::StatusChange => &self.test1,
            SlopeTestKind::NormalVsAbnormal => &self.test2,
        }
    }
}

/// Fitted outcome, or the status explaining why there is none usable.
fn usable_fit<'a>(store: &'a CoefficientStore, biomarker: &str) -> std::result::Result<&'a FitResult, TestStatus> {
    match store.outcome(biomarker) {
        Some(FitOutcome::Fitted(fit)) if fit.converged => Ok(fit),
        Some(FitOutcome::Fitted(_)) => Err(TestStatus::NotConverged),
        Some(FitOutcome::Skipped(reason)) => Err(TestStatus::Skipped(reason.clone())),
        None => Err(TestStatus::Untestable("no fit".to_string())),
    }
}

fn slope(fit: &FitResult, name: &str, sign: f64) -> Option<Slope> {
    Some(Slope {
        estimate: sign * fit.coefficient(name)?,
        std_error: fit.std_error(name)?,
    })
}

fn missing_term(name: &str) -> TestStatus {
    TestStatus::Untestable(format!("'{}' not in fit", name))
}

fn compare_one(fits: &CohortFits, biomarker: &str) -> Result<SlopeComparison> {
    let status_change = usable_fit(&fits.status_change, biomarker);
    let normal = usable_fit(&fits.normal, biomarker);
    let abnormal = usable_fit(&fits.abnormal, biomarker);

    let metrics = |store: &CoefficientStore| {
        store
            .outcome(biomarker)
            .and_then(FitOutcome::fit)
            .map(FitMetrics::from)
    };

    let intercept = status_change.as_ref().ok().and_then(|f| f.coefficient(INTERCEPT));
    let beta1 = status_change.as_ref().ok().and_then(|f| slope(f, PRE, -1.0));
    let beta3 = status_change.as_ref().ok().and_then(|f| slope(f, POST, 1.0));
    let beta2 = normal.as_ref().ok().and_then(|f| slope(f, PRE, -1.0));
    let beta4 = abnormal.as_ref().ok().and_then(|f| slope(f, POST, 1.0));

    // Var(β1 − β3) = Var(pre) + Var(post) + 2 Cov(pre, post) since β1 = −pre.
    let test1 = match &status_change {
        Err(status) => SlopeTest::not_tested(status.clone()),
        Ok(fit) => match (beta1, beta3, fit.covariance_between(PRE, POST)) {
            (Some(b1), Some(b3), Some(cov)) => {
                let variance = b1.std_error.powi(2) + b3.std_error.powi(2) + 2.0 * cov;
                SlopeTest::from_difference(b1.estimate - b3.estimate, variance)?
            }
            (None, ..) => SlopeTest::not_tested(missing_term(PRE)),
            _ => SlopeTest::not_tested(missing_term(POST)),
        },
    };

    let test2 = match (&normal, &abnormal) {
        (Err(status), _) | (_, Err(status)) => SlopeTest::not_tested(status.clone()),
        (Ok(_), Ok(_)) => match (beta2, beta4) {
            (Some(b2), Some(b4)) => {
                let variance = b2.std_error.powi(2) + b4.std_error.powi(2);
                SlopeTest::from_difference(b2.estimate - b4.estimate, variance)?
            }
            (None, _) => SlopeTest::not_tested(missing_term(PRE)),
            _ => SlopeTest::not_tested(missing_term(POST)),
        },
    };

    Ok(SlopeComparison {
        biomarker_id: biomarker.to_string(),
        intercept,
        beta1,
        beta2,
        beta3,
        beta4,
        status_change_fit: metrics(&fits.status_change),
        normal_fit: metrics(&fits.normal),
        abnormal_fit: metrics(&fits.abnormal),
        test1,
        test2,
    })
}

/// BH over the tested rows of one slope test.
fn correct_slope_test(rows: &mut [SlopeComparison], kind: SlopeTestKind) {
    let tested: Vec<usize> = rows
        .iter()
        .enumerate()
        .filter(|(_, r)| r.test(kind).status.is_tested())
        .map(|(i, _)| i)
        .collect();
    let p_values: Vec<f64> = tested.iter().filter_map(|&i| rows[i].test(kind).p_value).collect();
    let ids: Vec<String> = tested.iter().map(|&i| rows[i].biomarker_id.clone()).collect();

    let corrected = correct_bh(&p_values, &ids);
    for (&i, q) in tested.iter().zip(corrected.q_values) {
        let test = match kind {
            SlopeTestKind::StatusChange => &mut rows[i].test1,
            SlopeTestKind::NormalVsAbnormal => &mut rows[i].test2,
        };
        test.q_value = Some(q);
    }
}

/// Slope comparisons for every biomarker, in biomarker order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlopeReport {
    pub rows: Vec<SlopeComparison>,
}

/// Compute both slope tests and correct each over the panel.
pub fn compare_slopes(fits: &CohortFits) -> Result<SlopeReport> {
    let mut rows = fits
        .biomarkers
        .iter()
        .map(|b| compare_one(fits, b))
        .collect::<Result<Vec<_>>>()?;

    correct_slope_test(&mut rows, SlopeTestKind::StatusChange);
    correct_slope_test(&mut rows, SlopeTestKind::NormalVsAbnormal);

    log::info!(
        "Slope tests: {} biomarkers, {} with test 1, {} with test 2",
        rows.len(),
        rows.iter().filter(|r| r.test1.status.is_tested()).count(),
        rows.iter().filter(|r| r.test2.status.is_tested()).count()
    );

    Ok(SlopeReport { rows })
}

/// Fit the three cohorts and compare slopes.
pub fn run_cohort_analysis(table: &LongitudinalTable, config: &AnalysisConfig) -> Result<SlopeReport> {
    let fits = fit_cohorts(table, config)?;
    compare_slopes(&fits)
}

impl SlopeReport {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, biomarker_id: &str) -> Option<&SlopeComparison> {
        self.rows.iter().find(|r| r.biomarker_id == biomarker_id)
    }

    /// Rows ordered by the adjusted p-value of one test; untested rows last.
    pub fn ranked_by(&self, kind: SlopeTestKind) -> Vec<&SlopeComparison> {
        let mut ranked: Vec<_> = self.rows.iter().collect();
        ranked.sort_by(|a, b| match (a.test(kind).q_value, b.test(kind).q_value) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        ranked
    }

    /// Rows significant at `alpha` under one test.
    pub fn significant(&self, kind: SlopeTestKind, alpha: f64) -> Vec<&SlopeComparison> {
        self.rows
            .iter()
            .filter(|r| r.test(kind).q_value.map_or(false, |q| q < alpha))
            .collect()
    }

    /// Write ranked rows as tab-separated text.
    pub fn write_tsv<W: Write>(&self, mut writer: W, rank_by: SlopeTestKind, alpha: f64) -> Result<()> {
        writeln!(
            writer,
            "rank\tbiomarker\tintercept\tbeta1\tse_beta1\tbeta3\tse_beta3\twald1\tp_value1\tq_value1\tstatus1\t\
             beta2\tse_beta2\tbeta4\tse_beta4\twald2\tp_value2\tq_value2\tstatus2\t\
             aic_status_change\tbic_status_change\tmse_status_change\t\
             aic_normal\tbic_normal\tmse_normal\taic_abnormal\tbic_abnormal\tmse_abnormal\tsignificant"
        )?;

        let num = |v: Option<f64>| v.map_or_else(|| "NA".to_string(), |x| format!("{:.6}", x));
        let sci = |v: Option<f64>| v.map_or_else(|| "NA".to_string(), |x| format!("{:.4e}", x));
        let slope = |s: Option<Slope>| {
            format!(
                "{}\t{}",
                num(s.map(|s| s.estimate)),
                num(s.map(|s| s.std_error))
            )
        };
        let metrics = |m: Option<FitMetrics>| {
            format!(
                "{}\t{}\t{}",
                num(m.map(|m| m.aic)),
                num(m.map(|m| m.bic)),
                num(m.map(|m| m.mse))
            )
        };

        for (rank, r) in self.ranked_by(rank_by).into_iter().enumerate() {
            let significant = r.test(rank_by).q_value.map_or(false, |q| q < alpha);
            writeln!(
                writer,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                rank + 1,
                r.biomarker_id,
                num(r.intercept),
                slope(r.beta1),
                slope(r.beta3),
                num(r.test1.statistic),
                sci(r.test1.p_value),
                sci(r.test1.q_value),
                r.test1.status.label(),
                slope(r.beta2),
                slope(r.beta4),
                num(r.test2.statistic),
                sci(r.test2.p_value),
                sci(r.test2.q_value),
                r.test2.status.label(),
                metrics(r.status_change_fit),
                format!("{}\t{}", metrics(r.normal_fit), metrics(r.abnormal_fit)),
                significant
            )?;
        }
        Ok(())
    }

    /// Write ranked rows to a TSV file.
    pub fn to_tsv<P: AsRef<Path>>(&self, path: P, rank_by: SlopeTestKind, alpha: f64) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        self.write_tsv(&mut writer, rank_by, alpha)?;
        writer.flush()?;
        Ok(())
    }

    /// Write rows to a JSON file.
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }
}
