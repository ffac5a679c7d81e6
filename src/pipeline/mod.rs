//! Panel and cohort analyses over a longitudinal table.

mod cohort;
mod runner;

pub use cohort::{
    cohort_model, compare_slopes, fit_cohorts, run_cohort_analysis, CohortFits, FitMetrics, Slope,
    SlopeComparison, SlopeReport, SlopeTest, SlopeTestKind,
};
pub use runner::{fit_panel, PanelRun, Pipeline};
