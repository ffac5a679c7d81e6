//! Change-point linear mixed models for longitudinal biomarker panels
//!
//! Fits, for every biomarker in a panel, a linear mixed model whose time
//! trend bends at each subject's disease onset, then tests whether the slope
//! changes at onset with Wald tests and Benjamini-Hochberg correction.
//!
//! # Overview
//!
//! - **data**: Longitudinal tables, subjects, onset-anchored time basis, designs
//! - **model**: Fisher-scoring fit of the mixed model (ML or REML) and the fit store
//! - **test**: Wald tests of coefficients and contrasts
//! - **correct**: Multiple testing correction (Benjamini-Hochberg)
//! - **pipeline**: Parallel panel fitting and three-cohort slope comparison
//! - **benchmark**: Synthetic cohorts with known slope changes
//!
//! # Example
//!
//! ```no_run
//! use cplmm::prelude::*;
//!
//! let run = Pipeline::new()
//!     .test("post_onset")
//!     .run_tsv("biomarkers.tsv")
//!     .unwrap();
//!
//! for record in run.results.sorted_by_qvalue().iter().take(10) {
//!     println!("{} {:?}", record.biomarker_id, record.q_value);
//! }
//! ```

pub mod benchmark;
pub mod config;
pub mod correct;
pub mod data;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod test;

/// Convenient re-exports for common usage.
pub mod prelude {
    pub use crate::benchmark::{generate_synthetic, GroundTruth, SyntheticConfig, SyntheticData};
    pub use crate::config::AnalysisConfig;
    pub use crate::correct::{correct_bh, BhCorrected};
    pub use crate::data::{
        BasisTerm, Cohort, ColumnMapping, Confidence, Direction, LongitudinalTable, ModelSpec,
        Observation, OnsetPolicy, RandomEffects, ResultTable, Status, TestStatus, Variable,
        WaldRecord,
    };
    pub use crate::error::{CplmmError, Result};
    pub use crate::model::{
        fit_lmm, CoefficientStore, EstimationMethod, FitOutcome, FitResult, LmmConfig,
        MixedModelFitter, SkipReason,
    };
    pub use crate::pipeline::{
        compare_slopes, fit_cohorts, fit_panel, run_cohort_analysis, PanelRun, Pipeline,
        SlopeReport, SlopeTestKind,
    };
    pub use crate::test::{test_hypothesis, test_wald, Hypothesis, WaldTester};
}
