//! Mixed model estimation and fit storage.

pub mod lmm;
pub mod store;

pub use lmm::{fit_lmm, EstimationMethod, FitResult, LmmConfig, MixedModelFitter};
pub use store::{CoefficientStore, FitOutcome, SkipReason};
