//! Hypothesis testing on fitted change-point models.

pub mod wald;

pub use wald::{test_hypothesis, test_wald, Hypothesis, WaldTester};
