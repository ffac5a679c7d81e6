//! Synthetic data with known slope changes for benchmarking.

mod generate;

pub use generate::{generate_synthetic, GroundTruth, SyntheticConfig, SyntheticData};
