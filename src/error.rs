//! Error types for the cplmm library.

use thiserror::Error;

/// Main error type for the library.
#[derive(Error, Debug)]
pub enum CplmmError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Missing column '{0}' in longitudinal table")]
    MissingColumn(String),

    #[error("Invalid time data: {0}")]
    InvalidTime(String),

    #[error("Insufficient data for biomarker '{biomarker}': {reason}")]
    EmptyDesign { biomarker: String, reason: String },

    #[error("Rank-deficient design for biomarker '{biomarker}': rank {rank} < {n_columns} columns")]
    SingularDesign {
        biomarker: String,
        rank: usize,
        n_columns: usize,
    },

    #[error("Status reverts from abnormal to normal for subject '{subject}' at time {time}")]
    StatusReversion { subject: String, time: f64 },

    #[error("Biomarker '{0}' not found")]
    NotFound(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Numerical error: {0}")]
    Numerical(String),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, CplmmError>;
