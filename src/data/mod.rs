//! Data structures for longitudinal biomarker analysis.

mod columns;
mod design_matrix;
mod result;
mod subject;
mod table;
mod time_basis;

pub use columns::ColumnMapping;
pub use design_matrix::{BiomarkerDesign, DesignAssembler, ModelSpec, RandomEffects, INTERCEPT};
pub use result::{Confidence, Direction, ResultSummary, ResultTable, TestStatus, WaldRecord};
pub use subject::{Cohort, Subject};
pub use table::{LongitudinalTable, Observation, Status, Variable, VariableType};
pub use time_basis::{BasisTerm, OnsetPolicy, PiecewiseTime, TimeBasisBuilder};
