//! Mapping from semantic roles to column names.

use crate::data::table::{LongitudinalTable, VariableType};
use crate::error::{CplmmError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Caller-supplied column names for each semantic role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMapping {
    /// Subject identifier column.
    pub subject: String,
    /// Measurement time (age at collection).
    pub time: String,
    /// Status label column.
    pub status: String,
    /// Onset anchor column; `None` when the table carries no onset.
    pub onset: Option<String>,
    /// Status label meaning "normal"; every other label is abnormal.
    pub normal_label: String,
    /// Biomarkers to fit; `None` fits every numeric non-covariate column.
    pub biomarkers: Option<Vec<String>>,
    /// Covariate columns added to every fixed-effect design.
    pub covariates: Vec<String>,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            subject: "SUBID".to_string(),
            time: "PROCEDURE_AGE".to_string(),
            status: "STATUS".to_string(),
            onset: Some("ONSET_AGE".to_string()),
            normal_label: "Normal".to_string(),
            biomarkers: None,
            covariates: vec!["SEX".to_string(), "BASELINE_AGE".to_string()],
        }
    }
}

impl ColumnMapping {
    /// Role columns (subject, time, status, onset).
    fn role_columns(&self) -> Vec<&str> {
        let mut roles = vec![self.subject.as_str(), self.time.as_str(), self.status.as_str()];
        if let Some(onset) = &self.onset {
            roles.push(onset.as_str());
        }
        roles
    }

    /// Check that every role column exists in a header and roles are distinct.
    pub fn validate_header(&self, header: &[String]) -> Result<()> {
        let roles = self.role_columns();
        let mut distinct = HashSet::new();
        for role in &roles {
            if !distinct.insert(*role) {
                return Err(CplmmError::InvalidParameter(format!(
                    "Column '{}' is mapped to more than one role",
                    role
                )));
            }
            if !header.iter().any(|h| h == role) {
                return Err(CplmmError::MissingColumn(role.to_string()));
            }
        }
        Ok(())
    }

    /// Check covariates and requested biomarkers against a loaded table.
    pub fn validate_table(&self, table: &LongitudinalTable) -> Result<()> {
        let roles = self.role_columns();
        for covariate in &self.covariates {
            if roles.contains(&covariate.as_str()) {
                return Err(CplmmError::InvalidParameter(format!(
                    "Covariate '{}' is also a role column",
                    covariate
                )));
            }
            if !table.has_column(covariate) {
                return Err(CplmmError::MissingColumn(covariate.clone()));
            }
        }
        if let Some(biomarkers) = &self.biomarkers {
            for biomarker in biomarkers {
                if self.covariates.contains(biomarker) {
                    return Err(CplmmError::InvalidParameter(format!(
                        "Biomarker '{}' is also a covariate",
                        biomarker
                    )));
                }
                if !table.has_column(biomarker) {
                    return Err(CplmmError::MissingColumn(biomarker.clone()));
                }
            }
        }
        Ok(())
    }

    /// Biomarkers to fit, in table column order unless listed explicitly.
    pub fn resolve_biomarkers(&self, table: &LongitudinalTable) -> Vec<String> {
        match &self.biomarkers {
            Some(list) => list.clone(),
            None => table
                .column_names()
                .iter()
                .filter(|c| !self.covariates.contains(c))
                .filter(|c| table.column_type(c) == Some(VariableType::Continuous))
                .cloned()
                .collect(),
        }
    }
}
