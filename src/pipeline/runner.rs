//! Panel runner: fit every biomarker in parallel, then test once.

use crate::config::AnalysisConfig;
use crate::data::{
    ColumnMapping, DesignAssembler, LongitudinalTable, ModelSpec, OnsetPolicy, ResultTable,
};
use crate::error::{CplmmError, Result};
use crate::model::{CoefficientStore, FitResult, LmmConfig, MixedModelFitter, SkipReason};
use rayon::prelude::*;
use std::path::Path;

/// Output of a panel run.
#[derive(Debug, Clone)]
pub struct PanelRun {
    /// Fit outcome per biomarker, in biomarker order.
    pub store: CoefficientStore,
    /// One row per biomarker and hypothesis.
    pub results: ResultTable,
}

/// Fit each biomarker's design on the rayon pool.
///
/// Per-biomarker failures are recorded as skips and never stop sibling fits.
/// Table-level problems (unknown columns, invalid model) fail the whole call.
pub fn fit_panel(
    table: &LongitudinalTable,
    mapping: &ColumnMapping,
    model: &ModelSpec,
    fitter: &LmmConfig,
    policy: OnsetPolicy,
) -> Result<CoefficientStore> {
    let assembler = DesignAssembler::new(table, mapping, model, policy)?;
    let fitter = MixedModelFitter::new(fitter.clone())?;
    let biomarkers = mapping.resolve_biomarkers(table);

    log::info!(
        "Fitting {} biomarkers ({} subjects, {} observations)",
        biomarkers.len(),
        table.n_subjects(),
        table.n_observations()
    );

    let outcomes: Vec<(String, Result<FitResult>)> = biomarkers
        .into_par_iter()
        .map(|biomarker| {
            let outcome = assembler
                .assemble(&biomarker)
                .and_then(|design| fitter.fit(&biomarker, &design));
            (biomarker, outcome)
        })
        .collect();

    let mut store = CoefficientStore::new();
    for (biomarker, outcome) in outcomes {
        match outcome {
            Ok(fit) => store.insert(fit),
            Err(e) => {
                log::warn!("Skipping {}: {}", biomarker, e);
                store.record_skip(&biomarker, SkipReason::from(&e));
            }
        }
    }

    let n_fitted = store.fits().count();
    log::info!(
        "Fitted {} of {} biomarkers ({} converged, {} skipped)",
        n_fitted,
        store.len(),
        store.n_converged(),
        store.n_skipped()
    );

    Ok(store)
}

/// Builder for configuring and running a panel analysis.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    config: AnalysisConfig,
}

impl Pipeline {
    /// Create a pipeline with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from a config.
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Set the analysis name.
    pub fn name(mut self, name: &str) -> Self {
        self.config.name = name.to_string();
        self
    }

    pub fn columns(mut self, columns: ColumnMapping) -> Self {
        self.config.columns = columns;
        self
    }

    pub fn model(mut self, model: ModelSpec) -> Self {
        self.config.model = model;
        self
    }

    pub fn fitter(mut self, fitter: LmmConfig) -> Self {
        self.config.fitter = fitter;
        self
    }

    pub fn onset_policy(mut self, policy: OnsetPolicy) -> Self {
        self.config.onset_policy = policy;
        self
    }

    /// Replace the hypotheses with a single one.
    pub fn test(mut self, hypothesis: &str) -> Self {
        self.config.hypotheses = vec![hypothesis.to_string()];
        self
    }

    /// Add a hypothesis.
    pub fn also_test(mut self, hypothesis: &str) -> Self {
        self.config.hypotheses.push(hypothesis.to_string());
        self
    }

    pub fn alpha(mut self, alpha: f64) -> Self {
        self.config.alpha = alpha;
        self
    }

    /// Convert to config for serialization.
    pub fn to_config(&self) -> AnalysisConfig {
        self.config.clone()
    }

    /// Fit the panel and test every hypothesis.
    pub fn run(&self, table: &LongitudinalTable) -> Result<PanelRun> {
        self.config.validate()?;
        let tester = self.config.wald_tester()?;

        let store = fit_panel(
            table,
            &self.config.columns,
            &self.config.model,
            &self.config.fitter,
            self.config.onset_policy,
        )?;

        let results = tester.test_all(&store)?;
        log::info!(
            "{}: {} significant rows at q < {}",
            self.config.name,
            results.significant(self.config.alpha).len(),
            self.config.alpha
        );

        Ok(PanelRun { store, results })
    }

    /// Load a TSV table with the configured mapping and run.
    pub fn run_tsv<P: AsRef<Path>>(&self, path: P) -> Result<PanelRun> {
        let path = path.as_ref();
        let table = LongitudinalTable::from_tsv(path, &self.config.columns).map_err(|e| match e {
            CplmmError::Io(io) => CplmmError::Io(std::io::Error::new(
                io.kind(),
                format!("{}: {}", path.display(), io),
            )),
            other => other,
        })?;
        self.run(&table)
    }
}
