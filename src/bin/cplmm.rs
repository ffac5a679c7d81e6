//! CPLMM - change-point mixed models for longitudinal biomarkers
//!
//! Command-line interface for panel and cohort analyses.

use clap::{Parser, Subcommand, ValueEnum};
use cplmm::benchmark::{generate_synthetic, SyntheticConfig};
use cplmm::config::AnalysisConfig;
use cplmm::data::LongitudinalTable;
use cplmm::error::Result;
use cplmm::pipeline::{run_cohort_analysis, Pipeline, SlopeTestKind};
use std::path::{Path, PathBuf};

/// Output format for result tables
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Tsv,
    Json,
}

/// Slope test used to rank cohort results
#[derive(Debug, Clone, Copy, ValueEnum)]
enum RankBy {
    /// Pre- vs post-onset slope in converting subjects
    #[value(name = "1")]
    StatusChange,
    /// Normal vs abnormal cohort slope
    #[value(name = "2")]
    NormalVsAbnormal,
}

impl From<RankBy> for SlopeTestKind {
    fn from(rank_by: RankBy) -> Self {
        match rank_by {
            RankBy::StatusChange => SlopeTestKind::StatusChange,
            RankBy::NormalVsAbnormal => SlopeTestKind::NormalVsAbnormal,
        }
    }
}

/// Change-point linear mixed models for biomarker panels
#[derive(Parser)]
#[command(name = "cplmm")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit every biomarker and test the configured hypotheses
    Run {
        /// Path to analysis configuration YAML (defaults used if omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Path to longitudinal table TSV
        #[arg(short, long)]
        input: PathBuf,

        /// Output path for results
        #[arg(short, long)]
        output: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value = "tsv")]
        format: OutputFormat,
    },

    /// Compare slopes across status-change, normal and abnormal cohorts
    Cohorts {
        /// Path to analysis configuration YAML (defaults used if omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Path to longitudinal table TSV
        #[arg(short, long)]
        input: PathBuf,

        /// Output path for ranked results
        #[arg(short, long)]
        output: PathBuf,

        /// Adjusted p-value to rank by
        #[arg(short, long, value_enum, default_value = "1")]
        rank_by: RankBy,

        /// Output format
        #[arg(short, long, value_enum, default_value = "tsv")]
        format: OutputFormat,
    },

    /// Write a synthetic dataset and a matching configuration
    Example {
        /// Output directory
        #[arg(short, long)]
        output: PathBuf,

        /// Random seed (default: 42)
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Generate the small preset instead of the default panel
        #[arg(long)]
        small: bool,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            config,
            input,
            output,
            format,
        } => cmd_run(config.as_deref(), &input, &output, format),

        Commands::Cohorts {
            config,
            input,
            output,
            rank_by,
            format,
        } => cmd_cohorts(config.as_deref(), &input, &output, rank_by.into(), format),

        Commands::Example {
            output,
            seed,
            small,
        } => cmd_example(&output, seed, small),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<AnalysisConfig> {
    match path {
        Some(path) => {
            eprintln!("Loading configuration from {:?}...", path);
            AnalysisConfig::from_yaml_file(path)
        }
        None => Ok(AnalysisConfig::default()),
    }
}

fn load_table(path: &Path, config: &AnalysisConfig) -> Result<LongitudinalTable> {
    eprintln!("Loading data...");
    let table = LongitudinalTable::from_tsv(path, &config.columns)?;
    eprintln!(
        "Loaded {} observations from {} subjects",
        table.n_observations(),
        table.n_subjects()
    );
    Ok(table)
}

/// Fit the panel and write the Wald results
fn cmd_run(config_path: Option<&Path>, input: &Path, output: &Path, format: OutputFormat) -> Result<()> {
    let config = load_config(config_path)?;
    let table = load_table(input, &config)?;

    eprintln!("Running analysis '{}'...", config.name);
    eprintln!("  Testing: {}", config.hypotheses.join(", "));
    let run = Pipeline::from_config(&config).run(&table)?;

    eprintln!("Writing results to {:?}...", output);
    match format {
        OutputFormat::Tsv => run.results.to_tsv(output)?,
        OutputFormat::Json => run.results.to_json(output)?,
    }

    eprintln!("Done!");
    eprintln!("{}", run.results.summary());

    let top = run.results.sorted_by_qvalue();
    let hits: Vec<_> = top.iter().filter(|r| r.q_value.is_some()).take(5).collect();
    if !hits.is_empty() {
        eprintln!("\nTop hits:");
        for r in hits {
            eprintln!(
                "  {} [{}]: estimate={:.3}, q={:.4}",
                r.biomarker_id,
                r.hypothesis,
                r.estimate.unwrap_or(f64::NAN),
                r.q_value.unwrap_or(f64::NAN)
            );
        }
    }

    Ok(())
}

/// Run the three-cohort slope comparison
fn cmd_cohorts(
    config_path: Option<&Path>,
    input: &Path,
    output: &Path,
    rank_by: SlopeTestKind,
    format: OutputFormat,
) -> Result<()> {
    let config = load_config(config_path)?;
    let table = load_table(input, &config)?;

    eprintln!("Fitting status-change, normal and abnormal cohorts...");
    let report = run_cohort_analysis(&table, &config)?;

    eprintln!("Writing results to {:?}...", output);
    match format {
        OutputFormat::Tsv => report.to_tsv(output, rank_by, config.alpha)?,
        OutputFormat::Json => report.to_json(output)?,
    }

    eprintln!("Done! {} biomarkers compared", report.len());
    eprintln!(
        "  {} significant at q < {}",
        report.significant(rank_by, config.alpha).len(),
        config.alpha
    );

    Ok(())
}

/// Generate synthetic example data
fn cmd_example(output: &Path, seed: u64, small: bool) -> Result<()> {
    let base = if small {
        SyntheticConfig::small()
    } else {
        SyntheticConfig::default()
    };
    let data = generate_synthetic(&base.with_seed(seed))?;
    data.write_to_dir(output)?;

    eprintln!(
        "Wrote {} observations from {} subjects to {:?}",
        data.table.n_observations(),
        data.table.n_subjects(),
        output
    );
    eprintln!("  {} of {} biomarkers change slope at onset", data.ground_truth.changing.len(), data.config.n_biomarkers);
    eprintln!();
    eprintln!("Try:");
    eprintln!(
        "  cplmm run -c {0}/analysis.yaml -i {0}/table.tsv -o {0}/results.tsv",
        output.display()
    );

    Ok(())
}
