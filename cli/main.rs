#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::io;
use std::path::{Path, PathBuf};
use std::process;

use metricval::config::{ConfoundFit, FactorCount, IccForm, PipelineConfig};
use metricval::data::{CovariateSpec, Group, Schema, load_population};
use metricval::report;
use metricval::synthetic::{self, SyntheticParams};
use metricval::Pipeline;

#[derive(Clone, Copy, ValueEnum)]
pub enum ConfoundFitCli {
    Reference,
    Pooled,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum IccFormCli {
    Consistency,
    Agreement,
}

#[derive(Args)]
pub struct InputArgs {
    /// Tab-separated table of reference (healthy) subjects
    #[arg(long, value_name = "PATH")]
    pub reference: PathBuf,

    /// Tab-separated table of impaired subjects
    #[arg(long, value_name = "PATH")]
    pub impaired: PathBuf,

    /// Comma-separated metric column names
    #[arg(long, value_delimiter = ',', required = true)]
    pub metrics: Vec<String>,

    /// Comma-separated continuous covariate columns (e.g. age)
    #[arg(long, value_delimiter = ',')]
    pub continuous: Vec<String>,

    /// Comma-separated categorical covariate columns (e.g. gender,tested_hand)
    #[arg(long, value_delimiter = ',')]
    pub categorical: Vec<String>,

    /// Comma-separated external criterion columns
    #[arg(long, value_delimiter = ',')]
    pub criteria: Vec<String>,

    /// Pipeline configuration file (.toml); flags below override it
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Number of factors to extract (default from config: 1)
    #[arg(long, value_name = "K")]
    pub factors: Option<usize>,

    /// Retain factors by the eigenvalue > 1 rule instead of a fixed count
    #[arg(long, conflicts_with = "factors")]
    pub kaiser: bool,

    #[arg(long, value_enum)]
    pub confound_fit: Option<ConfoundFitCli>,

    #[arg(long, value_enum)]
    pub icc_form: Option<IccFormCli>,

    /// Percentile of the pooled compensated distribution used as cut-off
    #[arg(long, value_name = "P")]
    pub cutoff_percentile: Option<f64>,

    /// Run per-metric stages on the current thread only
    #[arg(long)]
    pub sequential: bool,
}

#[derive(Parser)]
#[command(name = "metricval", version, about = "Psychometric validation of assessment metrics")]
pub struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    /// Worker threads for per-metric stages (default: all cores)
    #[arg(long, global = true)]
    pub threads: Option<usize>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run every stage and write all result tables
    #[command(
        about = "Run the full validation pipeline (outputs: metric_scores.tsv, partial_correlations.tsv, factor_loadings.tsv, scree.tsv, cutoffs.tsv, confound_models.toml, *_compensated.tsv)"
    )]
    Run {
        #[command(flatten)]
        input: InputArgs,

        /// Output directory
        #[arg(long, value_name = "DIR", default_value = ".")]
        out: PathBuf,
    },

    /// Stop after scoring and print the scree table
    #[command(about = "Print the scree table of the compensated metrics")]
    Scree {
        #[command(flatten)]
        input: InputArgs,
    },

    /// Generate synthetic reference and impaired tables
    #[command(about = "Generate synthetic tables (outputs: reference.tsv, impaired.tsv)")]
    Synthetic {
        /// Subjects per group
        #[arg(long, default_value = "50")]
        subjects: usize,

        /// Number of metrics
        #[arg(long, default_value = "2")]
        metrics: usize,

        #[arg(long, default_value = "42")]
        seed: u64,

        /// Probability that a subject has a retest measurement
        #[arg(long, default_value = "1.0")]
        retest_probability: f64,

        /// Output directory
        #[arg(long, value_name = "DIR", default_value = ".")]
        out: PathBuf,
    },
}

fn build_config(input: &InputArgs) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    let mut config = match &input.config {
        Some(path) => {
            log::info!("Loading configuration from '{}'", path.display());
            PipelineConfig::load(path)?
        }
        None => PipelineConfig::default(),
    };
    if let Some(k) = input.factors {
        config.factor_count = FactorCount::Fixed(k);
    }
    if input.kaiser {
        config.factor_count = FactorCount::Kaiser;
    }
    if let Some(fit) = input.confound_fit {
        config.confound_fit = match fit {
            ConfoundFitCli::Reference => ConfoundFit::Reference,
            ConfoundFitCli::Pooled => ConfoundFit::Pooled,
        };
    }
    if let Some(form) = input.icc_form {
        config.icc_form = match form {
            IccFormCli::Consistency => IccForm::Consistency,
            IccFormCli::Agreement => IccForm::Agreement,
        };
    }
    if let Some(p) = input.cutoff_percentile {
        config.cutoff_percentile = p;
    }
    if input.sequential {
        config.parallel = false;
    }
    config.validate()?;
    Ok(config)
}

fn build_pipeline(input: &InputArgs) -> Result<Pipeline<'static>, Box<dyn std::error::Error>> {
    let covariates = input
        .continuous
        .iter()
        .map(|name| CovariateSpec::continuous(name))
        .chain(
            input
                .categorical
                .iter()
                .map(|name| CovariateSpec::categorical(name)),
        )
        .collect();
    let schema = Schema::new(input.metrics.clone(), covariates, input.criteria.clone())?;
    let config = build_config(input)?;

    let reference = load_population(&input.reference, Group::Reference, &schema)?;
    let impaired = load_population(&input.impaired, Group::Impaired, &schema)?;
    Ok(Pipeline::new(schema, reference, impaired, config)?)
}

fn run(input: InputArgs, out: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let results = build_pipeline(&input)?.run_all()?;
    let paths = report::write_results(out, &results)?;

    println!("Scored {} metrics:", results.scores.len());
    for score in results.scores.scores() {
        let icc = score
            .icc
            .map_or_else(|| "NA".to_string(), |v| format!("{v:.3}"));
        println!("  {:<24} AUC {:.3}  ICC {icc}", score.metric, score.auc);
    }
    println!("Metric scores written to {}", paths.metric_scores.display());
    println!("Confound models written to {}", paths.confound_models.display());
    Ok(())
}

fn run_scree(input: InputArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut pipeline = build_pipeline(&input)?;
    pipeline.run_confound_correction()?;
    pipeline.run_standardization()?;
    pipeline.run_scoring()?;
    let scree = pipeline.scree()?;
    let stdout = io::stdout();
    report::write_scree_to(&mut stdout.lock(), &scree)?;
    println!("Kaiser criterion retains {} factor(s)", scree.kaiser_count());
    Ok(())
}

fn run_synthetic(
    subjects: usize,
    metrics: usize,
    seed: u64,
    retest_probability: f64,
    out: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let params = SyntheticParams {
        subjects_per_group: subjects,
        metrics,
        retest_probability,
        ..SyntheticParams::default()
    };
    let mut rng = StdRng::seed_from_u64(seed);
    let data = synthetic::generate(&params, &mut rng)?;

    let reference_path = out.join("reference.tsv");
    let impaired_path = out.join("impaired.tsv");
    report::write_population(&reference_path, &data.reference, &data.schema)?;
    report::write_population(&impaired_path, &data.impaired, &data.schema)?;
    println!(
        "Synthetic tables written to {} and {} (metrics: {})",
        reference_path.display(),
        impaired_path.display(),
        data.schema.metrics.join(",")
    );
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let log_level = cli
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();

    if let Some(threads) = cli.threads {
        if let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
        {
            log::warn!("Could not configure {threads} worker threads: {e}");
        }
    }

    let result = match cli.command {
        Some(Commands::Run { input, out }) => run(input, &out),
        Some(Commands::Scree { input }) => run_scree(input),
        Some(Commands::Synthetic {
            subjects,
            metrics,
            seed,
            retest_probability,
            out,
        }) => run_synthetic(subjects, metrics, seed, retest_probability, &out),
        None => {
            let mut command = Cli::command();
            command
                .print_help()
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)
                .map(|_| println!())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
