use brightspot::config::AnalysisConfig;
use brightspot::pipeline::run_from_path;
use brightspot::synthetic::SyntheticTableBuilder;

use clap::{Parser, Subcommand};
use std::error::Error;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(
    name = "brightspot",
    version,
    about = "Bayesian bright/dark spot analysis of fishery catch quality",
    long_about = "Fits a Gamma regression with a log link to catch nutritional quality, imputing \
                 missing predictors jointly from a multivariate normal model, and scores every \
                 country by the predictive quantile of its observed catch quality."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit the model to a CSV table and write the summaries and plot specs
    #[command(about = "Run the analysis (outputs: <prefix>_*.csv, <prefix>_*.toml)")]
    Run {
        /// Path to the input CSV file
        input: PathBuf,

        /// TOML configuration file; defaults reproduce the reference analysis
        #[arg(long)]
        config: Option<PathBuf>,

        /// Directory for all outputs
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Post-warm-up draws per chain
        #[arg(long, value_name = "N")]
        samples: Option<usize>,

        /// Warm-up iterations per chain
        #[arg(long, value_name = "N")]
        warmup: Option<usize>,

        /// Number of chains (at least 2)
        #[arg(long, value_name = "N")]
        chains: Option<usize>,

        /// Sampler seed
        #[arg(long)]
        seed: Option<u64>,

        /// Hide the progress bars
        #[arg(long)]
        no_progress: bool,
    },

    /// Write a synthetic input table drawn from a known model
    #[command(about = "Generate a synthetic input CSV")]
    Simulate {
        /// Output CSV path
        output: PathBuf,

        /// Number of analysable rows
        #[arg(long, default_value = "120")]
        rows: usize,

        /// Probability that a predictor cell is missing
        #[arg(long, default_value = "0.1")]
        missing_fraction: f64,

        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Print the default configuration as TOML
    DefaultConfig,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            input,
            config,
            output_dir,
            samples,
            warmup,
            chains,
            seed,
            no_progress,
        } => run_command(
            &input,
            config.as_deref(),
            RunOverrides {
                output_dir,
                samples,
                warmup,
                chains,
                seed,
                no_progress,
            },
        ),
        Commands::Simulate {
            output,
            rows,
            missing_fraction,
            seed,
        } => simulate_command(&output, rows, missing_fraction, seed),
        Commands::DefaultConfig => default_config_command(),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

struct RunOverrides {
    output_dir: Option<PathBuf>,
    samples: Option<usize>,
    warmup: Option<usize>,
    chains: Option<usize>,
    seed: Option<u64>,
    no_progress: bool,
}

impl RunOverrides {
    fn apply(self, config: &mut AnalysisConfig) {
        if let Some(dir) = self.output_dir {
            config.output.directory = dir;
        }
        if let Some(n) = self.samples {
            config.sampler.n_samples = n;
        }
        if let Some(n) = self.warmup {
            config.sampler.n_warmup = n;
        }
        if let Some(n) = self.chains {
            config.sampler.n_chains = n;
        }
        if let Some(seed) = self.seed {
            config.sampler.seed = seed;
        }
        if self.no_progress {
            config.sampler.show_progress = false;
        }
    }
}

fn run_command(
    input: &Path,
    config_path: Option<&Path>,
    overrides: RunOverrides,
) -> Result<(), Box<dyn Error>> {
    let mut config = match config_path {
        Some(path) => {
            log::info!("Loading configuration from '{}'", path.display());
            AnalysisConfig::load(path)?
        }
        None => AnalysisConfig::default(),
    };
    overrides.apply(&mut config);

    let (outputs, written) = run_from_path(input, &config, None)?;

    println!("Analysed {} rows; outputs:", outputs.prepared.n_rows());
    for path in &written {
        println!("  {}", path.display());
    }
    if !outputs.manifest.unconverged.is_empty() {
        println!(
            "Warning: R-hat above {} for {}",
            config.diagnostics.rhat_threshold,
            outputs.manifest.unconverged.join(", ")
        );
    }
    Ok(())
}

fn simulate_command(
    output: &Path,
    rows: usize,
    missing_fraction: f64,
    seed: u64,
) -> Result<(), Box<dyn Error>> {
    let (table, truth) = SyntheticTableBuilder::new(rows)
        .with_missing_fraction(missing_fraction)
        .with_seed(seed)
        .build()?;
    table.write_csv(BufWriter::new(File::create(output)?))?;
    println!(
        "Wrote {} rows to {} (intercept {}, shape {}, beta {:?})",
        table.n_rows(),
        output.display(),
        truth.intercept,
        truth.shape,
        truth.beta.to_vec()
    );
    Ok(())
}

fn default_config_command() -> Result<(), Box<dyn Error>> {
    print!("{}", AnalysisConfig::default().to_toml_string()?);
    Ok(())
}
