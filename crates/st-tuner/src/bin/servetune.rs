use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use st_data::{ExtractorConfig, TrialStore};
use st_driver::{ExperimentDriver, ReplayDriver, ShellDriver};
use st_optimizer::RunState;
use st_tuner::{collect, AppConfig, Tuner};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "servetune")]
#[command(about = "Closed-loop tuner for vLLM serving parameters")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Tune every configured model, dataset and mode
    Tune {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,

        /// Replay stored trial logs instead of launching the engine
        #[arg(long)]
        replay: bool,
    },
    /// Check a configuration file without running anything
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Rebuild the results table from stored trial logs
    Collect {
        /// Trial store directory
        #[arg(short, long)]
        output_dir: PathBuf,

        /// Results table to write
        #[arg(short, long, default_value = "results.csv")]
        table: PathBuf,

        /// Take the log markers from this configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level, cli.verbose)?;

    match cli.command {
        Commands::Tune { config, replay } => tune(config, replay).await,
        Commands::Validate { config } => validate(config),
        Commands::Collect {
            output_dir,
            table,
            config,
        } => {
            let extractor = match config {
                Some(path) => load_config(&path)?.extractor,
                None => ExtractorConfig::default(),
            };
            let rows = collect(&output_dir, &table, &extractor)?;
            println!("Wrote {} rows to {}", rows, table.display());
            Ok(())
        }
    }
}

fn init_tracing(log_level: &str, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        match log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    };

    let directives = ["servetune", "st_tuner", "st_driver", "st_optimizer", "st_data"]
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect::<Vec<_>>()
        .join(",");

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| directives.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn load_config(path: &Path) -> Result<AppConfig> {
    AppConfig::from_yaml_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

fn validate(path: PathBuf) -> Result<()> {
    let config = load_config(&path)?;
    config.validate().context("Configuration is invalid")?;

    let runs = config.runs();
    println!("Configuration is valid: {} runs", runs.len());
    for run in runs {
        println!("  {}", run);
    }
    Ok(())
}

async fn tune(path: PathBuf, replay: bool) -> Result<()> {
    let config = load_config(&path)?;

    let driver: Box<dyn ExperimentDriver> = if replay {
        let store = TrialStore::new(&config.output_dir)?;
        Box::new(ReplayDriver::new(store))
    } else {
        Box::new(ShellDriver::new(config.driver.clone()))
    };

    let mut tuner = Tuner::new(config, driver)?;
    let statuses = tuner.run_all().await?;

    println!("\n=== Tuning Summary ===");
    for status in &statuses {
        match (&status.state, &status.best_trial) {
            (RunState::Failed, _) => {
                error!(run = %status.run, "Run failed");
                println!(
                    "{}: failed after {} trials ({})",
                    status.run,
                    status.trials_completed,
                    status.error.as_deref().unwrap_or("unknown error")
                );
            }
            (_, Some(best)) => println!(
                "{}: best {} at {:.2} req/s after {} trials",
                status.run, best.point, best.request_throughput, status.trials_completed
            ),
            (_, None) => {
                warn!(run = %status.run, "No feasible point found");
                println!(
                    "{}: no feasible point in {} trials",
                    status.run, status.trials_completed
                );
            }
        }
    }
    info!(
        results_table = %tuner.config().results_table.display(),
        "Tuning complete"
    );
    Ok(())
}
