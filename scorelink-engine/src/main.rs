//! scorelink - score/performance linking and render pipeline
//!
//! `scorelink match` builds and writes the registry snapshot only.
//! `scorelink run` also executes the configured render stages.
//!
//! Exit status: 0 on full success, 1 when any stage failed or the run was
//! cancelled, 2 on a fatal error (bad input, configuration, I/O).

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use scorelink_common::config::{self, ExecutionMode, TomlConfig};
use scorelink_engine::run::{self, RegistrySource, RunLayout, RunOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "scorelink")]
#[command(about = "Link score notes to performed notes and render per-note artifacts")]
#[command(version)]
struct Cli {
    /// TOML config file
    #[arg(long, global = true, env = config::CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, env = "SCORELINK_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Match, freeze the registry and run the render stages
    Run(RunArgs),
    /// Match and write the registry snapshot only
    Match(MatchArgs),
}

#[derive(Args, Debug)]
struct MatchArgs {
    /// Score document (JSON)
    #[arg(long, env = "SCORELINK_SCORE")]
    score: PathBuf,

    /// Performance document (JSON)
    #[arg(long, env = "SCORELINK_PERFORMANCE")]
    performance: PathBuf,

    #[arg(long, env = "SCORELINK_OUTPUT_DIR")]
    output_dir: PathBuf,

    /// Matching tolerance in milliseconds
    #[arg(long, env = "SCORELINK_TOLERANCE_MS")]
    tolerance_ms: Option<f64>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Score document (JSON)
    #[arg(long, env = "SCORELINK_SCORE", required_unless_present = "registry")]
    score: Option<PathBuf>,

    /// Performance document (JSON)
    #[arg(long, env = "SCORELINK_PERFORMANCE", required_unless_present = "registry")]
    performance: Option<PathBuf>,

    /// Reuse a registry snapshot instead of matching
    #[arg(long, conflicts_with_all = ["score", "performance"])]
    registry: Option<PathBuf>,

    #[arg(long, env = "SCORELINK_OUTPUT_DIR")]
    output_dir: PathBuf,

    /// sequential or bounded_parallel
    #[arg(long, env = "SCORELINK_MODE")]
    mode: Option<ExecutionMode>,

    /// Matching tolerance in milliseconds
    #[arg(long, env = "SCORELINK_TOLERANCE_MS")]
    tolerance_ms: Option<f64>,

    /// Worker cap for bounded_parallel mode
    #[arg(long, env = "SCORELINK_MAX_WORKERS")]
    max_workers: Option<usize>,

    /// Keep running independent stages after a non-critical stage fails
    #[arg(long, env = "SCORELINK_CONTINUE_ON_NON_CRITICAL_FAILURE", value_name = "BOOL")]
    continue_on_non_critical_failure: Option<bool>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match try_main(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!(error = %format!("{:#}", e), "scorelink failed");
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn try_main(cli: Cli) -> Result<bool> {
    let (mut config, config_path) =
        config::load_config(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Match(args) => {
            if let Some(tolerance) = args.tolerance_ms {
                config.matching.tolerance_ms = tolerance;
            }
            config.validate().context("Invalid configuration")?;

            let layout = RunLayout::new(&args.output_dir);
            layout.ensure()?;
            init_logging(cli.log_level.as_deref(), &config, &layout)?;
            log_config_source(config_path);

            let (snapshot, summary) =
                run::match_inputs(&args.score, &args.performance, &layout, &config)
                    .context("Matching failed")?;

            println!("{}", summary.report.display_string());
            println!(
                "{} entries, {} tied groups written to {}",
                snapshot.len(),
                summary.tied_groups,
                layout.registry().display()
            );
            Ok(true)
        }
        Command::Run(args) => {
            if let Some(tolerance) = args.tolerance_ms {
                config.matching.tolerance_ms = tolerance;
            }
            if let Some(workers) = args.max_workers {
                config.pipeline.max_workers = workers;
            }
            if let Some(continue_on_failure) = args.continue_on_non_critical_failure {
                config.pipeline.continue_on_non_critical_failure = continue_on_failure;
            }
            config.validate().context("Invalid configuration")?;

            let layout = RunLayout::new(&args.output_dir);
            layout.ensure()?;
            init_logging(cli.log_level.as_deref(), &config, &layout)?;
            log_config_source(config_path);

            let source = match (args.registry, args.score, args.performance) {
                (Some(snapshot), _, _) => RegistrySource::Snapshot(snapshot),
                (None, Some(score), Some(performance)) => RegistrySource::Inputs { score, performance },
                _ => anyhow::bail!("--score and --performance are required without --registry"),
            };
            let options = RunOptions {
                source,
                output_dir: args.output_dir,
                mode: args.mode.unwrap_or(config.pipeline.mode),
                config,
            };

            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Received Ctrl+C, cancelling run");
                    trigger.cancel();
                }
            });

            let report = run::run(&options, cancel, None).await.context("Run failed")?;

            if let Some(matching) = &report.matching {
                println!("{}", matching.report.display_string());
            }
            println!("{}", report.execution.display_string());
            println!("{}", report.progress.display_string());
            Ok(report.success())
        }
    }
}

fn init_logging(level: Option<&str>, config: &TomlConfig, layout: &RunLayout) -> Result<()> {
    let level = level.unwrap_or(config.logging.level.as_str());
    let execution_log = config
        .logging
        .execution_log
        .clone()
        .unwrap_or_else(|| layout.execution_log());
    scorelink_engine::logging::init(level, Some(&execution_log)).context("Failed to initialize logging")?;
    Ok(())
}

fn log_config_source(path: Option<PathBuf>) {
    match path {
        Some(path) => info!(path = %path.display(), "Using configuration file"),
        None => info!("No configuration file, using compiled defaults"),
    }
    info!(version = env!("CARGO_PKG_VERSION"), "Starting scorelink");
}
