//! sig-harvester CLI.
//!
//! One `run` command drives the whole pipeline: resolve the top packages,
//! cross-compile them per triple, extract patterns, and merge signatures.
//! Exit codes: 0 on full success, 1 when the run completed with package
//! or merge failures, 2 on a fatal or aborted run.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sig_harvester::{
    CargoCrossBuilder, Coordinator, CratesIoFetcher, CratesIoRegistry, FlairPatternTool,
    HarvestConfig, RetryPolicy, SigmakeMergeTool, TargetTriple,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sig-harvester")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Builds merged FLAIR signatures from top registry packages", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full harvest pipeline
    Run {
        /// How many top-ranked packages to process
        #[arg(short = 'n', long, default_value_t = 100)]
        count: usize,

        /// Target triple to build for (repeatable; defaults to all)
        #[arg(short, long = "target")]
        targets: Vec<String>,

        /// Package names to skip
        #[arg(long = "exclude")]
        exclude: Vec<String>,

        /// Directory for merged signatures and the run report
        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,

        /// Staging area for downloaded sources
        #[arg(long, default_value = "crates")]
        staging_dir: PathBuf,

        /// Directory containing the FLAIR binaries (pelf, pcf, sigmake)
        #[arg(long, default_value = "flair", env = "FLAIR_DIR")]
        flair_dir: PathBuf,

        /// Worker-pool size for concurrent package processing
        #[arg(short, long, default_value_t = 4)]
        workers: usize,

        /// Per-build timeout in seconds
        #[arg(long, default_value_t = 600)]
        build_timeout_secs: u64,
    },
}

fn parse_triples(targets: &[String]) -> Result<Vec<TargetTriple>> {
    if targets.is_empty() {
        return Ok(TargetTriple::ALL.to_vec());
    }
    targets
        .iter()
        .map(|raw| {
            TargetTriple::parse(raw)
                .with_context(|| format!("unsupported target triple '{raw}'"))
        })
        .collect()
}

async fn run_pipeline(
    count: usize,
    targets: Vec<String>,
    exclude: Vec<String>,
    output_dir: PathBuf,
    staging_dir: PathBuf,
    flair_dir: PathBuf,
    workers: usize,
    build_timeout_secs: u64,
) -> Result<i32> {
    let triples = parse_triples(&targets)?;
    let retry = RetryPolicy::default();

    let config = HarvestConfig {
        package_count: count,
        exclude,
        triples,
        staging_dir: staging_dir.clone(),
        output_dir: output_dir.clone(),
        flair_dir: flair_dir.clone(),
        workers,
        build_timeout: Duration::from_secs(build_timeout_secs),
        ..HarvestConfig::default()
    };

    let registry =
        Arc::new(CratesIoRegistry::new(retry.clone()).context("building registry client")?);
    let fetcher = Arc::new(
        CratesIoFetcher::new(staging_dir.clone(), retry).context("building fetcher")?,
    );
    let builder = Arc::new(CargoCrossBuilder::new(config.build_timeout));
    let patterns = Arc::new(FlairPatternTool::new(
        flair_dir.clone(),
        staging_dir.join("pats"),
        config.tool_timeout,
    ));
    let signatures = Arc::new(SigmakeMergeTool::new(flair_dir, config.tool_timeout));

    let coordinator = Coordinator::new(
        registry,
        fetcher,
        builder,
        patterns,
        signatures,
        config,
    );

    // Ctrl-C aborts the run; workers kill their external children.
    let cancel = coordinator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let report = match coordinator.run().await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "fatal pipeline error");
            return Ok(sig_harvester::report::EXIT_FATAL);
        }
    };

    report.log_summary();

    tokio::fs::create_dir_all(&output_dir).await?;
    let report_path = output_dir.join("report.json");
    let json = serde_json::to_string_pretty(&report).context("serializing run report")?;
    tokio::fs::write(&report_path, json)
        .await
        .with_context(|| format!("writing {}", report_path.display()))?;
    info!(path = %report_path.display(), "run report written");

    Ok(report.exit_code())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let code = match cli.command {
        Commands::Run {
            count,
            targets,
            exclude,
            output_dir,
            staging_dir,
            flair_dir,
            workers,
            build_timeout_secs,
        } => {
            run_pipeline(
                count,
                targets,
                exclude,
                output_dir,
                staging_dir,
                flair_dir,
                workers,
                build_timeout_secs,
            )
            .await?
        }
    };

    std::process::exit(code);
}
