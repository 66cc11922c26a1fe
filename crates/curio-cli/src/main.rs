use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use curio_core::Stage;
use curio_storage::FsStageStore;
use curio_sync::{
    cancel_pair, format_status, report_latest_markdown, stage_status, Pipeline, PipelineConfig,
    RunOptions,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "curio-cli")]
#[command(about = "Licensed corpus curation pipeline")]
struct Cli {
    /// Workspace root; defaults to CURIO_WORKSPACE or the current directory.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,
    /// Pipeline config; defaults to CURIO_CONFIG or <workspace>/curio.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline (dry-run unless --execute).
    Run {
        #[arg(long, value_parser = parse_stage)]
        stage: Option<Stage>,
        #[arg(long)]
        execute: bool,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        limit_targets: Option<usize>,
        #[arg(long)]
        limit_files: Option<usize>,
        #[arg(long)]
        no_fetch: bool,
        #[arg(long)]
        refresh_evidence: bool,
    },
    /// Per-stage state counts.
    Status,
    /// Summarise the most recent runs.
    Report {
        #[arg(long, default_value_t = 3)]
        runs: usize,
    },
}

fn parse_stage(raw: &str) -> Result<Stage, String> {
    Stage::parse(raw)
        .ok_or_else(|| format!("unknown stage {raw:?}; expected classify, acquire, screen or merge"))
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "curio=debug" } else { "curio=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = PipelineConfig::from_env_with(cli.workspace, cli.config)?;

    let command = cli.command.unwrap_or(Commands::Run {
        stage: None,
        execute: false,
        workers: None,
        limit_targets: None,
        limit_files: None,
        no_fetch: false,
        refresh_evidence: false,
    });
    match command {
        Commands::Run {
            stage,
            execute,
            workers,
            limit_targets,
            limit_files,
            no_fetch,
            refresh_evidence,
        } => {
            let (handle, signal) = cancel_pair();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; no new fetches will start");
                    handle.cancel();
                }
            });

            let pipeline = Pipeline::from_config(config, signal)?;
            let options = RunOptions {
                stage,
                execute,
                workers,
                limit_targets,
                limit_files,
                no_fetch,
                refresh_evidence,
            };
            let report = pipeline.run(&options).await?;
            let summary = &report.summary;
            println!(
                "run complete: run_id={} execute={} accepted={} pitched={} duplicates={} needs_review={}{}",
                summary.run_id,
                summary.execute,
                summary.accepted,
                summary.pitched,
                summary.duplicates,
                summary.needs_review,
                if summary.cancelled { " (cancelled)" } else { "" }
            );
            if !execute {
                for (stage, counts) in &summary.stages {
                    println!("  {stage}: {} planned, {} blocked", counts.planned, counts.blocked);
                }
            }
        }
        Commands::Status => {
            let stages = FsStageStore::new(config.state_dir());
            println!("{}", format_status(&stage_status(&stages)?));
        }
        Commands::Report { runs } => {
            println!("{}", report_latest_markdown(&config.reports_dir(), runs)?);
        }
    }

    Ok(())
}
