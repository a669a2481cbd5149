use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wep_pipeline::{
    report_runs_markdown, Pipeline, PipelineConfig, RunPaths, SpreadsheetConverter,
    SsconvertConverter,
};

#[derive(Debug, Parser)]
#[command(name = "wep")]
#[command(about = "Webinar engagement pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Clean, link and aggregate the sheet exports into one import file.
    Run {
        #[arg(long)]
        input_dir: Option<PathBuf>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Convert this workbook into `input_dir` before running.
        #[arg(long)]
        workbook: Option<PathBuf>,
    },
    /// Split a workbook into one CSV per sheet.
    Convert {
        #[arg(long)]
        workbook: PathBuf,
        #[arg(long)]
        output_dir: PathBuf,
    },
    /// Summarise the most recent runs.
    Report {
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
        runs: u64,
    },
    /// Print the default configuration as YAML.
    Config,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let command = cli.command.unwrap_or(Commands::Run {
        input_dir: None,
        output_dir: None,
        config: None,
        workbook: None,
    });
    match command {
        Commands::Run {
            input_dir,
            output_dir,
            config,
            workbook,
        } => {
            let env_paths = RunPaths::from_env();
            let paths = RunPaths::new(
                input_dir.unwrap_or(env_paths.input_dir),
                output_dir.unwrap_or(env_paths.output_dir),
            );
            let config = match config.or_else(|| std::env::var_os("WEP_CONFIG").map(PathBuf::from)) {
                Some(path) => PipelineConfig::load(&path)
                    .with_context(|| format!("loading config {}", path.display()))?,
                None => PipelineConfig::default(),
            };
            if let Some(workbook) = workbook {
                SsconvertConverter::new().convert(&workbook, &paths.input_dir)?;
            }

            let summary = Pipeline::new(config, paths)?.run_once()?;
            let matched = summary.crm_join().map(|j| j.matched).unwrap_or_default();
            println!(
                "run complete: run_id={} records={} crm_matches={} output={} reports={}",
                summary.run_id, summary.enriched_rows, matched, summary.output_file, summary.reports_dir
            );
        }
        Commands::Convert {
            workbook,
            output_dir,
        } => {
            let files = SsconvertConverter::new().convert(&workbook, &output_dir)?;
            for file in files {
                println!("{}", file.display());
            }
        }
        Commands::Report { output_dir, runs } => {
            let output_dir = output_dir.unwrap_or(RunPaths::from_env().output_dir);
            println!("{}", report_runs_markdown(&output_dir, usize::try_from(runs)?)?);
        }
        Commands::Config => {
            print!("{}", PipelineConfig::default().to_yaml()?);
        }
    }

    Ok(())
}
