//! Command-line front end for tilestream.
//!
//! - `tilestream inspect <file>...` decodes and validates local containers
//! - `tilestream fetch <key>...` streams keys through the loader

mod inspect;
mod stream;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tilestream::LoaderConfig;

#[derive(Parser)]
#[command(about = "Inspect b3dm tile containers and stream tile content")]
struct CliArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode and validate local b3dm files.
    Inspect {
        /// Files to inspect.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Treat warnings and unsupported versions as errors.
        #[arg(long)]
        strict: bool,

        /// Print one JSON summary per file instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Load URLs or paths through the loader and report each delivery.
    Fetch {
        /// Keys to load (http(s) URLs or file paths).
        #[arg(required = true)]
        keys: Vec<String>,

        /// JSON loader config file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Directory that relative keys are read from.
        #[arg(long)]
        root: Option<PathBuf>,

        /// Reject containers with any validation finding.
        #[arg(long)]
        strict: bool,
    },
}

fn run_inspect(files: &[PathBuf], strict: bool, json: bool) -> ExitCode {
    let mut failed = false;
    for path in files {
        match inspect::inspect(path, strict) {
            Ok(summary) => {
                failed |= summary.has_errors();
                if json {
                    match serde_json::to_string(&summary) {
                        Ok(line) => println!("{line}"),
                        Err(e) => {
                            tracing::error!("failed to serialize summary: {e}");
                            failed = true;
                        }
                    }
                } else {
                    print!("{}", summary.to_text());
                }
            }
            Err(e) => {
                tracing::error!("{e}");
                failed = true;
            }
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn run_fetch(
    keys: &[String],
    config: Option<PathBuf>,
    root: Option<PathBuf>,
    strict: bool,
) -> ExitCode {
    let config = match config {
        Some(path) => match LoaderConfig::from_json_file(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("{e}");
                return ExitCode::FAILURE;
            }
        },
        None => LoaderConfig::default(),
    };
    let config = if strict { config.with_strict(true) } else { config };

    let report = match stream::fetch_all(keys, config, root.as_deref()).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    for outcome in &report.outcomes {
        println!("{outcome}");
    }
    let stats = &report.stats;
    tracing::info!(
        elapsed_ms = report.elapsed_ms,
        cached = stats.cache_size,
        formats = ?stats.supported_formats,
        "done"
    );

    if report.outcomes.iter().all(|o| o.result.is_ok()) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    match CliArgs::parse().command {
        Command::Inspect {
            files,
            strict,
            json,
        } => run_inspect(&files, strict, json),
        Command::Fetch {
            keys,
            config,
            root,
            strict,
        } => run_fetch(&keys, config, root, strict).await,
    }
}
