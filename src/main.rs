use std::io::{BufReader, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use abuse_guard::config::{GuardConfig, LoggingConfig};
use abuse_guard::replay::{run_stream, Replayer, TrafficReport};

/// Abuse Guard: sliding-window rate limiting with escalating IP blocks
#[derive(Parser, Debug)]
#[command(name = "abuse-guard", version)]
#[command(about = "Evaluate request traffic against rate limits and abuse blocks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate configuration and print the effective settings as YAML
    Check {
        /// YAML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Replay a JSON-lines traffic log against simulated time
    Replay {
        /// Traffic log, one JSON request per line
        #[arg(short, long)]
        input: PathBuf,

        /// YAML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Only print the final report, not per-request verdicts
        #[arg(long)]
        stats_only: bool,
    },

    /// Evaluate JSON-lines requests from stdin in real time
    Stream {
        /// YAML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

impl Command {
    fn config_path(&self) -> Option<&PathBuf> {
        match self {
            Command::Check { config }
            | Command::Replay { config, .. }
            | Command::Stream { config } => config.as_ref(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = GuardConfig::load(cli.command.config_path().map(PathBuf::as_path))
        .context("Failed to load configuration")?;
    init_tracing(&config.logging);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Check { .. } => {
            print!("{}", serde_yaml::to_string(&config)?);
            info!("Configuration is valid");
        }
        Command::Replay {
            input, stats_only, ..
        } => {
            let file = std::fs::File::open(&input)
                .with_context(|| format!("Failed to open {}", input.display()))?;
            info!(input = %input.display(), "Replaying traffic log");

            let mut replayer = Replayer::new(&config);
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            replayer.run(BufReader::new(file), &mut out, !stats_only)?;

            print_report(&mut out, &replayer.report())?;
        }
        Command::Stream { .. } => {
            info!("Streaming requests from stdin");

            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let mut stdout = tokio::io::stdout();
            let report = run_stream(&config, stdin, &mut stdout, shutdown_signal()).await?;

            print_report(&mut std::io::stdout().lock(), &report)?;
        }
    }

    Ok(())
}

fn print_report<W: Write>(out: &mut W, report: &TrafficReport) -> anyhow::Result<()> {
    serde_json::to_writer_pretty(&mut *out, report)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

/// Logs go to stderr; stdout carries verdicts and reports.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping stream");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping stream");
        }
    }
}
