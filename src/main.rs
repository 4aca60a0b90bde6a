//! regmirror sync tool
//!
//! Mirrors repositories between registries (and local OCI layouts)
//! according to a YAML configuration: one pass, a dry-run check, or a
//! long-running scheduler.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use regmirror::sync::{SyncConfig, SyncError, SyncRunner};

/// Utility for mirroring docker repositories
#[derive(Parser, Debug)]
#[clap(author, version, about)]
#[clap(propagate_version = true)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    /// Config file, "-" reads stdin
    #[clap(short = 'c', long, global = true)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[clap(short = 'v', long, global = true, default_value = "info")]
    verbosity: String,

    /// Log in JSON format
    #[clap(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Process each sync step once, ignoring schedules
    Once,

    /// Check which steps would copy without copying anything
    Check {
        /// Exit non-zero when a sync would have been performed
        #[clap(long)]
        strict: bool,
    },

    /// Run the scheduler, firing steps on their cron/interval
    Server,

    /// Show the version
    Version,
}

fn init_logging(cli: &Cli) {
    let filter = EnvFilter::try_new(&cli.verbosity)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(cli: &Cli) -> Result<SyncConfig, SyncError> {
    match cli.config.as_deref() {
        Some("-") => SyncConfig::load_reader(std::io::stdin()),
        Some(path) => SyncConfig::load_path(path),
        None => Err(SyncError::Config(
            "a config file is required (-c)".to_string(),
        )),
    }
}

fn exit_for(err: &SyncError) -> ExitCode {
    match err {
        SyncError::Config(_) | SyncError::Yaml(_) | SyncError::BadSchedule(_) => ExitCode::from(1),
        _ => ExitCode::from(2),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    if matches!(cli.command, Commands::Version) {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            return ExitCode::from(1);
        }
    };
    let runner = match SyncRunner::new(config) {
        Ok(runner) => runner,
        Err(e) => {
            tracing::error!(error = %e, "failed to set up client");
            return ExitCode::from(1);
        }
    };

    let cancel = CancellationToken::new();

    match cli.command {
        Commands::Once => {
            let interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::debug!("interrupt received, stopping");
                    interrupt.cancel();
                }
            });
            match runner.run_once(&cancel).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!(error = %e, "sync failed");
                    exit_for(&e)
                }
            }
        }
        Commands::Check { strict } => match runner.run_check(&cancel).await {
            Ok(needed) => {
                if needed && strict {
                    ExitCode::from(1)
                } else {
                    ExitCode::SUCCESS
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "check failed");
                exit_for(&e)
            }
        },
        Commands::Server => {
            // first interrupt stops scheduling and lets in-flight steps
            // finish; a second one cancels them
            let shutdown = CancellationToken::new();
            let sig_shutdown = shutdown.clone();
            let sig_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received, finishing in-flight steps");
                    sig_shutdown.cancel();
                }
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("second interrupt, canceling in-flight steps");
                    sig_cancel.cancel();
                }
            });
            match runner.run_server(&shutdown, &cancel).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!(error = %e, "server run failed");
                    exit_for(&e)
                }
            }
        }
        Commands::Version => unreachable!(),
    }
}
