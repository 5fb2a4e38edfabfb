//! linuxdiag
//!
//! Runs diagnostic commands on the local machine or on remote hosts over SSH

use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use eyre::eyre;
use linuxdiag_exec::{Dispatcher, Encoding, ExecError};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{Config, LogConfig};

#[derive(Parser)]
#[command(name = "linuxdiag")]
#[command(about = "Run Linux diagnostics locally or over SSH", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command and print its output
    Run {
        /// Remote host; runs locally when omitted
        #[arg(long)]
        host: Option<String>,
        /// Timeout in seconds (0 disables), defaults to the configured value
        #[arg(long)]
        timeout: Option<u64>,
        /// Fallback argv element, repeat for each argument
        #[arg(long = "fallback", value_name = "ARG")]
        fallback: Vec<String>,
        /// Write raw bytes instead of decoded text
        #[arg(long)]
        raw: bool,
        /// Print the result as JSON
        #[arg(long, conflicts_with = "raw")]
        json: bool,
        /// Command and arguments
        #[arg(last = true, required = true)]
        argv: Vec<String>,
    },
    /// Print the absolute path of a command
    Which {
        name: String,
        /// Remote host; resolves locally when omitted
        #[arg(long)]
        host: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

fn init_tracing(log: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Await `work` unless ctrl-c arrives first
///
/// Runs inside `Dispatcher::scope`, so an interrupt still closes every
/// pooled connection before the process exits.
async fn interruptible<T>(work: impl Future<Output = Result<T, ExecError>>) -> Result<T> {
    tokio::select! {
        result = work => Ok(result?),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            Err(eyre!("interrupted"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let config = Config::load_default(cli.config.as_deref())?;
    init_tracing(&config.log);
    match &config.source {
        Some(path) => debug!(path = %path.display(), "loaded config"),
        None => warn!("no config file found, using defaults"),
    }

    match cli.command {
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Which { name, host } => {
            let dispatcher = Dispatcher::from_config(&config.exec)?;
            let path = dispatcher
                .scope(|d| async move { interruptible(d.which(&name, host.as_deref())).await })
                .await?;
            println!("{path}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            host,
            timeout,
            fallback,
            raw,
            json,
            argv,
        } => {
            let dispatcher = Dispatcher::from_config(&config.exec)?;
            let mut options = dispatcher.default_options();
            if let Some(secs) = timeout {
                options.timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
            if raw {
                options.encoding = Encoding::Raw;
            }

            let result = dispatcher
                .scope(|d| async move {
                    let fallback = (!fallback.is_empty()).then_some(&fallback[..]);
                    interruptible(d.execute_with_fallback_options(
                        &argv,
                        fallback,
                        host.as_deref(),
                        options,
                    ))
                    .await
                })
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                std::io::stdout().write_all(result.stdout.as_bytes())?;
                std::io::stderr().write_all(result.stderr.as_bytes())?;
            }

            Ok(ExitCode::from(u8::try_from(result.status).unwrap_or(1)))
        }
    }
}
