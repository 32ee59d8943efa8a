//! The pylon command line tool.

use std::io::IsTerminal;
use std::io::stderr;
use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use clap_verbosity_flag::Verbosity;
use colored::Colorize;
use pylon::Config;
use pylon::commands;
use tracing_log::AsTrace;

/// The subcommands of the pylon CLI.
#[derive(Subcommand)]
enum Commands {
    /// Waits for a workflow to complete on a site environment.
    Wait(commands::wait::Args),

    /// Streams new and finished workflows from a site to the console.
    Watch(commands::watch::Args),
}

/// The pylon command line interface.
#[derive(Parser)]
#[command(author, version, propagate_version = true, about, long_about = None)]
struct Cli {
    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a pylon configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity flags.
    #[command(flatten)]
    verbose: Verbosity,
}

/// Parses arguments, wires up tracing, and dispatches the subcommand.
pub async fn inner() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_log::LogTracer::init()?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(cli.verbose.log_level_filter().as_trace())
        .with_writer(std::io::stderr)
        .with_ansi(stderr().is_terminal())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Wait(args) => commands::wait::wait(args, config).await,
        Commands::Watch(args) => commands::watch::watch(args, config).await,
    }
}

#[tokio::main]
pub async fn main() {
    if let Err(e) = inner().await {
        eprintln!(
            "{error}: {e:?}",
            error = if std::io::stderr().is_terminal() {
                "error".red().bold()
            } else {
                "error".normal()
            }
        );
        std::process::exit(1);
    }
}
