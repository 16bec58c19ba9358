//! fusion-executor - a GitLab Runner custom executor for VMware Fusion

use clap::{Parser, Subcommand};
use color_eyre::{Report, Result};

mod ci;
mod command_run;
mod exit_code;
mod provision;
mod readiness;
mod ssh;
mod stages;
mod vmrun;

/// Run GitLab CI jobs in disposable VMware Fusion guests.
///
/// Every job gets a linked clone of a base guest, reset to a clean snapshot
/// before the job starts. Scripts are executed in the clone over SSH.
#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// One subcommand per custom executor stage.
#[derive(Subcommand)]
enum Commands {
    /// Called by the config_exec stage
    Config(stages::config::ConfigOpts),

    /// Called by the prepare_exec stage
    Prepare(stages::prepare::PrepareOpts),

    /// Called by the run_exec stage
    Run(stages::run::RunOpts),

    /// Called by the cleanup_exec stage
    Cleanup(stages::cleanup::CleanupOpts),
}

/// Install and configure the tracing/logging system.
///
/// Logs are filtered by the RUST_LOG environment variable, defaulting to
/// 'info', and written to stderr so that stdout stays reserved for job
/// output and the config document.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Config(opts) => stages::config::run(opts),
        Commands::Prepare(opts) => stages::prepare::run(opts),
        Commands::Run(opts) => stages::run::run(opts),
        Commands::Cleanup(opts) => stages::cleanup::run(opts),
    }
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();
    if let Err(e) = dispatch(cli.command) {
        let code = exit_code::for_report(&e);
        eprintln!("Error: {e:?}");
        tracing::debug!("exiting with {code}");
        std::process::exit(code);
    }
    tracing::debug!("exiting");
    std::process::exit(0)
}
