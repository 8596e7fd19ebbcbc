//! kcache - GPU kernel cache node agent
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use kcache::cli::commands;
use kcache::cli::{Cli, Commands};
use kcache::config::ConfigManager;
use kcache::error::KcacheResult;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> KcacheResult<()> {
    let cli = Cli::parse();

    // Completions need neither config nor logging
    if let Commands::Completions { shell } = cli.command {
        commands::completions(shell);
        return Ok(());
    }

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    init_logging(cli.verbose, &config.general.log_format);
    debug!("Using config {}", config_manager.path().display());

    match cli.command {
        Commands::Completions { .. } => unreachable!("Completions handled above"),
        Commands::Agent(args) => commands::agent(args, &config).await,
        Commands::Reconcile(args) => commands::reconcile(args, &config).await,
        Commands::Cache(args) => commands::cache(args, &config).await,
        Commands::Usage(args) => commands::usage(args, &config).await,
        Commands::Declare(args) => commands::declare(args, &config).await,
        Commands::Status(args) => commands::status(args, &config).await,
        Commands::Config(args) => commands::config(args, &config, &config_manager).await,
    }
}

/// 0 = warn, 1 = info, 2+ = debug; `RUST_LOG` overrides. Logs go to stderr.
fn init_logging(verbose: u8, format: &str) {
    let filter = if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("kcache=warn"),
            1 => EnvFilter::new("kcache=info"),
            _ => EnvFilter::new("kcache=debug"),
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
