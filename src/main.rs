use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;
use geosync::cli::{self, Cli, Command, WorkerArgs};
use tracing_subscriber::EnvFilter;

fn init_tracing(level: &str) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

async fn worker(args: WorkerArgs) -> anyhow::Result<()> {
    let settings = args.settings()?;
    init_tracing(&settings.log_level);
    tracing::info!(brick = %args.brick.display(), "geosync worker starting");

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown requested, finishing current cycle");
        drop(stop_tx);
    });

    tokio::task::spawn_blocking(move || args.run(&settings, &stop_rx)).await?
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Worker(args) => match worker(args).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %format!("{:#}", e), "worker stopped");
                eprintln!("{} {:#}", "Error:".red().bold(), e);
                ExitCode::FAILURE
            }
        },
        Command::ConfigGet {
            config_file,
            name,
            json,
        } => {
            init_tracing("warn");
            cli::config_get(&config_file, name.as_deref(), json)
        }
        Command::ConfigHelp { name } => cli::config_help(name.as_deref()),
        Command::ConfigSet {
            config_file,
            name,
            value,
        } => {
            init_tracing("warn");
            cli::config_set(&config_file, &name, &value)
        }
    }
}
