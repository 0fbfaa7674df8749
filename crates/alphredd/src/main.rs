//! alphredd - personal assistant daemon
//!
//! `alphredd serve` runs the chat/HTTP process, `alphredd worker` runs the
//! task worker. Both read the same config and database.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use alphred_core::Config;
use alphredd::Daemon;
use clap::{Parser, Subcommand};
use eyre::WrapErr;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "alphredd", about = "Alphred personal assistant daemon", version)]
struct Cli {
    /// Config file (key=value); defaults to ./.alphred/config when present
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, global = true, env = "ALPHRED_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the chat and task HTTP API
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Poll for delegated tasks and execute them
    Worker,
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cwd = std::env::current_dir().wrap_err("failed to read current directory")?;
    let mut config =
        Config::discover(cli.config.as_deref(), &cwd).wrap_err("failed to load config")?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Command::Serve { port: Some(port) } = cli.command {
        config.port = port;
    }
    config.resolve_paths(&cwd);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let daemon = Daemon::new(config)
            .await
            .wrap_err("failed to initialize daemon")?;

        let cancel = CancellationToken::new();
        tokio::spawn(shutdown_on_signal(cancel.clone()));

        match cli.command {
            Command::Serve { .. } => daemon.serve(cancel).await?,
            Command::Worker => {
                let stats = daemon.run_worker(cancel).await;
                info!(
                    completed = stats.completed,
                    failed = stats.failed,
                    "worker exited"
                );
            }
        }
        Ok(())
    })
}

/// Cancel `token` on the first SIGINT or SIGTERM.
async fn shutdown_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (Ok(mut sigterm), Ok(mut sigint)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) else {
            tracing::error!("failed to register signal handlers");
            return;
        };

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, initiating graceful shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received SIGINT, initiating graceful shutdown");
        }
    }

    token.cancel();
}
