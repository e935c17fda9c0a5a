// Connect daemon: pushes a vault to a paired listener, or listens for pushes.

mod cli;
mod config;
mod runner;
mod store;
mod transport;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::Command;
use crate::store::FileVault;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let command = cli::parse(std::env::args().skip(1))?;
    if let Command::Version = command {
        println!("connect-node {}", VERSION);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cfg = config::load();

    let rt = tokio::runtime::Runtime::new().context("start runtime")?;
    rt.block_on(async {
        tokio::select! {
            result = run(command, &cfg) => result,
            result = shutdown_signal() => {
                result?;
                info!("shutting down");
                Ok(())
            }
        }
    })
}

async fn run(command: Command, cfg: &config::Config) -> anyhow::Result<()> {
    match command {
        Command::Version => Ok(()),
        Command::Listen { port, out } => {
            runner::listen(port.unwrap_or(cfg.listen_port), out, cfg).await
        }
        Command::Push {
            peer,
            peer_key,
            file,
        } => {
            let mut vault = FileVault::new(file);
            runner::push(peer, peer_key, &mut vault, cfg).await
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix). Open sessions are dropped; peers see the link go down.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
