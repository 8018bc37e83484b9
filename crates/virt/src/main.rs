//! reprotest-virt-null
//!
//! Testbed backend running builds directly on the local host.

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "reprotest-virt-null")]
#[command(about = "reprotest testbed backend for the local host")]
#[command(version)]
struct Cli {
    /// Log protocol traffic to stderr
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries the control stream, so logs go to stderr only
    if cli.debug {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("debug"))
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = reprotest_virt::serve(tokio::io::stdin(), tokio::io::stdout()) => {
            result?;
        }
        _ = terminate.recv() => {
            info!("Terminated, removing scratch directory");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, removing scratch directory");
        }
    }

    Ok(())
}
