//! stratusd — run a bare stratus daemon.
//!
//! Consuming applications normally embed [`stratusd::App`] in their
//! own binary; this entrypoint serves a daemon with no application
//! schema or resources, which is enough to form and operate a
//! cluster over the control socket.

use std::path::PathBuf;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stratusd", about = "Stratus cluster daemon")]
struct Cli {
    /// Directory holding all daemon state.
    #[arg(long)]
    state_dir: PathBuf,

    /// Log debug detail.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Err(e) = stratusd::App::new(cli.state_dir).run().await {
        error!(error = %e, "daemon exited with error");
        anyhow::bail!("{e}");
    }

    Ok(())
}
