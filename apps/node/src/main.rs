//! imgsync node entry point.

mod app;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "imgsync-node", version)]
#[command(about = "Moves one disk image between two nodes in verified chunks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Wait for a sender and write the image to disk
    Receive {
        #[arg(long, default_value = "0.0.0.0:7700")]
        listen: String,
        #[arg(long)]
        dest: PathBuf,
        /// Image size in bytes
        #[arg(long)]
        size: u64,
        #[arg(long)]
        token: String,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Connect to a receiver and serve the image
    Send {
        #[arg(long)]
        connect: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        token: String,
        #[arg(long, default_value_t = 2)]
        connections: usize,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting imgsync node");

    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new()?;
    match cli.command {
        Command::Receive {
            listen,
            dest,
            size,
            token,
            config,
        } => rt.block_on(app::receive(app::ReceiveArgs {
            listen,
            dest,
            size,
            token,
            config: app::load_config(config.as_deref())?,
        })),
        Command::Send {
            connect,
            file,
            token,
            connections,
            config,
        } => rt.block_on(app::send(app::SendArgs {
            connect,
            file,
            token,
            connections,
            config: app::load_config(config.as_deref())?,
        })),
    }
}
