//! rtremote command-line driver
//!
//! `serve` runs an echo server that answers every request with a matching
//! response; `call` sends one request and prints the reply.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "rtremote")]
#[command(about = "Remote-object RPC transport tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Transport configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept connections and echo every request back as its response
    Serve {
        /// Endpoint to listen on (tcp://host:port, host:port or unix:///path)
        #[arg(short, long, default_value = "127.0.0.1:10004")]
        listen: String,
    },

    /// Send one request and wait for the reply
    Call {
        /// Endpoint to connect to
        #[arg(long)]
        connect: String,
        /// Value of the message.type field
        #[arg(short, long)]
        message_type: String,
        /// Extra JSON object fields merged into the request
        #[arg(short, long)]
        body: Option<String>,
        /// Reply deadline in milliseconds (0 = configured default)
        #[arg(short, long, default_value_t = 0)]
        timeout_ms: u64,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RTREMOTE_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { listen } => commands::serve::execute(config, &listen),
        Commands::Call {
            connect,
            message_type,
            body,
            timeout_ms,
        } => commands::call::execute(
            config,
            commands::call::CallArgs {
                connect,
                message_type,
                body,
                timeout_ms,
            },
        ),
    }
}
