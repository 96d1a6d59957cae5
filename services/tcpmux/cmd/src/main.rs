//! tcpmux binary.
//!
//! `tcpmux bridge` exposes the session manager over JSON lines on
//! stdin/stdout; `tcpmux echo` runs a small echo server on top of it.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tcpmux_session::SessionManager;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod bridge;
mod config;
mod echo;
mod logging;

use config::BridgeConfig;
use logging::TcpmuxLogFormatter;

/// Multiplexed TCP/TLS sockets for a host process
#[derive(Parser, Debug)]
#[command(name = "tcpmux", version, about = "Multiplexed TCP/TLS session manager")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "tcpmux.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// First id handed to accepted sockets
    #[arg(long)]
    first_child_id: Option<u32>,

    /// Default write deadline, e.g. 5s
    #[arg(long)]
    send_timeout: Option<humantime::Duration>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read JSON-lines commands on stdin, write events to stdout
    Bridge,
    /// Echo every byte back to its sender
    Echo {
        /// Listen address, e.g. 127.0.0.1:7000
        #[arg(long)]
        listen: SocketAddr,

        /// Path to TLS certificate file (PEM format)
        #[arg(long, requires = "tls_key")]
        tls_cert: Option<PathBuf>,

        /// Path to TLS private key file (PEM format)
        #[arg(long, requires = "tls_cert")]
        tls_key: Option<PathBuf>,
    },
}

fn init_logging(level: &str) -> Result<()> {
    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("tcpmux={}", level).parse()?)
        .add_directive(format!("tcpmux_session={}", level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .event_format(TcpmuxLogFormatter::new("tcpmux"))
        .init();
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Loaded before logging so the file can pick the level
    let mut config = BridgeConfig::load_from_file(&args.config)?;
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    if let Some(id) = args.first_child_id {
        config.first_child_id = id;
    }
    if let Some(timeout) = args.send_timeout {
        config.send_timeout = Some(timeout.into());
    }

    init_logging(&config.log_level)?;
    info!("Starting tcpmux v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration: first_child_id={}, send_timeout={:?}, read_buffer_size={}, no_delay={}",
        config.first_child_id, config.send_timeout, config.read_buffer_size, config.no_delay
    );

    let (manager, events) = SessionManager::channel(config.manager_config());

    match args.command {
        Command::Bridge => {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            bridge::run(manager, events, stdin, tokio::io::stdout()).await?;
        }
        Command::Echo {
            listen,
            tls_cert,
            tls_key,
        } => {
            let tls = match (tls_cert, tls_key) {
                (Some(cert), Some(key)) => Some(echo::load_server_tls(&cert, &key)?),
                _ => None,
            };
            echo::run(manager, events, listen, tls).await?;
        }
    }

    info!("tcpmux stopped");
    Ok(())
}
