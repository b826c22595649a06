//! localsock CLI - echo server and greeting client for the socket transport.
//!
//! This is the demo binary entry point. See the `localsock` library for the
//! transport itself.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use localsock::{event_channel, Config, Connection, ConnectionEvent, ConnectionHandler};
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Message sent by `send` when none is given.
const DEFAULT_GREETING: &str = "greetings\n";

// CLI
#[derive(Parser)]
#[command(name = "localsock")]
#[command(version)]
#[command(about = "Message-oriented IPC over Unix domain sockets")]
struct Cli {
    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Socket path (overrides config and environment)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Echo every received message back to its sender until Ctrl-C
    Serve,
    /// Connect, send a message and print the reply
    Send {
        /// Message to send (words are joined with spaces)
        message: Vec<String>,
        /// Seconds to wait for a reply
        #[arg(long, default_value_t = 5)]
        wait_secs: u64,
    },
}

/// Sends every message straight back on the connection it arrived on.
struct Echo;

impl ConnectionHandler for Echo {
    fn on_connection(&self, connection: &Connection) {
        log::info!("[Socket] {} connected", connection.id());
    }

    fn on_message(&self, connection: &Connection, payload: Bytes) {
        log::debug!("[Socket] {} sent {} bytes", connection.id(), payload.len());
        if let Err(e) = connection.send(payload) {
            log::warn!("[Socket] Echo to {} failed: {e}", connection.id());
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
        config.validate()?;
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    match cli.command {
        Commands::Serve => runtime.block_on(serve(config)),
        Commands::Send { message, wait_secs } => {
            let message = if message.is_empty() {
                DEFAULT_GREETING.to_string()
            } else {
                message.join(" ")
            };
            runtime.block_on(send(config, message, Duration::from_secs(wait_secs)))
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    let server = localsock::SocketServer::bind(&config, Echo)
        .with_context(|| format!("Failed to serve on {}", config.socket_path.display()))?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    log::info!("Shutting down ({} connection(s))", server.connection_count());
    server.stop().await;
    Ok(())
}

async fn send(config: Config, message: String, wait: Duration) -> Result<()> {
    let (handler, mut events) = event_channel();
    let client = localsock::SocketClient::connect_with_config(&config, handler)
        .await
        .with_context(|| format!("Failed to connect to {}", config.socket_path.display()))?;

    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let event = match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_elapsed) => {
                log::warn!("[Client] No reply within {wait:?}");
                break;
            }
        };

        match event {
            ConnectionEvent::Connected(connection) => {
                connection.send(message.as_bytes())?;
            }
            ConnectionEvent::Message { payload, .. } => {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(&payload)?;
                stdout.flush()?;
                break;
            }
            ConnectionEvent::Error { error, .. } => {
                return Err(error).context("Connection failed");
            }
            ConnectionEvent::Closed { reason, .. } => {
                log::info!("[Client] Connection {reason}");
                break;
            }
        }
    }

    client.close();
    if tokio::time::timeout(Duration::from_secs(1), client.closed())
        .await
        .is_err()
    {
        log::debug!("[Client] Close did not finish in time");
    }
    Ok(())
}
