//! sockmux CLI - drives a [`SocketManager`] from the command line.
//!
//! `listen` prints every event as a JSON line (optionally echoing data
//! back); `connect` forwards stdin lines and writes received data to
//! stdout. Ctrl-C closes every socket, letting queued writes flush,
//! before exiting.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use sockmux::{event_channel, Config, ConnectionId, SocketEvent, SocketManager};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Id the CLI uses for its own listen/connect.
const CONTROLLER_ID: ConnectionId = 1;

// CLI
#[derive(Parser)]
#[command(name = "sockmux")]
#[command(version)]
#[command(about = "TCP socket multiplexer")]
struct Cli {
    /// Path to a JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for connections and print every event as a JSON line
    Listen {
        /// Interface to bind (default: all interfaces)
        #[arg(long)]
        host: Option<String>,
        /// Port to bind
        #[arg(long)]
        port: u16,
        /// Echo received data back to the sender
        #[arg(long)]
        echo: bool,
    },
    /// Connect to a server, send stdin lines, print what comes back
    Connect {
        /// Host to connect to (default: localhost)
        #[arg(long)]
        host: Option<String>,
        /// Port to connect to
        #[arg(long)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let (sink, rx) = event_channel();
    let manager = SocketManager::new(&sink, config);

    let result = match cli.command {
        Commands::Listen { host, port, echo } => {
            manager.listen(CONTROLLER_ID, host.as_deref(), port);
            run_listen(&manager, rx, echo).await
        }
        Commands::Connect { host, port } => {
            manager.connect(CONTROLLER_ID, host.as_deref(), port);
            run_connect(&manager, rx).await
        }
    };

    // Gives graceful closes their chance to flush before the runtime stops.
    manager.shutdown().await;
    result
}

/// Prints events until the listener closes or Ctrl-C.
async fn run_listen(
    manager: &SocketManager,
    mut rx: UnboundedReceiver<SocketEvent>,
    echo: bool,
) -> Result<()> {
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                log::info!("Interrupted, shutting down");
                return Ok(());
            }
            event = rx.recv() => {
                let Some(event) = event else {
                    return Ok(());
                };
                println!("{}", serde_json::to_string(&event)?);

                match event {
                    SocketEvent::Data { id, bytes } if echo => manager.write(id, bytes),
                    SocketEvent::Error { id: CONTROLLER_ID, message }
                        if !manager.contains(CONTROLLER_ID) =>
                    {
                        anyhow::bail!(message);
                    }
                    SocketEvent::Close { id: CONTROLLER_ID, .. } => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}

/// Bridges stdin/stdout to one connection until it closes or Ctrl-C.
async fn run_connect(manager: &SocketManager, mut rx: UnboundedReceiver<SocketEvent>) -> Result<()> {
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut connected = false;
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                log::info!("Interrupted, shutting down");
                return Ok(());
            }
            line = lines.next_line(), if connected && stdin_open => match line? {
                Some(line) => manager.write(CONTROLLER_ID, format!("{line}\n").into_bytes()),
                None => {
                    // stdin EOF: flush and close our side.
                    stdin_open = false;
                    manager.close(CONTROLLER_ID);
                }
            },
            event = rx.recv() => match event {
                None => return Ok(()),
                Some(SocketEvent::Connect { address, .. }) => {
                    log::info!("Connected to {address}");
                    connected = true;
                }
                Some(SocketEvent::Data { bytes, .. }) => {
                    stdout.write_all(&bytes).await?;
                    stdout.flush().await?;
                }
                Some(SocketEvent::Error { message, .. }) => {
                    if !connected {
                        anyhow::bail!(message);
                    }
                    log::error!("{message}");
                }
                Some(SocketEvent::Close { had_error, .. }) => {
                    log::info!("Connection closed (had_error: {had_error})");
                    return Ok(());
                }
                Some(SocketEvent::Timeout { .. } | SocketEvent::Connection { .. }) => {}
            },
        }
    }
}
