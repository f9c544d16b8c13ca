//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p collab_server -- [-port 26000] [-password <string>] [-name <serverName>]
//!
//! The server accepts collaboration clients, negotiates plug-in protocols,
//! and forwards chat, audio, and shared-object traffic between them.
//!
//! Console commands:
//!   status            - Show server status
//!   clients           - List connected clients
//!   koinonia ...      - Manage shared objects (list/print/save/load/...)
//!   quit              - Shutdown server

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use collab_server::CollabServer;
use collab_shared::config::ServerConfig;
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> ServerConfig {
    let mut config = ServerConfig::default();
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-port" if i + 1 < args.len() => {
                config.port = args[i + 1].parse().unwrap_or(config.port);
                i += 2;
            }
            "-password" if i + 1 < args.len() => {
                config.password = args[i + 1].clone();
                i += 2;
            }
            "-name" if i + 1 < args.len() => {
                config.server_name = args[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = parse_args();
    info!(port = config.port, name = %config.server_name, "starting server");

    let server = CollabServer::new(config).await.context("create server")?;
    let local = server.local_addr()?;
    info!(%local, "server bound");

    // Feed stdin lines into the console channel from a plain thread.
    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() {
                break;
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Server ready. Type 'help' for commands, 'quit' to exit.");
    println!();

    server.run(Some(console_rx)).await
}
