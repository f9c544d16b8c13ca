//! Standalone client binary: a line-oriented chat front end.
//!
//! Usage:
//!   cargo run -p collab_client -- [-name <clientName>] [collab://[password@]host[:port]]
//!
//! Typed lines are broadcast as chat messages; lines starting with `/`
//! are commands:
//!   /msg <clientId> <text>  - Private message
//!   /name <newName>         - Request a rename
//!   /who                    - List known peers
//!   /ping                   - Measure round-trip time
//!   /quit                   - Disconnect and exit

use std::env;
use std::sync::Arc;

use anyhow::Context;
use collab_client::client::CollabClient;
use collab_client::plugins::chat::ChatClient;
use collab_client::plugins::koinonia::KoinoniaClient;
use collab_client::plugins::PluginClient;
use collab_shared::config::{ClientConfig, ServerUri};
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> ClientConfig {
    let mut config = ClientConfig::default();
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-name" if i + 1 < args.len() => {
                config.client_name = args[i + 1].clone();
                i += 2;
            }
            uri if !uri.starts_with('-') => {
                config.server_uri = uri.to_string();
                i += 1;
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
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let config = parse_args();
    let uri = ServerUri::parse(&config.server_uri).context("parse server URI")?;

    let chat = Arc::new(ChatClient::new(
        0,
        Box::new(|source, private, text| {
            if private {
                println!("[{source}] (private) {text}");
            } else {
                println!("[{source}] {text}");
            }
        }),
    ));
    let koinonia = Arc::new(KoinoniaClient::new(1));
    let plugins: Vec<Arc<dyn PluginClient>> = vec![chat.clone(), koinonia];

    let mut client = CollabClient::connect(&uri, &config.client_name, plugins)
        .await
        .context("connect")?;
    println!(
        "Connected to {:?} as {:?} (client {}).",
        client.server_name(),
        client.client_name(),
        client.client_id()
    );

    // Feed stdin lines into a channel from a plain thread.
    let (line_tx, mut line_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            if std::io::BufRead::read_line(&mut stdin.lock(), &mut line).is_err() {
                break;
            }
            if line_tx.blocking_send(line.trim().to_string()).is_err() {
                break;
            }
        }
    });

    let mut poll = tokio::time::interval(std::time::Duration::from_millis(50));
    loop {
        tokio::select! {
            _ = poll.tick() => {
                client.drain_frontend()?;
            }
            line = line_rx.recv() => {
                let Some(line) = line else { break };
                if line.is_empty() {
                    continue;
                }
                if let Some(rest) = line.strip_prefix('/') {
                    let mut parts = rest.splitn(2, ' ');
                    match (parts.next().unwrap_or(""), parts.next()) {
                        ("quit", _) => break,
                        ("ping", _) => client.ping(),
                        ("who", _) => {
                            for (id, name) in client.roster() {
                                println!("  {id} {name:?}");
                            }
                        }
                        ("name", Some(name)) => client.request_name_change(name.trim()),
                        ("msg", Some(rest)) => {
                            let mut parts = rest.splitn(2, ' ');
                            let target = parts.next().unwrap_or("").parse().unwrap_or(0);
                            let text = parts.next().unwrap_or("");
                            if target == 0 || text.is_empty() {
                                println!("usage: /msg <clientId> <text>");
                            } else if let Err(e) = chat.send(target, text) {
                                println!("error: {e:#}");
                            }
                        }
                        _ => println!("unknown command: /{rest}"),
                    }
                } else if let Err(e) = chat.send(0, &line) {
                    println!("error: {e:#}");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
        if !client.is_connected() {
            println!("Connection lost.");
            return Ok(());
        }
    }

    info!("disconnecting");
    client.disconnect();
    Ok(())
}
