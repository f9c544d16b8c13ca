use collab_server::CollabServer;
use collab_shared::config::ServerConfig;
use tokio::sync::mpsc;

/// Smoke test: server binds, answers console commands, and shuts down on
/// `quit`.
#[tokio::test]
async fn server_console_status_and_quit() -> anyhow::Result<()> {
    let (mut server, addr) = CollabServer::bind_ephemeral(ServerConfig::default()).await?;
    assert_ne!(addr.port(), 0);

    let output = server.exec_console("status")?;
    assert!(output.iter().any(|line| line.contains("Clients: 0")));

    let (console_tx, console_rx) = mpsc::channel(4);
    let run = tokio::spawn(server.run(Some(console_rx)));
    console_tx.send("quit".to_string()).await?;
    run.await??;
    Ok(())
}
