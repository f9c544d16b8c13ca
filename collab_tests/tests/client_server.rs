//! Full socket-based integration tests for client ↔ server communication.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use collab_client::client::CollabClient;
use collab_client::plugins::agora::AgoraClient;
use collab_client::plugins::chat::ChatClient;
use collab_client::plugins::PluginClient;
use collab_server::CollabServer;
use collab_shared::config::{ServerConfig, ServerUri};
use collab_shared::protocol::{
    self, ClientMessage, ConnectRequest, ProtocolRequest, ProtocolStatus, ServerMessage,
    CORE_PROTOCOL_VERSION, NAME_LENGTH, NONCE_LENGTH, NUM_CLIENT_MESSAGES, NUM_SERVER_MESSAGES,
};
use collab_shared::socket::{ReliableConn, ReliableReader, ReliableWriter};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

async fn start_server(config: ServerConfig) -> anyhow::Result<SocketAddr> {
    let (server, addr) = CollabServer::bind_ephemeral(config).await?;
    tokio::spawn(server.run(None));
    Ok(addr)
}

fn uri_for(addr: SocketAddr, password: Option<&str>) -> ServerUri {
    ServerUri {
        password: password.map(str::to_string),
        host: addr.ip().to_string(),
        port: addr.port(),
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Performs the raw pre-handshake exchange and returns the split socket
/// plus the server's nonce.
async fn raw_connect(
    addr: SocketAddr,
) -> anyhow::Result<(ReliableReader, ReliableWriter, [u8; NONCE_LENGTH])> {
    let conn = ReliableConn::connect(addr).await?;
    let (mut reader, writer) = conn.into_split();

    let marker = reader.read_u32().await?;
    assert!(!protocol::detect_swap(marker)?);
    let version = reader.read_u32().await?;
    assert!(protocol::versions_compatible(version, CORE_PROTOCOL_VERSION));
    let mut nonce = [0u8; NONCE_LENGTH];
    reader.read_raw(&mut nonce).await?;
    Ok((reader, writer, nonce))
}

async fn read_name(reader: &mut ReliableReader) -> anyhow::Result<String> {
    let raw = reader.read_vec(NAME_LENGTH).await?;
    protocol::read_name_field(&mut collab_shared::buffer::MessageReader::new(&raw, false))
}

/// Handshake with zero requested plug-ins still yields a client ID and a
/// UDP ticket.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_with_zero_plugins() -> anyhow::Result<()> {
    init_tracing();
    let addr = start_server(ServerConfig::default()).await?;
    let (mut reader, mut writer, nonce) = raw_connect(addr).await?;

    let request = ConnectRequest {
        protocol_version: CORE_PROTOCOL_VERSION,
        hash: protocol::password_hash("", &nonce),
        client_name: "probe".into(),
        protocols: Vec::new(),
    };
    writer.send(request.encode()).await?;

    let id = reader.read_message_id().await?.expect("reply expected");
    assert_eq!(ServerMessage::from_id(id), Some(ServerMessage::ConnectReply));
    let _server_name = read_name(&mut reader).await?;
    let client_id = reader.read_u16().await?;
    assert_ne!(client_id, 0);
    let granted = read_name(&mut reader).await?;
    assert_eq!(granted, "probe");
    let udp_ticket = reader.read_u32().await?;
    assert_ne!(udp_ticket, 0);
    assert_eq!(reader.read_u16().await?, 0);
    Ok(())
}

/// One known, one unknown, and one wrong-version plug-in in a single
/// request; the known one gets the first ranges above the core IDs.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_reports_per_plugin_status() -> anyhow::Result<()> {
    init_tracing();
    let addr = start_server(ServerConfig::default()).await?;
    let (mut reader, mut writer, nonce) = raw_connect(addr).await?;

    let request = ConnectRequest {
        protocol_version: CORE_PROTOCOL_VERSION,
        hash: protocol::password_hash("", &nonce),
        client_name: "probe".into(),
        protocols: vec![
            ProtocolRequest {
                name: "Chat".into(),
                version: 1 << 16,
            },
            ProtocolRequest {
                name: "Whiteboard".into(),
                version: 1 << 16,
            },
            ProtocolRequest {
                name: "Koinonia".into(),
                version: 2 << 16,
            },
        ],
    };
    writer.send(request.encode()).await?;

    let id = reader.read_message_id().await?.expect("reply expected");
    assert_eq!(ServerMessage::from_id(id), Some(ServerMessage::ConnectReply));
    let _ = read_name(&mut reader).await?;
    let _ = reader.read_u16().await?;
    let _ = read_name(&mut reader).await?;
    let _ = reader.read_u32().await?;
    assert_eq!(reader.read_u16().await?, 3);

    let mut replies = Vec::new();
    for _ in 0..3 {
        let status = ProtocolStatus::from_u8(reader.read_u8().await?).unwrap();
        let version = reader.read_u32().await?;
        let _index = reader.read_u16().await?;
        let client_base = reader.read_u16().await?;
        let server_base = reader.read_u16().await?;
        replies.push((status, version, client_base, server_base));
    }

    assert_eq!(replies[0].0, ProtocolStatus::Success);
    assert_eq!(replies[0].2, NUM_CLIENT_MESSAGES);
    assert_eq!(replies[0].3, NUM_SERVER_MESSAGES);
    assert_eq!(replies[1].0, ProtocolStatus::UnknownProtocol);
    assert_eq!(replies[2].0, ProtocolStatus::WrongVersion);
    assert_eq!(replies[2].1, 1 << 16);
    Ok(())
}

/// A wrong password hash draws a reject and a closed connection.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_password_is_rejected() -> anyhow::Result<()> {
    init_tracing();
    let addr = start_server(ServerConfig {
        password: "secret".into(),
        ..ServerConfig::default()
    })
    .await?;
    let (mut reader, mut writer, nonce) = raw_connect(addr).await?;

    let request = ConnectRequest {
        protocol_version: CORE_PROTOCOL_VERSION,
        hash: protocol::password_hash("wrong", &nonce),
        client_name: "intruder".into(),
        protocols: Vec::new(),
    };
    writer.send(request.encode()).await?;

    let id = reader.read_message_id().await?.expect("reject expected");
    assert_eq!(
        ServerMessage::from_id(id),
        Some(ServerMessage::ConnectReject)
    );
    Ok(())
}

/// The server echoes ping payloads value for value.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_echoes_identical_values() -> anyhow::Result<()> {
    init_tracing();
    let addr = start_server(ServerConfig::default()).await?;
    let (mut reader, mut writer, nonce) = raw_connect(addr).await?;

    let request = ConnectRequest {
        protocol_version: CORE_PROTOCOL_VERSION,
        hash: protocol::password_hash("", &nonce),
        client_name: "pinger".into(),
        protocols: Vec::new(),
    };
    writer.send(request.encode()).await?;
    let id = reader.read_message_id().await?.expect("reply expected");
    assert_eq!(ServerMessage::from_id(id), Some(ServerMessage::ConnectReply));
    // Skip the rest of the reply.
    reader.read_vec(NAME_LENGTH).await?;
    reader.read_u16().await?;
    reader.read_vec(NAME_LENGTH).await?;
    reader.read_u32().await?;
    assert_eq!(reader.read_u16().await?, 0);

    let ping = protocol::Ping {
        sequence: 42,
        seconds: 1_700_000_000,
        nanoseconds: 0,
    };
    writer.send(ping.encode(ClientMessage::PingRequest.id())).await?;

    let id = reader.read_message_id().await?.expect("pong expected");
    assert_eq!(ServerMessage::from_id(id), Some(ServerMessage::PingReply));
    assert_eq!(reader.read_i16().await?, 42);
    assert_eq!(reader.read_i64().await?, 1_700_000_000);
    assert_eq!(reader.read_i64().await?, 0);
    Ok(())
}

/// A client writing every multi-byte field byte-reversed (as a
/// foreign-endian host would) still handshakes and pings correctly: the
/// server detects the reversed marker and swaps on read.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn byte_swapped_client_completes_handshake() -> anyhow::Result<()> {
    use collab_shared::buffer::MessageWriter;

    init_tracing();
    let addr = start_server(ServerConfig::default()).await?;
    let (mut reader, mut writer, nonce) = raw_connect(addr).await?;

    // Hand-build the connect request with reversed integers.
    let hash = protocol::password_hash("", &nonce);
    let mut request = MessageWriter::headerless(ConnectRequest::FIXED_SIZE);
    request.write_u32(protocol::ENDIANNESS_MARKER.swap_bytes());
    request.write_u32(CORE_PROTOCOL_VERSION.swap_bytes());
    request.write_raw(&hash);
    protocol::write_name_field("swapped", &mut request);
    request.write_u16(0u16.swap_bytes());
    writer.send(request.finish()).await?;

    let id = reader.read_message_id().await?.expect("reply expected");
    assert_eq!(ServerMessage::from_id(id), Some(ServerMessage::ConnectReply));
    reader.read_vec(NAME_LENGTH).await?;
    let client_id = reader.read_u16().await?;
    assert_ne!(client_id, 0);
    let granted = read_name(&mut reader).await?;
    assert_eq!(granted, "swapped");
    reader.read_u32().await?;
    assert_eq!(reader.read_u16().await?, 0);

    // Ping with reversed fields; the reply decodes to the true values.
    let mut ping = MessageWriter::headerless(2 + protocol::Ping::SIZE);
    ping.write_u16(ClientMessage::PingRequest.id().swap_bytes());
    ping.write_i16(7i16.swap_bytes());
    ping.write_i64(1_700_000_000i64.swap_bytes());
    ping.write_i64(9i64.swap_bytes());
    writer.send(ping.finish()).await?;

    let id = reader.read_message_id().await?.expect("pong expected");
    assert_eq!(ServerMessage::from_id(id), Some(ServerMessage::PingReply));
    assert_eq!(reader.read_i16().await?, 7);
    assert_eq!(reader.read_i64().await?, 1_700_000_000);
    assert_eq!(reader.read_i64().await?, 9);
    Ok(())
}

/// Two clients requesting the same name: the second gets a uniquified
/// variant.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn name_collision_gets_uniquified() -> anyhow::Result<()> {
    init_tracing();
    let addr = start_server(ServerConfig::default()).await?;
    let uri = uri_for(addr, None);

    let first = CollabClient::connect(&uri, "alice", Vec::new()).await?;
    let second = CollabClient::connect(&uri, "alice", Vec::new()).await?;

    assert_eq!(first.client_name(), "alice");
    assert_eq!(second.client_name(), "alice (2)");
    assert_ne!(first.client_id(), second.client_id());
    Ok(())
}

fn chat_plugin(log: Arc<Mutex<Vec<(u16, bool, String)>>>) -> Arc<ChatClient> {
    Arc::new(ChatClient::new(
        0,
        Box::new(move |source, private, text| {
            log.lock().unwrap().push((source, private, text.to_string()));
        }),
    ))
}

/// Broadcast chat reaches the other participant; private chat reaches
/// only its destination, flagged private.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_broadcast_and_private_delivery() -> anyhow::Result<()> {
    init_tracing();
    let addr = start_server(ServerConfig::default()).await?;
    let uri = uri_for(addr, None);

    let alice_log = Arc::new(Mutex::new(Vec::new()));
    let bob_log = Arc::new(Mutex::new(Vec::new()));
    let alice_chat = chat_plugin(alice_log.clone());
    let bob_chat = chat_plugin(bob_log.clone());

    let mut alice = CollabClient::connect(
        &uri,
        "alice",
        vec![alice_chat.clone() as Arc<dyn PluginClient>],
    )
    .await?;
    let mut bob = CollabClient::connect(
        &uri,
        "bob",
        vec![bob_chat.clone() as Arc<dyn PluginClient>],
    )
    .await?;
    let alice_id = alice.client_id();

    // Wait until the roster settled so the broadcast has a recipient.
    wait_until("alice to learn about bob", || {
        alice.roster().iter().any(|(_, name)| name == "bob")
    })
    .await;

    alice_chat.send(0, "hello everyone")?;
    wait_until("bob to receive the broadcast", || {
        bob.drain_frontend().unwrap();
        !bob_log.lock().unwrap().is_empty()
    })
    .await;
    assert_eq!(
        bob_log.lock().unwrap()[0],
        (alice_id, false, "hello everyone".to_string())
    );

    bob_chat.send(alice_id, "psst")?;
    wait_until("alice to receive the private message", || {
        alice.drain_frontend().unwrap();
        !alice_log.lock().unwrap().is_empty()
    })
    .await;
    let received = alice_log.lock().unwrap()[0].clone();
    assert_eq!(received.1, true);
    assert_eq!(received.2, "psst");
    Ok(())
}

/// Audio: stream announcements cross between participants and a packet
/// comes back with the source stamped in, reordered through the jitter
/// buffer.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn audio_packets_forwarded_with_source() -> anyhow::Result<()> {
    init_tracing();
    let addr = start_server(ServerConfig::default()).await?;
    let uri = uri_for(addr, None);

    let alice_audio = Arc::new(AgoraClient::new(48_000, 960));
    let bob_audio = Arc::new(AgoraClient::new(16_000, 320));

    let alice = CollabClient::connect(
        &uri,
        "alice",
        vec![alice_audio.clone() as Arc<dyn PluginClient>],
    )
    .await?;
    let _bob = CollabClient::connect(
        &uri,
        "bob",
        vec![bob_audio.clone() as Arc<dyn PluginClient>],
    )
    .await?;
    let alice_id = alice.client_id();

    wait_until("bob to learn alice's stream", || {
        bob_audio.stream_params(alice_id).is_some()
    })
    .await;
    assert_eq!(bob_audio.stream_params(alice_id), Some((48_000, 960)));

    alice_audio.send_audio(0, vec![1, 2, 3, 4])?;
    wait_until("bob to receive the audio packet", || {
        bob_audio.dequeue_audio(alice_id).is_some_and(|packet| {
            packet.client_id == alice_id && packet.data == vec![1, 2, 3, 4]
        })
    })
    .await;
    Ok(())
}
