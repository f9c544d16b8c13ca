//! Client implementation.
//!
//! The back end owns the sockets: a reader task dispatches server
//! messages (awaiting payload bytes as they arrive), a writer task drains
//! the outbound channel into the socket send queue, and optional datagram
//! tasks carry the lossy channel once the UDP ticket exchange completed.
//!
//! Work that belongs on the application's thread crosses the front-end
//! forwarding channel as reference-counted buffer handles; nothing is
//! re-serialized on the way over, and the application drains the channel
//! from its own loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use collab_shared::buffer::{MessageBuffer, MessageReader, MessageWriter};
use collab_shared::config::ServerUri;
use collab_shared::protocol::{
    self, ClientId, ClientMessage, ConnectRequest, MessageId, NameChangeRequest, Ping,
    ProtocolRequest, ProtocolStatus, ServerMessage, UdpConnectReply, UdpConnectRequest,
    CORE_PROTOCOL_VERSION, NAME_LENGTH,
};
use collab_shared::socket::{
    ReliableConn, ReliableReader, ReliableWriter, UnreliableConn, UnreliableReader,
    UnreliableWriter,
};

use crate::plugins::PluginClient;

/// How long to wait for each UDP connect attempt.
const UDP_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const UDP_CONNECT_ATTEMPTS: usize = 3;

/// One buffer forwarded from the back end to the application thread.
pub struct FrontendMessage {
    /// Index into the client's plug-in list.
    pub plugin: usize,
    /// Message ID relative to the plug-in's server base.
    pub offset: MessageId,
    /// Complete message in host byte order.
    pub message: MessageBuffer,
}

/// Cloneable handle giving plug-ins access to the client's channels.
#[derive(Clone)]
pub struct ClientHandle {
    client_id: ClientId,
    swap_on_read: bool,
    tcp_tx: mpsc::UnboundedSender<MessageBuffer>,
    udp_tx: mpsc::UnboundedSender<MessageBuffer>,
    udp_ready: Arc<AtomicBool>,
    frontend_tx: mpsc::UnboundedSender<FrontendMessage>,
}

impl ClientHandle {
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// True when server data must be byte-reversed on read.
    pub fn swap_on_read(&self) -> bool {
        self.swap_on_read
    }

    /// Queues a message on the reliable channel.
    pub fn send(&self, message: MessageBuffer) {
        let _ = self.tcp_tx.send(message);
    }

    /// Queues a message on the datagram channel, falling back to the
    /// reliable channel while the UDP handshake has not completed.
    pub fn send_udp_preferred(&self, message: MessageBuffer) {
        if self.udp_ready.load(Ordering::Acquire) {
            let _ = self.udp_tx.send(message);
        } else {
            self.send(message);
        }
    }

    /// Hands a buffer to the application thread.
    pub fn forward_frontend(&self, plugin: usize, offset: MessageId, message: MessageBuffer) {
        let _ = self.frontend_tx.send(FrontendMessage {
            plugin,
            offset,
            message,
        });
    }
}

/// A peer known through connect notifications.
struct RemoteClient {
    name: String,
    /// Local plug-in indices shared with this peer.
    plugins: Vec<usize>,
}

struct Shared {
    roster: Mutex<HashMap<ClientId, RemoteClient>>,
    own_name: Mutex<String>,
    outstanding_ping: Mutex<Option<(i16, Instant)>>,
    last_rtt: Mutex<Option<Duration>>,
    connected: AtomicBool,
}

/// High-level collaboration client.
pub struct CollabClient {
    handle: ClientHandle,
    plugins: Arc<Vec<Arc<dyn PluginClient>>>,
    frontend_rx: mpsc::UnboundedReceiver<FrontendMessage>,
    shared: Arc<Shared>,
    client_id: ClientId,
    server_name: String,
    next_ping_sequence: i16,
}

impl CollabClient {
    /// Connects, performs the core handshake, negotiates the given
    /// plug-ins, and attempts the UDP ticket exchange.
    pub async fn connect(
        uri: &ServerUri,
        client_name: &str,
        plugins: Vec<Arc<dyn PluginClient>>,
    ) -> Result<CollabClient> {
        let server_addr = resolve(uri).await?;
        info!(%server_addr, "connecting");

        let conn = ReliableConn::connect(server_addr).await?;
        let (mut reader, mut writer) = conn.into_split();

        // The server's first word tells us its byte order.
        let marker = reader.read_u32().await?;
        let swap = protocol::detect_swap(marker)?;
        reader.set_swap_on_read(swap);

        let server_version = reader.read_u32().await?;
        if !protocol::versions_compatible(server_version, CORE_PROTOCOL_VERSION) {
            bail!("server protocol version {server_version:#x} is incompatible");
        }
        let mut nonce = [0u8; protocol::NONCE_LENGTH];
        reader.read_raw(&mut nonce).await?;

        let password = uri.password.as_deref().unwrap_or("");
        let request = ConnectRequest {
            protocol_version: CORE_PROTOCOL_VERSION,
            hash: protocol::password_hash(password, &nonce),
            client_name: client_name.to_string(),
            protocols: plugins
                .iter()
                .map(|p| ProtocolRequest {
                    name: p.name().to_string(),
                    version: p.version(),
                })
                .collect(),
        };
        writer.send(request.encode()).await?;

        // The reply is the first framed message on the connection.
        let reply_id = reader
            .read_message_id()
            .await?
            .context("server closed during handshake")?;
        match ServerMessage::from_id(reply_id) {
            Some(ServerMessage::ConnectReply) => {}
            Some(ServerMessage::ConnectReject) => {
                bail!("server rejected the connection (bad password or version)")
            }
            _ => bail!("unexpected handshake reply {reply_id}"),
        }

        let server_name = read_name(&mut reader).await?;
        let client_id = reader.read_u16().await?;
        let granted_name = read_name(&mut reader).await?;
        let udp_ticket = reader.read_u32().await?;
        let num_protocols = reader.read_u16().await?;
        if num_protocols as usize != plugins.len() {
            bail!(
                "server answered {num_protocols} protocol requests, expected {}",
                plugins.len()
            );
        }

        // Replies correspond to requests in order; the protocol index is
        // the server's table position, echoed in connect notifications.
        let mut index_map: HashMap<u16, usize> = HashMap::new();
        for (local_index, plugin) in plugins.iter().enumerate() {
            let status = reader.read_u8().await?;
            let status = ProtocolStatus::from_u8(status)
                .with_context(|| format!("invalid protocol status {status}"))?;
            let version = reader.read_u32().await?;
            let protocol_index = reader.read_u16().await?;
            let client_base = reader.read_u16().await?;
            let server_base = reader.read_u16().await?;
            match status {
                ProtocolStatus::Success => {
                    plugin.set_message_bases(collab_shared::plugin::MessageBases {
                        client: client_base,
                        server: server_base,
                    });
                    index_map.insert(protocol_index, local_index);
                    debug!(
                        plugin = plugin.name(),
                        version, client_base, server_base, "plug-in negotiated"
                    );
                }
                ProtocolStatus::UnknownProtocol => {
                    warn!(plugin = plugin.name(), "server does not know this plug-in");
                }
                ProtocolStatus::WrongVersion => {
                    warn!(
                        plugin = plugin.name(),
                        server_version = version,
                        "server speaks a different plug-in version"
                    );
                }
            }
        }

        info!(
            client_id,
            name = %granted_name,
            server = %server_name,
            swap,
            "connected"
        );

        // Bind the lossy channel and present the ticket. A client whose
        // exchange never completes runs TCP-only.
        let udp_bind: SocketAddr = if server_addr.is_ipv4() {
            "0.0.0.0:0".parse().expect("literal")
        } else {
            "[::]:0".parse().expect("literal")
        };
        let udp = UnreliableConn::bind(udp_bind).await?;
        let (udp_reader, mut udp_writer) = udp.into_split();
        let udp_ok = udp_connect(
            &udp_reader,
            &mut udp_writer,
            server_addr,
            client_id,
            udp_ticket,
            swap,
        )
        .await;
        if !udp_ok {
            warn!("UDP handshake did not complete, staying TCP-only");
        }

        let (tcp_tx, tcp_rx) = mpsc::unbounded_channel();
        let (udp_tx, udp_rx) = mpsc::unbounded_channel();
        let (frontend_tx, frontend_rx) = mpsc::unbounded_channel();
        let udp_ready = Arc::new(AtomicBool::new(udp_ok));
        let handle = ClientHandle {
            client_id,
            swap_on_read: swap,
            tcp_tx,
            udp_tx,
            udp_ready,
            frontend_tx,
        };
        let shared = Arc::new(Shared {
            roster: Mutex::new(HashMap::new()),
            own_name: Mutex::new(granted_name),
            outstanding_ping: Mutex::new(None),
            last_rtt: Mutex::new(None),
            connected: AtomicBool::new(true),
        });
        let plugins = Arc::new(plugins);

        tokio::spawn(run_writer(writer, tcp_rx));
        if udp_ok {
            tokio::spawn(run_udp_writer(udp_writer, udp_rx, server_addr));
            tokio::spawn(run_udp_reader(
                udp_reader,
                server_addr,
                handle.clone(),
                plugins.clone(),
            ));
        }
        tokio::spawn(run_backend(
            reader,
            handle.clone(),
            plugins.clone(),
            index_map,
            shared.clone(),
        ));

        for plugin in plugins.iter() {
            if plugin.message_bases().is_some() {
                plugin.start(&handle);
            }
        }

        Ok(CollabClient {
            handle,
            plugins,
            frontend_rx,
            shared,
            client_id,
            server_name,
            next_ping_sequence: 0,
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// The name the server granted, after any uniquification or rename.
    pub fn client_name(&self) -> String {
        self.shared.own_name.lock().expect("name lock").clone()
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// False once the server connection is gone.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Names of the peers currently known through connect notifications.
    pub fn roster(&self) -> Vec<(ClientId, String)> {
        let roster = self.shared.roster.lock().expect("roster lock");
        let mut entries: Vec<(ClientId, String)> = roster
            .iter()
            .map(|(&id, remote)| (id, remote.name.clone()))
            .collect();
        entries.sort();
        entries
    }

    /// Sends a ping carrying the current wall-clock time.
    pub fn ping(&mut self) {
        self.next_ping_sequence = self.next_ping_sequence.wrapping_add(1);
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        let ping = Ping {
            sequence: self.next_ping_sequence,
            seconds: now.as_secs() as i64,
            nanoseconds: now.subsec_nanos() as i64,
        };
        *self.shared.outstanding_ping.lock().expect("ping lock") =
            Some((ping.sequence, Instant::now()));
        self.handle
            .send(ping.encode(ClientMessage::PingRequest.id()));
    }

    /// Round-trip time measured by the most recently answered ping.
    pub fn last_ping_rtt(&self) -> Option<Duration> {
        *self.shared.last_rtt.lock().expect("rtt lock")
    }

    /// Asks the server to change this client's name.
    pub fn request_name_change(&self, name: &str) {
        self.handle.send(
            NameChangeRequest {
                name: name.to_string(),
            }
            .encode(),
        );
    }

    /// Announces departure; the server closes the connection in response.
    pub fn disconnect(self) {
        let writer = MessageWriter::new(ClientMessage::DisconnectRequest.id(), 0);
        self.handle.send(writer.finish());
    }

    /// Waits for one forwarded buffer and dispatches it to its plug-in.
    /// Returns `false` once the back end is gone.
    pub async fn dispatch_frontend_message(&mut self) -> Result<bool> {
        match self.frontend_rx.recv().await {
            Some(forwarded) => {
                self.dispatch_one(forwarded)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Dispatches every forwarded buffer currently queued.
    pub fn drain_frontend(&mut self) -> Result<usize> {
        let mut handled = 0;
        while let Ok(forwarded) = self.frontend_rx.try_recv() {
            self.dispatch_one(forwarded)?;
            handled += 1;
        }
        Ok(handled)
    }

    fn dispatch_one(&self, forwarded: FrontendMessage) -> Result<()> {
        let plugin = self
            .plugins
            .get(forwarded.plugin)
            .context("forwarded message for unknown plug-in")?;
        plugin.handle_frontend(&self.handle, forwarded.offset, &forwarded.message)
    }
}

async fn resolve(uri: &ServerUri) -> Result<SocketAddr> {
    tokio::net::lookup_host((uri.host.as_str(), uri.port))
        .await
        .with_context(|| format!("resolving {}", uri.host))?
        .next()
        .with_context(|| format!("no addresses for {}", uri.host))
}

async fn read_name(reader: &mut ReliableReader) -> Result<String> {
    let raw = reader.read_vec(NAME_LENGTH).await?;
    protocol::read_name_field(&mut MessageReader::new(&raw, false))
}

/// Presents the UDP ticket until the server confirms it, or gives up.
async fn udp_connect(
    udp_reader: &UnreliableReader,
    udp_writer: &mut UnreliableWriter,
    server_addr: SocketAddr,
    client_id: ClientId,
    ticket: u32,
    swap: bool,
) -> bool {
    let request = UdpConnectRequest { client_id, ticket }.encode();
    for _ in 0..UDP_CONNECT_ATTEMPTS {
        if udp_writer.send(server_addr, request.clone()).await.is_err() {
            return false;
        }
        match tokio::time::timeout(UDP_CONNECT_TIMEOUT, udp_reader.recv()).await {
            Ok(Ok((from, datagram))) if from == server_addr => {
                let mut reader = MessageReader::new(datagram.as_slice(), swap);
                let confirmed = reader
                    .read_u16()
                    .ok()
                    .filter(|&id| id == ServerMessage::UdpConnectReply.id())
                    .and_then(|_| UdpConnectReply::decode(&mut reader).ok())
                    .is_some_and(|reply| reply.ticket == ticket);
                if confirmed {
                    return true;
                }
            }
            Ok(Ok(_)) | Err(_) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "UDP receive failed during connect");
                return false;
            }
        }
    }
    false
}

/// Drains the outbound channel into the socket send queue, batching
/// whatever is already waiting into one vectored write.
async fn run_writer(mut writer: ReliableWriter, mut rx: mpsc::UnboundedReceiver<MessageBuffer>) {
    while let Some(message) = rx.recv().await {
        writer.queue_message(message);
        while let Ok(more) = rx.try_recv() {
            writer.queue_message(more);
        }
        if let Err(e) = writer.flush().await {
            debug!(error = %e, "write side closed");
            return;
        }
    }
}

async fn run_udp_writer(
    mut writer: UnreliableWriter,
    mut rx: mpsc::UnboundedReceiver<MessageBuffer>,
    server_addr: SocketAddr,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = writer.send(server_addr, message).await {
            warn!(error = %e, "datagram send failed");
        }
    }
}

/// Receives server datagrams and dispatches them to their plug-ins.
async fn run_udp_reader(
    reader: UnreliableReader,
    server_addr: SocketAddr,
    handle: ClientHandle,
    plugins: Arc<Vec<Arc<dyn PluginClient>>>,
) {
    loop {
        let (from, datagram) = match reader.recv().await {
            Ok(received) => received,
            Err(e) => {
                debug!(error = %e, "datagram receive failed");
                return;
            }
        };
        if from != server_addr {
            continue;
        }
        if let Err(e) = dispatch_datagram(&handle, &plugins, datagram) {
            // The datagram channel is lossy by contract; drop and go on.
            debug!(error = %e, "discarding datagram");
        }
    }
}

fn dispatch_datagram(
    handle: &ClientHandle,
    plugins: &[Arc<dyn PluginClient>],
    datagram: MessageBuffer,
) -> Result<()> {
    let bytes = datagram.as_slice();
    if bytes.len() < 2 {
        bail!("datagram shorter than a message ID");
    }
    let swap = handle.swap_on_read();
    let id_native = u16::from_ne_bytes([bytes[0], bytes[1]]);
    let id = if swap {
        id_native.swap_bytes()
    } else {
        id_native
    };

    for plugin in plugins {
        if let Some(bases) = plugin.message_bases() {
            if let Some(offset) = bases.server_offset(id, plugin.num_server_messages()) {
                return plugin.handle_datagram(handle, offset, datagram, swap);
            }
        }
    }
    bail!("unknown datagram message ID {id}");
}

/// Dispatches server messages until the connection goes away.
async fn run_backend(
    mut reader: ReliableReader,
    handle: ClientHandle,
    plugins: Arc<Vec<Arc<dyn PluginClient>>>,
    index_map: HashMap<u16, usize>,
    shared: Arc<Shared>,
) {
    if let Err(e) = backend_loop(&mut reader, &handle, &plugins, &index_map, &shared).await {
        warn!(error = %e, "connection error");
    } else {
        info!("server closed the connection");
    }
    shared.connected.store(false, Ordering::Release);
}

async fn backend_loop(
    reader: &mut ReliableReader,
    handle: &ClientHandle,
    plugins: &Arc<Vec<Arc<dyn PluginClient>>>,
    index_map: &HashMap<u16, usize>,
    shared: &Arc<Shared>,
) -> Result<()> {
    loop {
        let Some(id) = reader.read_message_id().await? else {
            return Ok(());
        };

        match ServerMessage::from_id(id) {
            Some(ServerMessage::PingReply) => {
                let ping = Ping {
                    sequence: reader.read_i16().await?,
                    seconds: reader.read_i64().await?,
                    nanoseconds: reader.read_i64().await?,
                };
                let outstanding = shared.outstanding_ping.lock().expect("ping lock").take();
                if let Some((sequence, sent)) = outstanding {
                    if sequence == ping.sequence {
                        let rtt = sent.elapsed();
                        debug!(sequence, ?rtt, "pong");
                        *shared.last_rtt.lock().expect("rtt lock") = Some(rtt);
                    }
                }
            }
            Some(ServerMessage::NameChangeReply) => {
                let granted = reader.read_bool().await?;
                let name = read_name(reader).await?;
                if granted {
                    *shared.own_name.lock().expect("name lock") = name.clone();
                    info!(name = %name, "name change granted");
                } else {
                    info!(name = %name, "name change denied");
                }
            }
            Some(ServerMessage::NameChangeNotification) => {
                let client = reader.read_u16().await?;
                let name = read_name(reader).await?;
                if let Some(remote) = shared.roster.lock().expect("roster lock").get_mut(&client) {
                    remote.name = name;
                }
            }
            Some(ServerMessage::ClientConnectNotification) => {
                let client = reader.read_u16().await?;
                let name = read_name(reader).await?;
                let count = reader.read_u16().await?;
                let mut local_plugins = Vec::new();
                for _ in 0..count {
                    let protocol_index = reader.read_u16().await?;
                    if let Some(&local) = index_map.get(&protocol_index) {
                        local_plugins.push(local);
                    }
                }
                info!(client, name = %name, "client joined");
                shared.roster.lock().expect("roster lock").insert(
                    client,
                    RemoteClient {
                        name,
                        plugins: local_plugins.clone(),
                    },
                );
                for local in local_plugins {
                    plugins[local].client_connected(client);
                }
            }
            Some(ServerMessage::ClientDisconnectNotification) => {
                let client = reader.read_u16().await?;
                let removed = shared.roster.lock().expect("roster lock").remove(&client);
                if let Some(remote) = removed {
                    info!(client, name = %remote.name, "client left");
                    for local in remote.plugins {
                        plugins[local].client_disconnected(client);
                    }
                }
            }
            Some(
                ServerMessage::ConnectReply
                | ServerMessage::ConnectReject
                | ServerMessage::UdpConnectReply,
            ) => {
                bail!("unexpected handshake message {id} after handshake");
            }
            None => {
                let mut dispatched = false;
                for plugin in plugins.iter() {
                    let Some(bases) = plugin.message_bases() else {
                        continue;
                    };
                    if let Some(offset) = bases.server_offset(id, plugin.num_server_messages()) {
                        plugin.handle_message(handle, offset, reader).await?;
                        dispatched = true;
                        break;
                    }
                }
                if !dispatched {
                    bail!("unknown message ID {id}");
                }
            }
        }
    }
}
