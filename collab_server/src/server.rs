//! Server implementation.
//!
//! One listener accepts clients and drives the handshake; every connected
//! client gets a reader task (dispatch + handlers) and a writer task
//! draining that client's outbound channel into the socket send queue. All
//! shared state sits behind one lock, and everything a handler changes
//! together (version counters, stored objects, fan-out) happens under a
//! single acquisition, so per-object notification order is preserved end
//! to end.
//!
//! The UDP socket is shared by a receive task and a send task; a datagram
//! from an unknown address is only accepted when it is a ticketed
//! `UdpConnectRequest`, which binds that source address to its client.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use collab_shared::buffer::{MessageBuffer, MessageReader};
use collab_shared::config::ServerConfig;
use collab_shared::console::Console;
use collab_shared::plugin::MessageBases;
use collab_shared::protocol::{
    self, ClientConnectNotification, ClientDisconnectNotification, ClientId, ClientMessage,
    ConnectReply, NameChangeNotification, NameChangeReply, PasswordRequest, Ping, ProtocolReply,
    ProtocolStatus, ServerMessage, UdpConnectReply, UdpConnectRequest, CORE_PROTOCOL_VERSION,
    NAME_LENGTH, NONCE_LENGTH, NUM_CLIENT_MESSAGES, NUM_SERVER_MESSAGES,
};
use collab_shared::socket::{
    ReliableConn, ReliableListener, ReliableReader, ReliableWriter, UnreliableConn,
    UnreliableReader,
};

use crate::plugins::{agora::AgoraServer, chat::ChatServer, koinonia::KoinoniaServer, PluginServer};

/// Per-client server state.
struct ClientEntry {
    name: String,
    sender: mpsc::UnboundedSender<MessageBuffer>,
    swap_on_read: bool,
    /// Server plug-in table indices the client negotiated.
    negotiated: Vec<u16>,
    udp_ticket: u32,
    /// Bound once the UDP connect exchange completed.
    udp_address: Option<SocketAddr>,
}

/// Mutable server state shared by every task.
struct ServerState {
    server_name: String,
    password: String,
    next_client_id: ClientId,
    clients: HashMap<ClientId, ClientEntry>,
    udp_tickets: HashMap<u32, ClientId>,
    udp_clients: HashMap<SocketAddr, ClientId>,
}

impl ServerState {
    fn name_in_use(&self, name: &str, except: Option<ClientId>) -> bool {
        self.clients
            .iter()
            .any(|(&id, entry)| Some(id) != except && entry.name == name)
    }

    /// Picks a name unique among current clients, appending ` (n)` if the
    /// requested one is taken.
    fn uniquify_name(&self, requested: &str) -> String {
        let base = if requested.is_empty() {
            "Anonymous"
        } else {
            requested
        };
        if !self.name_in_use(base, None) {
            return base.to_string();
        }
        let mut n = 2usize;
        loop {
            let candidate = format!("{base} ({n})");
            if !self.name_in_use(&candidate, None) {
                return candidate;
            }
            n += 1;
        }
    }

    fn allocate_client_id(&mut self) -> ClientId {
        loop {
            self.next_client_id = self.next_client_id.wrapping_add(1);
            if self.next_client_id != 0 && !self.clients.contains_key(&self.next_client_id) {
                return self.next_client_id;
            }
        }
    }
}

/// Cloneable handle giving plug-ins and tasks access to the server.
#[derive(Clone)]
pub struct ServerHandle {
    state: Arc<Mutex<ServerState>>,
    plugins: Arc<Vec<Arc<dyn PluginServer>>>,
    udp_tx: mpsc::UnboundedSender<(SocketAddr, MessageBuffer)>,
}

impl ServerHandle {
    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().expect("server state lock poisoned")
    }

    pub fn plugins(&self) -> &[Arc<dyn PluginServer>] {
        &self.plugins
    }

    /// Queues a message on a client's reliable channel.
    pub fn send_to(&self, client: ClientId, message: MessageBuffer) -> bool {
        match self.lock().clients.get(&client) {
            Some(entry) => entry.sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Queues a message to every client that negotiated the plug-in,
    /// except the source.
    pub fn broadcast_plugin(&self, plugin_index: u16, except: ClientId, message: MessageBuffer) {
        let state = self.lock();
        for (&id, entry) in &state.clients {
            if id != except && entry.negotiated.contains(&plugin_index) {
                let _ = entry.sender.send(message.clone());
            }
        }
    }

    /// Sends over the datagram channel when the client completed its UDP
    /// handshake, falling back to the reliable channel otherwise.
    pub fn send_udp_preferred(&self, client: ClientId, message: MessageBuffer) {
        let target = {
            let state = self.lock();
            match state.clients.get(&client) {
                Some(entry) => entry.udp_address,
                None => return,
            }
        };
        match target {
            Some(addr) => {
                let _ = self.udp_tx.send((addr, message));
            }
            None => {
                self.send_to(client, message);
            }
        }
    }

    /// IDs of all clients that negotiated the plug-in.
    pub fn clients_with_plugin(&self, plugin_index: u16) -> Vec<ClientId> {
        self.lock()
            .clients
            .iter()
            .filter(|(_, entry)| entry.negotiated.contains(&plugin_index))
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn client_name(&self, client: ClientId) -> Option<String> {
        self.lock().clients.get(&client).map(|e| e.name.clone())
    }

    /// The client's byte-order flag detected at handshake.
    pub fn client_swap(&self, client: ClientId) -> bool {
        self.lock()
            .clients
            .get(&client)
            .is_some_and(|e| e.swap_on_read)
    }

    fn client_negotiated(&self, client: ClientId, plugin_index: u16) -> bool {
        self.lock()
            .clients
            .get(&client)
            .is_some_and(|e| e.negotiated.contains(&plugin_index))
    }
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    listener: ReliableListener,
    udp: Option<UnreliableConn>,
    udp_rx: Option<mpsc::UnboundedReceiver<(SocketAddr, MessageBuffer)>>,
    handle: ServerHandle,
    console: Console,
    koinonia: Arc<KoinoniaServer>,
}

impl CollabServer {
    /// Binds the TCP and UDP sockets and registers the bundled plug-ins.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port);
        Self::bind(config, bind).await
    }

    /// Test helper: binds to an ephemeral loopback port.
    pub async fn bind_ephemeral(config: ServerConfig) -> Result<(Self, SocketAddr)> {
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let server = Self::bind(config, bind).await?;
        let addr = server.local_addr()?;
        Ok((server, addr))
    }

    async fn bind(config: ServerConfig, bind: SocketAddr) -> Result<Self> {
        let listener = ReliableListener::bind(bind).await?;
        // The UDP socket shares the TCP port, whatever the listener got.
        let udp_bind = SocketAddr::new(bind.ip(), listener.local_addr()?.port());
        let udp = UnreliableConn::bind(udp_bind).await?;

        let chat = Arc::new(ChatServer::new(0));
        let agora = Arc::new(AgoraServer::new(1));
        let koinonia = Arc::new(KoinoniaServer::new());
        let plugins: Vec<Arc<dyn PluginServer>> = vec![chat, agora, koinonia.clone()];

        // Assign disjoint message ID ranges above the core's.
        let mut client_base = NUM_CLIENT_MESSAGES;
        let mut server_base = NUM_SERVER_MESSAGES;
        for plugin in &plugins {
            plugin.set_message_bases(MessageBases {
                client: client_base,
                server: server_base,
            });
            client_base += plugin.num_client_messages();
            server_base += plugin.num_server_messages();
        }

        let state = ServerState {
            server_name: config.server_name.clone(),
            password: config.password.clone(),
            next_client_id: 0,
            clients: HashMap::new(),
            udp_tickets: HashMap::new(),
            udp_clients: HashMap::new(),
        };
        let (udp_tx, udp_rx) = mpsc::unbounded_channel();
        let handle = ServerHandle {
            state: Arc::new(Mutex::new(state)),
            plugins: Arc::new(plugins),
            udp_tx,
        };

        let mut console = Console::new();
        Self::register_console_commands(&mut console, &handle);
        koinonia.clone().register_console_commands(&mut console, &handle);

        Ok(CollabServer {
            config,
            listener,
            udp: Some(udp),
            udp_rx: Some(udp_rx),
            handle,
            console,
            koinonia,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn koinonia(&self) -> Arc<KoinoniaServer> {
        self.koinonia.clone()
    }

    fn register_console_commands(console: &mut Console, handle: &ServerHandle) {
        let status_handle = handle.clone();
        console.register_command("status", "Show server status", move |_args, out| {
            let state = status_handle.lock();
            out.print(format!("Server: {}", state.server_name));
            out.print(format!("Clients: {}", state.clients.len()));
            Ok(())
        });

        let clients_handle = handle.clone();
        console.register_command("clients", "List connected clients", move |_args, out| {
            let state = clients_handle.lock();
            let mut ids: Vec<&ClientId> = state.clients.keys().collect();
            ids.sort();
            for id in ids {
                let entry = &state.clients[id];
                let udp = match entry.udp_address {
                    Some(addr) => addr.to_string(),
                    None => "tcp-only".to_string(),
                };
                out.print(format!("  {} {:?} udp={}", id, entry.name, udp));
            }
            Ok(())
        });
    }

    /// Executes one console command line.
    pub fn exec_console(&mut self, line: &str) -> Result<Vec<String>> {
        self.console.exec(line)
    }

    /// Runs the accept, datagram, console, and signal loops until a
    /// termination signal arrives or `quit` is entered.
    pub async fn run(mut self, console_rx: Option<mpsc::Receiver<String>>) -> Result<()> {
        let (udp_reader, mut udp_writer) = self.udp.take().expect("run called twice").into_split();
        let mut udp_rx = self.udp_rx.take().expect("run called twice");

        // Datagram send task: drains the shared queue, one datagram each.
        tokio::spawn(async move {
            while let Some((peer, message)) = udp_rx.recv().await {
                if let Err(e) = udp_writer.send(peer, message).await {
                    warn!(error = %e, "datagram send failed");
                }
            }
        });

        // Datagram receive task.
        let udp_handle = self.handle.clone();
        tokio::spawn(async move {
            run_udp(udp_handle, udp_reader).await;
        });

        let mut console_rx = console_rx;
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("installing SIGTERM handler")?;

        info!(
            port = self.listener.local_addr()?.port(),
            name = %self.config.server_name,
            "server listening"
        );

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (conn, peer) = accepted?;
                    info!(%peer, "incoming connection");
                    let handle = self.handle.clone();
                    tokio::spawn(async move {
                        serve_client(handle, conn, peer).await;
                    });
                }
                line = recv_console(&mut console_rx) => {
                    if line.trim() == "quit" {
                        info!("console requested shutdown");
                        break;
                    }
                    match self.console.exec(&line) {
                        Ok(output) => {
                            for line in output {
                                println!("{line}");
                            }
                        }
                        Err(e) => println!("error: {e:#}"),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("termination signal received, shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn recv_console(rx: &mut Option<mpsc::Receiver<String>>) -> String {
    match rx {
        Some(rx) => match rx.recv().await {
            Some(line) => line,
            // Console feed gone; park this branch.
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

/// Drives one client connection from handshake to disconnect.
async fn serve_client(handle: ServerHandle, conn: ReliableConn, peer: SocketAddr) {
    let (mut reader, writer) = conn.into_split();
    let client_id = match handshake(&handle, &mut reader, writer, peer).await {
        Ok(Some(client_id)) => client_id,
        Ok(None) => return,
        Err(e) => {
            warn!(%peer, error = %e, "handshake failed");
            return;
        }
    };

    if let Err(e) = message_loop(&handle, client_id, &mut reader).await {
        warn!(client = client_id, error = %e, "connection error");
    }
    disconnect(&handle, client_id);
}

/// Server half of the core handshake; returns the new client's ID, or
/// `None` when the connection was rejected.
async fn handshake(
    handle: &ServerHandle,
    reader: &mut ReliableReader,
    mut writer: ReliableWriter,
    peer: SocketAddr,
) -> Result<Option<ClientId>> {
    // Challenge first: endianness marker, version, nonce.
    let nonce: [u8; NONCE_LENGTH] = rand::random();
    let request = PasswordRequest {
        protocol_version: CORE_PROTOCOL_VERSION,
        nonce,
    };
    writer.send(request.encode()).await?;

    // The client's first word tells us its byte order.
    let marker = reader.read_u32().await?;
    let swap = protocol::detect_swap(marker)?;
    reader.set_swap_on_read(swap);

    let client_version = reader.read_u32().await?;
    let mut hash = [0u8; protocol::HASH_LENGTH];
    reader.read_raw(&mut hash).await?;
    let name_raw = reader.read_vec(NAME_LENGTH).await?;
    let requested_name = protocol::read_name_field(&mut MessageReader::new(&name_raw, false))?;
    let num_protocols = reader.read_u16().await?;
    let mut requests = Vec::with_capacity(num_protocols as usize);
    for _ in 0..num_protocols {
        let name_raw = reader.read_vec(NAME_LENGTH).await?;
        let name = protocol::read_name_field(&mut MessageReader::new(&name_raw, false))?;
        let version = reader.read_u32().await?;
        requests.push((name, version));
    }

    if !protocol::versions_compatible(client_version, CORE_PROTOCOL_VERSION) {
        warn!(%peer, client_version, "rejecting client with incompatible protocol version");
        writer.send(protocol::encode_connect_reject()).await?;
        return Ok(None);
    }
    let expected = {
        let state = handle.lock();
        protocol::password_hash(&state.password, &nonce)
    };
    if hash != expected {
        warn!(%peer, "rejecting client with bad password hash");
        writer.send(protocol::encode_connect_reject()).await?;
        return Ok(None);
    }

    // Match the requested plug-ins against the server's table.
    let mut replies = Vec::with_capacity(requests.len());
    let mut negotiated = Vec::new();
    for (name, version) in &requests {
        let found = handle
            .plugins
            .iter()
            .enumerate()
            .find(|(_, p)| p.name() == name);
        let reply = match found {
            Some((index, plugin)) if protocol::versions_compatible(*version, plugin.version()) => {
                negotiated.push(index as u16);
                let bases = plugin.message_bases();
                ProtocolReply {
                    status: ProtocolStatus::Success,
                    version: plugin.version(),
                    protocol_index: index as u16,
                    client_message_base: bases.client,
                    server_message_base: bases.server,
                }
            }
            Some((index, plugin)) => ProtocolReply {
                status: ProtocolStatus::WrongVersion,
                version: plugin.version(),
                protocol_index: index as u16,
                client_message_base: 0,
                server_message_base: 0,
            },
            None => ProtocolReply {
                status: ProtocolStatus::UnknownProtocol,
                version: 0,
                protocol_index: 0,
                client_message_base: 0,
                server_message_base: 0,
            },
        };
        replies.push(reply);
    }

    // Register the client and issue its UDP ticket.
    let (sender, receiver) = mpsc::unbounded_channel::<MessageBuffer>();
    let (client_id, client_name, udp_ticket, server_name) = {
        let mut state = handle.lock();
        let client_id = state.allocate_client_id();
        let client_name = state.uniquify_name(&requested_name);
        let udp_ticket = loop {
            let ticket: u32 = rand::random();
            if ticket != 0 && !state.udp_tickets.contains_key(&ticket) {
                break ticket;
            }
        };
        state.udp_tickets.insert(udp_ticket, client_id);
        state.clients.insert(
            client_id,
            ClientEntry {
                name: client_name.clone(),
                sender,
                swap_on_read: swap,
                negotiated: negotiated.clone(),
                udp_ticket,
                udp_address: None,
            },
        );
        (client_id, client_name, udp_ticket, state.server_name.clone())
    };

    let reply = ConnectReply {
        server_name,
        client_id,
        client_name: client_name.clone(),
        udp_ticket,
        protocols: replies,
    };
    if let Err(e) = writer.send(reply.encode()).await {
        // The client is registered already; unwind it before bailing.
        disconnect(handle, client_id);
        return Err(e);
    }

    // Hand the write half to its drain task; everything else goes through
    // the outbound channel from here on.
    tokio::spawn(run_writer(writer, receiver, client_id));

    announce_client(handle, client_id, &client_name, &negotiated);
    for &index in &negotiated {
        handle.plugins[index as usize].client_connected(handle, client_id);
    }

    info!(client = client_id, name = %client_name, %peer, swap, "client joined");
    Ok(Some(client_id))
}

/// Drains one client's outbound channel into its socket send queue,
/// batching whatever is already waiting into one vectored write.
async fn run_writer(
    mut writer: ReliableWriter,
    mut receiver: mpsc::UnboundedReceiver<MessageBuffer>,
    client_id: ClientId,
) {
    while let Some(message) = receiver.recv().await {
        writer.queue_message(message);
        while let Ok(more) = receiver.try_recv() {
            writer.queue_message(more);
        }
        if let Err(e) = writer.flush().await {
            debug!(client = client_id, error = %e, "write side closed");
            return;
        }
    }
}

/// Crosses connect notifications between the new client and every
/// existing client sharing at least one plug-in with it.
fn announce_client(handle: &ServerHandle, client_id: ClientId, name: &str, negotiated: &[u16]) {
    let notification = ClientConnectNotification {
        client_id,
        client_name: name.to_string(),
        protocol_indices: negotiated.to_vec(),
    }
    .encode();

    let state = handle.lock();
    for (&other_id, other) in &state.clients {
        if other_id == client_id {
            continue;
        }
        if !other.negotiated.iter().any(|i| negotiated.contains(i)) {
            continue;
        }
        let _ = other.sender.send(notification.clone());
        let reverse = ClientConnectNotification {
            client_id: other_id,
            client_name: other.name.clone(),
            protocol_indices: other.negotiated.clone(),
        }
        .encode();
        if let Some(new_entry) = state.clients.get(&client_id) {
            let _ = new_entry.sender.send(reverse);
        }
    }
}

/// Dispatches messages from one client until it disconnects or errs.
async fn message_loop(
    handle: &ServerHandle,
    client_id: ClientId,
    reader: &mut ReliableReader,
) -> Result<()> {
    loop {
        let Some(id) = reader.read_message_id().await? else {
            return Ok(());
        };

        match ClientMessage::from_id(id) {
            Some(ClientMessage::DisconnectRequest) => return Ok(()),
            Some(ClientMessage::PingRequest) => {
                let ping = Ping {
                    sequence: reader.read_i16().await?,
                    seconds: reader.read_i64().await?,
                    nanoseconds: reader.read_i64().await?,
                };
                handle.send_to(client_id, ping.encode(ServerMessage::PingReply.id()));
            }
            Some(ClientMessage::NameChangeRequest) => {
                let raw = reader.read_vec(NAME_LENGTH).await?;
                let name = protocol::read_name_field(&mut MessageReader::new(&raw, false))?;
                handle_name_change(handle, client_id, name);
            }
            Some(ClientMessage::UdpConnectRequest) => {
                bail!("UDP connect request on the reliable channel");
            }
            None => {
                let mut dispatched = false;
                for (index, plugin) in handle.plugins.iter().enumerate() {
                    let bases = plugin.message_bases();
                    if let Some(offset) = bases.client_offset(id, plugin.num_client_messages()) {
                        if !handle.client_negotiated(client_id, index as u16) {
                            bail!(
                                "message {id} for plug-in {} the client did not negotiate",
                                plugin.name()
                            );
                        }
                        plugin
                            .handle_message(handle, client_id, offset, reader)
                            .await?;
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

fn handle_name_change(handle: &ServerHandle, client_id: ClientId, name: String) {
    let mut state = handle.lock();
    let Some(entry) = state.clients.get(&client_id) else {
        return;
    };
    if name.is_empty() || state.name_in_use(&name, Some(client_id)) {
        let reply = NameChangeReply {
            granted: false,
            name: entry.name.clone(),
        };
        let _ = entry.sender.send(reply.encode());
        return;
    }

    let reply = NameChangeReply {
        granted: true,
        name: name.clone(),
    };
    let _ = entry.sender.send(reply.encode());

    let notification = NameChangeNotification {
        client_id,
        name: name.clone(),
    }
    .encode();
    for (&other_id, other) in &state.clients {
        if other_id != client_id {
            let _ = other.sender.send(notification.clone());
        }
    }
    state.clients.get_mut(&client_id).expect("checked above").name = name;
}

/// Tears down a client: plug-in hooks, ticket invalidation, and disconnect
/// notifications to peers that shared a plug-in with it.
fn disconnect(handle: &ServerHandle, client_id: ClientId) {
    let entry = {
        let mut state = handle.lock();
        let Some(entry) = state.clients.remove(&client_id) else {
            return;
        };
        state.udp_tickets.remove(&entry.udp_ticket);
        if let Some(addr) = entry.udp_address {
            state.udp_clients.remove(&addr);
        }
        entry
    };

    for &index in &entry.negotiated {
        handle.plugins[index as usize].client_disconnected(handle, client_id);
    }

    let notification = ClientDisconnectNotification { client_id }.encode();
    let state = handle.lock();
    for other in state.clients.values() {
        if other.negotiated.iter().any(|i| entry.negotiated.contains(i)) {
            let _ = other.sender.send(notification.clone());
        }
    }
    info!(client = client_id, name = %entry.name, "client left");
}

/// Receives and dispatches datagrams for the server's lifetime.
async fn run_udp(handle: ServerHandle, reader: UnreliableReader) {
    loop {
        match reader.recv().await {
            Ok((from, datagram)) => {
                if let Err(e) = handle_datagram(&handle, from, datagram) {
                    // Datagrams are lossy by contract; drop and move on.
                    debug!(%from, error = %e, "discarding datagram");
                }
            }
            Err(e) => {
                warn!(error = %e, "datagram receive failed");
                return;
            }
        }
    }
}

fn handle_datagram(handle: &ServerHandle, from: SocketAddr, datagram: MessageBuffer) -> Result<()> {
    let bytes = datagram.as_slice();
    if bytes.len() < 2 {
        bail!("datagram shorter than a message ID");
    }
    let id_native = u16::from_ne_bytes([bytes[0], bytes[1]]);

    // The connect request's nonzero ID doubles as the channel's endianness
    // probe: match it in either byte order.
    let connect_id = ClientMessage::UdpConnectRequest.id();
    if id_native == connect_id || id_native == connect_id.swap_bytes() {
        let swap = id_native != connect_id;
        let mut reader = MessageReader::new(&bytes[2..], swap);
        let request = UdpConnectRequest::decode(&mut reader)?;

        let granted = {
            let mut state = handle.lock();
            let valid = state.udp_tickets.get(&request.ticket) == Some(&request.client_id)
                && state
                    .clients
                    .get(&request.client_id)
                    .is_some_and(|e| e.udp_ticket == request.ticket);
            if valid {
                if let Some(entry) = state.clients.get_mut(&request.client_id) {
                    entry.udp_address = Some(from);
                }
                state.udp_clients.insert(from, request.client_id);
            }
            valid
        };
        if !granted {
            bail!("invalid UDP ticket from {from}");
        }
        let reply = UdpConnectReply {
            ticket: request.ticket,
        };
        let _ = handle.udp_tx.send((from, reply.encode()));
        info!(client = request.client_id, %from, "UDP channel bound");
        return Ok(());
    }

    let Some(client) = handle.lock().udp_clients.get(&from).copied() else {
        bail!("datagram from unbound address");
    };
    let swap = handle.client_swap(client);
    let id = if swap {
        id_native.swap_bytes()
    } else {
        id_native
    };

    for (index, plugin) in handle.plugins.iter().enumerate() {
        let bases = plugin.message_bases();
        if let Some(offset) = bases.client_offset(id, plugin.num_client_messages()) {
            if !handle.client_negotiated(client, index as u16) {
                bail!("datagram for plug-in the client did not negotiate");
            }
            return plugin.handle_datagram(handle, client, offset, datagram, swap);
        }
    }
    bail!("unknown datagram message ID {id}");
}
