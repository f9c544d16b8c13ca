//! Server half of the real-time audio forwarding plug-in.
//!
//! Audio packets are forwarded without inspection of their payload:
//! arriving datagrams get their header rewritten in place and go back out
//! UDP-preferred, falling back to the reliable channel for recipients
//! whose UDP handshake never completed. Stream announcements travel over
//! TCP.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;

use collab_shared::agora::{
    self, AudioPacket, ConnectNotification, AGORA_PROTOCOL_NAME, AGORA_PROTOCOL_VERSION,
    AUDIO_PACKET_REQUEST, CONNECT_REQUEST, NUM_CLIENT_MESSAGES, NUM_SERVER_MESSAGES,
};
use collab_shared::buffer::{MessageBuffer, MessageReader};
use collab_shared::plugin::MessageBases;
use collab_shared::protocol::{ClientId, MessageId};
use collab_shared::socket::ReliableReader;

use crate::plugins::PluginServer;
use crate::server::ServerHandle;

/// Announced stream parameters of one client.
#[derive(Debug, Clone, Copy)]
struct StreamParams {
    sample_rate: u32,
    packet_frames: u32,
}

pub struct AgoraServer {
    plugin_index: u16,
    bases: Mutex<MessageBases>,
    streams: Mutex<HashMap<ClientId, StreamParams>>,
}

impl AgoraServer {
    pub fn new(plugin_index: u16) -> Self {
        AgoraServer {
            plugin_index,
            bases: Mutex::new(MessageBases { client: 0, server: 0 }),
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Routes a rewritten audio reply to its destination(s), preferring
    /// the datagram channel.
    fn route(
        &self,
        handle: &ServerHandle,
        source: ClientId,
        destination: ClientId,
        reply: MessageBuffer,
    ) {
        if destination == 0 {
            for peer in handle.clients_with_plugin(self.plugin_index) {
                if peer != source {
                    handle.send_udp_preferred(peer, reply.clone());
                }
            }
        } else if handle
            .clients_with_plugin(self.plugin_index)
            .contains(&destination)
        {
            handle.send_udp_preferred(destination, reply);
        }
    }
}

#[async_trait]
impl PluginServer for AgoraServer {
    fn name(&self) -> &'static str {
        AGORA_PROTOCOL_NAME
    }

    fn version(&self) -> u32 {
        AGORA_PROTOCOL_VERSION
    }

    fn num_client_messages(&self) -> MessageId {
        NUM_CLIENT_MESSAGES
    }

    fn num_server_messages(&self) -> MessageId {
        NUM_SERVER_MESSAGES
    }

    fn set_message_bases(&self, bases: MessageBases) {
        *self.bases.lock().expect("bases lock") = bases;
    }

    fn message_bases(&self) -> MessageBases {
        *self.bases.lock().expect("bases lock")
    }

    fn client_connected(&self, _handle: &ServerHandle, _client: ClientId) {}

    fn client_disconnected(&self, _handle: &ServerHandle, client: ClientId) {
        self.streams.lock().expect("streams lock").remove(&client);
    }

    async fn handle_message(
        &self,
        handle: &ServerHandle,
        client: ClientId,
        offset: MessageId,
        reader: &mut ReliableReader,
    ) -> Result<()> {
        match offset {
            CONNECT_REQUEST => {
                let params = StreamParams {
                    sample_rate: reader.read_u32().await?,
                    packet_frames: reader.read_u32().await?,
                };
                let server_base = self.message_bases().server;

                // Announce the new stream to the other participants, and
                // the existing streams to the new one.
                let announcement = ConnectNotification {
                    client_id: client,
                    sample_rate: params.sample_rate,
                    packet_frames: params.packet_frames,
                }
                .encode(server_base);
                handle.broadcast_plugin(self.plugin_index, client, announcement);

                let existing: Vec<(ClientId, StreamParams)> = {
                    let streams = self.streams.lock().expect("streams lock");
                    streams.iter().map(|(&id, &p)| (id, p)).collect()
                };
                for (peer, peer_params) in existing {
                    let notification = ConnectNotification {
                        client_id: peer,
                        sample_rate: peer_params.sample_rate,
                        packet_frames: peer_params.packet_frames,
                    }
                    .encode(server_base);
                    handle.send_to(client, notification);
                }

                self.streams
                    .lock()
                    .expect("streams lock")
                    .insert(client, params);
                Ok(())
            }
            AUDIO_PACKET_REQUEST => {
                // TCP fallback path of a sender without a UDP channel.
                let destination = reader.read_u16().await?;
                let sequence = reader.read_i16().await?;
                let len = reader.read_u16().await? as usize;
                let data = reader.read_vec(len).await?;

                let reply = AudioPacket {
                    client_id: client,
                    sequence,
                    data,
                }
                .encode(self.message_bases().server + agora::AUDIO_PACKET_REPLY);
                self.route(handle, client, destination, reply);
                Ok(())
            }
            other => bail!("unexpected audio message {other}"),
        }
    }

    fn handle_datagram(
        &self,
        handle: &ServerHandle,
        client: ClientId,
        offset: MessageId,
        datagram: MessageBuffer,
        swap: bool,
    ) -> Result<()> {
        if offset != AUDIO_PACKET_REQUEST {
            bail!("unexpected audio datagram {offset}");
        }

        // Peek the destination, then rewrite the header in place and
        // forward the same buffer.
        let mut reader = MessageReader::new(datagram.as_slice(), swap);
        reader.skip(2)?;
        let (destination, _, _) = AudioPacket::decode_header(&mut reader)?;

        let reply = agora::forwarded_reply(datagram, self.message_bases().server, client, swap)?;
        self.route(handle, client, destination, reply);
        Ok(())
    }
}
