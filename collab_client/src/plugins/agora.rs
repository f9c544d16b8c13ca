//! Client half of the real-time audio forwarding plug-in.
//!
//! Outgoing packets carry a wrapping sequence number and prefer the
//! datagram channel. Incoming packets land in a per-source jitter buffer
//! guarded by a short critical section; an audio playback thread dequeues
//! them at its own cadence, absorbing reordering, duplication, and loss.
//! Capture and codecs live outside the core.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::debug;

use collab_shared::agora::{
    AudioPacket, ConnectNotification, ConnectRequest, AGORA_PROTOCOL_NAME, AGORA_PROTOCOL_VERSION,
    AUDIO_PACKET_REPLY, AUDIO_PACKET_REQUEST, CONNECT_NOTIFICATION, NUM_CLIENT_MESSAGES,
    NUM_SERVER_MESSAGES,
};
use collab_shared::buffer::{MessageBuffer, MessageReader};
use collab_shared::jitter::{JitterBuffer, Sequence};
use collab_shared::plugin::MessageBases;
use collab_shared::protocol::{ClientId, MessageId};
use collab_shared::socket::ReliableReader;

use crate::client::ClientHandle;
use crate::plugins::PluginClient;

/// Slots in each per-source jitter buffer.
const JITTER_SLOTS: usize = 16;

/// One peer's announced audio stream.
struct RemoteStream {
    sample_rate: u32,
    packet_frames: u32,
    jitter: JitterBuffer,
}

pub struct AgoraClient {
    bases: Mutex<Option<MessageBases>>,
    handle: Mutex<Option<ClientHandle>>,
    sample_rate: u32,
    packet_frames: u32,
    next_sequence: Mutex<Sequence>,
    streams: Mutex<HashMap<ClientId, RemoteStream>>,
}

impl AgoraClient {
    pub fn new(sample_rate: u32, packet_frames: u32) -> Self {
        AgoraClient {
            bases: Mutex::new(None),
            handle: Mutex::new(None),
            sample_rate,
            packet_frames,
            next_sequence: Mutex::new(0),
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Sends one encoded audio packet, UDP-preferred; destination 0
    /// reaches every other audio participant.
    pub fn send_audio(&self, destination: ClientId, data: Vec<u8>) -> Result<()> {
        let bases = self
            .bases
            .lock()
            .expect("bases lock")
            .context("audio plug-in was not negotiated")?;
        let handle = self.handle.lock().expect("handle lock");
        let handle = handle.as_ref().context("audio plug-in not started")?;

        let sequence = {
            let mut next = self.next_sequence.lock().expect("sequence lock");
            *next = next.wrapping_add(1);
            *next
        };
        let packet = AudioPacket {
            client_id: destination,
            sequence,
            data,
        }
        .encode(bases.client + AUDIO_PACKET_REQUEST);
        handle.send_udp_preferred(packet);
        Ok(())
    }

    /// Announced stream parameters of a peer, if it transmits audio.
    pub fn stream_params(&self, source: ClientId) -> Option<(u32, u32)> {
        self.streams
            .lock()
            .expect("streams lock")
            .get(&source)
            .map(|s| (s.sample_rate, s.packet_frames))
    }

    /// Dequeues the next due packet of a source's stream; `None` for a
    /// gap the network never filled.
    pub fn dequeue_audio(&self, source: ClientId) -> Option<AudioPacket> {
        let mut streams = self.streams.lock().expect("streams lock");
        let stream = streams.get_mut(&source)?;
        let buffer = stream.jitter.dequeue()?;
        let mut reader = MessageReader::new(buffer.as_slice(), false);
        reader.skip(2).ok()?;
        AudioPacket::decode(&mut reader).ok()
    }

    /// Parses a host-order audio packet wire image and slots it into the
    /// sender's jitter buffer.
    fn enqueue_packet(&self, packet: MessageBuffer) -> Result<()> {
        let mut reader = MessageReader::new(packet.as_slice(), false);
        reader.skip(2)?;
        let (source, sequence, _) = AudioPacket::decode_header(&mut reader)?;

        let mut streams = self.streams.lock().expect("streams lock");
        match streams.get_mut(&source) {
            Some(stream) => {
                stream.jitter.enqueue(sequence, packet);
                Ok(())
            }
            None => {
                // Packet raced ahead of its stream announcement.
                debug!(source, "audio packet from unannounced stream");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl PluginClient for AgoraClient {
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
        *self.bases.lock().expect("bases lock") = Some(bases);
    }

    fn message_bases(&self) -> Option<MessageBases> {
        *self.bases.lock().expect("bases lock")
    }

    fn start(&self, handle: &ClientHandle) {
        *self.handle.lock().expect("handle lock") = Some(handle.clone());
        if let Some(bases) = self.message_bases() {
            handle.send(
                ConnectRequest {
                    sample_rate: self.sample_rate,
                    packet_frames: self.packet_frames,
                }
                .encode(bases.client),
            );
        }
    }

    fn client_disconnected(&self, client: ClientId) {
        self.streams.lock().expect("streams lock").remove(&client);
    }

    async fn handle_message(
        &self,
        _handle: &ClientHandle,
        offset: MessageId,
        reader: &mut ReliableReader,
    ) -> Result<()> {
        match offset {
            CONNECT_NOTIFICATION => {
                let source = reader.read_u16().await?;
                let sample_rate = reader.read_u32().await?;
                let packet_frames = reader.read_u32().await?;
                self.streams.lock().expect("streams lock").insert(
                    source,
                    RemoteStream {
                        sample_rate,
                        packet_frames,
                        jitter: JitterBuffer::new(JITTER_SLOTS),
                    },
                );
                debug!(source, sample_rate, packet_frames, "audio stream announced");
                Ok(())
            }
            AUDIO_PACKET_REPLY => {
                // TCP fallback path: rebuild the wire image in host order
                // and enqueue it like a datagram.
                let source = reader.read_u16().await?;
                let sequence = reader.read_i16().await?;
                let len = reader.read_u16().await? as usize;
                let data = reader.read_vec(len).await?;
                let bases = self.message_bases().context("bases set at negotiation")?;
                let packet = AudioPacket {
                    client_id: source,
                    sequence,
                    data,
                }
                .encode(bases.server + AUDIO_PACKET_REPLY);
                self.enqueue_packet(packet)
            }
            other => bail!("unexpected audio message {other}"),
        }
    }

    fn handle_datagram(
        &self,
        _handle: &ClientHandle,
        offset: MessageId,
        datagram: MessageBuffer,
        swap: bool,
    ) -> Result<()> {
        if offset != AUDIO_PACKET_REPLY {
            bail!("unexpected audio datagram {offset}");
        }
        if !swap {
            return self.enqueue_packet(datagram);
        }
        // Foreign byte order: decode and re-encode before buffering.
        let mut reader = MessageReader::new(datagram.as_slice(), true);
        reader.skip(2)?;
        let packet = AudioPacket::decode(&mut reader)?;
        let bases = self.message_bases().context("bases set at negotiation")?;
        self.enqueue_packet(packet.encode(bases.server + AUDIO_PACKET_REPLY))
    }
}
