//! Server halves of the bundled plug-in protocols.
//!
//! A plug-in is negotiated per client at handshake time; its handlers are
//! only ever invoked for clients that negotiated it. Handlers read their
//! message payloads directly off the client's socket (awaiting more bytes
//! as needed) and must not block the runtime; a handler error tears down
//! that client's connection through the normal disconnect path.

pub mod agora;
pub mod chat;
pub mod koinonia;

use anyhow::{bail, Result};
use async_trait::async_trait;

use collab_shared::buffer::MessageBuffer;
use collab_shared::plugin::MessageBases;
use collab_shared::protocol::{ClientId, MessageId};
use collab_shared::socket::ReliableReader;

use crate::server::ServerHandle;

/// Contract implemented by every server-side plug-in protocol.
#[async_trait]
pub trait PluginServer: Send + Sync {
    fn name(&self) -> &'static str;
    fn version(&self) -> u32;
    fn num_client_messages(&self) -> MessageId;
    fn num_server_messages(&self) -> MessageId;

    /// Called exactly once, when the server assigns this plug-in its
    /// message ID ranges.
    fn set_message_bases(&self, bases: MessageBases);
    fn message_bases(&self) -> MessageBases;

    /// A client that negotiated this plug-in finished its handshake.
    fn client_connected(&self, handle: &ServerHandle, client: ClientId);

    /// A client that negotiated this plug-in disconnected.
    fn client_disconnected(&self, handle: &ServerHandle, client: ClientId);

    /// Handles one TCP message; `offset` is relative to the client base.
    async fn handle_message(
        &self,
        handle: &ServerHandle,
        client: ClientId,
        offset: MessageId,
        reader: &mut ReliableReader,
    ) -> Result<()>;

    /// Handles one complete datagram; `offset` is relative to the client
    /// base and `swap` is the sending client's byte-order flag.
    fn handle_datagram(
        &self,
        _handle: &ServerHandle,
        _client: ClientId,
        offset: MessageId,
        _datagram: MessageBuffer,
        _swap: bool,
    ) -> Result<()> {
        bail!("unexpected datagram {offset} for plug-in {}", self.name());
    }
}
