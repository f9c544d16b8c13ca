//! Client halves of the bundled plug-in protocols.
//!
//! Back-end handlers read server messages directly off the socket and may
//! forward work to the application's thread through the front-end channel:
//! the back end re-encodes anything it forwards into the host's byte
//! order, so front-end handlers never swap.

pub mod agora;
pub mod chat;
pub mod koinonia;

use anyhow::{bail, Result};
use async_trait::async_trait;

use collab_shared::buffer::MessageBuffer;
use collab_shared::plugin::MessageBases;
use collab_shared::protocol::{ClientId, MessageId};
use collab_shared::socket::ReliableReader;

use crate::client::ClientHandle;

/// Contract implemented by every client-side plug-in protocol.
#[async_trait]
pub trait PluginClient: Send + Sync {
    fn name(&self) -> &'static str;
    fn version(&self) -> u32;
    fn num_client_messages(&self) -> MessageId;
    fn num_server_messages(&self) -> MessageId;

    /// Called exactly once, when the handshake assigns this plug-in its
    /// message ID ranges.
    fn set_message_bases(&self, bases: MessageBases);

    /// `None` until the server accepted the plug-in.
    fn message_bases(&self) -> Option<MessageBases>;

    /// The client is fully joined; buffered work may flush now.
    fn start(&self, handle: &ClientHandle);

    /// A peer sharing this plug-in joined.
    fn client_connected(&self, _client: ClientId) {}

    /// A peer sharing this plug-in left.
    fn client_disconnected(&self, _client: ClientId) {}

    /// Handles one server TCP message; `offset` is relative to the server
    /// base.
    async fn handle_message(
        &self,
        handle: &ClientHandle,
        offset: MessageId,
        reader: &mut ReliableReader,
    ) -> Result<()>;

    /// Handles one complete server datagram.
    fn handle_datagram(
        &self,
        _handle: &ClientHandle,
        offset: MessageId,
        _datagram: MessageBuffer,
        _swap: bool,
    ) -> Result<()> {
        bail!("unexpected datagram {offset} for plug-in {}", self.name());
    }

    /// Handles one buffer the back end forwarded to the front end. The
    /// buffer is in host byte order.
    fn handle_frontend(
        &self,
        _handle: &ClientHandle,
        _offset: MessageId,
        _message: &MessageBuffer,
    ) -> Result<()> {
        Ok(())
    }
}
