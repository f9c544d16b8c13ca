//! Server half of the text chat plug-in.
//!
//! Forwards each chat line to its destination with the source stamped in:
//! destination zero broadcasts to every other chat participant, anything
//! else is a private message.

use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::debug;

use collab_shared::chat::{
    MessageReply, CHAT_PROTOCOL_NAME, CHAT_PROTOCOL_VERSION, MAX_MESSAGE_LENGTH, MESSAGE_REQUEST,
    NUM_CLIENT_MESSAGES, NUM_SERVER_MESSAGES,
};
use collab_shared::plugin::MessageBases;
use collab_shared::protocol::{ClientId, MessageId};
use collab_shared::socket::ReliableReader;

use crate::plugins::PluginServer;
use crate::server::ServerHandle;

pub struct ChatServer {
    plugin_index: u16,
    bases: Mutex<MessageBases>,
}

impl ChatServer {
    pub fn new(plugin_index: u16) -> Self {
        ChatServer {
            plugin_index,
            bases: Mutex::new(MessageBases { client: 0, server: 0 }),
        }
    }
}

#[async_trait]
impl PluginServer for ChatServer {
    fn name(&self) -> &'static str {
        CHAT_PROTOCOL_NAME
    }

    fn version(&self) -> u32 {
        CHAT_PROTOCOL_VERSION
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

    fn client_disconnected(&self, _handle: &ServerHandle, _client: ClientId) {}

    async fn handle_message(
        &self,
        handle: &ServerHandle,
        client: ClientId,
        offset: MessageId,
        reader: &mut ReliableReader,
    ) -> Result<()> {
        if offset != MESSAGE_REQUEST {
            bail!("unexpected chat message {offset}");
        }

        let destination = reader.read_u16().await?;
        let len = reader.read_u16().await? as usize;
        if len > MAX_MESSAGE_LENGTH {
            bail!("chat message of {len} bytes is too long");
        }
        let bytes = reader.read_vec(len).await?;
        let text = String::from_utf8_lossy(&bytes).into_owned();

        let reply = MessageReply {
            source: client,
            private: destination != 0,
            text,
        }
        .encode(self.message_bases().server)?;

        if destination == 0 {
            handle.broadcast_plugin(self.plugin_index, client, reply);
        } else if handle
            .clients_with_plugin(self.plugin_index)
            .contains(&destination)
        {
            handle.send_to(destination, reply);
        } else {
            // Lost race with a disconnect, or a stale destination; drop it.
            debug!(source = client, destination, "chat destination not available");
        }
        Ok(())
    }
}
