//! Client half of the text chat plug-in.
//!
//! Incoming chat lines are re-encoded into host byte order on the back
//! end and handed to the application thread through the front-end
//! channel, where the message callback fires.

use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use collab_shared::buffer::MessageBuffer;
use collab_shared::chat::{
    MessageReply, MessageRequest, CHAT_PROTOCOL_NAME, CHAT_PROTOCOL_VERSION, MAX_MESSAGE_LENGTH,
    MESSAGE_REPLY, NUM_CLIENT_MESSAGES, NUM_SERVER_MESSAGES,
};
use collab_shared::plugin::MessageBases;
use collab_shared::protocol::{ClientId, MessageId};
use collab_shared::socket::ReliableReader;

use crate::client::ClientHandle;
use crate::plugins::PluginClient;

/// Called on the application thread for every delivered chat line:
/// `(source, private, text)`.
pub type ChatMessageCallback = Box<dyn Fn(ClientId, bool, &str) + Send + Sync>;

pub struct ChatClient {
    plugin_index: usize,
    bases: Mutex<Option<MessageBases>>,
    handle: Mutex<Option<ClientHandle>>,
    on_message: ChatMessageCallback,
}

impl ChatClient {
    pub fn new(plugin_index: usize, on_message: ChatMessageCallback) -> Self {
        ChatClient {
            plugin_index,
            bases: Mutex::new(None),
            handle: Mutex::new(None),
            on_message,
        }
    }

    /// Sends a chat line to one peer, or to everyone with destination 0.
    pub fn send(&self, destination: ClientId, text: &str) -> Result<()> {
        let bases = self
            .bases
            .lock()
            .expect("bases lock")
            .context("chat plug-in was not negotiated")?;
        let handle = self.handle.lock().expect("handle lock");
        let handle = handle.as_ref().context("chat plug-in not started")?;
        let request = MessageRequest {
            destination,
            text: text.to_string(),
        }
        .encode(bases.client)?;
        handle.send(request);
        Ok(())
    }
}

#[async_trait]
impl PluginClient for ChatClient {
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
        *self.bases.lock().expect("bases lock") = Some(bases);
    }

    fn message_bases(&self) -> Option<MessageBases> {
        *self.bases.lock().expect("bases lock")
    }

    fn start(&self, handle: &ClientHandle) {
        *self.handle.lock().expect("handle lock") = Some(handle.clone());
    }

    async fn handle_message(
        &self,
        handle: &ClientHandle,
        offset: MessageId,
        reader: &mut ReliableReader,
    ) -> Result<()> {
        if offset != MESSAGE_REPLY {
            bail!("unexpected chat message {offset}");
        }
        let source = reader.read_u16().await?;
        let private = reader.read_bool().await?;
        let len = reader.read_u16().await? as usize;
        if len > MAX_MESSAGE_LENGTH {
            bail!("chat message of {len} bytes is too long");
        }
        let bytes = reader.read_vec(len).await?;
        let text = String::from_utf8_lossy(&bytes).into_owned();

        // Re-encode in host order and let the front end deliver it.
        let bases = self.message_bases().context("bases set at negotiation")?;
        let reply = MessageReply {
            source,
            private,
            text,
        }
        .encode(bases.server)?;
        handle.forward_frontend(self.plugin_index, MESSAGE_REPLY, reply);
        Ok(())
    }

    fn handle_frontend(
        &self,
        _handle: &ClientHandle,
        offset: MessageId,
        message: &MessageBuffer,
    ) -> Result<()> {
        if offset != MESSAGE_REPLY {
            bail!("unexpected forwarded chat message {offset}");
        }
        let mut reader = message.payload_reader(false);
        let reply = MessageReply::decode(&mut reader)?;
        (self.on_message)(reply.source, reply.private, &reply.text);
        Ok(())
    }
}
