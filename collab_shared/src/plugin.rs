//! Plug-in protocol abstraction, shared parts.
//!
//! A plug-in protocol is a named, versioned feature layer negotiated at
//! handshake time. The server assigns each negotiated plug-in a contiguous
//! range of client-message IDs and a contiguous range of server-message
//! IDs; together with the core ranges these partition the message ID space
//! for the lifetime of the connection.
//!
//! Protocol versions put the major in the high 16 bits; two versions are
//! compatible when their majors match, and the server's version is the
//! negotiated one.

use crate::protocol::MessageId;

/// Message ID ranges assigned to one negotiated plug-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageBases {
    pub client: MessageId,
    pub server: MessageId,
}

impl MessageBases {
    /// Maps a global client-message ID into this plug-in's range.
    pub fn client_offset(&self, id: MessageId, count: MessageId) -> Option<MessageId> {
        (id >= self.client && id < self.client + count).then(|| id - self.client)
    }

    /// Maps a global server-message ID into this plug-in's range.
    pub fn server_offset(&self, id: MessageId, count: MessageId) -> Option<MessageId> {
        (id >= self.server && id < self.server + count).then(|| id - self.server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_range_checked() {
        let bases = MessageBases {
            client: 4,
            server: 8,
        };
        assert_eq!(bases.client_offset(4, 2), Some(0));
        assert_eq!(bases.client_offset(5, 2), Some(1));
        assert_eq!(bases.client_offset(6, 2), None);
        assert_eq!(bases.server_offset(8, 1), Some(0));
        assert_eq!(bases.server_offset(9, 1), None);
    }
}
