//! `collab_server`
//!
//! Server-side systems:
//! - Client acceptor and core handshake (endianness detection, password
//!   challenge, plug-in negotiation, message ID base assignment)
//! - Per-client reader/writer tasks and broadcast helpers
//! - UDP ticket table and datagram dispatch with TCP fallback
//! - Bundled plug-in servers (chat, audio forwarding, Koinonia)
//! - Operator console
//!
//! Networking model:
//! - TCP: handshake/control plane and everything needing ordered delivery
//! - UDP: lossy real-time plane (audio packets)

pub mod plugins;
pub mod server;

pub use server::CollabServer;
