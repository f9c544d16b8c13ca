//! `collab_client`
//!
//! Client-side systems:
//! - Connection management (reliable + unreliable channels)
//! - Core handshake (endianness detection, password challenge, plug-in
//!   negotiation)
//! - Back-end message dispatch and the front-end forwarding channel
//! - Bundled plug-in clients (chat, audio forwarding, Koinonia)

pub mod client;
pub mod plugins;

pub use client::CollabClient;
