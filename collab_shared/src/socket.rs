//! Non-blocking reliable and unreliable transport.
//!
//! [`ReliableConn`] wraps a TCP stream (Nagle disabled) in two halves:
//! - a read half with a fixed-capacity ring receive buffer refilled by
//!   readiness-driven `try_read`, offering typed reads that honor the
//!   connection's `swap_on_read` flag, and
//! - a write half holding a send queue of [`MessageBuffer`] references with
//!   a partial-send offset on the head entry, drained by vectored writes.
//!
//! [`UnreliableConn`] wraps a UDP socket with a per-datagram send queue of
//! `(peer, MessageBuffer)` pairs. The datagram channel is lossy by design;
//! reliability is layered above where needed.
//!
//! Transient `WouldBlock` results are logged and retried on the next
//! readiness event; all other I/O errors are fatal to the connection.

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::warn;

use crate::buffer::MessageBuffer;
use crate::protocol::MessageId;

/// Default capacity of the ring receive buffer.
pub const DEFAULT_RING_CAPACITY: usize = 8192;

/// Largest datagram the unreliable channel will carry.
pub const MAX_DATAGRAM_SIZE: usize = 65536;

/// Fixed-capacity byte ring with wrap-around.
struct RingBuffer {
    storage: Box<[u8]>,
    read_pos: usize,
    unread: usize,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        RingBuffer {
            storage: vec![0; capacity].into_boxed_slice(),
            read_pos: 0,
            unread: 0,
        }
    }

    fn unread(&self) -> usize {
        self.unread
    }

    fn free(&self) -> usize {
        self.storage.len() - self.unread
    }

    /// The next contiguous writable region, wrapping at the buffer end.
    fn spare_mut(&mut self) -> &mut [u8] {
        let write_pos = (self.read_pos + self.unread) % self.storage.len();
        let end = if write_pos >= self.read_pos || self.unread == 0 {
            self.storage.len()
        } else {
            self.read_pos
        };
        let end = end.min(write_pos + self.free());
        &mut self.storage[write_pos..end]
    }

    fn commit(&mut self, n: usize) {
        self.unread += n;
    }

    /// Copies out `dst.len()` bytes, wrapping at most once.
    fn pop(&mut self, dst: &mut [u8]) {
        debug_assert!(dst.len() <= self.unread);
        let first = dst.len().min(self.storage.len() - self.read_pos);
        dst[..first].copy_from_slice(&self.storage[self.read_pos..self.read_pos + first]);
        let rest = dst.len() - first;
        if rest > 0 {
            dst[first..].copy_from_slice(&self.storage[..rest]);
        }
        self.read_pos = (self.read_pos + dst.len()) % self.storage.len();
        self.unread -= dst.len();
    }
}

/// Read half of a reliable connection.
pub struct ReliableReader {
    half: OwnedReadHalf,
    ring: RingBuffer,
    swap_on_read: bool,
    peer_closed: bool,
}

macro_rules! conn_read_int {
    ($name:ident, $ty:ty) => {
        pub async fn $name(&mut self) -> Result<$ty> {
            let mut raw = [0u8; std::mem::size_of::<$ty>()];
            self.read_raw(&mut raw).await?;
            let v = <$ty>::from_ne_bytes(raw);
            Ok(if self.swap_on_read { v.swap_bytes() } else { v })
        }
    };
}

impl ReliableReader {
    /// True once the peer closed its write side.
    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    pub fn swap_on_read(&self) -> bool {
        self.swap_on_read
    }

    /// Sets the endianness-swap flag after handshake detection.
    pub fn set_swap_on_read(&mut self, swap: bool) {
        self.swap_on_read = swap;
    }

    /// Bytes that can be consumed without touching the socket.
    pub fn unread(&self) -> usize {
        self.ring.unread()
    }

    /// Waits until at least `needed` unread bytes are buffered.
    ///
    /// Returns `false` on a clean peer close with no buffered bytes and no
    /// byte shortfall mid-message treated as acceptable only when nothing
    /// was needed yet; a close that truncates a message is an error.
    async fn fill(&mut self, needed: usize) -> Result<bool> {
        while self.ring.unread() < needed {
            if self.peer_closed {
                if self.ring.unread() == 0 {
                    return Ok(false);
                }
                bail!("peer closed the connection mid-message");
            }
            if self.ring.free() == 0 {
                bail!("receive ring full while waiting for {needed} bytes");
            }
            self.half
                .readable()
                .await
                .context("waiting for socket readability")?;
            match self.half.try_read(self.ring.spare_mut()) {
                Ok(0) => self.peer_closed = true,
                Ok(n) => self.ring.commit(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    warn!("spurious readiness on reliable socket");
                }
                Err(e) => return Err(e).context("reading from reliable socket"),
            }
        }
        Ok(true)
    }

    /// Reads the next message ID; `None` on a clean close between messages.
    pub async fn read_message_id(&mut self) -> Result<Option<MessageId>> {
        if !self.fill(2).await? {
            return Ok(None);
        }
        self.read_u16().await.map(Some)
    }

    /// Reads exactly `dst.len()` bytes, draining the ring as it refills so
    /// the destination may be larger than the ring itself.
    pub async fn read_raw(&mut self, dst: &mut [u8]) -> Result<()> {
        let mut offset = 0;
        while offset < dst.len() {
            if self.ring.unread() == 0 && !self.fill(1).await? {
                bail!("peer closed the connection mid-message");
            }
            let n = self.ring.unread().min(dst.len() - offset);
            self.ring.pop(&mut dst[offset..offset + n]);
            offset += n;
        }
        Ok(())
    }

    /// Reads exactly `n` bytes into a fresh vector.
    pub async fn read_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; n];
        self.read_raw(&mut out).await?;
        Ok(out)
    }

    pub async fn read_u8(&mut self) -> Result<u8> {
        let mut raw = [0u8; 1];
        self.read_raw(&mut raw).await?;
        Ok(raw[0])
    }

    pub async fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8().await? as i8)
    }

    pub async fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8().await? != 0)
    }

    conn_read_int!(read_u16, u16);
    conn_read_int!(read_i16, i16);
    conn_read_int!(read_u32, u32);
    conn_read_int!(read_i32, i32);
    conn_read_int!(read_u64, u64);
    conn_read_int!(read_i64, i64);

    pub async fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32().await?))
    }

    pub async fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64().await?))
    }

    /// Reads a variable-length 32-bit unsigned integer.
    pub async fn read_varint(&mut self) -> Result<u32> {
        let first = self.read_u8().await?;
        let remaining = first.leading_ones() as usize;
        if remaining > 4 {
            bail!("malformed VarInt prefix {first:#04x}");
        }
        let payload_bits = u32::from(first) & (0xff >> remaining);
        let mut value = if remaining < 4 {
            payload_bits << (8 * remaining)
        } else {
            0
        };
        for i in 0..remaining {
            value |= u32::from(self.read_u8().await?) << (8 * i);
        }
        Ok(value)
    }
}

/// Write half of a reliable connection.
pub struct ReliableWriter {
    half: OwnedWriteHalf,
    queue: VecDeque<MessageBuffer>,
    /// Bytes of the head entry already on the wire.
    sent: usize,
    queued_bytes: usize,
}

impl ReliableWriter {
    /// Appends a message to the send queue.
    pub fn queue_message(&mut self, message: MessageBuffer) {
        self.queued_bytes += message.len();
        self.queue.push_back(message);
    }

    /// Total bytes not yet on the wire.
    pub fn unsent(&self) -> usize {
        self.queued_bytes - self.sent
    }

    /// Drains the send queue with vectored writes.
    pub async fn flush(&mut self) -> Result<()> {
        while !self.queue.is_empty() {
            self.half
                .writable()
                .await
                .context("waiting for socket writability")?;

            let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(self.queue.len());
            let head = &self.queue[0];
            slices.push(IoSlice::new(&head.as_slice()[self.sent..]));
            for message in self.queue.iter().skip(1) {
                slices.push(IoSlice::new(message.as_slice()));
            }

            let mut written = match self.half.try_write_vectored(&slices) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    warn!("spurious writability on reliable socket");
                    continue;
                }
                Err(e) => return Err(e).context("writing to reliable socket"),
            };

            // Release entries the write drained completely.
            while written > 0 {
                let head_remaining = self.queue[0].len() - self.sent;
                if written >= head_remaining {
                    written -= head_remaining;
                    let done = self.queue.pop_front().expect("nonempty queue");
                    self.queued_bytes -= done.len();
                    self.sent = 0;
                } else {
                    self.sent += written;
                    written = 0;
                }
            }
        }
        Ok(())
    }

    /// Queues a message and drains the queue.
    pub async fn send(&mut self, message: MessageBuffer) -> Result<()> {
        self.queue_message(message);
        self.flush().await
    }
}

/// Reliable connection over TCP.
pub struct ReliableConn {
    reader: ReliableReader,
    writer: ReliableWriter,
    peer: SocketAddr,
}

impl ReliableConn {
    /// Wraps an accepted or connected stream; disables Nagle's algorithm.
    pub fn new(stream: TcpStream) -> Result<Self> {
        Self::with_ring_capacity(stream, DEFAULT_RING_CAPACITY)
    }

    /// Like [`Self::new`] with an explicit receive ring capacity.
    pub fn with_ring_capacity(stream: TcpStream, capacity: usize) -> Result<Self> {
        stream.set_nodelay(true).context("disabling Nagle")?;
        let peer = stream.peer_addr().context("querying peer address")?;
        let (read_half, write_half) = stream.into_split();
        Ok(ReliableConn {
            reader: ReliableReader {
                half: read_half,
                ring: RingBuffer::new(capacity),
                swap_on_read: false,
                peer_closed: false,
            },
            writer: ReliableWriter {
                half: write_half,
                queue: VecDeque::new(),
                sent: 0,
                queued_bytes: 0,
            },
            peer,
        })
    }

    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to {addr}"))?;
        Self::new(stream)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn reader(&mut self) -> &mut ReliableReader {
        &mut self.reader
    }

    pub fn writer(&mut self) -> &mut ReliableWriter {
        &mut self.writer
    }

    /// Splits into independently owned halves for reader/writer tasks.
    pub fn into_split(self) -> (ReliableReader, ReliableWriter) {
        (self.reader, self.writer)
    }
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding TCP listener to {addr}"))?;
        Ok(ReliableListener { listener })
    }

    pub async fn accept(&self) -> Result<(ReliableConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("accepting client")?;
        Ok((ReliableConn::new(stream)?, addr))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Receive half of an unreliable channel.
pub struct UnreliableReader {
    socket: std::sync::Arc<UdpSocket>,
}

impl UnreliableReader {
    /// Receives one datagram into a buffer of exactly its size.
    pub async fn recv(&self) -> Result<(SocketAddr, MessageBuffer)> {
        let mut scratch = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            self.socket
                .readable()
                .await
                .context("waiting for datagram readability")?;
            match self.socket.try_recv_from(&mut scratch) {
                Ok((n, from)) => {
                    let bytes = bytes::Bytes::copy_from_slice(&scratch[..n]);
                    return Ok((from, MessageBuffer::from_bytes(bytes)));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    warn!("spurious readiness on datagram socket");
                }
                Err(e) => return Err(e).context("receiving datagram"),
            }
        }
    }
}

/// Send half of an unreliable channel, with a per-datagram queue.
pub struct UnreliableWriter {
    socket: std::sync::Arc<UdpSocket>,
    queue: VecDeque<(SocketAddr, MessageBuffer)>,
}

impl UnreliableWriter {
    /// Appends a datagram to the send queue.
    pub fn queue_message(&mut self, peer: SocketAddr, message: MessageBuffer) {
        self.queue.push_back((peer, message));
    }

    /// Drains the send queue, one datagram per send.
    pub async fn flush(&mut self) -> Result<()> {
        while let Some((peer, message)) = self.queue.front() {
            self.socket
                .writable()
                .await
                .context("waiting for datagram writability")?;
            match self.socket.try_send_to(message.as_slice(), *peer) {
                Ok(_) => {
                    self.queue.pop_front();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    warn!("spurious writability on datagram socket");
                }
                Err(e) => return Err(e).context("sending datagram"),
            }
        }
        Ok(())
    }

    /// Queues one datagram and drains the queue.
    pub async fn send(&mut self, peer: SocketAddr, message: MessageBuffer) -> Result<()> {
        self.queue_message(peer, message);
        self.flush().await
    }
}

/// Unreliable channel over UDP with a per-datagram send queue.
pub struct UnreliableConn {
    reader: UnreliableReader,
    writer: UnreliableWriter,
}

impl UnreliableConn {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("binding UDP socket to {addr}"))?;
        let socket = std::sync::Arc::new(socket);
        Ok(UnreliableConn {
            reader: UnreliableReader {
                socket: socket.clone(),
            },
            writer: UnreliableWriter {
                socket,
                queue: VecDeque::new(),
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.reader.socket.local_addr()?)
    }

    /// Receives one datagram into a buffer of exactly its size.
    pub async fn recv(&self) -> Result<(SocketAddr, MessageBuffer)> {
        self.reader.recv().await
    }

    /// Queues one datagram and drains the queue.
    pub async fn send(&mut self, peer: SocketAddr, message: MessageBuffer) -> Result<()> {
        self.writer.send(peer, message).await
    }

    /// Splits into independently owned halves for reader/writer tasks.
    pub fn into_split(self) -> (UnreliableReader, UnreliableWriter) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MessageWriter;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::AsyncWriteExt;

    fn localhost() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind(localhost()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn queued_messages_arrive_in_order() {
        let (client, server) = tcp_pair().await;
        let mut conn = ReliableConn::new(client).unwrap();
        let mut peer = ReliableConn::new(server).unwrap();

        for i in 0..10u32 {
            let mut writer = MessageWriter::new(99, 4);
            writer.write_u32(i);
            conn.writer().queue_message(writer.finish());
        }
        conn.writer().flush().await.unwrap();

        for i in 0..10u32 {
            assert_eq!(peer.reader().read_message_id().await.unwrap(), Some(99));
            assert_eq!(peer.reader().read_u32().await.unwrap(), i);
        }
    }

    #[tokio::test]
    async fn ring_wraps_mid_message() {
        let (client, server) = tcp_pair().await;
        let mut sender = ReliableConn::new(client).unwrap();
        // A ring far smaller than the traffic forces wrap-around.
        let mut receiver = ReliableConn::with_ring_capacity(server, 16).unwrap();

        for i in 0..50u64 {
            let mut writer = MessageWriter::new(1, 8);
            writer.write_u64(i);
            sender.writer().queue_message(writer.finish());
        }
        let send = tokio::spawn(async move {
            sender.writer().flush().await.unwrap();
            sender
        });

        for i in 0..50u64 {
            assert_eq!(receiver.reader().read_message_id().await.unwrap(), Some(1));
            assert_eq!(receiver.reader().read_u64().await.unwrap(), i);
        }
        send.await.unwrap();
    }

    #[tokio::test]
    async fn one_byte_at_a_time_arrival() {
        let (client, server) = tcp_pair().await;
        let mut receiver = ReliableConn::new(server).unwrap();

        let mut writer = MessageWriter::new(7, 12);
        writer.write_u32(0xabcd_1234);
        writer.write_i64(-9);
        let message = writer.finish();
        let bytes = message.as_slice().to_vec();

        let feeder = tokio::spawn(async move {
            let mut client = client;
            for byte in bytes {
                client.write_all(&[byte]).await.unwrap();
                client.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
            client
        });

        assert_eq!(receiver.reader().read_message_id().await.unwrap(), Some(7));
        assert_eq!(receiver.reader().read_u32().await.unwrap(), 0xabcd_1234);
        assert_eq!(receiver.reader().read_i64().await.unwrap(), -9);
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn clean_close_between_messages() {
        let (client, server) = tcp_pair().await;
        let mut receiver = ReliableConn::new(server).unwrap();
        drop(client);
        assert_eq!(receiver.reader().read_message_id().await.unwrap(), None);
    }

    #[tokio::test]
    async fn close_mid_message_is_an_error() {
        let (mut client, server) = tcp_pair().await;
        let mut receiver = ReliableConn::new(server).unwrap();
        client.write_all(&[0x01]).await.unwrap();
        drop(client);
        assert!(receiver.reader().read_message_id().await.is_err());
    }

    #[tokio::test]
    async fn swapped_reads_reverse_bytes() {
        let (client, server) = tcp_pair().await;
        let mut sender = ReliableConn::new(client).unwrap();
        let mut receiver = ReliableConn::new(server).unwrap();
        receiver.reader().set_swap_on_read(true);

        let mut writer = MessageWriter::headerless(4);
        writer.write_u32(0x0102_0304);
        sender.writer().send(writer.finish()).await.unwrap();

        assert_eq!(receiver.reader().read_u32().await.unwrap(), 0x0403_0201);
    }

    #[tokio::test]
    async fn datagram_roundtrip() {
        let mut a = UnreliableConn::bind(localhost()).await.unwrap();
        let b = UnreliableConn::bind(localhost()).await.unwrap();
        let b_addr = b.local_addr().unwrap();

        let mut writer = MessageWriter::new(5, 6);
        writer.write_u16(17);
        writer.write_u32(0xfeed_f00d);
        a.send(b_addr, writer.finish()).await.unwrap();

        let (_, message) = b.recv().await.unwrap();
        assert_eq!(message.len(), 8);
        let mut reader = message.payload_reader(false);
        assert_eq!(reader.read_u16().unwrap(), 5);
        assert_eq!(reader.read_u16().unwrap(), 17);
        assert_eq!(reader.read_u32().unwrap(), 0xfeed_f00d);
    }
}
