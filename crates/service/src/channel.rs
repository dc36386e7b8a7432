//! A single UDP socket owned by a [`crate::session::Session`].
//!
//! A `Channel` is either `Connected` (bound to exactly one board address,
//! sent to via `MESSAGE`) or `Unconnected` (no bound peer, sent to via
//! `MESSAGE_TO`, received datagrams filtered against the authorization
//! table by the caller). The channel itself only tracks its mode and
//! open/closed state; the receive loop and map bookkeeping live in
//! `session.rs`, since both need the session's authorization table and
//! WebSocket sender.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::net::UdpSocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Connected,
    Unconnected,
}

pub struct Channel {
    id: u32,
    socket: UdpSocket,
    mode: ChannelMode,
    open: AtomicBool,
    received: AtomicU64,
    sent: AtomicU64,
}

impl Channel {
    pub(crate) fn new(id: u32, socket: UdpSocket, mode: ChannelMode) -> Arc<Self> {
        Arc::new(Self {
            id,
            socket,
            mode,
            open: AtomicBool::new(true),
            received: AtomicU64::new(0),
            sent: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Marks the channel closed. The receive task notices this no later
    /// than its next receive-timeout tick and exits; the socket is
    /// released when the last `Arc<Channel>` referencing it drops.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub(crate) async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    /// Sends on a `Connected` channel's bound peer.
    pub async fn send(&self, payload: &[u8]) -> std::io::Result<()> {
        self.socket.send(payload).await?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Sends on an `Unconnected` channel to an explicit destination.
    pub async fn send_to(&self, payload: &[u8], remote: SocketAddr) -> std::io::Result<()> {
        self.socket.send_to(payload, remote).await?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn note_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}
