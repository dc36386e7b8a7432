//! The Session: owns one WebSocket's channel map, parses and dispatches
//! opcodes, and guarantees every channel it has opened gets closed when the
//! session ends.
//!
//! Dispatch follows the same shape as a STUN/TURN packet forwarder that
//! matches on method and calls one handler function per method, each
//! returning the reply (if any) to send: [`Session::handle_client_message`]
//! matches on opcode and calls one `Session::<verb>` method per opcode.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use ahash::AHashMap;
use bytes::BytesMut;
use codec::{ClientMessage, ServerMessage, message_header, truncate_error_message};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::auth::AuthorizationTable;
use crate::channel::{Channel, ChannelMode};
use crate::error::{CloseReason, ProtocolError};
use crate::sender::{BinarySink, WebSocketSender};

/// How long a channel's receive loop waits for a datagram before checking
/// whether it should exit. This is what makes `close()` prompt without any
/// cross-task cancellation signal.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case", default))]
pub struct SessionOptions {
    #[cfg_attr(feature = "serde", serde(with = "duration_secs"))]
    pub receive_timeout: Duration,
    /// Local IPv4 address new `Unconnected` sockets are bound to. `None`
    /// means this server does not support `OPEN_UNCONNECTED` at all.
    pub unconnected_bind_ip: Option<Ipv4Addr>,
    /// Purely diagnostic: log each channel's sent/received counters at
    /// close. Has no effect on wire behavior.
    pub log_channel_counts: bool,
}

#[cfg(feature = "serde")]
mod duration_secs {
    use std::time::Duration;

    use serde::Deserialize;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            unconnected_bind_ip: None,
            log_channel_counts: false,
        }
    }
}

pub struct Session<S: BinarySink> {
    auth: Arc<AuthorizationTable>,
    channels: Arc<Mutex<AHashMap<u32, Arc<Channel>>>>,
    next_channel_id: AtomicU32,
    sender: Arc<WebSocketSender<S>>,
    options: SessionOptions,
    fault: Arc<Fault>,
}

/// Latches a one-shot fault signal so it is never lost to a missed wakeup.
///
/// `Notify::notify_waiters` only wakes tasks that are *already* awaiting
/// `notified()`; a signal raised while nobody is awaiting (e.g. while
/// `handle_client_message` is busy running) would otherwise vanish. The
/// flag makes the signal sticky: `wait()` checks it before and after
/// registering interest in the notification, so a signal raised in either
/// window is still observed.
struct Fault {
    flag: AtomicBool,
    notify: Notify,
}

impl Fault {
    fn new() -> Self {
        Self { flag: AtomicBool::new(false), notify: Notify::new() }
    }

    fn signal(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.flag.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

impl<S: BinarySink> Session<S> {
    pub fn new(auth: AuthorizationTable, sender: WebSocketSender<S>, options: SessionOptions) -> Self {
        Self {
            auth: Arc::new(auth),
            channels: Arc::new(Mutex::new(AHashMap::with_capacity(16))),
            next_channel_id: AtomicU32::new(1),
            sender: Arc::new(sender),
            options,
            fault: Arc::new(Fault::new()),
        }
    }

    /// Resolves when a background receive task has hit an unrecoverable
    /// WebSocket send failure. The caller driving the inbound WebSocket
    /// loop should select on this alongside reading client frames and
    /// close the session with `SERVER_ERROR` when it fires. The signal is
    /// latched, so it is observed even if it was raised before this was
    /// first awaited.
    pub async fn faulted(&self) {
        self.fault.wait().await;
    }

    /// Channel IDs are monotonic and never reused within a session; `0` is
    /// reserved as the "nothing closed" sentinel in `CLOSE` replies, so the
    /// issuer skips it on wraparound.
    fn issue_channel_id(&self) -> u32 {
        loop {
            let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Parses and dispatches one inbound WebSocket frame. `Ok(())` means
    /// the session should keep running (a reply may already have been
    /// sent); `Err(reason)` means the caller must close the session with
    /// the given status.
    pub async fn handle_client_message(&self, bytes: &[u8]) -> Result<(), CloseReason> {
        let message = ClientMessage::decode(bytes).map_err(|_| CloseReason::BadData)?;

        match message {
            ClientMessage::Open { correlation_id, x, y, port } => {
                self.open_connected(correlation_id, x, y, port).await
            }
            ClientMessage::Close { correlation_id, channel_id } => {
                self.close_channel(correlation_id, channel_id).await
            }
            ClientMessage::Message { channel_id, payload } => {
                self.send_message(channel_id, payload).await
            }
            ClientMessage::OpenUnconnected { correlation_id } => {
                self.open_unconnected(correlation_id).await
            }
            ClientMessage::MessageTo { channel_id, x, y, port, payload } => {
                self.send_message_to(channel_id, x, y, port, payload).await
            }
        }
    }

    async fn open_connected(
        &self,
        correlation_id: u32,
        x: u32,
        y: u32,
        port: u32,
    ) -> Result<(), CloseReason> {
        match self.try_open_connected(x, y, port).await {
            Ok(channel) => {
                let id = channel.id();
                self.channels.lock().insert(id, channel.clone());
                self.spawn_receive_loop(channel, None);
                self.reply(ServerMessage::Open { correlation_id, channel_id: id }).await
            }
            Err(err) => self.reply_error(correlation_id, &err.message()).await,
        }
    }

    async fn try_open_connected(&self, x: u32, y: u32, port: u32) -> Result<Arc<Channel>, ProtocolError> {
        let remote_ip = self.auth.lookup(x, y).ok_or(ProtocolError::UnknownBoard { x, y })?;

        if port == 0 || port > 0xFFFF {
            return Err(ProtocolError::InvalidPort(port));
        }

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(ProtocolError::SocketOpenFailure)?;
        socket
            .connect(SocketAddrV4::new(remote_ip, port as u16))
            .await
            .map_err(ProtocolError::SocketOpenFailure)?;

        let id = self.issue_channel_id();
        Ok(Channel::new(id, socket, ChannelMode::Connected))
    }

    async fn open_unconnected(&self, correlation_id: u32) -> Result<(), CloseReason> {
        match self.try_open_unconnected().await {
            Ok((channel, local_addr, local_port)) => {
                let id = channel.id();
                self.channels.lock().insert(id, channel.clone());
                self.spawn_receive_loop(channel, Some(self.auth.clone()));
                self.reply(ServerMessage::OpenUnconnected {
                    correlation_id,
                    channel_id: id,
                    local_addr,
                    local_port: local_port as u32,
                })
                .await
            }
            Err(err) => self.reply_error(correlation_id, &err.message()).await,
        }
    }

    async fn try_open_unconnected(&self) -> Result<(Arc<Channel>, Ipv4Addr, u16), ProtocolError> {
        let bind_ip = self
            .options
            .unconnected_bind_ip
            .ok_or(ProtocolError::UnsupportedUnconnected)?;

        let socket = UdpSocket::bind((bind_ip, 0)).await.map_err(ProtocolError::SocketOpenFailure)?;
        let local_port = socket
            .local_addr()
            .map_err(ProtocolError::SocketOpenFailure)?
            .port();

        let id = self.issue_channel_id();
        Ok((Channel::new(id, socket, ChannelMode::Unconnected), bind_ip, local_port))
    }

    async fn close_channel(&self, correlation_id: u32, channel_id: u32) -> Result<(), CloseReason> {
        let removed = self.channels.lock().remove(&channel_id);

        let closed_id = match removed {
            Some(channel) => {
                channel.close();
                if self.options.log_channel_counts {
                    log::debug!(
                        "channel {} closed by client request (sent={}, received={})",
                        channel.id(),
                        channel.sent_count(),
                        channel.received_count(),
                    );
                }
                channel.id()
            }
            None => 0,
        };

        self.reply(ServerMessage::Close { correlation_id, channel_id: closed_id }).await
    }

    async fn send_message(&self, channel_id: u32, payload: &[u8]) -> Result<(), CloseReason> {
        let channel = self.channels.lock().get(&channel_id).cloned();
        let Some(channel) = channel else {
            return Ok(());
        };

        if !channel.is_open() || channel.mode() != ChannelMode::Connected {
            return Ok(());
        }

        if let Err(err) = channel.send(payload).await {
            log::error!("channel {channel_id} udp send failed: {err}");
        }

        Ok(())
    }

    async fn send_message_to(
        &self,
        channel_id: u32,
        x: u32,
        y: u32,
        port: u32,
        payload: &[u8],
    ) -> Result<(), CloseReason> {
        let channel = self.channels.lock().get(&channel_id).cloned();
        let Some(channel) = channel else {
            return Ok(());
        };

        if !channel.is_open() {
            return Ok(());
        }

        // MESSAGE_TO carries no correlation_id of its own (see §6); error
        // replies it triggers echo 0 rather than a caller-chosen value.
        if channel.mode() == ChannelMode::Connected {
            return self.reply_error(0, &ProtocolError::IllegalOnConnected.message()).await;
        }

        if port == 0 || port > 0xFFFF {
            return self.reply_error(0, &ProtocolError::InvalidPort(port).message()).await;
        }

        let Some(remote_ip) = self.auth.lookup(x, y) else {
            return self.reply_error(0, &ProtocolError::UnknownBoard { x, y }.message()).await;
        };

        let remote = SocketAddr::V4(SocketAddrV4::new(remote_ip, port as u16));
        if let Err(err) = channel.send_to(payload, remote).await {
            log::error!("channel {channel_id} udp send_to failed: {err}");
        }

        Ok(())
    }

    async fn reply(&self, message: ServerMessage<'_>) -> Result<(), CloseReason> {
        let mut buf = BytesMut::new();
        message.encode(&mut buf);
        self.sender.send(buf.freeze()).await.map_err(|_| CloseReason::ServerError)
    }

    async fn reply_error(&self, correlation_id: u32, message: &str) -> Result<(), CloseReason> {
        let message = truncate_error_message(message);
        self.reply(ServerMessage::Error { correlation_id, message }).await
    }

    /// Starts the per-channel receive loop described in the component
    /// design: wait up to `receive_timeout` for a datagram, drop it if an
    /// unconnected channel's authorization filter rejects the peer,
    /// otherwise reframe it and forward it on the WebSocket. `filter` is
    /// `Some` only for `Unconnected` channels — `Connected` sockets are
    /// already restricted to their one bound peer by the OS.
    fn spawn_receive_loop(&self, channel: Arc<Channel>, filter: Option<Arc<AuthorizationTable>>) {
        let sender = self.sender.clone();
        let channels = self.channels.clone();
        let fault = self.fault.clone();
        let receive_timeout = self.options.receive_timeout;
        let log_counts = self.options.log_channel_counts;

        tokio::spawn(async move {
            let header = message_header(channel.id());
            let mut buf = [0u8; 1500];

            while channel.is_open() {
                let received = match timeout(receive_timeout, channel.recv_from(&mut buf)).await {
                    Err(_elapsed) => continue,
                    // A board that is momentarily not listening surfaces as an
                    // ICMP port-unreachable on the next recv, reported here as
                    // `ConnectionReset`/`ConnectionRefused`. That is not fatal
                    // to a connected channel — only genuinely unrecoverable
                    // socket errors should tear it down.
                    Ok(Err(err))
                        if err.kind() == ErrorKind::ConnectionReset
                            || err.kind() == ErrorKind::ConnectionRefused =>
                    {
                        continue;
                    }
                    Ok(Err(err)) => {
                        log::error!("channel {} fatal udp receive error: {err}", channel.id());
                        break;
                    }
                    Ok(Ok(pair)) => pair,
                };

                let (n, peer) = received;

                // `close()` may have run while this recv was in flight; a
                // datagram that arrived just before that is still delivered
                // here, but must not be forwarded after close() has returned.
                if !channel.is_open() {
                    break;
                }

                if let Some(filter) = &filter {
                    let authorized = match peer {
                        SocketAddr::V4(addr) => filter.is_authorized(*addr.ip()),
                        SocketAddr::V6(_) => false,
                    };

                    if !authorized {
                        log::debug!(
                            "channel {} dropped datagram from unauthorized peer {peer}",
                            channel.id()
                        );
                        continue;
                    }
                }

                channel.note_received();

                let mut frame = BytesMut::with_capacity(header.len() + n);
                frame.extend_from_slice(&header);
                frame.extend_from_slice(&buf[..n]);

                if let Err(err) = sender.send(frame.freeze()).await {
                    sender.log_once(Some(channel.id()), &err);
                    channel.close();
                    channels.lock().remove(&channel.id());
                    fault.signal();
                    return;
                }
            }

            channel.close();
            channels.lock().remove(&channel.id());

            if log_counts {
                log::debug!(
                    "channel {} closed (sent={}, received={})",
                    channel.id(),
                    channel.sent_count(),
                    channel.received_count(),
                );
            }
        });
    }

    /// Closes every channel this session currently owns. Best-effort: one
    /// channel failing to close does not stop the rest from being closed.
    /// Called when the WebSocket itself ends, for any reason.
    pub fn close_all(&self) {
        let snapshot: Vec<Arc<Channel>> = self.channels.lock().drain().map(|(_, c)| c).collect();
        for channel in snapshot {
            channel.close();
        }
    }

    /// Tears the session down for `reason`: sends the matching WebSocket
    /// close code (best-effort) and closes every channel. The caller
    /// driving the inbound loop should stop reading afterwards.
    pub async fn shutdown(&self, reason: CloseReason) {
        self.sender.close(reason.ws_code(), &reason.to_string()).await;
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthorizationTable;
    use crate::sender::DEFAULT_SEND_TIMEOUT;
    use bytes::{BufMut, Bytes};
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    struct RecordingSink(tokio::sync::mpsc::UnboundedSender<Bytes>);

    #[derive(Debug)]
    struct NeverFails;
    impl std::fmt::Display for NeverFails {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "never")
        }
    }
    impl std::error::Error for NeverFails {}

    impl BinarySink for RecordingSink {
        type Error = NeverFails;

        async fn send_binary(&mut self, bytes: Bytes) -> Result<(), NeverFails> {
            let _ = self.0.send(bytes);
            Ok(())
        }
    }

    fn make_session(
        bind_ip: Option<Ipv4Addr>,
    ) -> (Session<RecordingSink>, UnboundedReceiver<Bytes>) {
        let (tx, rx) = unbounded_channel();
        let sender = WebSocketSender::new(RecordingSink(tx), 512 * 1024, DEFAULT_SEND_TIMEOUT);
        let auth = AuthorizationTable::from_resolved([(0, 0, Ipv4Addr::new(127, 0, 0, 1))]);
        let options = SessionOptions { unconnected_bind_ip: bind_ip, ..Default::default() };
        (Session::new(auth, sender, options), rx)
    }

    #[tokio::test]
    async fn close_on_unknown_channel_replies_zero() {
        let (session, mut rx) = make_session(None);

        let mut request = BytesMut::new();
        request.put_u32_le(1); // CLOSE
        request.put_u32_le(5); // correlation
        request.put_u32_le(99); // unknown id
        session.handle_client_message(&request).await.unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(&reply[..], &[1, 0, 0, 0, 5, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn open_with_unknown_board_replies_error() {
        let (session, mut rx) = make_session(None);

        let mut request = BytesMut::new();
        request.put_u32_le(0); // OPEN
        request.put_u32_le(1); // correlation
        request.put_u32_le(9); // x: not in the table
        request.put_u32_le(9); // y
        request.put_u32_le(5); // port
        session.handle_client_message(&request).await.unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(u32::from_le_bytes(reply[0..4].try_into().unwrap()), 5); // ERROR
        assert_eq!(u32::from_le_bytes(reply[4..8].try_into().unwrap()), 1); // correlation echoed
    }

    #[tokio::test]
    async fn open_unconnected_without_bind_ip_replies_error() {
        let (session, mut rx) = make_session(None);

        let mut request = BytesMut::new();
        request.put_u32_le(3); // OPEN_UNCONNECTED
        request.put_u32_le(7); // correlation
        session.handle_client_message(&request).await.unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(u32::from_le_bytes(reply[0..4].try_into().unwrap()), 5); // ERROR
    }

    #[tokio::test]
    async fn unknown_opcode_closes_with_bad_data() {
        let (session, _rx) = make_session(None);
        let err = session.handle_client_message(&[9, 0, 0, 0]).await.unwrap_err();
        assert_eq!(err, CloseReason::BadData);
    }

    #[tokio::test]
    async fn trailing_bytes_on_open_closes_with_bad_data() {
        let (session, _rx) = make_session(None);
        let mut request = BytesMut::new();
        request.put_u32_le(0);
        request.put_u32_le(1);
        request.put_u32_le(0);
        request.put_u32_le(0);
        request.put_u32_le(5);
        request.extend_from_slice(&[0xff]);

        let err = session.handle_client_message(&request).await.unwrap_err();
        assert_eq!(err, CloseReason::BadData);
    }
}
