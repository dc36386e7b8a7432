//! The single-writer WebSocket sender.
//!
//! Many Channel receive tasks, plus the Session's own reply path, want to
//! write frames onto one WebSocket concurrently. [`WebSocketSender`] is the
//! one place that actually touches the underlying sink: it serializes
//! writers behind a mutex, tracks how many bytes are currently in flight
//! against a bounded budget, and bounds each individual write by a
//! send-time limit.
//!
//! Exceeding either the buffer budget or the time limit is treated as fatal
//! to the session (see [`SendError`]); the caller (`Session`) maps both to
//! `SERVER_ERROR`.

use std::future::Future;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// The default bound on bytes queued for send before a session is
/// considered stuck and closed.
pub const DEFAULT_BUFFER_LIMIT: usize = 512 * 1024;

/// The default per-frame send-time limit before a session is considered
/// stuck and closed.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// What a WebSocket sink needs to be able to do to back a
/// [`WebSocketSender`]. Implemented once per transport (axum's
/// `WebSocketUpgrade` in this crate's integration harness; anything else
/// an embedding WebSocket server framework provides).
pub trait BinarySink: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Writes one complete binary frame and flushes it.
    fn send_binary(&mut self, bytes: Bytes) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Sends a close frame carrying `code`/`reason`, if the underlying
    /// transport distinguishes close codes. The default is a no-op: sinks
    /// that don't support a typed close (or tests) just let the session's
    /// drop close the connection.
    fn close(&mut self, code: u16, reason: &str) -> impl Future<Output = ()> + Send {
        let _ = (code, reason);
        async {}
    }
}

#[derive(Debug)]
pub enum SendError {
    /// The frame would have pushed the outstanding buffer past its limit.
    BufferFull { attempted: usize, limit: usize },
    /// The underlying sink did not accept the frame within the send-time
    /// limit.
    TimedOut,
    /// The underlying sink reported a write failure.
    SinkClosed,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BufferFull { attempted, limit } => {
                write!(f, "send of {attempted} bytes would exceed the {limit}-byte outbound buffer")
            }
            Self::TimedOut => write!(f, "websocket send exceeded its time limit"),
            Self::SinkClosed => write!(f, "websocket sink rejected the frame"),
        }
    }
}

impl std::error::Error for SendError {}

pub struct WebSocketSender<S> {
    inner: Mutex<S>,
    outstanding: AtomicUsize,
    buffer_limit: usize,
    send_timeout: Duration,
    // Only the slow path (over-budget / timed-out sends) needs a lock, and
    // it's never held across an await point; it exists purely so repeated
    // failures don't spam the log on every single frame.
    last_failure_logged: StdMutex<bool>,
}

impl<S: BinarySink> WebSocketSender<S> {
    pub fn new(inner: S, buffer_limit: usize, send_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(inner),
            outstanding: AtomicUsize::new(0),
            buffer_limit,
            send_timeout,
            last_failure_logged: StdMutex::new(false),
        }
    }

    pub fn with_defaults(inner: S) -> Self {
        Self::new(inner, DEFAULT_BUFFER_LIMIT, DEFAULT_SEND_TIMEOUT)
    }

    /// Sends one already-framed message. Concurrent callers are serialized
    /// on the underlying sink; the byte budget is reserved optimistically
    /// before the write and released afterwards either way.
    pub async fn send(&self, frame: Bytes) -> Result<(), SendError> {
        let len = frame.len();
        let reserved = self.outstanding.fetch_add(len, Ordering::SeqCst) + len;
        if reserved > self.buffer_limit {
            self.outstanding.fetch_sub(len, Ordering::SeqCst);
            return Err(SendError::BufferFull { attempted: len, limit: self.buffer_limit });
        }

        let mut sink = self.inner.lock().await;
        let result = timeout(self.send_timeout, sink.send_binary(frame)).await;
        drop(sink);

        self.outstanding.fetch_sub(len, Ordering::SeqCst);

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::SinkClosed),
            Err(_) => Err(SendError::TimedOut),
        }
    }

    /// Sends a close frame on the underlying sink, serialized behind the
    /// same single-writer lock as ordinary frames.
    pub async fn close(&self, code: u16, reason: &str) {
        self.inner.lock().await.close(code, reason).await;
    }

    /// Logs a fatal send error exactly once per distinct failure, to avoid
    /// flooding the log when a session is already on its way out.
    pub(crate) fn log_once(&self, channel_id: Option<u32>, err: &SendError) {
        let mut logged = self.last_failure_logged.lock().unwrap();
        if !*logged {
            *logged = true;
            match channel_id {
                Some(id) => log::error!("channel {id} websocket send failed: {err}"),
                None => log::error!("websocket send failed: {err}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

    struct ChannelSink(UnboundedSender<Bytes>);

    #[derive(Debug)]
    struct Never;

    impl std::fmt::Display for Never {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "never")
        }
    }
    impl std::error::Error for Never {}

    impl BinarySink for ChannelSink {
        type Error = Never;

        async fn send_binary(&mut self, bytes: Bytes) -> Result<(), Never> {
            let _ = self.0.send(bytes);
            Ok(())
        }
    }

    fn harness() -> (Arc<WebSocketSender<ChannelSink>>, UnboundedReceiver<Bytes>) {
        let (tx, rx) = unbounded_channel();
        (Arc::new(WebSocketSender::with_defaults(ChannelSink(tx))), rx)
    }

    #[tokio::test]
    async fn sends_are_delivered_in_order() {
        let (sender, mut rx) = harness();
        sender.send(Bytes::from_static(b"one")).await.unwrap();
        sender.send(Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn rejects_frame_over_buffer_budget() {
        let (tx, _rx) = unbounded_channel();
        let sender = WebSocketSender::new(ChannelSink(tx), 4, DEFAULT_SEND_TIMEOUT);

        let err = sender.send(Bytes::from_static(b"too long")).await.unwrap_err();
        assert!(matches!(err, SendError::BufferFull { .. }));
    }
}
