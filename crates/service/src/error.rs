//! Protocol-level error taxonomy.
//!
//! Every variant here is reported back to the client as an `ERROR` reply
//! frame; the session itself stays open. Parsing failures
//! (`codec::Error`) and WebSocket write failures are handled one level up,
//! in [`crate::session::Session`], because those two close the session
//! rather than being reported in-band.

#[derive(Debug)]
pub enum ProtocolError {
    InvalidPort(u32),
    UnknownBoard { x: u32, y: u32 },
    IllegalOnConnected,
    UnsupportedUnconnected,
    SocketOpenFailure(std::io::Error),
}

impl ProtocolError {
    /// The text carried in the `ERROR` reply frame, truncated to the
    /// protocol's 1000-byte budget.
    pub fn message(&self) -> String {
        match self {
            Self::InvalidPort(port) => format!("bad port number: {port}"),
            Self::UnknownBoard { x, y } => format!("unrecognised ethernet chip at ({x}, {y})"),
            Self::IllegalOnConnected => {
                "operation is not valid on a connected channel".to_string()
            }
            Self::UnsupportedUnconnected => {
                "unconnected channels are not supported by this server".to_string()
            }
            Self::SocketOpenFailure(err) => format!("failed to open udp socket: {err}"),
        }
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ProtocolError {}

/// The reason a [`crate::session::Session`] must be torn down, as opposed
/// to merely replying with an error and continuing. Returned by anything
/// that can fail fatally while handling one client frame; the caller (the
/// WebSocket-driving loop) maps this to the wire close code named in each
/// variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent a frame that could not be parsed at all, or a
    /// fixed-shape request with trailing bytes.
    BadData,
    /// Writing to the WebSocket itself failed or exceeded its budget.
    ServerError,
}

impl CloseReason {
    /// The application-range WebSocket close code (RFC 6455 §7.4.2, private
    /// use range 4000-4999) an embedding transport should send for this
    /// reason.
    pub fn ws_code(&self) -> u16 {
        match self {
            Self::BadData => 4000,
            Self::ServerError => 4001,
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadData => write!(f, "bad data"),
            Self::ServerError => write!(f, "server error"),
        }
    }
}
