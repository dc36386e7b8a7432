//! Wire codec for the board-proxy protocol.
//!
//! Every frame begins with a 4-byte little-endian opcode word. All further
//! fixed fields are 4-byte little-endian words too, with one exception: the
//! resolved board address carried in an [`ServerMessage::OpenUnconnected`]
//! reply is 4 bytes in network (big-endian) order, because it is consumed
//! directly as an IPv4 address rather than as a word-sized integer.
//!
//! `Message` and `MessageTo` frames carry a raw payload after their fixed
//! header; the payload is simply "whatever bytes remain in the frame", there
//! is no length prefix for it.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, BytesMut};

pub const OPCODE_OPEN: u32 = 0;
pub const OPCODE_CLOSE: u32 = 1;
pub const OPCODE_MESSAGE: u32 = 2;
pub const OPCODE_OPEN_UNCONNECTED: u32 = 3;
pub const OPCODE_MESSAGE_TO: u32 = 4;
pub const OPCODE_ERROR: u32 = 5;

/// Frames sent to us by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage<'a> {
    Open {
        correlation_id: u32,
        x: u32,
        y: u32,
        port: u32,
    },
    Close {
        correlation_id: u32,
        channel_id: u32,
    },
    Message {
        channel_id: u32,
        payload: &'a [u8],
    },
    OpenUnconnected {
        correlation_id: u32,
    },
    MessageTo {
        channel_id: u32,
        x: u32,
        y: u32,
        port: u32,
        payload: &'a [u8],
    },
}

/// Frames we send back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage<'a> {
    Open {
        correlation_id: u32,
        channel_id: u32,
    },
    Close {
        correlation_id: u32,
        /// `0` if there was nothing to close.
        channel_id: u32,
    },
    Message {
        channel_id: u32,
        payload: &'a [u8],
    },
    OpenUnconnected {
        correlation_id: u32,
        channel_id: u32,
        local_addr: Ipv4Addr,
        local_port: u32,
    },
    Error {
        correlation_id: u32,
        message: &'a str,
    },
}

#[derive(Debug)]
pub enum Error {
    /// Not enough bytes to hold a fixed-shape header.
    Truncated,
    /// A fixed-shape request (`Open`/`Close`/`OpenUnconnected`) had trailing
    /// bytes after its declared fields.
    TrailingBytes,
    /// The leading opcode word did not match any known opcode.
    UnknownOpcode(u32),
    /// An `Error` frame's message bytes were not valid UTF-8.
    InvalidUtf8,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "frame is shorter than its opcode requires"),
            Self::TrailingBytes => write!(f, "frame has bytes past its fixed-shape fields"),
            Self::UnknownOpcode(op) => write!(f, "unknown opcode {op}"),
            Self::InvalidUtf8 => write!(f, "error frame message is not valid utf-8"),
        }
    }
}

const WORD: usize = 4;

fn read_word(bytes: &[u8], at: usize) -> Result<u32, Error> {
    bytes
        .get(at..at + WORD)
        .map(|w| u32::from_le_bytes(w.try_into().unwrap()))
        .ok_or(Error::Truncated)
}

impl<'a> ClientMessage<'a> {
    /// Decodes one client frame.
    ///
    /// Fixed-shape opcodes (`Open`, `Close`, `OpenUnconnected`) reject any
    /// trailing bytes as [`Error::TrailingBytes`]; `Message`/`MessageTo`
    /// take whatever remains in the buffer as their payload.
    ///
    /// # Test
    ///
    /// ```
    /// use spalloc_proxy_codec::ClientMessage;
    ///
    /// let frame = [0x00, 0, 0, 0, 42, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x34, 0x12, 0, 0];
    /// let msg = ClientMessage::decode(&frame).unwrap();
    /// assert_eq!(
    ///     msg,
    ///     ClientMessage::Open { correlation_id: 42, x: 0, y: 0, port: 0x1234 },
    /// );
    /// ```
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        let opcode = read_word(bytes, 0)?;
        match opcode {
            OPCODE_OPEN => {
                let correlation_id = read_word(bytes, 4)?;
                let x = read_word(bytes, 8)?;
                let y = read_word(bytes, 12)?;
                let port = read_word(bytes, 16)?;
                if bytes.len() != 20 {
                    return Err(Error::TrailingBytes);
                }
                Ok(Self::Open { correlation_id, x, y, port })
            }
            OPCODE_CLOSE => {
                let correlation_id = read_word(bytes, 4)?;
                let channel_id = read_word(bytes, 8)?;
                if bytes.len() != 12 {
                    return Err(Error::TrailingBytes);
                }
                Ok(Self::Close { correlation_id, channel_id })
            }
            OPCODE_MESSAGE => {
                let channel_id = read_word(bytes, 4)?;
                Ok(Self::Message { channel_id, payload: &bytes[8.min(bytes.len())..] })
            }
            OPCODE_OPEN_UNCONNECTED => {
                let correlation_id = read_word(bytes, 4)?;
                if bytes.len() != 8 {
                    return Err(Error::TrailingBytes);
                }
                Ok(Self::OpenUnconnected { correlation_id })
            }
            OPCODE_MESSAGE_TO => {
                let channel_id = read_word(bytes, 4)?;
                let x = read_word(bytes, 8)?;
                let y = read_word(bytes, 12)?;
                let port = read_word(bytes, 16)?;
                Ok(Self::MessageTo {
                    channel_id,
                    x,
                    y,
                    port,
                    payload: &bytes[20.min(bytes.len())..],
                })
            }
            other => Err(Error::UnknownOpcode(other)),
        }
    }
}

impl<'a> ServerMessage<'a> {
    /// Encodes one server frame, appending it to `out`.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use spalloc_proxy_codec::ServerMessage;
    ///
    /// let mut out = BytesMut::new();
    /// ServerMessage::Open { correlation_id: 42, channel_id: 1 }.encode(&mut out);
    /// assert_eq!(&out[..], &[0, 0, 0, 0, 42, 0, 0, 0, 1, 0, 0, 0]);
    /// ```
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Self::Open { correlation_id, channel_id } => {
                out.put_u32_le(OPCODE_OPEN);
                out.put_u32_le(*correlation_id);
                out.put_u32_le(*channel_id);
            }
            Self::Close { correlation_id, channel_id } => {
                out.put_u32_le(OPCODE_CLOSE);
                out.put_u32_le(*correlation_id);
                out.put_u32_le(*channel_id);
            }
            Self::Message { channel_id, payload } => {
                out.put_u32_le(OPCODE_MESSAGE);
                out.put_u32_le(*channel_id);
                out.put_slice(payload);
            }
            Self::OpenUnconnected { correlation_id, channel_id, local_addr, local_port } => {
                out.put_u32_le(OPCODE_OPEN_UNCONNECTED);
                out.put_u32_le(*correlation_id);
                out.put_u32_le(*channel_id);
                out.put_slice(&local_addr.octets());
                out.put_u32_le(*local_port);
            }
            Self::Error { correlation_id, message } => {
                out.put_u32_le(OPCODE_ERROR);
                out.put_u32_le(*correlation_id);
                out.put_slice(message.as_bytes());
            }
        }
    }

    /// Convenience wrapper around [`Self::encode`] that returns a fresh
    /// buffer, used by call sites that don't already hold one.
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(match self {
            Self::Message { payload, .. } => 8 + payload.len(),
            Self::Error { message, .. } => 8 + message.len(),
            _ => 20,
        });
        self.encode(&mut out);
        out.to_vec()
    }
}

/// Pre-builds the 2-word `(MESSAGE, channel_id)` header a [`Channel`] copies
/// in front of every datagram it forwards, so the hot receive path never
/// re-serializes the opcode or id.
///
/// [`Channel`]: ../spalloc_proxy_service/struct.Channel.html
///
/// # Test
///
/// ```
/// use spalloc_proxy_codec::message_header;
///
/// assert_eq!(message_header(7), [2, 0, 0, 0, 7, 0, 0, 0]);
/// ```
pub fn message_header(channel_id: u32) -> [u8; 8] {
    let mut header = [0u8; 8];
    (&mut header[..]).put_u32_le(OPCODE_MESSAGE);
    (&mut header[4..]).put_u32_le(channel_id);
    header
}

/// Truncates an error message to the protocol's 1000-byte budget, at a
/// UTF-8 char boundary.
pub fn truncate_error_message(message: &str) -> &str {
    const MAX: usize = 1000;
    if message.len() <= MAX {
        return message;
    }

    let mut end = MAX;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}
