//! End-to-end scenarios against an in-process `Session`, driven with literal
//! wire frames and a mock frame sink instead of a real WebSocket.

use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use codec::{OPCODE_CLOSE, OPCODE_ERROR, OPCODE_MESSAGE, OPCODE_OPEN, OPCODE_OPEN_UNCONNECTED};
use spalloc_proxy_service::{AuthorizationTable, BinarySink, Session, SessionOptions, WebSocketSender};
use tokio::net::UdpSocket;
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

fn open_request(correlation_id: u32, x: u32, y: u32, port: u32) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32_le(OPCODE_OPEN);
    buf.put_u32_le(correlation_id);
    buf.put_u32_le(x);
    buf.put_u32_le(y);
    buf.put_u32_le(port);
    buf
}

fn close_request(correlation_id: u32, channel_id: u32) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32_le(OPCODE_CLOSE);
    buf.put_u32_le(correlation_id);
    buf.put_u32_le(channel_id);
    buf
}

fn open_unconnected_request(correlation_id: u32) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32_le(OPCODE_OPEN_UNCONNECTED);
    buf.put_u32_le(correlation_id);
    buf
}

fn make_session(
    boards: impl IntoIterator<Item = (u32, u32, Ipv4Addr)>,
) -> (Session<RecordingSink>, UnboundedReceiver<Bytes>) {
    make_session_with_options(boards, SessionOptions::default())
}

fn make_session_with_options(
    boards: impl IntoIterator<Item = (u32, u32, Ipv4Addr)>,
    options: SessionOptions,
) -> (Session<RecordingSink>, UnboundedReceiver<Bytes>) {
    let (tx, rx) = unbounded_channel();
    let sender = WebSocketSender::with_defaults(RecordingSink(tx));
    let auth = AuthorizationTable::from_resolved(boards);
    (Session::new(auth, sender, options), rx)
}

/// Scenario 1: open then close a connected channel round-trips the literal
/// bytes the spec tabulates.
#[tokio::test]
async fn opens_and_closes_a_connected_channel() {
    let board = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let board_port = board.local_addr().unwrap().port() as u32;

    let (session, mut rx) = make_session([(0, 0, Ipv4Addr::LOCALHOST)]);

    session
        .handle_client_message(&open_request(42, 0, 0, board_port))
        .await
        .unwrap();

    let reply = rx.recv().await.unwrap();
    assert_eq!(reply[0..4].to_vec(), OPCODE_OPEN.to_le_bytes());
    assert_eq!(u32::from_le_bytes(reply[4..8].try_into().unwrap()), 42);
    let channel_id = u32::from_le_bytes(reply[8..12].try_into().unwrap());
    assert_eq!(channel_id, 1);

    session
        .handle_client_message(&close_request(43, channel_id))
        .await
        .unwrap();

    let reply = rx.recv().await.unwrap();
    assert_eq!(
        &reply[..],
        &[1, 0, 0, 0, 43, 0, 0, 0, 1, 0, 0, 0],
    );
}

/// Scenario 2: closing an id nobody opened yields the `0` sentinel, not an
/// error.
#[tokio::test]
async fn close_of_unknown_id_replies_zero_sentinel() {
    let (session, mut rx) = make_session([]);

    session.handle_client_message(&close_request(5, 99)).await.unwrap();

    let reply = rx.recv().await.unwrap();
    assert_eq!(&reply[..], &[1, 0, 0, 0, 5, 0, 0, 0, 0, 0, 0, 0]);
}

/// Scenario 3: an unknown board replies with an `ERROR` frame naming the
/// chip, and opens no socket (no channel id is ever handed out).
#[tokio::test]
async fn unknown_board_replies_with_error_frame() {
    let (session, mut rx) = make_session([]);

    session.handle_client_message(&open_request(7, 0, 0, 1234)).await.unwrap();

    let mut reply = rx.recv().await.unwrap();
    assert_eq!(reply.get_u32_le(), OPCODE_ERROR);
    assert_eq!(reply.get_u32_le(), 7);
    let message = std::str::from_utf8(&reply[..]).unwrap();
    assert!(message.contains("unrecognised ethernet chip"), "{message}");
}

/// Scenario 4: port 0 is rejected with an `ERROR` frame mentioning the bad
/// port, without ever touching the authorization table.
#[tokio::test]
async fn zero_port_replies_with_error_frame() {
    let (session, mut rx) = make_session([(0, 0, Ipv4Addr::LOCALHOST)]);

    session.handle_client_message(&open_request(1, 0, 0, 0)).await.unwrap();

    let mut reply = rx.recv().await.unwrap();
    assert_eq!(reply.get_u32_le(), OPCODE_ERROR);
    assert_eq!(reply.get_u32_le(), 1);
    let message = std::str::from_utf8(&reply[..]).unwrap();
    assert!(message.contains("bad port number"), "{message}");
}

/// Scenario 5: a datagram arriving on a connected channel's bound peer is
/// reframed and forwarded with the `(MESSAGE, id)` header.
#[tokio::test]
async fn forwards_a_datagram_on_a_connected_channel() {
    let board = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let board_port = board.local_addr().unwrap().port() as u32;

    let (session, mut rx) = make_session([(0, 0, Ipv4Addr::LOCALHOST)]);
    session
        .handle_client_message(&open_request(1, 0, 0, board_port))
        .await
        .unwrap();

    let open_reply = rx.recv().await.unwrap();
    let channel_id = u32::from_le_bytes(open_reply[8..12].try_into().unwrap());

    // The board only learns the proxy's ephemeral local port once the proxy
    // has sent it something, exactly as it would over real hardware; send
    // one `MESSAGE` through the channel first so the board can read the
    // source address off the datagram it receives.
    let mut outbound = BytesMut::new();
    outbound.put_u32_le(OPCODE_MESSAGE);
    outbound.put_u32_le(channel_id);
    outbound.extend_from_slice(b"hello");
    session.handle_client_message(&outbound).await.unwrap();

    let mut probe = [0u8; 16];
    let (_, proxy_addr) = tokio::time::timeout(Duration::from_secs(1), board.recv_from(&mut probe))
        .await
        .unwrap()
        .unwrap();

    board.send_to(&[0xDE, 0xAD, 0xBE, 0xEF], proxy_addr).await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(u32::from_le_bytes(frame[0..4].try_into().unwrap()), OPCODE_MESSAGE);
    assert_eq!(u32::from_le_bytes(frame[4..8].try_into().unwrap()), channel_id);
    assert_eq!(&frame[8..], &[0xDE, 0xAD, 0xBE, 0xEF]);
}

/// Invariant 6: a `MESSAGE_TO` aimed at a `Connected` channel is rejected
/// with an `ERROR` reply and no datagram leaves the socket.
#[tokio::test]
async fn message_to_on_connected_channel_is_rejected() {
    use codec::OPCODE_MESSAGE_TO;

    let board = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let board_port = board.local_addr().unwrap().port() as u32;

    let (session, mut rx) = make_session([(0, 0, Ipv4Addr::LOCALHOST)]);
    session
        .handle_client_message(&open_request(1, 0, 0, board_port))
        .await
        .unwrap();
    let open_reply = rx.recv().await.unwrap();
    let channel_id = u32::from_le_bytes(open_reply[8..12].try_into().unwrap());

    let mut request = BytesMut::new();
    request.put_u32_le(OPCODE_MESSAGE_TO);
    request.put_u32_le(channel_id);
    request.put_u32_le(0);
    request.put_u32_le(0);
    request.put_u32_le(board_port);
    request.extend_from_slice(b"hi");

    session.handle_client_message(&request).await.unwrap();

    let mut reply = rx.recv().await.unwrap();
    assert_eq!(reply.get_u32_le(), OPCODE_ERROR);

    let mut probe = [0u8; 16];
    let result = tokio::time::timeout(Duration::from_millis(100), board.recv_from(&mut probe)).await;
    assert!(result.is_err(), "no datagram should have been sent to the board");
}

/// Scenario 6: a datagram arriving on an `Unconnected` channel from a peer
/// outside the authorization table's address set is dropped rather than
/// forwarded on the websocket.
#[tokio::test]
async fn unconnected_channel_drops_datagram_from_unauthorized_peer() {
    let options = SessionOptions {
        unconnected_bind_ip: Some(Ipv4Addr::LOCALHOST),
        ..SessionOptions::default()
    };
    // The table only authorizes a board address other than the loopback
    // address the stand-in "board" socket below actually sends from, so
    // everything it sends should be dropped by the receive loop's filter.
    let (session, mut rx) =
        make_session_with_options([(0, 0, Ipv4Addr::new(10, 0, 0, 1))], options);

    session.handle_client_message(&open_unconnected_request(9)).await.unwrap();
    let open_reply = rx.recv().await.unwrap();
    assert_eq!(
        u32::from_le_bytes(open_reply[0..4].try_into().unwrap()),
        OPCODE_OPEN_UNCONNECTED
    );
    let channel_port = u32::from_le_bytes(open_reply[16..20].try_into().unwrap()) as u16;

    let board = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    board
        .send_to(b"unauthorized", (Ipv4Addr::LOCALHOST, channel_port))
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(result.is_err(), "datagram from an unauthorized peer must not be forwarded");
}
