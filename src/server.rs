//! Stand-in for the externally-provided WebSocket server framework.
//!
//! The spec assumes something else already terminates TLS, performs the
//! WebSocket handshake, and resolves a job id to its board allocation
//! before handing the core an opened, binary-framed session. This module is
//! the minimum axum wiring needed to exercise that core from `cargo run`:
//! one route that upgrades to a WebSocket and drives a [`Session`] off the
//! demo job board list in [`Config`].

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt, stream::SplitSink};
use service::{AuthorizationTable, BinarySink, CloseReason, Session, WebSocketSender};
use tokio::net::TcpListener;

use crate::config::Config;

/// Adapts axum's WebSocket sink to the single-writer [`BinarySink`]
/// contract the service crate's `WebSocketSender` needs.
struct AxumSink(SplitSink<WebSocket, Message>);

impl BinarySink for AxumSink {
    type Error = axum::Error;

    async fn send_binary(&mut self, bytes: Bytes) -> Result<(), axum::Error> {
        self.0.send(Message::Binary(bytes)).await
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = axum::extract::ws::CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        let _ = self.0.send(Message::Close(Some(frame))).await;
    }
}

pub async fn start(config: Arc<Config>) -> anyhow::Result<()> {
    let listen = config.server.listen;
    let app = Router::new().route("/proxy", get(upgrade)).with_state(config);

    let listener = TcpListener::bind(listen).await?;
    log::info!("board proxy listening={listen}");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn upgrade(ws: WebSocketUpgrade, State(config): State<Arc<Config>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, config))
}

async fn handle_socket(socket: WebSocket, config: Arc<Config>) {
    let (sink, mut stream) = socket.split();

    let boards: Vec<(u32, u32, String)> = config
        .job
        .boards
        .iter()
        .map(|b| (b.x, b.y, b.hostname.clone()))
        .collect();
    let auth = AuthorizationTable::resolve(&boards).await;

    let sender = WebSocketSender::new(AxumSink(sink), config.proxy.buffer_limit, config.proxy.send_timeout());
    let session = Arc::new(Session::new(auth, sender, config.proxy.session_options()));

    loop {
        tokio::select! {
            _ = session.faulted() => {
                log::error!("session faulted on a websocket send, closing");
                session.shutdown(CloseReason::ServerError).await;
                return;
            }
            frame = stream.next() => {
                let Some(frame) = frame else {
                    break;
                };

                match frame {
                    Ok(Message::Binary(bytes)) => {
                        if let Err(reason) = session.handle_client_message(&bytes).await {
                            log::warn!("closing session: {reason}");
                            session.shutdown(reason).await;
                            return;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        log::error!("websocket read error: {err}");
                        break;
                    }
                }
            }
        }
    }

    session.close_all();
}
