//! WebSocket transport binding.
//!
//! The dispatcher core is transport-agnostic; this module adapts it to an
//! axum WebSocket endpoint.  Inbound socket messages become
//! [`ClientFrame`]s fed to the ingress connection; a writer task drains the
//! connection's outbound channel back onto the socket.

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::dispatcher::Dispatcher;
use crate::ingress::ClientFrame;

pub fn build_router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/sockethub", get(ws_handler))
        .route("/healthz", get(healthz))
        .with_state(dispatcher)
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(dispatcher): State<Arc<Dispatcher>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, dispatcher))
}

async fn handle_socket(socket: WebSocket, dispatcher: Arc<Dispatcher>) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let mut conn = dispatcher.connect(outbound_tx);
    conn.resolve_session().await;

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: everything the core emits (direct frames and pump payloads)
    // funnels through the outbound channel onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let message = match frame {
                ClientFrame::Text(text) => Message::Text(text.into()),
                ClientFrame::Binary(bytes) => Message::Binary(bytes.into()),
            };
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                conn.handle_frame(ClientFrame::Text(text.to_string())).await;
            }
            Ok(Message::Binary(bytes)) => {
                conn.handle_frame(ClientFrame::Binary(bytes.to_vec())).await;
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!(session_id = conn.session_id(), error = %e, "WS error");
                break;
            }
            // Ping/pong are handled by axum.
            Ok(_) => {}
        }
    }

    conn.close().await;
    // Dropping the connection releases the last outbound sender once the
    // egress pump has consumed its sentinel, which ends the writer.
    drop(conn);
    let _ = writer.await;
}
