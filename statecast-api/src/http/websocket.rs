//! WebSocket transport adapter
//!
//! Owns nothing but the socket. Every decision (authentication, subscriptions,
//! batching, throttling) lives in the relay; this module only moves text
//! frames in and drains the connection's outbound queue.

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tracing::{debug, info, warn};

use statecast_relay::{ConnectionSession, FrameOutcome, Outbound};

use crate::http::AppState;

/// Time allowed for the writer to flush queued frames after the reader stops
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// `GET /ws`
pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let max_message_size = state.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let relay = state.relay;
    let ConnectionSession {
        id,
        guard,
        mut outbound,
        cancel,
    } = relay.connect();

    info!(connection_id = %id, "WebSocket connection established");

    let (mut sink, mut stream) = socket.split();

    // Server frames -> WebSocket
    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                () = writer_cancel.cancelled() => break,
                item = outbound.recv() => item,
            };

            let result = match item {
                Some(Outbound::Text(text)) => sink.send(Message::Text(text.as_ref().into())).await,
                Some(Outbound::Ping) => sink.send(Message::Ping(Bytes::new())).await,
                Some(Outbound::Close) => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                None => break,
            };

            if let Err(e) = result {
                debug!(connection_id = %id, error = %e, "Failed to send WebSocket message");
                break;
            }
        }
        let _ = sink.close().await;
    });

    // WebSocket -> relay
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => {
                debug!(connection_id = %id, "Connection terminated by relay");
                break;
            }
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                if relay.handle_message(id, text.as_str()).await == FrameOutcome::Close {
                    break;
                }
            }
            Some(Ok(Message::Pong(_))) => relay.record_liveness(id),
            Some(Ok(Message::Close(_))) | None => break,
            // Binary and client pings carry no relay semantics
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(connection_id = %id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    // Dropping the guard disconnects, which closes the outbound queue and
    // lets the writer finish whatever was queued before it
    drop(guard);
    let abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!(connection_id = %id, "Writer did not drain in time");
        abort.abort();
    }

    info!(connection_id = %id, "WebSocket connection closed");
}
