//! WebSocket endpoint bridging a socket to the broadcaster.
//!
//! Each socket gets a bounded outbound queue registered with the broadcaster
//! and two tasks: a writer draining the queue into the socket and a reader
//! feeding inbound frames back as liveness and `ping` requests.

use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::broadcast::{Broadcaster, QueueSink};

use super::HttpState;

pub async fn feed_socket(State(state): State<HttpState>, ws: WebSocketUpgrade) -> Response {
    let broadcaster = Arc::clone(state.feed.broadcaster());
    ws.on_upgrade(move |socket| serve_socket(broadcaster, socket))
}

async fn serve_socket(broadcaster: Arc<Broadcaster>, socket: WebSocket) {
    let (sink, mut outbound) = QueueSink::channel(broadcaster.config().outbound_queue.get());
    let id = match broadcaster.on_connect(Arc::new(sink)) {
        Ok(id) => id,
        Err(err) => {
            warn!(error = %err, "Rejected WebSocket client");
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();

    // Ends when the broadcaster drops the connection (queue closed) or the
    // peer stops accepting writes.
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sender.send(Message::text(&*frame)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let reader_broadcaster = Arc::clone(&broadcaster);
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => reader_broadcaster.handle_client_text(id, text.as_str()),
                Message::Ping(_) | Message::Pong(_) => {
                    reader_broadcaster.mark_alive(id);
                }
                Message::Binary(_) => {
                    reader_broadcaster.handle_client_text(id, "");
                }
                Message::Close(_) => break,
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    debug!(connection_id = %id, "WebSocket closed");
    broadcaster.on_disconnect(id);
}
