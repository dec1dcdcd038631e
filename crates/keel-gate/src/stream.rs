//! Worker stream: one websocket per worker connection.
//!
//! Incoming text frames go to the [`Session`]; once the worker has
//! identified itself a writer task forwards queued commands as JSON frames.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use keel_core::app::SessionManager;
use keel_core::domain::WorkerCommand;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::http::AppState;

pub async fn stream_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.sessions))
}

async fn handle_socket(socket: WebSocket, sessions: Arc<SessionManager>) {
    let mut session = sessions.open();
    debug!(session = %session.id(), "worker stream opened");
    let (sender, mut receiver) = socket.split();
    let mut sender = Some(sender);

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            // 非 UTF-8 は decode できないフレームとして扱う
            Ok(Message::Binary(bytes)) => String::from_utf8(bytes).unwrap_or_default(),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!(session = %session.id(), error = %e, "worker stream read failed");
                break;
            }
        };

        if let Err(e) = session.on_text(&text) {
            warn!(session = %session.id(), error = %e, "closing worker stream");
            break;
        }

        if let Some(outbound) = session.take_outbound()
            && let Some(sink) = sender.take()
        {
            if let Some(worker) = session.worker() {
                info!(session = %session.id(), worker = %worker, "worker identified");
            }
            tokio::spawn(forward_commands(sink, outbound));
        }
    }

    session.close();
    debug!(session = %session.id(), "worker stream closed");
}

/// Ends when the session's outbound queue is dropped or the socket fails.
async fn forward_commands(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<WorkerCommand>,
) {
    while let Some(command) = outbound.recv().await {
        let json = match serde_json::to_string(&command) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "could not encode worker command");
                continue;
            }
        };
        if sink.send(Message::Text(json)).await.is_err() {
            break;
        }
    }
    // ignore: the peer may already be gone
    let _ = sink.close().await;
}
