//! WebSocket Status Push
//!
//! `GET /ws/documents/:document_id` upgrades to a socket that streams the
//! document's [`ChannelMessage`]s as JSON text frames:
//!
//! 1. `connected` once, after the subscription is in place
//! 2. `status` for every block status change of the document
//! 3. `lagged` when the socket fell behind and events were dropped; the
//!    client should reconcile from the cache
//!
//! Delivery is at-most-once. Nothing is replayed on reconnect.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use lectern_core::{ChannelMessage, DocumentId};
use lectern_events::{DocumentSubscription, SubscriptionError};
use tracing::{debug, error, info, warn};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::telemetry::metrics;

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(document_id): Path<DocumentId>,
) -> ApiResult<Response> {
    if !state.documents.contains(document_id) {
        return Err(ApiError::document_not_found(document_id));
    }
    info!(document_id = %document_id, "WebSocket connection request");

    // Subscribe before the upgrade so nothing published in between is lost.
    let subscription = state.notifier.subscribe(document_id);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, subscription)))
}

/// Runs for the lifetime of one connection.
async fn handle_socket(socket: WebSocket, mut subscription: DocumentSubscription) {
    let document_id = subscription.document_id();
    if let Some(m) = metrics() {
        m.ws_connected();
    }
    info!(document_id = %document_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    if let Err(e) = send_message(&mut sender, &ChannelMessage::Connected { document_id }).await {
        error!(document_id = %document_id, error = %e, "Failed to send Connected message");
        if let Some(m) = metrics() {
            m.ws_disconnected();
        }
        return;
    }

    // Inbound frames are only watched for close.
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => {
                    debug!(document_id = %document_id, "Client sent close frame");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(document_id = %document_id, error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            result = subscription.recv() => {
                let message = match result {
                    Ok(event) => ChannelMessage::Status(event),
                    Err(SubscriptionError::Lagged(skipped)) => {
                        warn!(document_id = %document_id, skipped, "Client lagged, events dropped");
                        ChannelMessage::Lagged { skipped }
                    }
                    Err(SubscriptionError::Closed) => {
                        info!(document_id = %document_id, "Document channel closed");
                        break;
                    }
                };
                if let Err(e) = send_message(&mut sender, &message).await {
                    debug!(document_id = %document_id, error = %e, "Send failed, closing connection");
                    break;
                }
            }

            _ = &mut recv_task => {
                debug!(document_id = %document_id, "Receiver task finished");
                break;
            }
        }
    }

    recv_task.abort();
    let _ = sender.close().await;
    if let Some(m) = metrics() {
        m.ws_disconnected();
    }
    info!(document_id = %document_id, "WebSocket disconnected");
}

/// Serialize to JSON and send as a text frame.
async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ChannelMessage,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(message).map_err(|e| {
        error!(error = %e, "Failed to serialize channel message");
        axum::Error::new(e)
    })?;

    sender.send(Message::Text(json)).await
}
