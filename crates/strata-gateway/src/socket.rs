use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use strata_core::types::SessionId;

use crate::handlers::InboundContext;
use crate::state::AppState;

/// Drive one WebSocket connection until the client goes away.
///
/// Outbound frames (batches, responses, notices) all go through the
/// connection's channel, so a single writer task owns the socket sink.
pub async fn handle_socket(ws: WebSocket, session: SessionId, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (conn, mut outbound) = state.connections.connect(&session);

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let ctx = InboundContext::new(session.clone()).with_connection(conn.id());
    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                debug!(session_id = %session, error = %e, "WebSocket read error");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                conn.touch();
                let response = state.handlers.dispatch(&ctx, text.as_str()).await;
                match serde_json::to_string(&response) {
                    Ok(json) => {
                        if !conn.send(json) {
                            warn!(session_id = %session, connection = %conn.id(), "Response not delivered");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode response"),
                }
            }
            Message::Close(_) => break,
            _ => conn.touch(),
        }
    }

    state.connections.disconnect(&session, conn.id());
    if state.connections.connections(&session).is_empty() {
        state.handlers.forget_session(&session);
    }
    writer.abort();
}
