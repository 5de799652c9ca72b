//! Server end of the rule status channel.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use tokio::sync::broadcast::{self, error::RecvError};

use super::server::AppState;
use crate::status::{ClientFrame, RuleStatusEvent, ServerFrame, NORMAL_CLOSE};

/// Handle GET /api/rules/status
pub async fn rule_status_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    // Subscribed before the upgrade so nothing published after the handshake is missed.
    let events = state.dispatcher.status().subscribe();
    ws.on_upgrade(move |socket| serve_status_socket(socket, events))
}

async fn serve_status_socket(mut socket: WebSocket, mut events: broadcast::Receiver<RuleStatusEvent>) {
    tracing::debug!("Status observer connected");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&ServerFrame::RuleStatus(event)) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to encode status frame");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Status observer lagging, oldest events dropped");
                }
                Err(RecvError::Closed) => {
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: NORMAL_CLOSE,
                            reason: "shutting down".into(),
                        })))
                        .await;
                    break;
                }
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(ClientFrame::Ping) => tracing::trace!("Status observer ping"),
                    Err(e) => {
                        tracing::warn!(error = %e, frame = %text, "Dropping malformed observer frame");
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "Status observer socket error");
                    break;
                }
            },
        }
    }

    tracing::debug!("Status observer disconnected");
}
