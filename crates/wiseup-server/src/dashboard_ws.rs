//! Live dashboard over WebSocket.
//!
//! Each connection registers one observer with the [`DashboardBroadcaster`]:
//! the server pushes `snapshot` and `ping` messages, the client answers with
//! `{"type":"ack"}`. An observer that the broadcaster evicts (full queue or no
//! acks) sees its channel close and the socket is closed with it.

use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use wiseup_telemetry::{DashboardBroadcaster, DashboardMessage, ObserverMessage};

use crate::server::AppState;

pub async fn dashboard_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let dashboard = Arc::clone(&state.services.dashboard);
    ws.on_upgrade(move |socket| handle_dashboard_socket(socket, dashboard))
}

async fn handle_dashboard_socket(socket: WebSocket, dashboard: Arc<DashboardBroadcaster>) {
    let (tx, mut rx) = mpsc::channel(dashboard.config().observer_buffer);
    let handle = dashboard.subscribe(tx);
    let (mut ws_write, mut ws_read) = socket.split();

    tracing::debug!(observer = handle.id(), "dashboard WebSocket connected");

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(message) = outbound else {
                    tracing::debug!(observer = handle.id(), "dashboard observer evicted");
                    let _ = ws_write
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::POLICY,
                            reason: "observer evicted".into(),
                        })))
                        .await;
                    break;
                };
                let json = match serde_json::to_string(message.as_ref()) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to serialize dashboard message");
                        continue;
                    }
                };
                if let Err(e) = ws_write.send(Message::Text(json.into())).await {
                    tracing::debug!(error = %e, "dashboard write error");
                    break;
                }
                if let DashboardMessage::Close { reason } = message.as_ref() {
                    let _ = ws_write
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::AWAY,
                            reason: reason.clone().into(),
                        })))
                        .await;
                    break;
                }
            }
            inbound = ws_read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ObserverMessage>(text.as_str()) {
                            Ok(ObserverMessage::Ack { .. }) => dashboard.ack(handle),
                            Err(e) => tracing::debug!(error = %e, "ignoring unknown observer message"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "dashboard read error");
                        break;
                    }
                }
            }
        }
    }

    dashboard.unsubscribe(handle);
    tracing::debug!(observer = handle.id(), "dashboard WebSocket disconnected");
}
