//! WebSocket push of observation events
//!
//! Each connection gets its own broadcast subscription, wrapped as a
//! stream. Events serialize as `{"type": "log_update" | "status_update" |
//! "statistics_update" | "instances_update" | "instance_update", "data":
//! ...}`. A lagging client skips ahead rather than backpressuring the
//! publishers.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use crate::events::BusError;

use super::AppState;

/// `GET /ws`
pub async fn upgrade(
    State(s): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve(socket, s))
}

async fn serve(mut socket: WebSocket, state: Arc<AppState>) {
    let mut events = BroadcastStream::new(state.bus.subscribe());
    debug!("websocket subscriber connected");
    loop {
        tokio::select! {
            event = events.next() => {
                let event = match event {
                    Some(Ok(event)) => event,
                    Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                        warn!(error = %BusError::Lagged(missed), "websocket subscriber skipping ahead");
                        continue;
                    }
                    None => break,
                };
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize event");
                        continue;
                    }
                };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ignore pings and client chatter
                    Some(Err(_)) => break,
                }
            }
        }
    }
    debug!("websocket subscriber disconnected");
}
