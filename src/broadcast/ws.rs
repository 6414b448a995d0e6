//! WebSocket endpoint for dashboard clients.
//!
//! Routes:
//! - `GET /ws`: upgrade; the client receives `init-data` once, then every
//!   `sensor-update` as it happens
//! - `GET /health`: JSON liveness with subscriber count and per-station
//!   reading count, trend and last location
//!
//! Clients only listen. Anything they send is ignored apart from close.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

use super::{RealtimeEvent, RealtimeHub, SubscriberSet};
use crate::logging::{self, Component};
use crate::pipeline::Orchestrator;

#[derive(Clone)]
pub struct RealtimeState {
    pub pipeline: Arc<Orchestrator>,
    pub hub: Arc<RealtimeHub>,
}

pub fn router(state: RealtimeState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Binds `addr` and serves until the process exits.
pub async fn serve(addr: &str, state: RealtimeState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    logging::info(
        Component::Realtime,
        None,
        &format!("WebSocket endpoint: ws://{}/ws", addr),
    );
    axum::serve(listener, router(state)).await
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RealtimeState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn health_handler(State(state): State<RealtimeState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "stations": state.pipeline.history().statuses(),
        "subscribers": state.hub.subscriber_count(),
    }))
}

async fn handle_socket(socket: WebSocket, state: RealtimeState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut subscription = state.pipeline.subscribe();
    logging::info(
        Component::Realtime,
        None,
        &format!("Client connected. Total: {}", state.hub.subscriber_count()),
    );

    if send_event(&mut ws_tx, &subscription.baseline).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = subscription.live.recv() => match event {
                Ok(event) => {
                    if send_event(&mut ws_tx, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    logging::warn(
                        Component::Realtime,
                        None,
                        &format!("Slow client skipped {} updates", skipped),
                    );
                }
                Err(RecvError::Closed) => break,
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    logging::debug(Component::Realtime, None, &format!("WebSocket error: {}", e));
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    drop(subscription);
    logging::info(
        Component::Realtime,
        None,
        &format!("Client disconnected. Total: {}", state.hub.subscriber_count()),
    );
}

async fn send_event<S>(ws_tx: &mut S, event: &RealtimeEvent) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
{
    let text = match event.to_json() {
        Ok(text) => text,
        Err(e) => {
            logging::error(
                Component::Realtime,
                None,
                &format!("Failed to serialize {}: {}", event.name(), e),
            );
            return Ok(());
        }
    };
    ws_tx.send(Message::Text(text)).await.map_err(|_| ())
}
