use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;

use crate::state::ServerState;

/// GET /health — listener status and connection counts.
pub async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let control = state.control();
    let bound = control
        .as_ref()
        .map(|c| state.bound_to(c).len())
        .unwrap_or(0);
    Json(serde_json::json!({
        "status": "ok",
        "listening": control.is_some(),
        "connections": state.connection_count(),
        "bound": bound,
    }))
}

/// GET /events — SSE stream of connection lifecycle events.
pub async fn events(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let rx = state.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| {
        let event = msg.ok()?;
        let data = serde_json::to_string(&event).ok()?;
        Some(Ok::<Event, Infallible>(
            Event::default().event("transport").data(data),
        ))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
