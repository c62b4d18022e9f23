//! WebSocket handlers for the DG-LAB app connections.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::response::Response;
use dglab_core::types::EndpointIdentity;
use dglab_core::TransportEvent;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{code, parse_inbound, WireMessage};
use crate::state::{Outbound, ServerState};

/// GET / — upgrade to a control-channel connection.
pub async fn connect(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, peer, state))
}

/// GET /{id} — the path the pairing URL points apps at.
pub async fn connect_with_id(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    if state.control().is_some_and(|c| c.as_str() != id) {
        debug!(requested = %id, %peer, "connection names a different controller");
    }
    ws.on_upgrade(move |socket| handle_socket(socket, peer, state))
}

async fn handle_socket(socket: WebSocket, peer: SocketAddr, state: Arc<ServerState>) {
    let endpoint = EndpointIdentity::new(Uuid::new_v4().to_string());
    let (sink, mut stream) = socket.split();
    let outbound = state.register(endpoint.clone());
    let mut writer = tokio::spawn(write_loop(sink, outbound));

    state.enqueue(&endpoint, WireMessage::hello(&endpoint).to_json());
    info!(endpoint = endpoint.short(), %peer, "client connected");
    state.publish(TransportEvent::EndpointConnected {
        endpoint: endpoint.clone(),
        peer: Some(peer.to_string()),
    });

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_text(&state, &endpoint, text.as_str()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(endpoint = endpoint.short(), error = %e, "socket error");
                    state.publish(TransportEvent::ChannelError {
                        endpoint: Some(endpoint.clone()),
                        message: e.to_string(),
                    });
                    break;
                }
            },
            // The writer ends when the server drops this connection.
            _ = &mut writer => break,
        }
    }

    state.unregister(&endpoint);
    writer.abort();
    info!(endpoint = endpoint.short(), "client disconnected");
    state.publish(TransportEvent::EndpointDisconnected { endpoint });
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut outbound: mpsc::Receiver<Outbound>) {
    while let Some(Outbound { text, ack }) = outbound.recv().await {
        let written = sink.send(Message::Text(text.into())).await.is_ok();
        if let Some(ack) = ack {
            let _ = ack.send(written);
        }
        if !written {
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

fn handle_text(state: &ServerState, endpoint: &EndpointIdentity, text: &str) {
    let msg = match parse_inbound(text) {
        Ok(msg) => msg,
        Err(rejection) => {
            debug!(endpoint = endpoint.short(), code = rejection, "rejected message");
            state.enqueue(endpoint, WireMessage::error(endpoint, rejection).to_json());
            return;
        }
    };

    if msg.is_bind_request() {
        let result = if msg.target_id == endpoint.as_str() {
            state.bind(&msg.client_id, endpoint)
        } else {
            code::UNKNOWN_TARGET
        };
        state.enqueue(
            endpoint,
            WireMessage::bind_result(&msg.client_id, &msg.target_id, result).to_json(),
        );
        if result == code::OK {
            info!(endpoint = endpoint.short(), "bind succeeded");
            state.publish(TransportEvent::BindSucceeded {
                endpoint: endpoint.clone(),
            });
        } else {
            warn!(endpoint = endpoint.short(), code = result, "bind failed");
            state.publish(TransportEvent::BindFailed {
                endpoint: Some(endpoint.clone()),
                reason: format!("code {result}"),
            });
        }
        return;
    }

    match msg.kind.as_str() {
        "heartbeat" => {}
        "msg" => {
            let bound = state
                .control()
                .is_some_and(|control| state.is_bound(endpoint, &control));
            if bound {
                // strength and feedback reports from the app
                debug!(endpoint = endpoint.short(), message = %msg.message, "app report");
            } else {
                state.enqueue(endpoint, WireMessage::error(endpoint, code::NOT_BOUND).to_json());
            }
        }
        other => debug!(endpoint = endpoint.short(), kind = other, "ignored message"),
    }
}
