//! DG-LAB socket control channel.
//!
//! [`DgLabServer`] is the transport behind the orchestrator: it accepts app
//! connections over WebSocket, tracks which apps are bound to the controller
//! identity, and turns core commands into protocol frames.

pub mod error;
pub mod protocol;
pub mod routes;
pub mod state;
pub mod ws;

use std::collections::BTreeSet;
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use dglab_core::config::ServerConfig;
use dglab_core::types::{ControlIdentity, EndpointIdentity, StimCommand};
use dglab_core::{BindingRegistry, Transport, TransportEvent};
use futures::FutureExt;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use error::ServerError;
pub use state::ServerState;

use protocol::{encode_command, WireMessage};

/// How long `stop_listening` waits for the accept loop to wind down.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the axum Router for the control channel.
/// Used by [`DgLabServer`] and available for integration testing.
pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/", get(ws::connect))
        .route("/health", get(routes::health))
        .route("/events", get(routes::events))
        .route("/{id}", get(ws::connect_with_id))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

struct Listening {
    port: u16,
    shutdown: oneshot::Sender<()>,
    serve: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

pub struct DgLabServer {
    bind: String,
    state: Arc<ServerState>,
    listening: Mutex<Option<Listening>>,
}

impl DgLabServer {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            bind: config.bind.clone(),
            state: Arc::new(ServerState::new(config)),
            listening: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// The port actually bound, while listening.
    pub fn port(&self) -> Option<u16> {
        self.lock_listening().as_ref().map(|l| l.port)
    }

    /// Pairing URL for the DG-LAB app. `host` falls back to the detected
    /// LAN address, then to `127.0.0.1`.
    pub fn pairing_url(&self, host: Option<&str>) -> Option<String> {
        let port = self.port()?;
        let control = self.state.control()?;
        let host = match host {
            Some(host) => host.to_string(),
            None => detect_local_ip()
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "127.0.0.1".to_string()),
        };
        Some(protocol::pairing_url(&host, port, &control))
    }

    fn lock_listening(&self) -> MutexGuard<'_, Option<Listening>> {
        self.listening.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn listen(&self, port: u16) -> Result<ControlIdentity, ServerError> {
        if let Some(current) = self.port() {
            return Err(ServerError::AlreadyListening(current));
        }

        let addr = format!("{}:{port}", self.bind);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let port = listener.local_addr()?.port();

        let control = ControlIdentity::new(Uuid::new_v4().to_string());
        self.state.set_control(Some(control.clone()));

        let (shutdown, shutdown_rx) = oneshot::channel();
        let app = build_router(Arc::clone(&self.state));
        let state = Arc::clone(&self.state);
        let serve = tokio::spawn(async move {
            let stop_requested = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&stop_requested);
            let serving = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                if shutdown_rx.await.is_ok() {
                    flag.store(true, Ordering::SeqCst);
                }
            });
            let result = AssertUnwindSafe(serving.into_future())
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(std::io::Error::other("listener task panicked")));
            report_listener_exit(&state, result, stop_requested.load(Ordering::SeqCst));
        });
        let heartbeat = tokio::spawn(heartbeat_loop(Arc::clone(&self.state)));

        *self.lock_listening() = Some(Listening {
            port,
            shutdown,
            serve,
            heartbeat,
        });
        info!(port, control = %control, "control channel listening");
        Ok(control)
    }
}

impl BindingRegistry for DgLabServer {
    fn list_connected_endpoints(&self) -> BTreeSet<EndpointIdentity> {
        self.state.connected()
    }

    fn list_bound_endpoints(&self, control: &ControlIdentity) -> BTreeSet<EndpointIdentity> {
        self.state.bound_to(control)
    }

    fn active_connection_count(&self) -> usize {
        self.state.connection_count()
    }
}

impl Transport for DgLabServer {
    async fn start_listening(&self, port: u16) -> dglab_core::Result<ControlIdentity> {
        Ok(self.listen(port).await?)
    }

    async fn stop_listening(&self) {
        let listening = self.lock_listening().take();
        let Some(listening) = listening else {
            return;
        };

        let _ = listening.shutdown.send(());
        listening.heartbeat.abort();
        self.state.close_all();

        let mut serve = listening.serve;
        if tokio::time::timeout(STOP_TIMEOUT, &mut serve).await.is_err() {
            warn!("listener did not stop in time; aborting");
            serve.abort();
        }
        self.state.set_control(None);
        info!(port = listening.port, "control channel closed");
    }

    async fn send_to(&self, endpoint: &EndpointIdentity, command: StimCommand) -> bool {
        let Some(control) = self.state.control() else {
            return false;
        };
        if !self.state.is_bound(endpoint, &control) {
            debug!(endpoint = endpoint.short(), "send to unbound endpoint skipped");
            return false;
        }
        let frame = encode_command(&control, endpoint, command).to_json();
        self.state.deliver(endpoint, frame).await
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.state.subscribe()
    }
}

/// Publish a listener-level [`TransportEvent::ChannelError`] unless the
/// listener ended because `stop_listening` asked it to.
fn report_listener_exit(
    state: &ServerState,
    result: std::io::Result<()>,
    stop_requested: bool,
) -> bool {
    let message = match result {
        Ok(()) if stop_requested => return false,
        Ok(()) => "listener ended without a stop request".to_string(),
        Err(e) => e.to_string(),
    };
    error!(error = %message, "control channel listener failed");
    state.publish(TransportEvent::ChannelError {
        endpoint: None,
        message,
    });
    true
}

async fn heartbeat_loop(state: Arc<ServerState>) {
    let period = state.heartbeat_interval();
    if period.is_zero() {
        return;
    }
    let mut ticker = tokio::time::interval(period);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        for (endpoint, control) in state.heartbeat_targets() {
            state.enqueue(
                &endpoint,
                WireMessage::heartbeat(&endpoint, control.as_ref()).to_json(),
            );
        }
    }
}

/// LAN address of the default route. No packet is sent: connecting a UDP
/// socket only selects the outgoing interface.
pub fn detect_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}
