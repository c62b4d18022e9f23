use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dglab_core::config::ServerConfig;
use dglab_core::types::{ControlIdentity, EndpointIdentity};
use dglab_core::TransportEvent;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::protocol::code;

/// Frames queued for one connection's writer task.
const OUTBOUND_CAPACITY: usize = 32;

/// A text frame for the writer task. `ack` resolves once the frame was
/// written to the socket (or failed to be).
pub(crate) struct Outbound {
    pub text: String,
    pub ack: Option<oneshot::Sender<bool>>,
}

struct ClientHandle {
    tx: mpsc::Sender<Outbound>,
}

#[derive(Default)]
struct Registry {
    control: Option<ControlIdentity>,
    clients: HashMap<EndpointIdentity, ClientHandle>,
    /// endpoint -> the controller it is bound to
    bindings: HashMap<EndpointIdentity, ControlIdentity>,
}

/// Connection and binding state shared by the socket handlers and
/// [`crate::DgLabServer`].
pub struct ServerState {
    registry: Mutex<Registry>,
    events: broadcast::Sender<TransportEvent>,
    send_timeout: Duration,
    heartbeat: Duration,
}

impl ServerState {
    pub fn new(config: &ServerConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            registry: Mutex::new(Registry::default()),
            events,
            send_timeout: config.send_timeout(),
            heartbeat: Duration::from_secs(config.heartbeat_secs),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat
    }

    pub fn control(&self) -> Option<ControlIdentity> {
        self.lock().control.clone()
    }

    pub(crate) fn set_control(&self, control: Option<ControlIdentity>) {
        self.lock().control = control;
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    pub fn publish(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    pub(crate) fn register(&self, endpoint: EndpointIdentity) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        self.lock().clients.insert(endpoint, ClientHandle { tx });
        rx
    }

    /// Forget a connection and any binding it held.
    pub(crate) fn unregister(&self, endpoint: &EndpointIdentity) {
        let mut reg = self.lock();
        reg.clients.remove(endpoint);
        reg.bindings.remove(endpoint);
    }

    /// Drop every connection's writer, which closes the sockets.
    pub(crate) fn close_all(&self) {
        let mut reg = self.lock();
        reg.clients.clear();
        reg.bindings.clear();
    }

    pub fn connected(&self) -> BTreeSet<EndpointIdentity> {
        self.lock().clients.keys().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().clients.len()
    }

    // -----------------------------------------------------------------------
    // Bindings
    // -----------------------------------------------------------------------

    /// Bind `endpoint` to the controller named `control_id`. Returns the
    /// protocol result code.
    pub(crate) fn bind(&self, control_id: &str, endpoint: &EndpointIdentity) -> &'static str {
        let mut reg = self.lock();
        let control = match &reg.control {
            Some(control) if control.as_str() == control_id => control.clone(),
            _ => return code::UNKNOWN_TARGET,
        };
        if !reg.clients.contains_key(endpoint) {
            return code::UNKNOWN_TARGET;
        }
        if reg.bindings.contains_key(endpoint) {
            return code::ALREADY_BOUND;
        }
        reg.bindings.insert(endpoint.clone(), control);
        code::OK
    }

    pub fn is_bound(&self, endpoint: &EndpointIdentity, control: &ControlIdentity) -> bool {
        self.lock().bindings.get(endpoint) == Some(control)
    }

    pub fn bound_to(&self, control: &ControlIdentity) -> BTreeSet<EndpointIdentity> {
        self.lock()
            .bindings
            .iter()
            .filter(|(_, c)| *c == control)
            .map(|(e, _)| e.clone())
            .collect()
    }

    pub(crate) fn heartbeat_targets(&self) -> Vec<(EndpointIdentity, Option<ControlIdentity>)> {
        let reg = self.lock();
        reg.clients
            .keys()
            .map(|e| (e.clone(), reg.bindings.get(e).cloned()))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    fn sender(&self, endpoint: &EndpointIdentity) -> Option<mpsc::Sender<Outbound>> {
        self.lock().clients.get(endpoint).map(|c| c.tx.clone())
    }

    /// Queue a frame without waiting for it. Used for replies and
    /// heartbeats; a full or closed queue drops the frame.
    pub(crate) fn enqueue(&self, endpoint: &EndpointIdentity, text: String) -> bool {
        match self.sender(endpoint) {
            Some(tx) => tx.try_send(Outbound { text, ack: None }).is_ok(),
            None => false,
        }
    }

    /// Queue a frame and wait until the writer has put it on the socket,
    /// bounded by the send timeout.
    pub(crate) async fn deliver(&self, endpoint: &EndpointIdentity, text: String) -> bool {
        let Some(tx) = self.sender(endpoint) else {
            return false;
        };
        let (ack, acked) = oneshot::channel();
        let delivery = async move {
            tx.send(Outbound {
                text,
                ack: Some(ack),
            })
            .await
            .ok()?;
            acked.await.ok()
        };
        matches!(
            tokio::time::timeout(self.send_timeout, delivery).await,
            Ok(Some(true))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_control() -> (ServerState, ControlIdentity) {
        let state = ServerState::new(&ServerConfig::default());
        let control = ControlIdentity::new("ctl-1");
        state.set_control(Some(control.clone()));
        (state, control)
    }

    #[test]
    fn bind_result_codes() {
        let (state, control) = state_with_control();
        let app = EndpointIdentity::new("app-1");

        // not connected yet
        assert_eq!(state.bind("ctl-1", &app), code::UNKNOWN_TARGET);

        let _rx = state.register(app.clone());
        assert_eq!(state.bind("someone-else", &app), code::UNKNOWN_TARGET);
        assert_eq!(state.bind("ctl-1", &app), code::OK);
        assert_eq!(state.bind("ctl-1", &app), code::ALREADY_BOUND);

        assert!(state.is_bound(&app, &control));
        assert_eq!(state.bound_to(&control).len(), 1);
    }

    #[test]
    fn unregister_drops_binding() {
        let (state, control) = state_with_control();
        let app = EndpointIdentity::new("app-1");
        let _rx = state.register(app.clone());
        state.bind("ctl-1", &app);

        state.unregister(&app);
        assert!(state.connected().is_empty());
        assert!(state.bound_to(&control).is_empty());
    }

    #[tokio::test]
    async fn deliver_waits_for_writer_ack() {
        let (state, _control) = state_with_control();
        let app = EndpointIdentity::new("app-1");
        let mut rx = state.register(app.clone());

        let writer = tokio::spawn(async move {
            let out = rx.recv().await.unwrap();
            assert_eq!(out.text, "hello");
            out.ack.unwrap().send(true).unwrap();
        });

        assert!(state.deliver(&app, "hello".into()).await);
        writer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn deliver_times_out_without_ack() {
        let (state, _control) = state_with_control();
        let app = EndpointIdentity::new("app-1");
        let _rx = state.register(app.clone());

        assert!(!state.deliver(&app, "hello".into()).await);
    }

    #[tokio::test]
    async fn deliver_to_unknown_endpoint_fails() {
        let (state, _control) = state_with_control();
        assert!(!state.deliver(&EndpointIdentity::new("nobody"), "x".into()).await);
    }
}
