//! In-memory transport used by the unit tests.

use std::collections::{BTreeSet, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::transport::{BindingRegistry, Transport, TransportEvent};
use crate::types::{ControlIdentity, EndpointIdentity, StimCommand};
use crate::{OrchestratorError, Result};

#[derive(Debug, Clone)]
pub(crate) struct SentCommand {
    pub at: Instant,
    pub endpoint: EndpointIdentity,
    pub command: StimCommand,
}

pub(crate) struct MockTransport {
    control: ControlIdentity,
    connected: Mutex<BTreeSet<EndpointIdentity>>,
    bound: Mutex<BTreeSet<EndpointIdentity>>,
    sends: Mutex<Vec<SentCommand>>,
    failing: Mutex<HashSet<(EndpointIdentity, StimCommand)>>,
    failing_endpoints: Mutex<HashSet<EndpointIdentity>>,
    panicking_endpoints: Mutex<HashSet<EndpointIdentity>>,
    send_delay: Mutex<Option<Duration>>,
    unusable_ports: Mutex<HashSet<u16>>,
    listening: Mutex<Option<u16>>,
    events: broadcast::Sender<TransportEvent>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            control: ControlIdentity::new("ctl-test"),
            connected: Mutex::new(BTreeSet::new()),
            bound: Mutex::new(BTreeSet::new()),
            sends: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            failing_endpoints: Mutex::new(HashSet::new()),
            panicking_endpoints: Mutex::new(HashSet::new()),
            send_delay: Mutex::new(None),
            unusable_ports: Mutex::new(HashSet::new()),
            listening: Mutex::new(None),
            events,
        }
    }

    pub fn control(&self) -> ControlIdentity {
        self.control.clone()
    }

    pub fn connect(&self, id: &str) {
        self.connected
            .lock()
            .unwrap()
            .insert(EndpointIdentity::new(id));
    }

    pub fn disconnect(&self, id: &str) {
        self.connected
            .lock()
            .unwrap()
            .remove(&EndpointIdentity::new(id));
    }

    pub fn bind(&self, id: &str) {
        self.bound.lock().unwrap().insert(EndpointIdentity::new(id));
    }

    pub fn unbind(&self, id: &str) {
        self.bound.lock().unwrap().remove(&EndpointIdentity::new(id));
    }

    pub fn connect_bound(&self, id: &str) {
        self.connect(id);
        self.bind(id);
    }

    pub fn fail_command(&self, id: &str, command: StimCommand) {
        self.failing
            .lock()
            .unwrap()
            .insert((EndpointIdentity::new(id), command));
    }

    pub fn fail_endpoint(&self, id: &str) {
        self.failing_endpoints
            .lock()
            .unwrap()
            .insert(EndpointIdentity::new(id));
    }

    pub fn panic_on(&self, id: &str) {
        self.panicking_endpoints
            .lock()
            .unwrap()
            .insert(EndpointIdentity::new(id));
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = Some(delay);
    }

    pub fn refuse_port(&self, port: u16) {
        self.unusable_ports.lock().unwrap().insert(port);
    }

    pub fn accept_port(&self, port: u16) {
        self.unusable_ports.lock().unwrap().remove(&port);
    }

    pub fn listening_port(&self) -> Option<u16> {
        *self.listening.lock().unwrap()
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn sends(&self) -> Vec<SentCommand> {
        self.sends.lock().unwrap().clone()
    }

    pub fn send_count(&self) -> usize {
        self.sends.lock().unwrap().len()
    }

    /// Pulse sends grouped by the instant they were issued, in order.
    pub fn pulse_ticks(&self) -> Vec<Vec<SentCommand>> {
        let mut ticks: Vec<Vec<SentCommand>> = Vec::new();
        for sent in self.sends() {
            if !matches!(sent.command, StimCommand::Pulse { .. }) {
                continue;
            }
            match ticks.last_mut() {
                Some(tick) if tick[0].at == sent.at => tick.push(sent),
                _ => ticks.push(vec![sent]),
            }
        }
        ticks
    }
}

impl BindingRegistry for MockTransport {
    fn list_connected_endpoints(&self) -> BTreeSet<EndpointIdentity> {
        self.connected.lock().unwrap().clone()
    }

    fn list_bound_endpoints(&self, control: &ControlIdentity) -> BTreeSet<EndpointIdentity> {
        if *control == self.control {
            self.bound.lock().unwrap().clone()
        } else {
            BTreeSet::new()
        }
    }

    fn active_connection_count(&self) -> usize {
        self.connected.lock().unwrap().len()
    }
}

impl Transport for MockTransport {
    async fn start_listening(&self, port: u16) -> Result<ControlIdentity> {
        if self.unusable_ports.lock().unwrap().contains(&port) {
            return Err(OrchestratorError::Transport(format!(
                "port {port} already in use"
            )));
        }
        *self.listening.lock().unwrap() = Some(port);
        Ok(self.control.clone())
    }

    async fn stop_listening(&self) {
        *self.listening.lock().unwrap() = None;
    }

    async fn send_to(&self, endpoint: &EndpointIdentity, command: StimCommand) -> bool {
        self.sends.lock().unwrap().push(SentCommand {
            at: Instant::now(),
            endpoint: endpoint.clone(),
            command,
        });

        let delay = *self.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.panicking_endpoints.lock().unwrap().contains(endpoint) {
            panic!("injected transport panic");
        }

        let failing_endpoint = self.failing_endpoints.lock().unwrap().contains(endpoint);
        let failing_command = self
            .failing
            .lock()
            .unwrap()
            .contains(&(endpoint.clone(), command));
        !(failing_endpoint || failing_command)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
