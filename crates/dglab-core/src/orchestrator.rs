//! The orchestration facade.
//!
//! [`Orchestrator`] owns the lifecycle state machine and composes the
//! debouncer, profile resolver, dispatch scheduler and emergency stop behind
//! the operations a host adapter calls. Host events are fire-and-forget: they
//! are queued onto a bounded job channel drained by one worker task that caps
//! how many dispatch sequences run at once.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::debounce::Debouncer;
use crate::error::{OrchestratorError, Result};
use crate::estop::EmergencyStop;
use crate::events::{DropReason, EventSink, OrchestratorEvent};
use crate::profile::HostEvent;
use crate::registry::EndpointCounts;
use crate::scheduler::Dispatcher;
use crate::signal::Signals;
use crate::transport::{Transport, TransportEvent};
use crate::types::{ControlIdentity, DeathKind};

// ---------------------------------------------------------------------------
// OrchestratorState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Uninitialized,
    Initializing,
    Ready,
    Degraded,
    ShuttingDown,
    Stopped,
}

impl OrchestratorState {
    pub fn as_str(self) -> &'static str {
        match self {
            OrchestratorState::Uninitialized => "uninitialized",
            OrchestratorState::Initializing => "initializing",
            OrchestratorState::Ready => "ready",
            OrchestratorState::Degraded => "degraded",
            OrchestratorState::ShuttingDown => "shutting_down",
            OrchestratorState::Stopped => "stopped",
        }
    }

    /// Host events and emergency stops are only served in these states.
    pub fn is_operational(self) -> bool {
        matches!(self, OrchestratorState::Ready | OrchestratorState::Degraded)
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StatusReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: OrchestratorState,
    /// `true` only in `Ready`.
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_identity: Option<ControlIdentity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(flatten)]
    pub endpoints: EndpointCounts,
    /// When the current state was entered.
    pub since: DateTime<Utc>,
}

impl StatusReport {
    pub fn summary(&self) -> String {
        let port = self
            .port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{} (port {port}, {} connection(s), {} bound)",
            self.state, self.endpoints.active_connections, self.endpoints.bound_endpoints
        )
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct Session<T> {
    control: ControlIdentity,
    port: u16,
    jobs: mpsc::Sender<HostEvent>,
    estop: Arc<EmergencyStop<T>>,
    worker: JoinHandle<()>,
    watcher: JoinHandle<()>,
}

struct Lifecycle<T> {
    state: OrchestratorState,
    changed_at: DateTime<Utc>,
    session: Option<Session<T>>,
}

struct Inner<T> {
    config: Config,
    transport: Arc<T>,
    debouncer: Debouncer,
    signals: Signals,
    events: EventSink,
    lifecycle: Mutex<Lifecycle<T>>,
    /// Serializes `start` and `shutdown`.
    control_ops: tokio::sync::Mutex<()>,
}

/// Explicitly owned orchestrator instance. Cheap to clone; clones share state.
pub struct Orchestrator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Orchestrator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Orchestrator<T> {
    pub fn new(config: Config, transport: Arc<T>) -> Self {
        let debouncer = Debouncer::from_config(&config.debounce);
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                debouncer,
                signals: Signals::new(),
                events: EventSink::default(),
                lifecycle: Mutex::new(Lifecycle {
                    state: OrchestratorState::Uninitialized,
                    changed_at: Utc::now(),
                    session: None,
                }),
                control_ops: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    pub fn state(&self) -> OrchestratorState {
        self.inner.lock().state
    }

    pub fn events(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.inner.events.subscribe()
    }

    /// Bring the control channel up, falling back through the configured
    /// port search span. On failure the orchestrator is left `Stopped` and
    /// `start` may be called again.
    pub async fn start(&self) -> Result<ControlIdentity> {
        let _ops = self.inner.control_ops.lock().await;
        {
            let mut lc = self.inner.lock();
            match lc.state {
                OrchestratorState::Uninitialized | OrchestratorState::Stopped => {}
                state => return Err(OrchestratorError::InvalidState { op: "start", state }),
            }
            self.inner
                .transition(&mut lc, OrchestratorState::Initializing);
        }

        self.inner.signals.reset();
        // Subscribe before listening so no connect or bind is missed.
        let transport_events = self.inner.transport.subscribe();

        let server = &self.inner.config.server;
        let mut listening = None;
        for port in server.candidate_ports() {
            match self.inner.transport.start_listening(port).await {
                Ok(control) => {
                    listening = Some((control, port));
                    break;
                }
                Err(e) => debug!(port, error = %e, "port unusable"),
            }
        }

        let Some((control, port)) = listening else {
            let first = server.port;
            let last = first.saturating_add(server.port_search_span);
            error!(first, last, "no usable listening port");
            let mut lc = self.inner.lock();
            self.inner.transition(&mut lc, OrchestratorState::Stopped);
            return Err(OrchestratorError::NoUsablePort { first, last });
        };

        let dispatch = &self.inner.config.dispatch;
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.inner.transport),
            control.clone(),
            dispatch.cadence,
            self.inner
                .signals
                .interrupts(dispatch.yield_to_emergency_stop),
            self.inner.events.clone(),
        ));
        let estop = Arc::new(EmergencyStop::new(
            Arc::clone(&self.inner.transport),
            control.clone(),
            self.inner.signals.clone(),
            self.inner.events.clone(),
        ));
        let (jobs, queue) = mpsc::channel(dispatch.queue_capacity.max(1));
        let worker = tokio::spawn(run_worker(
            dispatcher,
            queue,
            dispatch.max_concurrent,
            self.inner.events.clone(),
        ));
        let watcher = tokio::spawn(watch_transport(
            Arc::downgrade(&self.inner),
            transport_events,
        ));

        let mut lc = self.inner.lock();
        lc.session = Some(Session {
            control: control.clone(),
            port,
            jobs,
            estop,
            worker,
            watcher,
        });
        self.inner.transition(&mut lc, OrchestratorState::Ready);
        info!(port, control = %control, "orchestrator ready");
        Ok(control)
    }

    /// Queue a damage dispatch. `false` when not running, debounced, or the
    /// job queue is full.
    pub fn handle_damage_event(&self, magnitude: i32) -> bool {
        self.submit(HostEvent::Damage { magnitude })
    }

    /// Queue a death dispatch. Deaths are never debounced.
    pub fn handle_death_event(&self, kind: DeathKind) -> bool {
        info!(kind = %kind, "death event");
        self.submit(HostEvent::Death { kind })
    }

    pub fn submit(&self, event: HostEvent) -> bool {
        let class = event.class();
        let jobs = {
            let lc = self.inner.lock();
            if lc.state.is_operational() {
                lc.session.as_ref().map(|s| s.jobs.clone())
            } else {
                None
            }
        };
        let Some(jobs) = jobs else {
            debug!(%class, "event ignored: not running");
            self.inner.events.publish(OrchestratorEvent::EventDropped {
                class,
                reason: DropReason::NotReady,
            });
            return false;
        };

        if !self.inner.debouncer.should_accept(class, Instant::now()) {
            debug!(%class, "event debounced");
            self.inner.events.publish(OrchestratorEvent::EventDropped {
                class,
                reason: DropReason::Debounced,
            });
            return false;
        }

        let profile = event.profile();
        match jobs.try_send(event) {
            Ok(()) => {
                debug!(
                    %class,
                    waveform = %profile.waveform,
                    duration_secs = profile.duration_secs,
                    "event queued"
                );
                self.inner
                    .events
                    .publish(OrchestratorEvent::EventAccepted { class, profile });
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(%class, "dispatch queue full; event dropped");
                self.inner.events.publish(OrchestratorEvent::EventDropped {
                    class,
                    reason: DropReason::QueueFull,
                });
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.inner.events.publish(OrchestratorEvent::EventDropped {
                    class,
                    reason: DropReason::NotReady,
                });
                false
            }
        }
    }

    /// Clear and zero every channel on every bound endpoint. `false` when not
    /// running, when nothing is bound, or when any command failed.
    pub async fn emergency_stop(&self) -> bool {
        let estop = {
            let lc = self.inner.lock();
            if lc.state.is_operational() {
                lc.session.as_ref().map(|s| Arc::clone(&s.estop))
            } else {
                None
            }
        };
        let Some(estop) = estop else {
            warn!(state = %self.state(), "emergency stop ignored: not running");
            return false;
        };
        estop.trigger().await
    }

    /// Always answerable, in every state.
    pub fn status(&self) -> StatusReport {
        let (state, since, control, port) = {
            let lc = self.inner.lock();
            let session = lc.session.as_ref();
            (
                lc.state,
                lc.changed_at,
                session.map(|s| s.control.clone()),
                session.map(|s| s.port),
            )
        };
        let endpoints = EndpointCounts::snapshot(&*self.inner.transport, control.as_ref());
        StatusReport {
            state,
            healthy: state == OrchestratorState::Ready,
            control_identity: control,
            port,
            endpoints,
            since,
        }
    }

    /// Tear down. In-flight dispatches stop before their next tick and get
    /// `shutdown.grace_period_ms` to finish the current one before they are
    /// cancelled. A no-op when already stopped or never started.
    pub async fn shutdown(&self) -> Result<()> {
        let _ops = self.inner.control_ops.lock().await;
        let session = {
            let mut lc = self.inner.lock();
            match lc.state {
                OrchestratorState::Ready | OrchestratorState::Degraded => {}
                OrchestratorState::Uninitialized | OrchestratorState::Stopped => return Ok(()),
                state => {
                    return Err(OrchestratorError::InvalidState {
                        op: "shut down",
                        state,
                    })
                }
            }
            self.inner
                .transition(&mut lc, OrchestratorState::ShuttingDown);
            lc.session.take()
        };

        let grace = self.inner.config.shutdown.grace_period();
        self.inner.signals.request_shutdown();

        if let Some(Session {
            jobs,
            mut worker,
            watcher,
            ..
        }) = session
        {
            // Closing the queue lets the worker exit once running jobs end.
            drop(jobs);
            match tokio::time::timeout(grace, &mut worker).await {
                Ok(_) => debug!("dispatch worker drained"),
                Err(_) => {
                    warn!(
                        grace_ms = grace.as_millis() as u64,
                        "grace period elapsed; cancelling in-flight dispatches"
                    );
                    worker.abort();
                }
            }
            self.inner.transport.stop_listening().await;
            watcher.abort();
        }

        let mut lc = self.inner.lock();
        self.inner.transition(&mut lc, OrchestratorState::Stopped);
        info!("orchestrator stopped");
        Ok(())
    }
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, Lifecycle<T>> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, lc: &mut Lifecycle<T>, to: OrchestratorState) {
        let from = lc.state;
        if from == to {
            return;
        }
        lc.state = to;
        lc.changed_at = Utc::now();
        debug!(%from, %to, "state changed");
        self.events
            .publish(OrchestratorEvent::StateChanged { from, to });
    }

    /// Transport events only ever move the facade between `Ready` and
    /// `Degraded`.
    fn observe(&self, event: &TransportEvent) {
        let mut lc = self.lock();
        match event {
            TransportEvent::ChannelError { endpoint, message } => {
                match endpoint {
                    // One endpoint's socket failing leaves the channel usable.
                    Some(endpoint) => {
                        warn!(endpoint = endpoint.short(), message = %message, "endpoint error")
                    }
                    None => {
                        warn!(message = %message, "control channel error");
                        if lc.state == OrchestratorState::Ready {
                            self.transition(&mut lc, OrchestratorState::Degraded);
                        }
                    }
                }
            }
            TransportEvent::EndpointConnected { endpoint, peer } => {
                info!(endpoint = endpoint.short(), peer = ?peer, "endpoint connected");
                self.recover(&mut lc);
            }
            TransportEvent::BindSucceeded { endpoint } => {
                info!(endpoint = endpoint.short(), "endpoint bound");
                self.recover(&mut lc);
            }
            TransportEvent::EndpointDisconnected { endpoint } => {
                info!(endpoint = endpoint.short(), "endpoint disconnected");
            }
            TransportEvent::BindFailed { endpoint, reason } => {
                warn!(
                    endpoint = endpoint.as_ref().map(|e| e.short()),
                    reason = %reason,
                    "bind failed"
                );
            }
        }
        drop(lc);
        self.events
            .publish(OrchestratorEvent::Transport {
                event: event.clone(),
            });
    }

    fn recover(&self, lc: &mut Lifecycle<T>) {
        if lc.state == OrchestratorState::Degraded {
            info!("control channel recovered");
            self.transition(lc, OrchestratorState::Ready);
        }
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn run_worker<T: Transport>(
    dispatcher: Arc<Dispatcher<T>>,
    mut queue: mpsc::Receiver<HostEvent>,
    max_concurrent: usize,
    events: EventSink,
) {
    let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut running = JoinSet::new();

    while let Some(event) = queue.recv().await {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let dispatcher = Arc::clone(&dispatcher);
        let events = events.clone();
        running.spawn(async move {
            let _permit = permit;
            let class = event.class();
            let profile = event.profile();
            let result = dispatcher
                .dispatch_all_channels(profile, profile.duration_secs)
                .await;
            if !result.success() && result.targeted > 0 {
                warn!(%class, targeted = result.targeted, "dispatch delivered nothing");
            }
            events.publish(OrchestratorEvent::DispatchFinished { class, result });
        });

        while let Some(done) = running.try_join_next() {
            log_join(done);
        }
    }

    while let Some(done) = running.join_next().await {
        log_join(done);
    }
}

fn log_join(done: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = done {
        if e.is_panic() {
            error!("dispatch task panicked");
        }
    }
}

async fn watch_transport<T: Transport>(
    inner: Weak<Inner<T>>,
    mut events: broadcast::Receiver<TransportEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.observe(&event);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "transport events lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
