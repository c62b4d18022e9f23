use serde::Serialize;
use tokio::sync::broadcast;

use crate::orchestrator::OrchestratorState;
use crate::transport::TransportEvent;
use crate::types::{Channel, DispatchResult, EventClass, WaveProfile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Debounced,
    QueueFull,
    NotReady,
}

/// Status updates published by the orchestrator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    StateChanged {
        from: OrchestratorState,
        to: OrchestratorState,
    },
    EventAccepted {
        class: EventClass,
        profile: WaveProfile,
    },
    EventDropped {
        class: EventClass,
        reason: DropReason,
    },
    DispatchTick {
        channels: Vec<Channel>,
        tick: u32,
        targeted: usize,
        succeeded: usize,
    },
    DispatchFinished {
        class: EventClass,
        result: DispatchResult,
    },
    EmergencyStop {
        commands: usize,
        succeeded: usize,
    },
    /// Control channel activity, forwarded as-is.
    Transport { event: TransportEvent },
}

/// Fan-out point for [`OrchestratorEvent`]s. Publishing never blocks and
/// never fails; with no subscribers events are simply discarded.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: OrchestratorEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(256)
    }
}
