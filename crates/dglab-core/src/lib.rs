pub mod config;
pub mod debounce;
pub mod error;
pub mod estop;
pub mod events;
pub mod io;
pub mod orchestrator;
pub mod profile;
pub mod registry;
pub mod scheduler;
pub mod signal;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{OrchestratorError, Result};
pub use events::{DropReason, EventSink, OrchestratorEvent};
pub use orchestrator::{Orchestrator, OrchestratorState, StatusReport};
pub use profile::HostEvent;
pub use transport::{BindingRegistry, Transport, TransportEvent};
pub use types::{
    Channel, ControlIdentity, DeathKind, DispatchResult, EndpointIdentity, EventClass,
    StimCommand, WaveProfile, Waveform,
};
