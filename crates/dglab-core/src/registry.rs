use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::transport::BindingRegistry;
use crate::types::{ControlIdentity, EndpointIdentity};

/// Endpoints that may receive commands right now: connected AND bound to
/// `control`.
///
/// Re-derived on every call; callers must not cache the result across ticks.
pub fn live_targets<R: BindingRegistry>(
    registry: &R,
    control: &ControlIdentity,
) -> BTreeSet<EndpointIdentity> {
    let connected = registry.list_connected_endpoints();
    let bound = registry.list_bound_endpoints(control);
    connected.intersection(&bound).cloned().collect()
}

/// Point-in-time endpoint counts for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EndpointCounts {
    /// Every open connection, bound or not.
    pub active_connections: usize,
    pub connected_endpoints: usize,
    /// Connected endpoints bound to this orchestrator.
    pub bound_endpoints: usize,
}

impl EndpointCounts {
    pub fn snapshot<R: BindingRegistry>(registry: &R, control: Option<&ControlIdentity>) -> Self {
        let connected = registry.list_connected_endpoints();
        let bound_endpoints = match control {
            Some(control) => registry
                .list_bound_endpoints(control)
                .intersection(&connected)
                .count(),
            None => 0,
        };
        Self {
            active_connections: registry.active_connection_count(),
            connected_endpoints: connected.len(),
            bound_endpoints,
        }
    }
}
