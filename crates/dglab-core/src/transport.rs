//! Contracts the core consumes from the control-channel transport.
//!
//! The transport owns connection state, binding membership and the wire
//! encoding. The core only takes point-in-time reads of the registry and
//! hands [`StimCommand`]s to [`Transport::send_to`].

use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{ControlIdentity, EndpointIdentity, StimCommand};
use crate::Result;

/// Read-only view of who is connected and who is bound to whom.
pub trait BindingRegistry: Send + Sync + 'static {
    fn list_connected_endpoints(&self) -> BTreeSet<EndpointIdentity>;

    fn list_bound_endpoints(&self, control: &ControlIdentity) -> BTreeSet<EndpointIdentity>;

    /// Every open connection, bound or not.
    fn active_connection_count(&self) -> usize;
}

/// The send side of the control channel.
///
/// Futures are `Send` so dispatches can run on spawned tasks.
pub trait Transport: BindingRegistry {
    /// Start accepting connections on `port` and return the identity the
    /// orchestrator holds for the lifetime of the channel.
    fn start_listening(&self, port: u16) -> impl Future<Output = Result<ControlIdentity>> + Send;

    fn stop_listening(&self) -> impl Future<Output = ()> + Send;

    /// `true` when the endpoint acknowledged (or the frame was delivered).
    fn send_to(
        &self,
        endpoint: &EndpointIdentity,
        command: StimCommand,
    ) -> impl Future<Output = bool> + Send;

    /// Connection lifecycle notifications.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

// ---------------------------------------------------------------------------
// TransportEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    EndpointConnected {
        endpoint: EndpointIdentity,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer: Option<String>,
    },
    EndpointDisconnected {
        endpoint: EndpointIdentity,
    },
    /// A socket- or listener-level failure.
    ChannelError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<EndpointIdentity>,
        message: String,
    },
    BindSucceeded {
        endpoint: EndpointIdentity,
    },
    BindFailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<EndpointIdentity>,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Send one command, turning a panic inside the transport into a failed
/// send so a single endpoint cannot abort the rest of a fan-out.
pub(crate) async fn send_contained<T: Transport>(
    transport: &T,
    endpoint: &EndpointIdentity,
    command: StimCommand,
) -> bool {
    match AssertUnwindSafe(transport.send_to(endpoint, command))
        .catch_unwind()
        .await
    {
        Ok(delivered) => delivered,
        Err(_) => {
            tracing::error!(
                endpoint = endpoint.short(),
                channel = %command.channel(),
                "transport panicked while sending"
            );
            false
        }
    }
}
