use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use crate::events::{EventSink, OrchestratorEvent};
use crate::registry::live_targets;
use crate::signal::Signals;
use crate::transport::{send_contained, Transport};
use crate::types::{Channel, ControlIdentity, StimCommand};

/// Clears and zeroes both channels on every bound endpoint.
///
/// Independent of any in-flight dispatch: it takes no lock a dispatch holds
/// and never waits for a tick delay.
pub struct EmergencyStop<T> {
    transport: Arc<T>,
    control: ControlIdentity,
    signals: Signals,
    events: EventSink,
}

impl<T: Transport> EmergencyStop<T> {
    pub fn new(
        transport: Arc<T>,
        control: ControlIdentity,
        signals: Signals,
        events: EventSink,
    ) -> Self {
        Self {
            transport,
            control,
            signals,
            events,
        }
    }

    /// `true` only if every command reached its endpoint. With nothing bound
    /// the stop cannot be confirmed and reports `false`.
    pub async fn trigger(&self) -> bool {
        // Raised first so dispatches that yield to a stop fire no more ticks.
        self.signals.raise_stop();

        let targets = live_targets(&*self.transport, &self.control);
        if targets.is_empty() {
            warn!("emergency stop: no bound endpoints");
            self.events.publish(OrchestratorEvent::EmergencyStop {
                commands: 0,
                succeeded: 0,
            });
            return false;
        }

        let mut sends = Vec::with_capacity(targets.len() * 4);
        for endpoint in &targets {
            for &channel in Channel::all() {
                for command in [
                    StimCommand::Clear { channel },
                    StimCommand::ZeroStrength { channel },
                ] {
                    sends.push(send_contained(&*self.transport, endpoint, command));
                }
            }
        }
        let results = join_all(sends).await;

        let commands = results.len();
        let succeeded = results.iter().filter(|ok| **ok).count();
        let all_ok = succeeded == commands;
        if all_ok {
            info!(endpoints = targets.len(), commands, "emergency stop executed");
        } else {
            warn!(
                endpoints = targets.len(),
                failed = commands - succeeded,
                commands,
                "emergency stop partially failed"
            );
        }
        self.events.publish(OrchestratorEvent::EmergencyStop {
            commands,
            succeeded,
        });
        all_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;

    fn estop(mock: &Arc<MockTransport>) -> EmergencyStop<MockTransport> {
        EmergencyStop::new(
            Arc::clone(mock),
            mock.control(),
            Signals::new(),
            EventSink::default(),
        )
    }

    #[tokio::test]
    async fn two_endpoints_get_eight_commands() {
        let mock = Arc::new(MockTransport::new());
        mock.connect_bound("app-1");
        mock.connect_bound("app-2");

        assert!(estop(&mock).trigger().await);

        let sends = mock.sends();
        assert_eq!(sends.len(), 8);
        for endpoint in ["app-1", "app-2"] {
            for channel in [Channel::A, Channel::B] {
                for command in [
                    StimCommand::Clear { channel },
                    StimCommand::ZeroStrength { channel },
                ] {
                    assert!(sends
                        .iter()
                        .any(|s| s.endpoint.as_str() == endpoint && s.command == command));
                }
            }
        }
    }

    #[tokio::test]
    async fn one_failure_fails_the_stop_but_all_are_attempted() {
        let mock = Arc::new(MockTransport::new());
        mock.connect_bound("app-1");
        mock.connect_bound("app-2");
        mock.fail_command(
            "app-1",
            StimCommand::Clear {
                channel: Channel::B,
            },
        );

        assert!(!estop(&mock).trigger().await);
        assert_eq!(mock.send_count(), 8);
    }

    #[tokio::test]
    async fn no_bound_endpoints_is_false_and_silent_every_time() {
        let mock = Arc::new(MockTransport::new());
        mock.connect("app-1");
        let stop = estop(&mock);

        assert!(!stop.trigger().await);
        assert!(!stop.trigger().await);
        assert_eq!(mock.send_count(), 0);
    }

    #[tokio::test]
    async fn unbound_connections_are_skipped() {
        let mock = Arc::new(MockTransport::new());
        mock.connect_bound("app-1");
        mock.connect("stranger");

        assert!(estop(&mock).trigger().await);
        let sends = mock.sends();
        assert_eq!(sends.len(), 4);
        assert!(sends.iter().all(|s| s.endpoint.as_str() == "app-1"));
    }

    #[tokio::test]
    async fn panicking_endpoint_counts_as_failure() {
        let mock = Arc::new(MockTransport::new());
        mock.connect_bound("app-1");
        mock.connect_bound("app-2");
        mock.panic_on("app-2");

        assert!(!estop(&mock).trigger().await);
        assert_eq!(mock.send_count(), 8);
    }

    #[tokio::test]
    async fn trigger_raises_stop_generation() {
        let mock = Arc::new(MockTransport::new());
        let signals = Signals::new();
        let interrupts = signals.interrupts(true);
        let stop = EmergencyStop::new(
            Arc::clone(&mock),
            mock.control(),
            signals.clone(),
            EventSink::default(),
        );
        let before = interrupts.stop_generation();
        stop.trigger().await;
        assert!(interrupts.is_raised(before));
    }
}
