//! Timed fan-out of stimulation pulses.
//!
//! One dispatch runs `duration × cadence` ticks. Each tick re-reads the live
//! target set, sends one pulse per (endpoint, channel) pair concurrently and
//! waits for all of them before the inter-tick delay starts. Tick 0's success
//! count is the dispatch's result; later ticks only log and publish.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::events::{EventSink, OrchestratorEvent};
use crate::registry::live_targets;
use crate::signal::Interrupts;
use crate::transport::{send_contained, Transport};
use crate::types::{
    Channel, ControlIdentity, DispatchResult, EndpointIdentity, StimCommand, WaveProfile,
};

struct TickOutcome {
    targeted: usize,
    succeeded: usize,
}

pub struct Dispatcher<T> {
    transport: Arc<T>,
    control: ControlIdentity,
    cadence: u32,
    interrupts: Interrupts,
    events: EventSink,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(
        transport: Arc<T>,
        control: ControlIdentity,
        cadence: u32,
        interrupts: Interrupts,
        events: EventSink,
    ) -> Self {
        Self {
            transport,
            control,
            cadence: cadence.max(1),
            interrupts,
            events,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.cadence))
    }

    /// Run one send sequence on `channels` for `duration_secs` seconds.
    ///
    /// Returns immediately, without sending anything, when no endpoint is
    /// connected and bound. An interrupted sequence returns what it has
    /// accumulated so far.
    pub async fn dispatch(
        &self,
        profile: WaveProfile,
        channels: &[Channel],
        duration_secs: u32,
    ) -> DispatchResult {
        let mut result = DispatchResult::default();
        let duration_secs = duration_secs.max(1);
        let total_ticks = duration_secs.saturating_mul(self.cadence);
        let since = self.interrupts.stop_generation();

        if channels.is_empty() {
            return result;
        }
        if live_targets(&*self.transport, &self.control).is_empty() {
            debug!(waveform = %profile.waveform, "no bound endpoints; dispatch skipped");
            return result;
        }

        for tick in 0..total_ticks {
            if self.interrupts.is_raised(since) {
                result.interrupted = true;
                break;
            }

            let outcome = self.fan_out(profile, channels, duration_secs).await;
            result.ticks_fired += 1;

            if tick == 0 {
                result.succeeded = outcome.succeeded;
                result.targeted = outcome.targeted;
                info!(
                    succeeded = outcome.succeeded,
                    targeted = outcome.targeted,
                    channels = %channel_list(channels),
                    waveform = %profile.waveform,
                    duration_secs,
                    "sent waveform"
                );
            } else if outcome.succeeded < outcome.targeted {
                warn!(
                    tick,
                    failed = outcome.targeted - outcome.succeeded,
                    targeted = outcome.targeted,
                    channels = %channel_list(channels),
                    "pulse sends failed"
                );
            } else {
                debug!(tick, targeted = outcome.targeted, "tick delivered");
            }

            self.events.publish(OrchestratorEvent::DispatchTick {
                channels: channels.to_vec(),
                tick,
                targeted: outcome.targeted,
                succeeded: outcome.succeeded,
            });

            let last = tick + 1 == total_ticks;
            if !last && !self.interrupts.sleep(self.tick_interval(), since).await {
                result.interrupted = true;
                break;
            }
        }

        if result.interrupted {
            debug!(
                ticks_fired = result.ticks_fired,
                total_ticks, "dispatch interrupted"
            );
        }
        result
    }

    /// Dispatch on A and B at the same time; succeeds if either does.
    pub async fn dispatch_all_channels(
        &self,
        profile: WaveProfile,
        duration_secs: u32,
    ) -> DispatchResult {
        let (a, b) = tokio::join!(
            self.dispatch(profile, &[Channel::A], duration_secs),
            self.dispatch(profile, &[Channel::B], duration_secs),
        );
        DispatchResult {
            succeeded: a.succeeded + b.succeeded,
            targeted: a.targeted + b.targeted,
            ticks_fired: a.ticks_fired.max(b.ticks_fired),
            interrupted: a.interrupted || b.interrupted,
        }
    }

    async fn fan_out(
        &self,
        profile: WaveProfile,
        channels: &[Channel],
        duration_secs: u32,
    ) -> TickOutcome {
        let targets = live_targets(&*self.transport, &self.control);
        if targets.is_empty() {
            return TickOutcome {
                targeted: 0,
                succeeded: 0,
            };
        }

        let mut sends = Vec::with_capacity(targets.len() * channels.len());
        for endpoint in &targets {
            for &channel in channels {
                let command = StimCommand::Pulse {
                    channel,
                    waveform: profile.waveform,
                    duration_secs,
                };
                sends.push(self.send_pulse(endpoint, command));
            }
        }
        let results = join_all(sends).await;

        TickOutcome {
            targeted: results.len(),
            succeeded: results.into_iter().filter(|ok| *ok).count(),
        }
    }
}

impl<T: Transport> Dispatcher<T> {
    async fn send_pulse(&self, endpoint: &EndpointIdentity, command: StimCommand) -> bool {
        let ok = send_contained(&*self.transport, endpoint, command).await;
        if !ok {
            debug!(endpoint = endpoint.short(), channel = %command.channel(), "pulse not delivered");
        }
        ok
    }
}

fn channel_list(channels: &[Channel]) -> String {
    channels
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join("+")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Signals;
    use crate::testing::MockTransport;
    use crate::types::Waveform;

    const STRONG: WaveProfile = WaveProfile::new(Waveform::Type3, 3);

    fn dispatcher(mock: &Arc<MockTransport>, signals: &Signals) -> Dispatcher<MockTransport> {
        Dispatcher::new(
            Arc::clone(mock),
            mock.control(),
            1,
            signals.interrupts(false),
            EventSink::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn no_bound_endpoints_short_circuits_without_sends() {
        let mock = Arc::new(MockTransport::new());
        mock.connect("app-1"); // connected but never bound
        let signals = Signals::new();
        let d = dispatcher(&mock, &signals);

        let start = tokio::time::Instant::now();
        let result = d.dispatch(STRONG, &[Channel::A], 3).await;

        assert!(!result.success());
        assert_eq!(result.ticks_fired, 0);
        assert_eq!(mock.send_count(), 0);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn three_second_profile_fires_three_ticks_one_second_apart() {
        let mock = Arc::new(MockTransport::new());
        mock.connect_bound("app-1");
        mock.connect_bound("app-2");
        let signals = Signals::new();
        let d = dispatcher(&mock, &signals);

        let result = d.dispatch(STRONG, &[Channel::A], 3).await;

        assert!(result.success());
        assert_eq!(result.succeeded, 2);
        assert_eq!(result.targeted, 2);
        assert_eq!(result.ticks_fired, 3);

        let ticks = mock.pulse_ticks();
        assert_eq!(ticks.len(), 3);
        for tick in &ticks {
            assert_eq!(tick.len(), 2);
            assert!(tick.iter().all(|s| s.command.channel() == Channel::A));
        }
        for pair in ticks.windows(2) {
            let gap = pair[1][0].at - pair[0][0].at;
            assert!(gap >= Duration::from_secs(1) && gap < Duration::from_millis(1100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unbinding_mid_dispatch_shrinks_later_ticks_only() {
        let mock = Arc::new(MockTransport::new());
        mock.connect_bound("app-1");
        mock.connect_bound("app-2");
        let signals = Signals::new();
        let d = Arc::new(dispatcher(&mock, &signals));

        let running = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.dispatch(STRONG, &[Channel::B], 3).await })
        };

        // tick 0 at t=0, tick 1 at t=1s, tick 2 at t=2s
        tokio::time::sleep(Duration::from_millis(1500)).await;
        mock.unbind("app-2");

        let result = running.await.unwrap();
        assert_eq!(result.succeeded, 2);
        assert_eq!(result.targeted, 2);

        let ticks = mock.pulse_ticks();
        assert_eq!(ticks.len(), 3);
        assert_eq!(ticks[0].len(), 2);
        assert_eq!(ticks[1].len(), 2);
        assert_eq!(ticks[2].len(), 1);
        assert_eq!(ticks[2][0].endpoint.as_str(), "app-1");
    }

    #[tokio::test(start_paused = true)]
    async fn later_tick_with_no_targets_is_a_no_op() {
        let mock = Arc::new(MockTransport::new());
        mock.connect_bound("app-1");
        let signals = Signals::new();
        let d = Arc::new(dispatcher(&mock, &signals));

        let running = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.dispatch(STRONG, &[Channel::A], 3).await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        mock.disconnect("app-1");

        let result = running.await.unwrap();
        assert!(result.success());
        assert_eq!(result.ticks_fired, 3);
        assert_eq!(mock.send_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_after_tick_zero_do_not_change_result() {
        let mock = Arc::new(MockTransport::new());
        mock.connect_bound("app-1");
        let signals = Signals::new();
        let d = Arc::new(dispatcher(&mock, &signals));

        let running = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.dispatch(STRONG, &[Channel::A], 2).await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        mock.fail_endpoint("app-1");

        let result = running.await.unwrap();
        assert!(result.success());
        assert_eq!(result.succeeded, 1);
        assert_eq!(mock.send_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_zero_all_failed_reports_failure() {
        let mock = Arc::new(MockTransport::new());
        mock.connect_bound("app-1");
        mock.fail_endpoint("app-1");
        let signals = Signals::new();
        let d = dispatcher(&mock, &signals);

        let result = d.dispatch(STRONG, &[Channel::A], 1).await;
        assert!(!result.success());
        assert_eq!(result.targeted, 1);
        assert_eq!(result.succeeded, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_endpoint_does_not_abort_fan_out() {
        let mock = Arc::new(MockTransport::new());
        mock.connect_bound("app-1");
        mock.connect_bound("app-2");
        mock.panic_on("app-1");
        let signals = Signals::new();
        let d = dispatcher(&mock, &signals);

        let result = d.dispatch(STRONG, &[Channel::A], 1).await;
        assert!(result.success());
        assert_eq!(result.targeted, 2);
        assert_eq!(result.succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn all_channels_succeeds_when_either_channel_does() {
        let mock = Arc::new(MockTransport::new());
        mock.connect_bound("app-1");
        mock.fail_command(
            "app-1",
            StimCommand::Pulse {
                channel: Channel::A,
                waveform: Waveform::Type2,
                duration_secs: 2,
            },
        );
        let signals = Signals::new();
        let d = dispatcher(&mock, &signals);

        let result = d
            .dispatch_all_channels(WaveProfile::new(Waveform::Type2, 2), 2)
            .await;
        assert!(result.success());
        assert_eq!(result.succeeded, 1);
        assert_eq!(result.targeted, 2);
        assert_eq!(result.ticks_fired, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn all_channels_runs_both_channels_concurrently() {
        let mock = Arc::new(MockTransport::new());
        mock.connect_bound("app-1");
        let signals = Signals::new();
        let d = dispatcher(&mock, &signals);

        let start = tokio::time::Instant::now();
        let result = d.dispatch_all_channels(STRONG, 3).await;
        assert!(result.success());
        // both channels share the same 2s of inter-tick waits
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));
        assert_eq!(mock.send_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_further_ticks() {
        let mock = Arc::new(MockTransport::new());
        mock.connect_bound("app-1");
        let signals = Signals::new();
        let d = Arc::new(dispatcher(&mock, &signals));

        let running = {
            let d = Arc::clone(&d);
            let profile = WaveProfile::new(Waveform::Type3, 5);
            tokio::spawn(async move { d.dispatch(profile, &[Channel::A], 5).await })
        };
        tokio::time::sleep(Duration::from_millis(1500)).await;
        signals.request_shutdown();

        let result = running.await.unwrap();
        assert!(result.interrupted);
        assert!(result.success());
        assert_eq!(result.ticks_fired, 2);
        assert_eq!(mock.send_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn yielding_dispatch_stops_after_emergency_stop() {
        let mock = Arc::new(MockTransport::new());
        mock.connect_bound("app-1");
        let signals = Signals::new();
        let d = Arc::new(Dispatcher::new(
            Arc::clone(&mock),
            mock.control(),
            1,
            signals.interrupts(true),
            EventSink::default(),
        ));

        let running = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.dispatch(STRONG, &[Channel::A], 3).await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        signals.raise_stop();

        let result = running.await.unwrap();
        assert!(result.interrupted);
        assert_eq!(result.ticks_fired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_yielding_dispatch_keeps_ticking_through_emergency_stop() {
        let mock = Arc::new(MockTransport::new());
        mock.connect_bound("app-1");
        let signals = Signals::new();
        let d = Arc::new(dispatcher(&mock, &signals));

        let running = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.dispatch(STRONG, &[Channel::A], 3).await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        signals.raise_stop();

        let result = running.await.unwrap();
        assert!(!result.interrupted);
        assert_eq!(result.ticks_fired, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cadence_multiplies_ticks() {
        let mock = Arc::new(MockTransport::new());
        mock.connect_bound("app-1");
        let signals = Signals::new();
        let d = Dispatcher::new(
            Arc::clone(&mock),
            mock.control(),
            2,
            signals.interrupts(false),
            EventSink::default(),
        );
        assert_eq!(d.tick_interval(), Duration::from_millis(500));

        let result = d.dispatch(STRONG, &[Channel::A], 2).await;
        assert_eq!(result.ticks_fired, 4);
    }
}
