//! Shutdown and emergency-stop signalling for in-flight dispatches.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Owner side: raised by the facade and the emergency stop coordinator.
#[derive(Clone)]
pub struct Signals {
    shutdown: Arc<watch::Sender<bool>>,
    stops: Arc<watch::Sender<u64>>,
}

impl Signals {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        let (stops, _) = watch::channel(0);
        Self {
            shutdown: Arc::new(shutdown),
            stops: Arc::new(stops),
        }
    }

    pub fn interrupts(&self, yield_to_stop: bool) -> Interrupts {
        Interrupts {
            shutdown: self.shutdown.subscribe(),
            stops: self.stops.subscribe(),
            yield_to_stop,
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Clear a previous shutdown so a restarted orchestrator can dispatch.
    pub fn reset(&self) {
        self.shutdown.send_replace(false);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Record an emergency stop and return the new stop generation.
    pub fn raise_stop(&self) -> u64 {
        let mut generation = 0;
        self.stops.send_modify(|n| {
            *n += 1;
            generation = *n;
        });
        generation
    }
}

impl Default for Signals {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscriber side, held by each dispatcher.
#[derive(Clone)]
pub struct Interrupts {
    shutdown: watch::Receiver<bool>,
    stops: watch::Receiver<u64>,
    yield_to_stop: bool,
}

impl Interrupts {
    /// Current stop generation; a dispatch records it when it starts.
    pub fn stop_generation(&self) -> u64 {
        *self.stops.borrow()
    }

    /// `true` once shutdown was requested, or (when yielding is enabled) an
    /// emergency stop happened after `since`.
    pub fn is_raised(&self, since: u64) -> bool {
        if *self.shutdown.borrow() {
            return true;
        }
        self.yield_to_stop && *self.stops.borrow() != since
    }

    /// Wait `delay` unless interrupted first. Returns `false` when
    /// interrupted.
    pub async fn sleep(&self, delay: Duration, since: u64) -> bool {
        if self.is_raised(since) {
            return false;
        }

        let mut shutdown = self.shutdown.clone();
        let mut stops = self.stops.clone();
        let shutdown_raised = async move {
            let _ = shutdown.wait_for(|down| *down).await;
        };
        let stop_raised = async move {
            let _ = stops.wait_for(|n| *n != since).await;
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown_raised => false,
            _ = stop_raised, if self.yield_to_stop => false,
        }
    }
}
