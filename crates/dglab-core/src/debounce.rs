use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::DebounceConfig;
use crate::types::EventClass;

/// Per event-class rate limiter.
///
/// A class with no window (death) is always accepted. For a windowed class
/// the check and the timestamp update happen under one lock, so of two
/// racing callers at most one is accepted.
pub struct Debouncer {
    windows: HashMap<EventClass, Duration>,
    last_accepted: Mutex<HashMap<EventClass, Instant>>,
}

impl Debouncer {
    pub fn new(damage_window: Duration) -> Self {
        let mut windows = HashMap::new();
        windows.insert(EventClass::Damage, damage_window);
        Self {
            windows,
            last_accepted: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &DebounceConfig) -> Self {
        Self::new(Duration::from_millis(config.damage_window_ms))
    }

    pub fn window(&self, class: EventClass) -> Option<Duration> {
        self.windows.get(&class).copied()
    }

    /// Accept (and record) an event at `now`, or reject it as too soon.
    pub fn should_accept(&self, class: EventClass, now: Instant) -> bool {
        let Some(window) = self.window(class) else {
            return true;
        };

        let mut last = self
            .last_accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match last.get(&class) {
            Some(prev) if now.saturating_duration_since(*prev) < window => false,
            _ => {
                last.insert(class, now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn first_event_is_always_accepted() {
        let d = Debouncer::new(Duration::from_millis(1000));
        assert!(d.should_accept(EventClass::Damage, Instant::now()));
    }

    #[test]
    fn event_inside_window_is_dropped() {
        let d = Debouncer::new(Duration::from_millis(1000));
        let t0 = Instant::now();
        assert!(d.should_accept(EventClass::Damage, t0));
        assert!(!d.should_accept(EventClass::Damage, t0 + Duration::from_millis(500)));
        assert!(!d.should_accept(EventClass::Damage, t0 + Duration::from_millis(999)));
    }

    #[test]
    fn event_at_window_boundary_is_accepted() {
        let d = Debouncer::new(Duration::from_millis(1000));
        let t0 = Instant::now();
        assert!(d.should_accept(EventClass::Damage, t0));
        assert!(d.should_accept(EventClass::Damage, t0 + Duration::from_millis(1000)));
    }

    #[test]
    fn dropped_event_does_not_extend_window() {
        let d = Debouncer::new(Duration::from_millis(1000));
        let t0 = Instant::now();
        assert!(d.should_accept(EventClass::Damage, t0));
        assert!(!d.should_accept(EventClass::Damage, t0 + Duration::from_millis(900)));
        assert!(d.should_accept(EventClass::Damage, t0 + Duration::from_millis(1500)));
    }

    #[test]
    fn death_is_never_debounced() {
        let d = Debouncer::new(Duration::from_millis(1000));
        let t0 = Instant::now();
        for _ in 0..5 {
            assert!(d.should_accept(EventClass::Death, t0));
        }
    }

    #[test]
    fn concurrent_callers_accept_exactly_once() {
        let d = Arc::new(Debouncer::new(Duration::from_secs(60)));
        let now = Instant::now();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let d = Arc::clone(&d);
                std::thread::spawn(move || d.should_accept(EventClass::Damage, now))
            })
            .collect();
        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(accepted, 1);
    }
}
