//! Host event → stimulation profile. Pure, no I/O.

use serde::{Deserialize, Serialize};

use crate::types::{DeathKind, EventClass, WaveProfile, Waveform};

const DEATH_PROFILE: WaveProfile = WaveProfile::new(Waveform::Type3, 5);

/// A semantic event observed in the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    Damage { magnitude: i32 },
    Death { kind: DeathKind },
}

impl HostEvent {
    pub fn class(&self) -> EventClass {
        match self {
            HostEvent::Damage { .. } => EventClass::Damage,
            HostEvent::Death { .. } => EventClass::Death,
        }
    }

    pub fn profile(&self) -> WaveProfile {
        match *self {
            HostEvent::Damage { magnitude } => resolve_damage(magnitude),
            HostEvent::Death { kind } => resolve_death(kind),
        }
    }
}

/// Heavier hits select stronger and longer waveforms. Anything below 2
/// (including zero and negative values) maps to the lightest response.
pub fn resolve_damage(magnitude: i32) -> WaveProfile {
    match magnitude {
        m if m >= 3 => WaveProfile::new(Waveform::Type3, 3),
        2 => WaveProfile::new(Waveform::Type2, 2),
        _ => WaveProfile::new(Waveform::Type1, 1),
    }
}

/// Every death gets the same response; the kind only shows up in logs.
pub fn resolve_death(_kind: DeathKind) -> WaveProfile {
    DEATH_PROFILE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn damage_thresholds() {
        assert_eq!(resolve_damage(i32::MIN), WaveProfile::new(Waveform::Type1, 1));
        assert_eq!(resolve_damage(-1), WaveProfile::new(Waveform::Type1, 1));
        assert_eq!(resolve_damage(0), WaveProfile::new(Waveform::Type1, 1));
        assert_eq!(resolve_damage(1), WaveProfile::new(Waveform::Type1, 1));
        assert_eq!(resolve_damage(2), WaveProfile::new(Waveform::Type2, 2));
        assert_eq!(resolve_damage(3), WaveProfile::new(Waveform::Type3, 3));
        assert_eq!(resolve_damage(40), WaveProfile::new(Waveform::Type3, 3));
        assert_eq!(resolve_damage(i32::MAX), WaveProfile::new(Waveform::Type3, 3));
    }

    #[test]
    fn death_ignores_kind() {
        for kind in [DeathKind::Normal, DeathKind::NonLethal, DeathKind::Frost] {
            assert_eq!(resolve_death(kind), WaveProfile::new(Waveform::Type3, 5));
        }
    }

    #[test]
    fn host_event_class_and_profile() {
        let ev = HostEvent::Damage { magnitude: 2 };
        assert_eq!(ev.class(), EventClass::Damage);
        assert_eq!(ev.profile().duration_secs, 2);

        let ev = HostEvent::Death {
            kind: DeathKind::Frost,
        };
        assert_eq!(ev.class(), EventClass::Death);
        assert_eq!(ev.profile().waveform, Waveform::Type3);
    }
}
