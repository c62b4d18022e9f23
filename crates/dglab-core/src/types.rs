use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::OrchestratorError;

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

/// The orchestrator's own identity on the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlIdentity(String);

impl ControlIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ControlIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A remote device-app connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointIdentity(String);

impl EndpointIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((i, _)) => &self.0[..i],
            None => &self.0,
        }
    }
}

impl fmt::Display for EndpointIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    A,
    B,
}

impl Channel {
    pub fn all() -> &'static [Channel] {
        &[Channel::A, Channel::B]
    }

    /// Numeric channel index used by the device protocol (A = 1, B = 2).
    pub fn number(self) -> u8 {
        match self {
            Channel::A => 1,
            Channel::B => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::A => "A",
            Channel::B => "B",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" | "a" | "1" => Ok(Channel::A),
            "B" | "b" | "2" => Ok(Channel::B),
            _ => Err(OrchestratorError::InvalidEvent(format!("channel {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Waveform / WaveProfile
// ---------------------------------------------------------------------------

/// Closed set of waveform presets, ordered by intensity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Waveform {
    Type1,
    Type2,
    Type3,
}

impl Waveform {
    pub fn level(self) -> u8 {
        match self {
            Waveform::Type1 => 1,
            Waveform::Type2 => 2,
            Waveform::Type3 => 3,
        }
    }
}

impl fmt::Display for Waveform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type{}", self.level())
    }
}

/// A resolved stimulation response: which waveform, for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveProfile {
    pub waveform: Waveform,
    pub duration_secs: u32,
}

impl WaveProfile {
    pub const fn new(waveform: Waveform, duration_secs: u32) -> Self {
        Self {
            waveform,
            duration_secs,
        }
    }
}

// ---------------------------------------------------------------------------
// Host events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventClass {
    Damage,
    Death,
}

impl EventClass {
    pub fn as_str(self) -> &'static str {
        match self {
            EventClass::Damage => "damage",
            EventClass::Death => "death",
        }
    }
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeathKind {
    #[default]
    Normal,
    NonLethal,
    Frost,
}

impl DeathKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeathKind::Normal => "normal",
            DeathKind::NonLethal => "non-lethal",
            DeathKind::Frost => "frost",
        }
    }

    /// Map the host's `(non_lethal, frost)` flag pair onto a kind.
    pub fn from_flags(non_lethal: bool, frost: bool) -> Self {
        if non_lethal {
            DeathKind::NonLethal
        } else if frost {
            DeathKind::Frost
        } else {
            DeathKind::Normal
        }
    }
}

impl fmt::Display for DeathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeathKind {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(DeathKind::Normal),
            "non-lethal" | "non_lethal" | "nonlethal" => Ok(DeathKind::NonLethal),
            "frost" => Ok(DeathKind::Frost),
            _ => Err(OrchestratorError::InvalidEvent(format!("death kind {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// One channel-tagged command addressed to an endpoint.
///
/// The transport owns the wire encoding; to the core a pulse is just a
/// waveform selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StimCommand {
    Pulse {
        channel: Channel,
        waveform: Waveform,
        duration_secs: u32,
    },
    /// Drop whatever waveform queue the device is playing on `channel`.
    Clear { channel: Channel },
    /// Set the channel's output strength to zero.
    ZeroStrength { channel: Channel },
}

impl StimCommand {
    pub fn channel(&self) -> Channel {
        match *self {
            StimCommand::Pulse { channel, .. }
            | StimCommand::Clear { channel }
            | StimCommand::ZeroStrength { channel } => channel,
        }
    }
}

// ---------------------------------------------------------------------------
// DispatchResult
// ---------------------------------------------------------------------------

/// Outcome of one dispatch sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DispatchResult {
    /// Successful sends on the first tick.
    pub succeeded: usize,
    /// Sends attempted on the first tick.
    pub targeted: usize,
    /// Ticks that actually fired.
    pub ticks_fired: u32,
    /// `true` when the sequence ended early on shutdown or emergency stop.
    pub interrupted: bool,
}

impl DispatchResult {
    pub fn success(&self) -> bool {
        self.succeeded > 0
    }
}
