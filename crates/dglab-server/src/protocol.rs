//! DG-LAB socket protocol (V3): JSON envelopes, result codes and the
//! waveform frame encoder.

use dglab_core::types::{Channel, ControlIdentity, EndpointIdentity, StimCommand, Waveform};
use serde::{Deserialize, Serialize};

/// Largest accepted inbound message, in bytes.
pub const MAX_MESSAGE_LEN: usize = 1950;

/// Waveform frames per second of output (100 ms each).
pub const FRAMES_PER_SECOND: usize = 10;

pub const APP_DOWNLOAD_URL: &str = "https://www.dungeon-lab.com/app-download.php";

// ---------------------------------------------------------------------------
// Result codes
// ---------------------------------------------------------------------------

pub mod code {
    pub const OK: &str = "200";
    /// The endpoint is already bound to a controller.
    pub const ALREADY_BOUND: &str = "400";
    /// The controller named in a bind request does not exist.
    pub const UNKNOWN_TARGET: &str = "401";
    /// Sender and recipient are not bound to each other.
    pub const NOT_BOUND: &str = "402";
    /// Payload was not a JSON object.
    pub const NOT_JSON: &str = "403";
    pub const TOO_LONG: &str = "405";
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub target_id: String,
    #[serde(default)]
    pub message: String,
}

impl WireMessage {
    pub fn new(
        kind: &str,
        client_id: impl Into<String>,
        target_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.to_string(),
            client_id: client_id.into(),
            target_id: target_id.into(),
            message: message.into(),
        }
    }

    /// First message on every connection: tells the peer its own id.
    pub fn hello(endpoint: &EndpointIdentity) -> Self {
        Self::new("bind", endpoint.as_str(), "", "targetId")
    }

    pub fn bind_result(control: &str, endpoint: &str, code: &str) -> Self {
        Self::new("bind", control, endpoint, code)
    }

    pub fn heartbeat(endpoint: &EndpointIdentity, control: Option<&ControlIdentity>) -> Self {
        Self::new(
            "heartbeat",
            endpoint.as_str(),
            control.map(|c| c.as_str()).unwrap_or_default(),
            code::OK,
        )
    }

    pub fn error(endpoint: &EndpointIdentity, code: &str) -> Self {
        Self::new("error", endpoint.as_str(), "", code)
    }

    /// A bind request from an app: `clientId` names the controller,
    /// `targetId` the app itself.
    pub fn is_bind_request(&self) -> bool {
        self.kind == "bind" && self.message == "DGLAB"
    }

    pub fn to_json(&self) -> String {
        // A struct of plain strings always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Parse an inbound text frame, enforcing the size limit first.
pub fn parse_inbound(text: &str) -> Result<WireMessage, &'static str> {
    if text.len() > MAX_MESSAGE_LEN {
        return Err(code::TOO_LONG);
    }
    serde_json::from_str(text).map_err(|_| code::NOT_JSON)
}

// ---------------------------------------------------------------------------
// Command encoding
// ---------------------------------------------------------------------------

pub fn encode_command(
    control: &ControlIdentity,
    endpoint: &EndpointIdentity,
    command: StimCommand,
) -> WireMessage {
    let message = match command {
        StimCommand::Pulse {
            channel, waveform, ..
        } => pulse_message(channel, waveform),
        StimCommand::Clear { channel } => format!("clear-{}", channel.number()),
        // strength-<channel>+<mode>+<value>, mode 2 = set absolute
        StimCommand::ZeroStrength { channel } => format!("strength-{}+2+0", channel.number()),
    };
    WireMessage::new("msg", control.as_str(), endpoint.as_str(), message)
}

/// One second of `waveform` on `channel`: `pulse-A:["0A0A0A0A14141414",...]`.
pub fn pulse_message(channel: Channel, waveform: Waveform) -> String {
    let frames = waveform_frames(waveform, FRAMES_PER_SECOND);
    let array = serde_json::to_string(&frames).unwrap_or_else(|_| "[]".to_string());
    format!("pulse-{}:{array}", channel.as_str())
}

/// (frequency, intensity cycle) per preset. Frequency is the V3 compressed
/// 10..=240 value, intensity 0..=100.
fn pattern(waveform: Waveform) -> (u8, &'static [u8]) {
    match waveform {
        Waveform::Type1 => (10, &[0, 25, 50, 25]),
        Waveform::Type2 => (15, &[30, 60, 90, 60]),
        Waveform::Type3 => (20, &[80, 100, 100, 80]),
    }
}

/// `count` frames of 8 bytes hex: four frequency bytes then four intensity
/// bytes, one per 25 ms slot.
pub fn waveform_frames(waveform: Waveform, count: usize) -> Vec<String> {
    let (frequency, cycle) = pattern(waveform);
    cycle
        .iter()
        .cycle()
        .take(count)
        .map(|&intensity| {
            let mut frame = String::with_capacity(16);
            for byte in [frequency; 4].into_iter().chain([intensity; 4]) {
                frame.push_str(&format!("{byte:02X}"));
            }
            frame
        })
        .collect()
}

/// What the DG-LAB app scans to connect and bind.
pub fn pairing_url(host: &str, port: u16, control: &ControlIdentity) -> String {
    format!("{APP_DOWNLOAD_URL}#DGLAB-SOCKET#ws://{host}:{port}/{control}")
}
