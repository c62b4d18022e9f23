use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "dglab.yaml";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// How many ports after `port` are tried when `port` is taken.
    #[serde(default = "default_port_search_span")]
    pub port_search_span: u16,
    /// Host advertised in the pairing URL. Auto-detected when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_host: Option<String>,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9999
}

fn default_port_search_span() -> u16 {
    100
}

fn default_send_timeout_ms() -> u64 {
    2000
}

fn default_heartbeat_secs() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            port_search_span: default_port_search_span(),
            public_host: None,
            send_timeout_ms: default_send_timeout_ms(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

impl ServerConfig {
    /// Ports to try, in order: the configured port, then the search span.
    pub fn candidate_ports(&self) -> impl Iterator<Item = u16> {
        let first = self.port;
        let last = first.saturating_add(self.port_search_span);
        first..=last
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// DebounceConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebounceConfig {
    #[serde(default = "default_damage_window_ms")]
    pub damage_window_ms: u64,
}

fn default_damage_window_ms() -> u64 {
    1000
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            damage_window_ms: default_damage_window_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// DispatchConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Sends per second.
    #[serde(default = "default_cadence")]
    pub cadence: u32,
    /// When set, an emergency stop interrupts in-flight dispatches so no
    /// tick fires after the stop's zero-strength commands.
    #[serde(default)]
    pub yield_to_emergency_stop: bool,
    /// Host events waiting for a dispatch slot; excess events are shed.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Dispatch sequences allowed to run at the same time.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_cadence() -> u32 {
    1
}

fn default_queue_capacity() -> usize {
    16
}

fn default_max_concurrent() -> usize {
    4
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            cadence: default_cadence(),
            yield_to_emergency_stop: false,
            queue_capacity: default_queue_capacity(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

// ---------------------------------------------------------------------------
// ShutdownConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

fn default_grace_period_ms() -> u64 {
    3000
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub debug_logging: bool,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub debounce: DebounceConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

fn default_version() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            enabled: default_enabled(),
            debug_logging: false,
            server: ServerConfig::default(),
            debounce: DebounceConfig::default(),
            dispatch: DispatchConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(OrchestratorError::ConfigNotFound(
                path.display().to_string(),
            ));
        }
        let data = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(OrchestratorError::ConfigNotFound(_)) => Ok(Self::default()),
            other => other,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }

    pub fn summary(&self) -> String {
        format!(
            "enabled: {}, port: {}, debug logging: {}, damage debounce: {}ms, yield to stop: {}",
            self.enabled,
            self.server.port,
            self.debug_logging,
            self.debounce.damage_window_ms,
            self.dispatch.yield_to_emergency_stop,
        )
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        if !(1024..=65535).contains(&self.server.port) {
            error(format!(
                "server.port {} is outside 1024-65535",
                self.server.port
            ));
        }
        if self.dispatch.cadence == 0 {
            error("dispatch.cadence must be at least 1".to_string());
        }
        if self.dispatch.cadence > 1000 {
            error(format!(
                "dispatch.cadence {} exceeds 1000 sends per second",
                self.dispatch.cadence
            ));
        }
        if self.dispatch.queue_capacity == 0 {
            error("dispatch.queue_capacity must be at least 1".to_string());
        }
        if self.dispatch.max_concurrent == 0 {
            error("dispatch.max_concurrent must be at least 1".to_string());
        }
        if self.server.send_timeout_ms == 0 {
            error("server.send_timeout_ms must be at least 1".to_string());
        }

        if self.shutdown.grace_period_ms > 30_000 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "shutdown.grace_period_ms={} (>30s delays teardown noticeably)",
                    self.shutdown.grace_period_ms
                ),
            });
        }
        if self.server.heartbeat_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "server.heartbeat_secs=0 disables heartbeats".to_string(),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
