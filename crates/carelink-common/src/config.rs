//! Monitor configuration.
//!
//! Parsed in two stages: a permissive [`MonitorConfigInput`] where every
//! field is optional, then [`MonitorConfigInput::resolve`] which fills in
//! defaults and rejects values the monitor cannot run with.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_VERSION: u32 = 1;

/// Slowest accepted sampling rate; one tick every ten seconds.
pub const MIN_RATE_HZ: f64 = 0.1;
/// Fastest accepted sampling rate.
pub const MAX_RATE_HZ: f64 = 1000.0;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// ── Input (as written in the TOML file) ─────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MonitorConfigInput {
    pub version: u32,
    pub patient: PatientConfigInput,
    pub fall: FallConfigInput,
    pub modem: ModemConfigInput,
    pub heartbeat: HeartbeatConfigInput,
    pub position: PositionConfigInput,
    pub devices: DevicesConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PatientConfigInput {
    pub id: Option<String>,
    pub device_tag: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FallConfigInput {
    pub threshold_g: Option<f64>,
    pub impact_duration_ms: Option<u64>,
    pub subside_ms: Option<u64>,
    pub cooldown_s: Option<u64>,
    pub watch_threshold_g: Option<f64>,
    pub high_rate_hz: Option<f64>,
    pub low_rate_hz: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModemConfigInput {
    pub destination: Option<String>,
    pub retry_count: Option<u32>,
    pub probe_attempts: Option<u32>,
    pub probe_backoff_ms: Option<u64>,
    pub probe_timeout_ms: Option<u64>,
    pub command_timeout_ms: Option<u64>,
    pub idle_window_ms: Option<u64>,
    pub submit_window_s: Option<u64>,
    pub attempt_cooldown_s: Option<u64>,
    pub stabilize_s: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub drain_attempts: Option<u32>,
    pub reset_command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfigInput {
    pub interval_s: Option<u64>,
    pub location_every: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PositionConfigInput {
    pub stale_after_s: Option<u64>,
    pub silence_warning_s: Option<u64>,
    pub status_log_s: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DevicesConfigInput {
    pub modem: Option<PathBuf>,
    pub gps: Option<PathBuf>,
    pub i2c_bus: Option<PathBuf>,
    pub imu_address: Option<u16>,
}

// ── Resolved configuration ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct PatientConfig {
    pub id: String,
    pub device_tag: String,
}

impl Default for PatientConfig {
    fn default() -> Self {
        Self {
            id: "PATIENT_001".into(),
            device_tag: "PiZero".into(),
        }
    }
}

/// Fall classifier thresholds and sampling cadence.
#[derive(Debug, Clone, PartialEq)]
pub struct FallConfig {
    /// Magnitude (g) above which a sample counts as an impact.
    pub threshold_g: f64,
    /// Time an impact window must last before a fall is confirmed.
    pub impact_duration: Duration,
    /// Quiet time after which an unconfirmed impact window is abandoned.
    pub subside_after: Duration,
    /// Minimum spacing between two confirmed falls.
    pub cooldown: Duration,
    /// Magnitude (g) above which sampling switches to the high rate.
    pub watch_threshold_g: f64,
    pub high_rate_hz: f64,
    pub low_rate_hz: f64,
}

impl Default for FallConfig {
    fn default() -> Self {
        Self {
            threshold_g: 2.0,
            impact_duration: Duration::from_millis(40),
            subside_after: Duration::from_millis(200),
            cooldown: Duration::from_secs(60),
            watch_threshold_g: 1.4,
            high_rate_hz: 50.0,
            low_rate_hz: 5.0,
        }
    }
}

/// Timing and retry policy for the cellular modem.
#[derive(Debug, Clone, PartialEq)]
pub struct ModemConfig {
    /// Destination number for alert messages.
    pub destination: String,
    /// Whole submission attempts per alert.
    pub retry_count: u32,
    /// Probes issued while initializing the session.
    pub probe_attempts: u32,
    pub probe_backoff: Duration,
    pub probe_timeout: Duration,
    pub command_timeout: Duration,
    /// An exchange ends once no byte has arrived for this long.
    pub idle_window: Duration,
    /// How long to wait for a terminal marker after the submit byte.
    pub submit_window: Duration,
    pub attempt_cooldown: Duration,
    /// Wait after a hardware reset before probing again.
    pub stabilize: Duration,
    pub poll_interval: Duration,
    /// Reads spent discarding stale bytes before each command.
    pub drain_attempts: u32,
    /// External command that pulses the modem reset line.
    pub reset_command: Vec<String>,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            destination: String::new(),
            retry_count: 3,
            probe_attempts: 5,
            probe_backoff: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(3),
            idle_window: Duration::from_secs(1),
            submit_window: Duration::from_secs(15),
            attempt_cooldown: Duration::from_secs(5),
            stabilize: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
            drain_attempts: 3,
            reset_command: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// Every Nth heartbeat also sends a location update.
    pub location_every: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            location_every: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionConfig {
    /// Age after which a fix is treated as absent.
    pub stale_after: Duration,
    /// Warn when the receiver has been silent this long.
    pub silence_warning: Duration,
    pub status_log: Duration,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(300),
            silence_warning: Duration::from_secs(30),
            status_log: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DevicesConfig {
    pub modem: PathBuf,
    pub gps: PathBuf,
    pub i2c_bus: PathBuf,
    pub imu_address: u16,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            modem: PathBuf::from("/dev/serial0"),
            gps: PathBuf::from("/dev/ttyAMA1"),
            i2c_bus: PathBuf::from("/dev/i2c-1"),
            imu_address: 0x68,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub version: u32,
    pub patient: PatientConfig,
    pub fall: FallConfig,
    pub modem: ModemConfig,
    pub heartbeat: HeartbeatConfig,
    pub position: PositionConfig,
    pub devices: DevicesConfig,
}

// ── Resolution ──────────────────────────────────────────────────────

fn non_empty(value: Option<String>, default: String) -> String {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
}

fn ms(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

fn secs(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(default)
}

impl MonitorConfigInput {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(toml::from_str(input)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn resolve(self) -> Result<MonitorConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let patient_default = PatientConfig::default();
        let patient = PatientConfig {
            id: non_empty(self.patient.id, patient_default.id),
            device_tag: non_empty(self.patient.device_tag, patient_default.device_tag),
        };

        let f = FallConfig::default();
        let fall = FallConfig {
            threshold_g: self.fall.threshold_g.unwrap_or(f.threshold_g),
            impact_duration: ms(self.fall.impact_duration_ms, f.impact_duration),
            subside_after: ms(self.fall.subside_ms, f.subside_after),
            cooldown: secs(self.fall.cooldown_s, f.cooldown),
            watch_threshold_g: self.fall.watch_threshold_g.unwrap_or(f.watch_threshold_g),
            high_rate_hz: self.fall.high_rate_hz.unwrap_or(f.high_rate_hz),
            low_rate_hz: self.fall.low_rate_hz.unwrap_or(f.low_rate_hz),
        };

        let m = ModemConfig::default();
        let modem = ModemConfig {
            destination: non_empty(self.modem.destination, m.destination),
            retry_count: self.modem.retry_count.unwrap_or(m.retry_count),
            probe_attempts: self.modem.probe_attempts.unwrap_or(m.probe_attempts),
            probe_backoff: ms(self.modem.probe_backoff_ms, m.probe_backoff),
            probe_timeout: ms(self.modem.probe_timeout_ms, m.probe_timeout),
            command_timeout: ms(self.modem.command_timeout_ms, m.command_timeout),
            idle_window: ms(self.modem.idle_window_ms, m.idle_window),
            submit_window: secs(self.modem.submit_window_s, m.submit_window),
            attempt_cooldown: secs(self.modem.attempt_cooldown_s, m.attempt_cooldown),
            stabilize: secs(self.modem.stabilize_s, m.stabilize),
            poll_interval: ms(self.modem.poll_interval_ms, m.poll_interval).max(Duration::from_millis(1)),
            drain_attempts: self.modem.drain_attempts.unwrap_or(m.drain_attempts),
            reset_command: self
                .modem
                .reset_command
                .unwrap_or_default()
                .into_iter()
                .map(|arg| arg.trim().to_string())
                .filter(|arg| !arg.is_empty())
                .collect(),
        };

        let h = HeartbeatConfig::default();
        let heartbeat = HeartbeatConfig {
            interval: secs(self.heartbeat.interval_s, h.interval),
            location_every: self.heartbeat.location_every.unwrap_or(h.location_every),
        };

        let p = PositionConfig::default();
        let position = PositionConfig {
            stale_after: secs(self.position.stale_after_s, p.stale_after),
            silence_warning: secs(self.position.silence_warning_s, p.silence_warning),
            status_log: secs(self.position.status_log_s, p.status_log),
        };

        let d = DevicesConfig::default();
        let devices = DevicesConfig {
            modem: self.devices.modem.unwrap_or(d.modem),
            gps: self.devices.gps.unwrap_or(d.gps),
            i2c_bus: self.devices.i2c_bus.unwrap_or(d.i2c_bus),
            imu_address: self.devices.imu_address.unwrap_or(d.imu_address),
        };

        let config = MonitorConfig {
            version,
            patient,
            fall,
            modem,
            heartbeat,
            position,
            devices,
        };
        config.validate()?;
        Ok(config)
    }
}

impl MonitorConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        MonitorConfigInput::from_toml_str(input)?.resolve()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let fall = &self.fall;
        if !(fall.threshold_g > 0.0) {
            return Err(invalid("fall.threshold_g", "must be positive"));
        }
        if !(fall.watch_threshold_g > 0.0) || fall.watch_threshold_g > fall.threshold_g {
            return Err(invalid(
                "fall.watch_threshold_g",
                format!("must be positive and at most threshold_g ({})", fall.threshold_g),
            ));
        }
        if fall.impact_duration.is_zero() {
            return Err(invalid("fall.impact_duration_ms", "must be non-zero"));
        }
        for (field, rate) in [
            ("fall.low_rate_hz", fall.low_rate_hz),
            ("fall.high_rate_hz", fall.high_rate_hz),
        ] {
            if !(MIN_RATE_HZ..=MAX_RATE_HZ).contains(&rate) {
                return Err(invalid(
                    field,
                    format!("must be between {MIN_RATE_HZ} and {MAX_RATE_HZ} Hz"),
                ));
            }
        }
        if fall.low_rate_hz > fall.high_rate_hz {
            return Err(invalid(
                "fall.low_rate_hz",
                format!("must not exceed high_rate_hz ({})", fall.high_rate_hz),
            ));
        }

        let modem = &self.modem;
        if modem.destination.is_empty() {
            return Err(invalid("modem.destination", "no destination number configured"));
        }
        if modem.destination.contains('"') {
            return Err(invalid("modem.destination", "must not contain quotes"));
        }
        if modem.retry_count == 0 {
            return Err(invalid("modem.retry_count", "must be at least 1"));
        }
        if modem.probe_attempts == 0 {
            return Err(invalid("modem.probe_attempts", "must be at least 1"));
        }

        if self.heartbeat.interval.is_zero() {
            return Err(invalid("heartbeat.interval_s", "must be non-zero"));
        }
        if self.position.stale_after.is_zero() {
            return Err(invalid("position.stale_after_s", "must be non-zero"));
        }
        Ok(())
    }
}
