//! Configuration.
//!
//! Two layers:
//!
//! - [`DeviceConfig`]: per-device tunables (cycle durations, wait times,
//!   hour limits, scheduling window).  Persisted and reconciled across both
//!   stores like the device state; changed only through explicit
//!   configuration updates.
//! - [`ProcessConfig`]: loaded once at process start through `figment`:
//!   built-in defaults, then an optional TOML file, then `PONDCTL_*`
//!   environment variables (nested keys split on `__`).

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveTime, Utc};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::fsm::context::{Actuator, Family};
use crate::pins::IoMap;

// ═══════════════════════════════════════════════════════════════
//  Device tunables
// ═══════════════════════════════════════════════════════════════

/// Which UV lamps the hour accounting (and the operator) treats as in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UvMode {
    Off,
    Uv1,
    Uv2,
    #[default]
    Both,
}

impl UvMode {
    /// Whether the operating mode selects `actuator`.  Non-lamp actuators
    /// are always selected.
    pub fn selects(self, actuator: Actuator) -> bool {
        match actuator {
            Actuator::Uv1 => matches!(self, Self::Uv1 | Self::Both),
            Actuator::Uv2 => matches!(self, Self::Uv2 | Self::Both),
            _ => true,
        }
    }
}

/// Daily start/stop window for automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: NaiveTime,
    pub stop: NaiveTime,
}

impl Window {
    /// Check if `t` falls inside the window.  A window whose stop precedes
    /// its start wraps around midnight.
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.stop {
            t >= self.start && t < self.stop
        } else {
            t >= self.start || t < self.stop
        }
    }
}

/// Tunable values of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tunables {
    /// Pre-stage (pump priming) duration, seconds.
    pub pre_stage_secs: u64,
    /// Main-stage (drum rotation) duration, seconds.
    pub main_stage_secs: u64,
    /// Minimum gap between two level-triggered cycles, seconds.
    pub wait_between_cycles_secs: u64,
    /// Running-hour limit per counted actuator (lamp blister life).
    pub max_hours: u32,
    pub uv_mode: UvMode,
    /// Automation window; `None` disables window automation.
    pub window: Option<Window>,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            pre_stage_secs: 5,
            main_stage_secs: 20,
            wait_between_cycles_secs: 120,
            max_hours: 8000, // typical UV-C lamp life
            uv_mode: UvMode::Both,
            window: None,
        }
    }
}

/// Persisted per-device configuration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub tunables: Tunables,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl DeviceConfig {
    pub fn template(id: &str, tunables: Tunables) -> Self {
        Self {
            id: id.to_owned(),
            tunables,
            version: 0,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// Range-check every tunable before it is persisted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.tunables;
        if !(1..=600).contains(&t.pre_stage_secs) {
            return Err(ConfigError::Validation("pre_stage_secs must be 1–600"));
        }
        if !(1..=3600).contains(&t.main_stage_secs) {
            return Err(ConfigError::Validation("main_stage_secs must be 1–3600"));
        }
        if t.wait_between_cycles_secs > 86_400 {
            return Err(ConfigError::Validation(
                "wait_between_cycles_secs must be at most one day",
            ));
        }
        if t.max_hours == 0 {
            return Err(ConfigError::Validation("max_hours must be positive"));
        }
        if let Some(w) = t.window {
            if w.start == w.stop {
                return Err(ConfigError::Validation(
                    "window start and stop must differ",
                ));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════
//  Process configuration
// ═══════════════════════════════════════════════════════════════

/// Timer periods of one device's background tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub input_poll_ms: u64,
    pub reboot_poll_ms: u64,
    pub window_tick_secs: u64,
    pub hour_tick_secs: u64,
    /// Fixed backoff between board connection attempts.
    pub start_backoff_ms: u64,
    /// Interval of the turn-it-off retry loop.
    pub off_retry_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            input_poll_ms: 50,     // 20 Hz
            reboot_poll_ms: 1_000, // 1 Hz
            window_tick_secs: 60,
            hour_tick_secs: 3_600,
            start_backoff_ms: 2_000,
            off_retry_ms: 500,
        }
    }
}

/// Board transport.  Only the simulated board ships with the binary; the
/// microcontroller transports are provided by integrators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BoardKind {
    #[default]
    Simulated,
}

/// One controlled device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub id: String,
    pub name: String,
    pub family: Family,
    #[serde(default)]
    pub board: BoardKind,
    /// Re-publish local emergency-stop/security inputs to every device.
    #[serde(default)]
    pub propagate_interlocks: bool,
    #[serde(default)]
    pub io: Option<IoMap>,
    #[serde(default)]
    pub timing: Timing,
    /// Template used when neither store holds a config record.
    #[serde(default)]
    pub tunables: Tunables,
}

impl DeviceSpec {
    pub fn new(id: &str, name: &str, family: Family) -> Self {
        Self {
            id: id.to_owned(),
            name: name.to_owned(),
            family,
            board: BoardKind::Simulated,
            propagate_interlocks: false,
            io: None,
            timing: Timing::default(),
            tunables: Tunables::default(),
        }
    }

    /// Configured bindings, or the family's default layout.
    pub fn io_map(&self) -> IoMap {
        self.io.clone().unwrap_or_else(|| IoMap::default_for(self.family))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory of the authoritative (postcard-encoded) store.
    pub primary_dir: PathBuf,
    /// Directory of the replica (JSON-encoded) store; `None` disables it.
    pub secondary_dir: Option<PathBuf>,
    /// Upper bound on any single secondary-store operation.
    pub secondary_timeout_ms: u64,
    /// Append-only JSON-lines audit log.
    pub event_log: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            primary_dir: PathBuf::from("data/primary"),
            secondary_dir: Some(PathBuf::from("data/secondary")),
            secondary_timeout_ms: 2_000,
            event_log: PathBuf::from("data/events.jsonl"),
        }
    }
}

/// Everything loaded at process start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_filter: String,
    pub stores: StoreConfig,
    pub devices: Vec<DeviceSpec>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".to_owned(),
            stores: StoreConfig::default(),
            devices: vec![
                DeviceSpec::new("drum", "Drum filter", Family::DrumFilter),
                DeviceSpec::new("tfp", "Technical filter", Family::TechnicalFilter),
                DeviceSpec::new("tank", "Buffer tank", Family::Tank),
            ],
        }
    }
}

impl ProcessConfig {
    /// Layer defaults, an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let cfg: Self = figment
            .merge(Env::prefixed("PONDCTL_").split("__"))
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids: Vec<&str> = self.devices.iter().map(|d| d.id.as_str()).collect();
        let n = ids.len();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != n {
            return Err(ConfigError::Validation("device ids must be unique"));
        }
        for d in &self.devices {
            if d.id.is_empty() {
                return Err(ConfigError::Validation("device id must not be empty"));
            }
            if d.timing.input_poll_ms == 0
                || d.timing.reboot_poll_ms == 0
                || d.timing.window_tick_secs == 0
                || d.timing.hour_tick_secs == 0
                || d.timing.off_retry_ms == 0
            {
                return Err(ConfigError::Validation("timer periods must be positive"));
            }
            DeviceConfig::template(&d.id, d.tunables.clone()).validate()?;
        }
        Ok(())
    }
}
