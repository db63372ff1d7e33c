//! Device state record threaded through every interlock and cycle handler.
//!
//! `DeviceState` is the single struct the interlock machine reads from and
//! writes to.  It holds the safety flags, the per-actuator desired and
//! physical state, counters and timestamps.  The dispatch loop owns the live
//! copy; everything else sees clones.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::states::Policy;

// ---------------------------------------------------------------------------
// Device families and actuators
// ---------------------------------------------------------------------------

/// The three device families driven by this controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    /// Rotating drum filter with a spray-bar wash pump.
    DrumFilter,
    /// Technical filter chamber: aeration, filtration pump, UV clarifiers.
    TechnicalFilter,
    /// Buffer tank with a transfer pump.
    Tank,
}

/// Every switchable output the controller knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actuator {
    WashPump,
    Drum,
    Bubbler,
    FilterPump,
    Uv1,
    Uv2,
    TankPump,
}

impl Actuator {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WashPump => "wash_pump",
            Self::Drum => "drum",
            Self::Bubbler => "bubbler",
            Self::FilterPump => "filter_pump",
            Self::Uv1 => "uv1",
            Self::Uv2 => "uv2",
            Self::TankPump => "tank_pump",
        }
    }
}

impl fmt::Display for Actuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Per-actuator state
// ---------------------------------------------------------------------------

/// Desired and physical state of one actuator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorState {
    /// Operator intent; survives interlock trips and is replayed on resume.
    pub desired: bool,
    /// Last level successfully written to the board.
    pub energized: bool,
    /// Accumulated running hours (blister hours for UV lamps).
    pub hours: u32,
}

// ---------------------------------------------------------------------------
// DeviceState
// ---------------------------------------------------------------------------

/// Persisted per-device operational state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub id: String,
    pub name: String,
    pub family: Family,

    // -- Operational flags --
    /// Automation enabled (auto mode).
    pub running: bool,
    /// A wash/treatment cycle is in progress.
    pub cycling: bool,
    /// Security trip active.
    pub security: bool,
    /// Human override: security no longer blocks actuation.
    pub security_disabled: bool,
    /// Emergency stop latched.  Dominates every other flag.
    pub emergency_stopped: bool,

    // -- Actuators --
    pub actuators: BTreeMap<Actuator, ActuatorState>,

    // -- Counters and timestamps --
    pub total_cycles: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl DeviceState {
    /// Default template used when neither store holds a record.
    pub fn template(id: &str, name: &str, policy: &Policy) -> Self {
        Self {
            id: id.to_owned(),
            name: name.to_owned(),
            family: policy.family,
            running: false,
            cycling: false,
            security: false,
            security_disabled: false,
            emergency_stopped: false,
            actuators: policy
                .actuators
                .iter()
                .map(|a| (*a, ActuatorState::default()))
                .collect(),
            total_cycles: 0,
            last_cycle_at: None,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
            version: 0,
        }
    }

    /// Physical state as reported to callers.
    pub fn is_energized(&self, actuator: Actuator) -> bool {
        self.actuators.get(&actuator).is_some_and(|s| s.energized)
    }

    /// Remembered operator intent.
    pub fn is_desired(&self, actuator: Actuator) -> bool {
        self.actuators.get(&actuator).is_some_and(|s| s.desired)
    }

    pub fn hours(&self, actuator: Actuator) -> u32 {
        self.actuators.get(&actuator).map_or(0, |s| s.hours)
    }

    /// True if any fitted actuator is physically on.
    pub fn any_energized(&self) -> bool {
        self.actuators.values().any(|s| s.energized)
    }

    pub(crate) fn actuator_mut(&mut self, actuator: Actuator) -> &mut ActuatorState {
        self.actuators.entry(actuator).or_default()
    }
}
