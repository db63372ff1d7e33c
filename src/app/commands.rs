//! Inbound commands and the read-only snapshot handed to API callers.
//!
//! Each [`Command`] maps onto exactly one interlock transition.  The
//! [`Device`](super::service::Device) marshals it onto the dispatch loop and
//! replies with whether anything actually changed.

use crate::config::{DeviceConfig, Tunables};
use crate::fsm::CyclePhase;
use crate::fsm::context::{Actuator, DeviceState};
use crate::pins::InputRole;

/// Commands the outside world (API, operator panel) can issue.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Enable or disable automation.
    SetAuto(bool),
    /// Run a wash cycle now, regardless of the level sensor.
    ForceCycle,
    /// Manual on/off of one actuator.
    SetActuator { actuator: Actuator, on: bool },
    SetSecurity(bool),
    SetEmergencyStop(bool),
    SetSecurityOverride(bool),
    /// Replace the device tunables (validated, persisted, broadcast).
    UpdateConfig(Tunables),
}

/// Immutable copy of everything a caller may look at.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub state: DeviceState,
    pub config: DeviceConfig,
    pub phase: CyclePhase,
    /// Started and the board is reachable.
    pub online: bool,
    /// Last scanned logical level of every bound input, by pin.
    pub inputs: Vec<(u8, InputRole, bool)>,
}

impl Snapshot {
    pub fn is_running(&self, actuator: Actuator) -> bool {
        self.state.is_energized(actuator)
    }
}
