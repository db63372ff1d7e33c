//! Board pin bindings.
//!
//! Single source of truth for which board pin drives which actuator and
//! which pin carries which input role.  The defaults below match the relay
//! boards shipped with each device family; process configuration may
//! replace them wholesale.

use serde::{Deserialize, Serialize};

use crate::fsm::context::{Actuator, Family};

// ---------------------------------------------------------------------------
// Input roles
// ---------------------------------------------------------------------------

/// What an input pin means to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputRole {
    /// Latching mushroom button; level-follow.
    EmergencyStop,
    /// Security contact (float switch, lid, leak probe); level-follow.
    Security,
    /// Key switch; each press toggles the security override.
    SecurityOverride,
    /// Level sensor asking for a wash in auto mode; rising edge.
    CycleTrigger,
    /// Operator push button forcing a wash; rising edge.
    ForceCycle,
    /// Operator push button toggling auto mode; rising edge.
    AutoToggle,
}

impl InputRole {
    /// Level-follow roles act on both edges; the rest only on press.
    pub const fn follows_level(self) -> bool {
        matches!(self, Self::EmergencyStop | Self::Security)
    }
}

// ---------------------------------------------------------------------------
// Bindings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputBinding {
    pub actuator: Actuator,
    pub pin: u8,
    #[serde(default)]
    pub active_low: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputBinding {
    pub role: InputRole,
    pub pin: u8,
    #[serde(default)]
    pub active_low: bool,
}

/// All bindings of one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoMap {
    pub outputs: Vec<OutputBinding>,
    pub inputs: Vec<InputBinding>,
}

impl IoMap {
    pub fn output(&self, actuator: Actuator) -> Option<&OutputBinding> {
        self.outputs.iter().find(|b| b.actuator == actuator)
    }

    /// Relay-board layout shipped with each family.
    pub fn default_for(family: Family) -> Self {
        let out = |actuator, pin| OutputBinding {
            actuator,
            pin,
            active_low: false,
        };
        let inp = |role, pin, active_low| InputBinding {
            role,
            pin,
            active_low,
        };
        match family {
            Family::DrumFilter => Self {
                outputs: vec![out(Actuator::WashPump, 2), out(Actuator::Drum, 3)],
                inputs: vec![
                    inp(InputRole::EmergencyStop, 10, true),
                    inp(InputRole::CycleTrigger, 11, false),
                    inp(InputRole::ForceCycle, 12, true),
                    inp(InputRole::SecurityOverride, 13, true),
                    inp(InputRole::Security, 14, false),
                ],
            },
            Family::TechnicalFilter => Self {
                outputs: vec![
                    out(Actuator::Bubbler, 2),
                    out(Actuator::FilterPump, 3),
                    out(Actuator::Uv1, 4),
                    out(Actuator::Uv2, 5),
                ],
                inputs: vec![
                    inp(InputRole::EmergencyStop, 10, true),
                    inp(InputRole::AutoToggle, 11, true),
                    inp(InputRole::SecurityOverride, 13, true),
                    inp(InputRole::Security, 14, false),
                ],
            },
            Family::Tank => Self {
                outputs: vec![out(Actuator::TankPump, 2)],
                inputs: vec![
                    inp(InputRole::EmergencyStop, 10, true),
                    inp(InputRole::Security, 14, false),
                ],
            },
        }
    }
}
