//! Per-family policy tables.
//!
//! Every device family is described by one static [`Policy`] value: which
//! actuators it has, the order they restart in, which of them a security
//! trip must halt, and which timed behaviours apply.  The interlock machine
//! and the scheduler are written once against this table.
//!
//! ```text
//!  family            restart order                     security halts
//!  ───────────────   ───────────────────────────────   ─────────────────────
//!  DrumFilter        wash_pump, drum                   wash_pump, drum
//!  TechnicalFilter   bubbler, filter_pump, uv1, uv2    filter_pump, uv1, uv2
//!  Tank              tank_pump                         tank_pump
//! ```

use super::context::{Actuator, Family};

/// The two actuators a wash/treatment cycle drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleStages {
    /// Energised first and kept on for the whole cycle (e.g. spray pump).
    pub pre: Actuator,
    /// Energised after the pre-stage (e.g. drum motor).
    pub main: Actuator,
}

/// Static description of a device family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub family: Family,
    /// Fitted actuators, in restart order (aeration → pumps → treatment).
    pub actuators: &'static [Actuator],
    /// Actuators a security trip switches off.
    pub security_halts: &'static [Actuator],
    /// Actuators that remain controllable while security is tripped.
    pub security_exempt: &'static [Actuator],
    /// Wash cycle, if the family has one.
    pub cycle: Option<CycleStages>,
    /// Actuators that follow the `running` (auto) flag.
    pub auto_driven: &'static [Actuator],
    /// Actuators whose running hours are accounted.
    pub hour_counted: &'static [Actuator],
    /// Whether the start/stop time-of-day window applies.
    pub windowed: bool,
}

const DRUM_FILTER: Policy = Policy {
    family: Family::DrumFilter,
    actuators: &[Actuator::WashPump, Actuator::Drum],
    security_halts: &[Actuator::WashPump, Actuator::Drum],
    security_exempt: &[],
    cycle: Some(CycleStages {
        pre: Actuator::WashPump,
        main: Actuator::Drum,
    }),
    auto_driven: &[],
    hour_counted: &[],
    windowed: false,
};

const TECHNICAL_FILTER: Policy = Policy {
    family: Family::TechnicalFilter,
    actuators: &[
        Actuator::Bubbler,
        Actuator::FilterPump,
        Actuator::Uv1,
        Actuator::Uv2,
    ],
    security_halts: &[Actuator::FilterPump, Actuator::Uv1, Actuator::Uv2],
    // Aeration keeps the biology alive; it is never a hazard.
    security_exempt: &[Actuator::Bubbler],
    cycle: None,
    auto_driven: &[Actuator::FilterPump],
    hour_counted: &[Actuator::Uv1, Actuator::Uv2],
    windowed: true,
};

const TANK: Policy = Policy {
    family: Family::Tank,
    actuators: &[Actuator::TankPump],
    security_halts: &[Actuator::TankPump],
    security_exempt: &[],
    cycle: None,
    auto_driven: &[Actuator::TankPump],
    hour_counted: &[Actuator::TankPump],
    windowed: true,
};

impl Policy {
    /// Look up the policy table for a family.
    pub const fn for_family(family: Family) -> Self {
        match family {
            Family::DrumFilter => DRUM_FILTER,
            Family::TechnicalFilter => TECHNICAL_FILTER,
            Family::Tank => TANK,
        }
    }

    pub fn fits(&self, actuator: Actuator) -> bool {
        self.actuators.contains(&actuator)
    }

    pub fn halted_by_security(&self, actuator: Actuator) -> bool {
        self.security_halts.contains(&actuator)
    }

    pub fn exempt_from_security(&self, actuator: Actuator) -> bool {
        self.security_exempt.contains(&actuator)
    }

    /// True if the actuator is one of the cycle's stage actuators.
    pub fn is_cycle_stage(&self, actuator: Actuator) -> bool {
        self.cycle
            .is_some_and(|c| c.pre == actuator || c.main == actuator)
    }
}
