//! Audit events.
//!
//! The dispatch loop publishes an [`Event`] for every significant
//! transition.  They are immutable facts, written append-only and
//! best-effort through the [`EventLog`](super::ports::EventLog) port.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fsm::context::Actuator;

/// Coarse category of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Sensor-originated (level trip, hour accounting).
    Captor,
    /// Actuator or cycle activity.
    Motor,
    /// Board reachability.
    Board,
    /// Interlock transitions.
    Security,
}

/// What happened.  Serialised as a snake_case string such as `"wash"` or
/// `"start_drum"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum EventType {
    Wash,
    CycleAborted,
    StartAuto,
    StopAuto,
    Start(Actuator),
    Stop(Actuator),
    SetEmergencyStop,
    UnsetEmergencyStop,
    SetSecurity,
    UnsetSecurity,
    SetSecurityOverride,
    UnsetSecurityOverride,
    HoursExceeded(Actuator),
    ConfigUpdated,
    Reboot,
    Offline,
    Online,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wash => f.write_str("wash"),
            Self::CycleAborted => f.write_str("cycle_aborted"),
            Self::StartAuto => f.write_str("start_auto"),
            Self::StopAuto => f.write_str("stop_auto"),
            Self::Start(a) => write!(f, "start_{a}"),
            Self::Stop(a) => write!(f, "stop_{a}"),
            Self::SetEmergencyStop => f.write_str("set_emergency_stop"),
            Self::UnsetEmergencyStop => f.write_str("unset_emergency_stop"),
            Self::SetSecurity => f.write_str("set_security"),
            Self::UnsetSecurity => f.write_str("unset_security"),
            Self::SetSecurityOverride => f.write_str("set_security_override"),
            Self::UnsetSecurityOverride => f.write_str("unset_security_override"),
            Self::HoursExceeded(a) => write!(f, "hours_exceeded_{a}"),
            Self::ConfigUpdated => f.write_str("config_updated"),
            Self::Reboot => f.write_str("reboot"),
            Self::Offline => f.write_str("offline"),
            Self::Online => f.write_str("online"),
        }
    }
}

const ACTUATORS: [Actuator; 7] = [
    Actuator::WashPump,
    Actuator::Drum,
    Actuator::Bubbler,
    Actuator::FilterPump,
    Actuator::Uv1,
    Actuator::Uv2,
    Actuator::TankPump,
];

fn parse_actuator(s: &str) -> Option<Actuator> {
    ACTUATORS.into_iter().find(|a| a.as_str() == s)
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let plain = [
            Self::Wash,
            Self::CycleAborted,
            Self::StartAuto,
            Self::StopAuto,
            Self::SetEmergencyStop,
            Self::UnsetEmergencyStop,
            Self::SetSecurity,
            Self::UnsetSecurity,
            Self::SetSecurityOverride,
            Self::UnsetSecurityOverride,
            Self::ConfigUpdated,
            Self::Reboot,
            Self::Offline,
            Self::Online,
        ];
        if let Some(t) = plain.into_iter().find(|t| t.to_string() == s) {
            return Ok(t);
        }
        let tagged = s
            .strip_prefix("hours_exceeded_")
            .and_then(parse_actuator)
            .map(Self::HoursExceeded)
            .or_else(|| s.strip_prefix("start_").and_then(parse_actuator).map(Self::Start))
            .or_else(|| s.strip_prefix("stop_").and_then(parse_actuator).map(Self::Stop));
        tagged.ok_or_else(|| format!("unknown event type {s:?}"))
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        t.to_string()
    }
}

impl TryFrom<String> for EventType {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub source_id: String,
    pub source_name: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Seconds (cycle length, time since the previous cycle...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<f64>,
}

impl Event {
    pub fn new(
        source_id: &str,
        source_name: &str,
        timestamp: DateTime<Utc>,
        kind: EventKind,
        event_type: EventType,
    ) -> Self {
        Self {
            source_id: source_id.to_owned(),
            source_name: source_name.to_owned(),
            timestamp,
            kind,
            event_type,
            duration: None,
            data: None,
        }
    }

    #[must_use]
    pub fn with_duration(mut self, secs: u64) -> Self {
        self.duration = Some(secs);
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: f64) -> Self {
        self.data = Some(data);
        self
    }
}
