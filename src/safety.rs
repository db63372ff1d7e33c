//! Interlock state machine.
//!
//! [`Interlock`] owns the live [`DeviceState`] of one device together with
//! its family [`Policy`] and the wash [`CycleSequencer`].  Every command,
//! input transition and timer tick ends up as one method call here; the
//! guards are evaluated at the moment of actuation, never cached.
//!
//! ## Guards
//!
//! ```text
//!  can_actuate = !emergency_stopped && (!security || security_disabled)
//!  can_cycle   = can_actuate && !cycling && running
//! ```
//!
//! ## Interlock lifecycle
//!
//! 1. Emergency stop SET: the cycle is aborted and every fitted actuator is
//!    commanded off before the transition returns.
//! 2. Security SET: the family's halt subset is commanded off and a cycle
//!    that has not reached `Stopping` is aborted.  An active override skips
//!    both.
//! 3. Interlock CLEARED: actuators whose desired flag is set are restarted
//!    in restart order, provided nothing else still blocks.
//!
//! Desired flags survive trips; `energized` only tracks what the board was
//! last told.
//!
//! ## Holders
//!
//! The emergency stop and the security trip are each held by a set of
//! [`Holder`]s: the device's own input, the operator, and every peer that
//! broadcast the signal.  The flag is set by the first holder and cleared
//! only when the last one releases it.  A release from a source that holds
//! nothing is ignored.  A flag restored from the store is held by the
//! operator.  Failed off-writes are handed back in
//! [`Transition::retry_off`] and retried by the owner until they succeed.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::time::Instant;

use crate::app::events::{EventKind, EventType};
use crate::config::UvMode;
use crate::error::{ControlError, HardwareError};
use crate::fsm::context::{Actuator, DeviceState};
use crate::fsm::states::Policy;
use crate::fsm::{CyclePhase, CycleSequencer, CycleTrigger};

// ═══════════════════════════════════════════════════════════════
//  Output port and transition report
// ═══════════════════════════════════════════════════════════════

/// Actuator writes, already resolved to the device's pin bindings.
pub trait Outputs {
    fn write(&mut self, actuator: Actuator, on: bool) -> Result<(), HardwareError>;
}

/// An audit fact produced by a transition; the owner stamps it with the
/// device identity and wall-clock time.
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub kind: EventKind,
    pub event_type: EventType,
    pub duration: Option<u64>,
    pub data: Option<f64>,
}

impl Note {
    fn new(kind: EventKind, event_type: EventType) -> Self {
        Self {
            kind,
            event_type,
            duration: None,
            data: None,
        }
    }
}

/// Cycle timer requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleTimer {
    /// Run `id` started; schedule its stage steps.
    Arm(u64),
    /// Run `id` ended early; its pending steps must never fire.
    Disarm(u64),
}

/// Outcome of one transition.
#[derive(Debug, Default)]
pub struct Transition {
    /// Whether any state actually changed.
    pub changed: bool,
    /// Off-writes that failed and must be retried.
    pub retry_off: Vec<Actuator>,
    pub timers: Vec<CycleTimer>,
    pub notes: Vec<Note>,
    /// First start-direction hardware failure, if any.
    pub fault: Option<HardwareError>,
}

impl Transition {
    pub fn unchanged() -> Self {
        Self::default()
    }

    fn note(&mut self, kind: EventKind, event_type: EventType) {
        self.notes.push(Note::new(kind, event_type));
    }

    pub fn absorb(&mut self, other: Transition) {
        self.changed |= other.changed;
        self.retry_off.extend(other.retry_off);
        self.timers.extend(other.timers);
        self.notes.extend(other.notes);
        if self.fault.is_none() {
            self.fault = other.fault;
        }
    }

    /// The start-direction failure as a command error.
    pub fn into_result(self) -> Result<Self, ControlError> {
        match self.fault {
            Some(e) => Err(ControlError::Hardware(e)),
            None => Ok(self),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Interlock
// ═══════════════════════════════════════════════════════════════

/// A latching interlock flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Latch {
    EmergencyStop,
    Security,
}

/// Who asserted a [`Latch`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Holder {
    /// The device's own input pin.
    Input,
    /// The command surface.
    Operator,
    /// Another device, by id.
    Peer(String),
}

pub struct Interlock {
    state: DeviceState,
    policy: Policy,
    cycle: CycleSequencer,
    holders: BTreeMap<Latch, BTreeSet<Holder>>,
}

impl Interlock {
    pub fn new(state: DeviceState, policy: Policy) -> Self {
        let mut holders: BTreeMap<Latch, BTreeSet<Holder>> = BTreeMap::new();
        if state.emergency_stopped {
            holders.entry(Latch::EmergencyStop).or_default().insert(Holder::Operator);
        }
        if state.security {
            holders.entry(Latch::Security).or_default().insert(Holder::Operator);
        }
        Self {
            state,
            policy,
            cycle: CycleSequencer::new(),
            holders,
        }
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn phase(&self) -> CyclePhase {
        self.cycle.phase()
    }

    /// Adopt the stamp assigned by the store after a successful write.
    pub fn restamp(&mut self, version: u64, updated_at: DateTime<Utc>) {
        self.state.version = version;
        self.state.updated_at = updated_at;
    }

    // ── Guards ────────────────────────────────────────────────────

    pub fn can_actuate(&self) -> bool {
        let s = &self.state;
        !s.emergency_stopped && (!s.security || s.security_disabled)
    }

    pub fn can_cycle(&self) -> bool {
        self.can_actuate() && !self.state.cycling && self.state.running
    }

    /// Per-actuator guard: security-exempt actuators stay controllable
    /// during a security trip, never during an emergency stop.
    pub fn may_actuate(&self, actuator: Actuator) -> bool {
        !self.state.emergency_stopped
            && (self.can_actuate() || self.policy.exempt_from_security(actuator))
    }

    fn blocker(&self) -> &'static str {
        if self.state.emergency_stopped {
            "emergency stop active"
        } else {
            "security trip active"
        }
    }

    // ── Interlocks ────────────────────────────────────────────────

    /// Sources currently holding `latch`.
    pub fn holders(&self, latch: Latch) -> impl Iterator<Item = &Holder> {
        self.holders.get(&latch).into_iter().flatten()
    }

    /// Assert or release `latch` on behalf of `holder`.
    pub fn hold(
        &mut self,
        latch: Latch,
        holder: Holder,
        active: bool,
        out: &mut dyn Outputs,
    ) -> Transition {
        let engaged = {
            let holders = self.holders.entry(latch).or_default();
            if active {
                holders.insert(holder);
            } else if !holders.remove(&holder) {
                debug!(
                    "INTERLOCK | {}: {latch:?} release from {holder:?} ignored, not held",
                    self.state.id
                );
                return Transition::unchanged();
            } else if !holders.is_empty() {
                info!(
                    "INTERLOCK | {}: {latch:?} released by {holder:?}, still held by {holders:?}",
                    self.state.id
                );
                return Transition::unchanged();
            }
            !holders.is_empty()
        };
        match latch {
            Latch::EmergencyStop => self.set_emergency_stop(engaged, out),
            Latch::Security => self.set_security(engaged, out),
        }
    }

    /// Latch or release the emergency stop.  Setting it never fails: writes
    /// that do not go through are returned for retry.
    pub fn set_emergency_stop(&mut self, active: bool, out: &mut dyn Outputs) -> Transition {
        let mut t = Transition::unchanged();
        if self.state.emergency_stopped == active {
            return t;
        }
        self.state.emergency_stopped = active;
        t.changed = true;
        if active {
            error!("INTERLOCK | {}: emergency stop SET", self.state.id);
            t.note(EventKind::Security, EventType::SetEmergencyStop);
            self.abort_cycle(out, &mut t);
            for a in self.policy.actuators {
                self.switch_off(*a, out, &mut t);
            }
        } else {
            info!("INTERLOCK | {}: emergency stop CLEARED", self.state.id);
            t.note(EventKind::Security, EventType::UnsetEmergencyStop);
            self.resume(out, &mut t);
        }
        t
    }

    pub fn set_security(&mut self, active: bool, out: &mut dyn Outputs) -> Transition {
        let mut t = Transition::unchanged();
        if self.state.security == active {
            return t;
        }
        self.state.security = active;
        t.changed = true;
        if active {
            warn!("INTERLOCK | {}: security trip SET", self.state.id);
            t.note(EventKind::Security, EventType::SetSecurity);
            if self.state.security_disabled {
                info!("INTERLOCK | {}: override active, nothing halted", self.state.id);
            } else {
                self.halt_for_security(out, &mut t);
            }
        } else {
            info!("INTERLOCK | {}: security trip CLEARED", self.state.id);
            t.note(EventKind::Security, EventType::UnsetSecurity);
            self.resume(out, &mut t);
        }
        t
    }

    /// Enable or disable the human override.  The security flag itself is
    /// left alone.
    pub fn set_security_override(&mut self, active: bool, out: &mut dyn Outputs) -> Transition {
        let mut t = Transition::unchanged();
        if self.state.security_disabled == active {
            return t;
        }
        self.state.security_disabled = active;
        t.changed = true;
        if active {
            warn!("INTERLOCK | {}: security override ON", self.state.id);
            t.note(EventKind::Security, EventType::SetSecurityOverride);
            if self.state.security {
                self.resume(out, &mut t);
            }
        } else {
            info!("INTERLOCK | {}: security override OFF", self.state.id);
            t.note(EventKind::Security, EventType::UnsetSecurityOverride);
            if self.state.security {
                self.halt_for_security(out, &mut t);
            }
        }
        t
    }

    pub fn toggle_security_override(&mut self, out: &mut dyn Outputs) -> Transition {
        let next = !self.state.security_disabled;
        self.set_security_override(next, out)
    }

    // ── Operator commands ─────────────────────────────────────────

    /// Manual on/off of one actuator.
    pub fn set_actuator(
        &mut self,
        actuator: Actuator,
        on: bool,
        out: &mut dyn Outputs,
    ) -> Result<Transition, ControlError> {
        if !self.policy.fits(actuator) {
            return Err(ControlError::NotFitted(actuator));
        }
        let mut t = Transition::unchanged();
        let stage = self.policy.is_cycle_stage(actuator);
        if on {
            if self.state.cycling && stage {
                return Err(ControlError::Invalid("actuator is driven by the running cycle"));
            }
            if !self.may_actuate(actuator) {
                return Err(ControlError::Interlocked(self.blocker()));
            }
            if self.state.is_desired(actuator) && self.state.is_energized(actuator) {
                return Ok(t);
            }
            if let Err(e) = self.switch_on(actuator, out) {
                error!("INTERLOCK | {}: {actuator} start failed: {e}", self.state.id);
                t.fault = Some(e);
                return Ok(t);
            }
            self.state.actuator_mut(actuator).desired = true;
            t.changed = true;
            t.note(EventKind::Motor, EventType::Start(actuator));
        } else {
            if !self.state.is_desired(actuator) && !self.state.is_energized(actuator) {
                return Ok(t);
            }
            if self.state.cycling && stage {
                self.abort_cycle(out, &mut t);
            }
            self.state.actuator_mut(actuator).desired = false;
            self.switch_off(actuator, out, &mut t);
            t.changed = true;
            t.note(EventKind::Motor, EventType::Stop(actuator));
        }
        Ok(t)
    }

    /// Enable or disable automation.  Auto-driven actuators follow the flag.
    pub fn set_auto(&mut self, on: bool, out: &mut dyn Outputs) -> Result<Transition, ControlError> {
        let mut t = Transition::unchanged();
        if self.state.running == on {
            return Ok(t);
        }
        if on {
            if !self.can_actuate() {
                return Err(ControlError::Interlocked(self.blocker()));
            }
            let mut started = Vec::new();
            for a in self.policy.auto_driven {
                if let Err(e) = self.switch_on(*a, out) {
                    error!("INTERLOCK | {}: auto start of {a} failed: {e}", self.state.id);
                    for b in started.into_iter().rev() {
                        self.switch_off(b, out, &mut t);
                    }
                    t.fault = Some(e);
                    return Ok(t);
                }
                started.push(*a);
            }
            for a in started {
                self.state.actuator_mut(a).desired = true;
            }
            self.state.running = true;
            info!("{}: auto mode ON", self.state.id);
            t.note(EventKind::Motor, EventType::StartAuto);
        } else {
            self.state.running = false;
            for a in self.policy.auto_driven {
                self.state.actuator_mut(*a).desired = false;
                self.switch_off(*a, out, &mut t);
            }
            info!("{}: auto mode OFF", self.state.id);
            t.note(EventKind::Motor, EventType::StopAuto);
        }
        t.changed = true;
        Ok(t)
    }

    // ── Wash cycle ────────────────────────────────────────────────

    /// Begin a cycle.  A trigger while a cycle is running, or a level trip
    /// outside auto mode, reports "not started" (`changed == false`).
    pub fn start_cycle(
        &mut self,
        trigger: CycleTrigger,
        now: Instant,
        out: &mut dyn Outputs,
    ) -> Result<Transition, ControlError> {
        let Some(stages) = self.policy.cycle else {
            return Err(ControlError::Invalid("device family has no wash cycle"));
        };
        let mut t = Transition::unchanged();
        if self.state.cycling {
            info!("CYCLE | {}: already cycling, {trigger:?} trigger not started", self.state.id);
            return Ok(t);
        }
        if !self.can_actuate() {
            return Err(ControlError::Interlocked(self.blocker()));
        }
        if trigger == CycleTrigger::Level && !self.can_cycle() {
            debug!("CYCLE | {}: level trip ignored outside auto mode", self.state.id);
            return Ok(t);
        }
        let Some(id) = self.cycle.begin(trigger, now) else {
            return Ok(t);
        };
        if let Err(e) = self.switch_on(stages.pre, out) {
            error!("CYCLE | {}: pre-stage start failed: {e}", self.state.id);
            self.cycle.abort();
            t.fault = Some(e);
            return Ok(t);
        }
        self.state.cycling = true;
        t.changed = true;
        t.timers.push(CycleTimer::Arm(id));
        Ok(t)
    }

    /// A stage timer of run `id` elapsed.  Stale ids are ignored.
    pub fn cycle_step(
        &mut self,
        id: u64,
        now: Instant,
        wall: DateTime<Utc>,
        out: &mut dyn Outputs,
    ) -> Transition {
        let mut t = Transition::unchanged();
        let Some(stages) = self.policy.cycle else {
            return t;
        };
        let Some(phase) = self.cycle.advance(id) else {
            debug!("CYCLE | {}: stale step for #{id}", self.state.id);
            return t;
        };
        t.changed = true;
        match phase {
            CyclePhase::MainStage => {
                if !self.may_actuate(stages.main) {
                    warn!("CYCLE | {}: interlocked before main stage", self.state.id);
                    self.abort_cycle(out, &mut t);
                } else if let Err(e) = self.switch_on(stages.main, out) {
                    error!("CYCLE | {}: main-stage start failed: {e}", self.state.id);
                    self.abort_cycle(out, &mut t);
                    t.fault = Some(e);
                }
            }
            CyclePhase::Stopping => {
                self.switch_off(stages.main, out, &mut t);
                self.switch_off(stages.pre, out, &mut t);
                if let Some(took) = self.cycle.finish(id, now) {
                    let s = &mut self.state;
                    s.cycling = false;
                    s.total_cycles += 1;
                    let since = s
                        .last_cycle_at
                        .map(|last| (wall - last).num_seconds().max(0) as f64);
                    s.last_cycle_at = Some(wall);
                    let mut note = Note::new(EventKind::Motor, EventType::Wash);
                    note.duration = Some(took.as_secs());
                    note.data = since;
                    t.notes.push(note);
                }
            }
            CyclePhase::PreStage | CyclePhase::Idle => {}
        }
        t
    }

    /// Restart a cycle that was in progress when the board (or the process)
    /// went away.
    pub fn recover_cycle(&mut self, now: Instant, out: &mut dyn Outputs) -> Transition {
        let mut t = Transition::unchanged();
        if !self.state.cycling {
            return t;
        }
        info!("CYCLE | {}: resuming interrupted cycle", self.state.id);
        if let Some(id) = self.cycle.abort() {
            t.timers.push(CycleTimer::Disarm(id));
        }
        self.state.cycling = false;
        t.changed = true;
        if let Some(stages) = self.policy.cycle {
            self.switch_off(stages.main, out, &mut t);
            self.switch_off(stages.pre, out, &mut t);
        }
        match self.start_cycle(CycleTrigger::Recovery, now, out) {
            Ok(started) => t.absorb(started),
            Err(e) => warn!("CYCLE | {}: recovery not started: {e}", self.state.id),
        }
        t
    }

    // ── Timed bookkeeping ─────────────────────────────────────────

    /// One hour elapsed.  Energised, selected, hour-counted actuators gain
    /// an hour; nothing is counted while interlocked.
    pub fn tick_hours(&mut self, mode: UvMode, max_hours: u32) -> Transition {
        let mut t = Transition::unchanged();
        if !self.can_actuate() {
            debug!("{}: hour tick skipped while interlocked", self.state.id);
            return t;
        }
        for a in self.policy.hour_counted {
            if !mode.selects(*a) || !self.state.is_energized(*a) {
                continue;
            }
            let st = self.state.actuator_mut(*a);
            st.hours = st.hours.saturating_add(1);
            t.changed = true;
            if st.hours == max_hours {
                warn!("{}: {a} reached {max_hours} h", self.state.id);
                t.note(EventKind::Captor, EventType::HoursExceeded(*a));
            }
        }
        t
    }

    /// Rewrite the board's outputs from memory after a (re)connect.
    pub fn replay(&mut self, out: &mut dyn Outputs) -> Transition {
        let before = self.state.clone();
        let mut t = Transition::unchanged();
        for a in self.policy.actuators {
            if self.state.is_energized(*a) && self.may_actuate(*a) {
                if let Err(e) = self.switch_on(*a, out) {
                    warn!("{}: replay of {a} failed: {e}", self.state.id);
                    self.state.actuator_mut(*a).energized = false;
                    if t.fault.is_none() {
                        t.fault = Some(e);
                    }
                }
            } else {
                self.switch_off(*a, out, &mut t);
            }
        }
        t.changed = before != self.state;
        t
    }

    /// A retried off-write went through.
    pub fn confirm_off(&mut self, actuator: Actuator) -> Transition {
        let mut t = Transition::unchanged();
        if self.state.is_energized(actuator) {
            self.state.actuator_mut(actuator).energized = false;
            t.changed = true;
        }
        t
    }

    /// Whether an off-retry for `actuator` is still wanted.
    pub fn wants_off(&self, actuator: Actuator) -> bool {
        !self.state.is_desired(actuator) || !self.may_actuate(actuator)
    }

    // ── Internal ──────────────────────────────────────────────────

    fn switch_on(&mut self, actuator: Actuator, out: &mut dyn Outputs) -> Result<(), HardwareError> {
        out.write(actuator, true)?;
        self.state.actuator_mut(actuator).energized = true;
        Ok(())
    }

    fn switch_off(&mut self, actuator: Actuator, out: &mut dyn Outputs, t: &mut Transition) {
        match out.write(actuator, false) {
            Ok(()) => self.state.actuator_mut(actuator).energized = false,
            Err(e) => {
                warn!(
                    "INTERLOCK | {}: {actuator} off failed ({e}), will retry",
                    self.state.id
                );
                if !t.retry_off.contains(&actuator) {
                    t.retry_off.push(actuator);
                }
            }
        }
    }

    fn halt_for_security(&mut self, out: &mut dyn Outputs, t: &mut Transition) {
        let stage_halted = self
            .policy
            .cycle
            .is_some_and(|c| self.policy.halted_by_security(c.pre) || self.policy.halted_by_security(c.main));
        if self.state.cycling && stage_halted && !self.cycle.past_point_of_no_return() {
            self.abort_cycle(out, t);
        }
        for a in self.policy.security_halts {
            self.switch_off(*a, out, t);
        }
    }

    fn abort_cycle(&mut self, out: &mut dyn Outputs, t: &mut Transition) {
        if let Some(id) = self.cycle.abort() {
            t.timers.push(CycleTimer::Disarm(id));
        }
        if !self.state.cycling {
            return;
        }
        self.state.cycling = false;
        if let Some(stages) = self.policy.cycle {
            self.switch_off(stages.main, out, t);
            self.switch_off(stages.pre, out, t);
        }
        t.changed = true;
        t.note(EventKind::Motor, EventType::CycleAborted);
    }

    fn resume(&mut self, out: &mut dyn Outputs, t: &mut Transition) {
        if !self.can_actuate() {
            info!("INTERLOCK | {}: still interlocked, resume skipped", self.state.id);
            return;
        }
        for a in self.policy.actuators {
            if !self.state.is_desired(*a) || self.state.is_energized(*a) {
                continue;
            }
            if let Err(e) = self.switch_on(*a, out) {
                error!("INTERLOCK | {}: resume of {a} failed: {e}", self.state.id);
                t.fault = Some(e);
                break;
            }
            info!("INTERLOCK | {}: {a} resumed", self.state.id);
            t.note(EventKind::Motor, EventType::Start(*a));
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════
