//! Simulated I/O board.
//!
//! Behaves like a networked relay board: pins hold levels, a firmware
//! reset clears the outputs and raises the `rebooted` value, and the
//! transport can be taken down.  Clones share one board, so a test keeps a
//! handle while the device owns another.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::info;
use serde_json::Value;

use crate::app::ports::{
    ACK_REBOOT_FN, DigitalActuator, DigitalSensor, REBOOTED_VALUE, Reconnectable, RemoteBoard,
};
use crate::error::HardwareError;
use crate::pins::IoMap;

#[derive(Debug, Default)]
struct SimState {
    connected: bool,
    unreachable: bool,
    rebooted: bool,
    refuse_connects: u32,
    /// Output levels, as last written.  Lost on reboot.
    outputs: BTreeMap<u8, bool>,
    /// Externally driven input levels.
    inputs: BTreeMap<u8, bool>,
    failing_pins: BTreeSet<u8>,
    writes: Vec<(u8, bool)>,
    connects: u32,
    reconnects: u32,
    halts: u32,
    acks: u32,
}

#[derive(Clone)]
pub struct SimBoard {
    name: Arc<str>,
    state: Arc<Mutex<SimState>>,
}

impl SimBoard {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reachable(&self, s: &SimState) -> Result<(), HardwareError> {
        if s.unreachable {
            return Err(HardwareError::Transport(format!("{} unreachable", self.name)));
        }
        if !s.connected {
            return Err(HardwareError::Transport(format!("{} not connected", self.name)));
        }
        Ok(())
    }

    // ── Test controls ─────────────────────────────────────────────

    /// Drive an input pin (raw electrical level).
    pub fn set_input(&self, pin: u8, level: bool) {
        self.lock().inputs.insert(pin, level);
    }

    /// Drive every bound input to its inactive level (pulled up for
    /// active-low contacts).
    pub fn release_inputs(&self, io: &IoMap) {
        let mut s = self.lock();
        for binding in &io.inputs {
            s.inputs.insert(binding.pin, binding.active_low);
        }
    }

    /// Current output level of a pin.
    pub fn level(&self, pin: u8) -> bool {
        self.lock().outputs.get(&pin).copied().unwrap_or(false)
    }

    /// Simulate a firmware restart: outputs drop and `rebooted` is raised.
    pub fn reboot(&self) {
        let mut s = self.lock();
        s.outputs.clear();
        s.rebooted = true;
        info!("{}: simulated reboot", self.name);
    }

    /// Take the transport down (or bring it back).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_connects(&self, n: u32) {
        self.lock().refuse_connects = n;
    }

    /// Make writes to `pin` fail (or succeed again).
    pub fn set_pin_failing(&self, pin: u8, failing: bool) {
        let mut s = self.lock();
        if failing {
            s.failing_pins.insert(pin);
        } else {
            s.failing_pins.remove(&pin);
        }
    }

    pub fn writes(&self) -> Vec<(u8, bool)> {
        self.lock().writes.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn is_rebooted(&self) -> bool {
        self.lock().rebooted
    }

    pub fn connects(&self) -> u32 {
        self.lock().connects
    }

    pub fn reconnects(&self) -> u32 {
        self.lock().reconnects
    }

    pub fn halts(&self) -> u32 {
        self.lock().halts
    }

    pub fn acks(&self) -> u32 {
        self.lock().acks
    }
}

impl DigitalActuator for SimBoard {
    fn digital_write(&mut self, pin: u8, level: bool) -> Result<(), HardwareError> {
        let mut s = self.lock();
        self.reachable(&s)?;
        if s.failing_pins.contains(&pin) {
            return Err(HardwareError::Io {
                pin,
                reason: "relay did not respond".into(),
            });
        }
        s.outputs.insert(pin, level);
        s.writes.push((pin, level));
        Ok(())
    }
}

impl DigitalSensor for SimBoard {
    fn digital_read(&mut self, pin: u8) -> Result<bool, HardwareError> {
        let s = self.lock();
        self.reachable(&s)?;
        let level = s.inputs.get(&pin).or_else(|| s.outputs.get(&pin));
        Ok(level.copied().unwrap_or(false))
    }
}

impl Reconnectable for SimBoard {
    fn connect(&mut self) -> Result<(), HardwareError> {
        let mut s = self.lock();
        if s.refuse_connects > 0 {
            s.refuse_connects -= 1;
            return Err(HardwareError::Transport(format!("{} refused", self.name)));
        }
        if s.unreachable {
            return Err(HardwareError::Transport(format!("{} unreachable", self.name)));
        }
        s.connected = true;
        s.connects += 1;
        Ok(())
    }

    fn reconnect(&mut self) -> Result<(), HardwareError> {
        let mut s = self.lock();
        if s.unreachable {
            return Err(HardwareError::Transport(format!("{} unreachable", self.name)));
        }
        s.connected = true;
        s.reconnects += 1;
        Ok(())
    }

    fn halt(&mut self) -> Result<(), HardwareError> {
        let mut s = self.lock();
        s.connected = false;
        s.halts += 1;
        Ok(())
    }
}

impl RemoteBoard for SimBoard {
    fn read_value(&mut self, name: &str) -> Result<Value, HardwareError> {
        let s = self.lock();
        self.reachable(&s)?;
        match name {
            REBOOTED_VALUE => Ok(Value::Bool(s.rebooted)),
            other => Err(HardwareError::Unsupported(format!("value {other}"))),
        }
    }

    fn call_function(&mut self, name: &str, _args: &[Value]) -> Result<(), HardwareError> {
        let mut s = self.lock();
        self.reachable(&s)?;
        match name {
            ACK_REBOOT_FN => {
                s.rebooted = false;
                s.acks += 1;
                Ok(())
            }
            other => Err(HardwareError::Unsupported(format!("function {other}"))),
        }
    }
}
