//! Port traits: the hexagonal boundary between the controller and the outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ Device (domain)
//! ```
//!
//! Driven adapters (boards, record stores, audit logs, clocks) implement
//! these traits.  The [`Device`](super::service::Device) consumes them as
//! trait objects, so the domain core never touches hardware directly and a
//! simulated board can stand in for a networked one in tests.
//!
//! Hardware calls are synchronous and may block; everything else is async.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{HardwareError, StoreError};

use super::events::Event;

// ───────────────────────────────────────────────────────────────
// Hardware capabilities (driven adapter: domain → board)
// ───────────────────────────────────────────────────────────────

/// Boolean digital output (relay, contactor, LED).
pub trait DigitalActuator {
    fn digital_write(&mut self, pin: u8, level: bool) -> Result<(), HardwareError>;
}

/// Boolean digital input (button, float switch, contact).
pub trait DigitalSensor {
    fn digital_read(&mut self, pin: u8) -> Result<bool, HardwareError>;
}

/// Board-level connection lifecycle.
pub trait Reconnectable {
    /// First connection after process start or after `halt`.
    fn connect(&mut self) -> Result<(), HardwareError>;
    /// Re-establish the transport after the board rebooted.
    fn reconnect(&mut self) -> Result<(), HardwareError>;
    /// Release the transport.
    fn halt(&mut self) -> Result<(), HardwareError>;
}

/// Named values and functions exposed by networked boards.
pub trait RemoteBoard {
    fn read_value(&mut self, name: &str) -> Result<serde_json::Value, HardwareError>;
    fn call_function(
        &mut self,
        name: &str,
        args: &[serde_json::Value],
    ) -> Result<(), HardwareError>;
}

/// Everything a device needs from its board.
pub trait BoardPort: DigitalActuator + DigitalSensor + Reconnectable + RemoteBoard + Send {}

impl<T> BoardPort for T where T: DigitalActuator + DigitalSensor + Reconnectable + RemoteBoard + Send {}

/// Remote value a board raises after its firmware restarted.
pub const REBOOTED_VALUE: &str = "rebooted";
/// Remote function that clears [`REBOOTED_VALUE`].
pub const ACK_REBOOT_FN: &str = "ack_reboot";

// ───────────────────────────────────────────────────────────────
// Record store (driven adapter: domain ↔ persistence)
// ───────────────────────────────────────────────────────────────

/// Boxed future returned by store operations, so stores stay object-safe.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Which field arbitrates between two copies of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arbitration {
    /// Config-like records: strict per-store version increment.
    Version,
    /// State-like records: last writer wins by wall-clock stamp.
    UpdatedAt,
}

/// A persisted entity carrying a version/timestamp pair.
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const ARBITRATION: Arbitration;
    /// Store collection name (e.g. `"states"`).
    const COLLECTION: &'static str;

    fn key(&self) -> &str;
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
    fn updated_at(&self) -> DateTime<Utc>;
    fn set_updated_at(&mut self, at: DateTime<Utc>);
}

/// One backing store for records of type `R`.
///
/// Implementations write exactly what they are given; stamping and version
/// arithmetic belong to the reconciler.
pub trait RecordStore<R: Record>: Send + Sync {
    /// Human-readable label for logs.
    fn label(&self) -> &str;
    /// `Ok(None)` when the key is absent.
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<R>>;
    /// Insert a new record; fails if the key exists.
    fn create<'a>(&'a self, record: &'a R) -> StoreFuture<'a, ()>;
    /// Overwrite an existing record; fails if the key is absent.
    fn update<'a>(&'a self, record: &'a R) -> StoreFuture<'a, ()>;
}

// ───────────────────────────────────────────────────────────────
// Audit log (driven adapter: domain → append-only event trail)
// ───────────────────────────────────────────────────────────────

/// Append-only sink for audit [`Event`]s.  Failures are logged by the
/// caller and never fatal.
pub trait EventLog: Send + Sync {
    fn append<'a>(&'a self, event: &'a Event) -> StoreFuture<'a, ()>;
}

// ───────────────────────────────────────────────────────────────
// Clock
// ───────────────────────────────────────────────────────────────

/// Wall-clock source for timestamps and time-of-day windows.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
