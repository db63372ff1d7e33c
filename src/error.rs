//! Unified error types for the pond controller.
//!
//! Each concern owns a small enum; [`ControlError`] is what the command
//! surface returns.  Hardware and store errors are `Clone` so the dispatch
//! loop can both log them and hand them back to the caller.

use thiserror::Error;

use crate::fsm::context::Actuator;

// ---------------------------------------------------------------------------
// Hardware errors
// ---------------------------------------------------------------------------

/// Failure of a board-level operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HardwareError {
    /// A pin write or read failed on an otherwise reachable board.
    #[error("I/O error on pin {pin}: {reason}")]
    Io { pin: u8, reason: String },
    /// The board could not be reached at all.
    #[error("transport error: {0}")]
    Transport(String),
    /// No binding exists for the requested pin.
    #[error("unknown pin {0}")]
    UnknownPin(u8),
    /// The board does not implement the requested remote function or value.
    #[error("unsupported board operation: {0}")]
    Unsupported(String),
}

impl HardwareError {
    /// Transport errors mean the board is gone, not that one write failed.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

/// Failure of a record store or the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// `update` was issued for a key that does not exist.
    #[error("record {0} not found")]
    NotFound(String),
    /// `create` was issued for a key that already exists.
    #[error("record {0} already exists")]
    AlreadyExists(String),
    /// The stored bytes could not be decoded (corruption).
    #[error("codec error: {0}")]
    Codec(String),
    /// Underlying I/O failed.
    #[error("I/O error: {0}")]
    Io(String),
    /// The store is unreachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

/// Configuration failed to load or validate.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed range validation.
    #[error("validation failed: {0}")]
    Validation(&'static str),
    /// The layered configuration could not be extracted.
    #[error("config load failed: {0}")]
    Load(#[from] Box<figment::Error>),
}

// ---------------------------------------------------------------------------
// Control errors (command surface)
// ---------------------------------------------------------------------------

/// Errors returned by device commands.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    /// An interlock (emergency stop or security) blocks the command.
    #[error("interlocked: {0}")]
    Interlocked(&'static str),
    /// The device is not started.
    #[error("device {0} is offline")]
    Offline(String),
    /// The actuator is not part of this device family.
    #[error("actuator {0} is not fitted on this device")]
    NotFitted(Actuator),
    /// Start-direction hardware write failed; the flag was not set.
    #[error("hardware: {0}")]
    Hardware(#[from] HardwareError),
    /// The transition happened but could not be persisted to the primary store.
    #[error("durability gap: {0}")]
    Durability(StoreError),
    /// The command was rejected before reaching the hardware.
    #[error("invalid command: {0}")]
    Invalid(&'static str),
}

/// Crate-wide `Result` alias for command operations.
pub type Result<T> = core::result::Result<T, ControlError>;
