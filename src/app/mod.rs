//! Application layer of the controller.
//!
//! The domain rules (interlocks, cycle sequencing, reconciliation) live in
//! sibling modules; this layer wires them to the outside world.  All
//! interaction with boards, stores and the audit trail goes through the
//! **port traits** in [`ports`], so every device can be driven entirely by
//! in-process adapters in tests.

pub mod commands;
pub mod events;
pub mod ports;
pub mod service;
