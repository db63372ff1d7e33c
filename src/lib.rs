//! Pond equipment controller library.
//!
//! Each configured [`Device`](app::service::Device) drives one relay board
//! (drum filter, technical filter or tank) under hard interlocks, runs its
//! timed wash cycles, and keeps its persisted records converged across a
//! primary and an optional secondary store.

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod config;
pub mod error;
pub mod events;
pub mod fsm;
pub mod pins;
pub mod reconcile;
pub mod safety;
pub mod scheduler;
