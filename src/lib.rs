//! voltbay — appointment booking and slot-capacity engine for EV service
//! centers.
//!
//! The engine owns time slots and appointments, sharded per calendar day,
//! and turns a booking request into a committed, conflict-free reservation:
//! capacity limits per slot, non-overlap per vehicle and per technician,
//! a strict appointment state machine, and reschedule chains with full
//! history. Every mutation is appended to a write-ahead log before it is
//! applied in memory, so a restart replays to the exact committed state.
//!
//! This crate is consumed in-process; the API layer that exposes it over a
//! protocol lives outside.

pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod wal;

pub use engine::{BookingError, Engine, EngineConfig};
