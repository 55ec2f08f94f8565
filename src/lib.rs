//! Modbus RTU master for HVAC zone controllers behind a half-duplex serial adaptor.
//!
//! Bus access is layered leaves first: [`protocol`] builds and checks frames,
//! [`transport`] moves them over the line, [`sequencer`] keeps exactly one
//! request in flight, and [`engine`] discovers units and keeps their registers
//! in sync.

pub mod config;
pub mod emulator;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod sequencer;
pub mod transport;
pub mod unit;

pub use error::{BusError, Result};
