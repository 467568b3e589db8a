//! Integration test infrastructure for serbridged
//!
//! Provides:
//! - In-memory serial devices with recorded line control ([`FakeOpener`])
//! - A controller that records output, errors and monitored traffic
//! - Fixtures for starting ports and talking to them over TCP

mod controller;
mod device;
pub mod fixtures;

pub use controller::RecordingController;
pub use device::{FakeDevice, FakeOpener, LineState};
pub use fixtures::*;
