//! Library surface for the `modmqttd` binary and its tests — the polling
//! and dispatch engine described in SPEC_FULL.md lives here; `main.rs` is
//! just argument parsing and process wiring.

pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod modbus;
pub mod mqtt;
pub mod orchestrator;
