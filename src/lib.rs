//! Lockstep co-simulation of a small distribution feeder: a PV plant, a
//! battery storage controller, and a grid solver advance through a shared
//! timeline as federates, exchanging measurements over a last-value cache
//! bus.

/// Last-value-cached pub/sub channels.
pub mod bus;
pub mod config;
/// Conservative lockstep time arbitration.
pub mod coordinator;
pub mod devices;
pub mod error;
pub mod federate;
pub mod grid;
pub mod runner;
pub mod telemetry;
