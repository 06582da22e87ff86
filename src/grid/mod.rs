//! Grid solver boundary: typed voltages, the solver adapter, and the
//! federate that drives it.

/// Typed complex voltage value.
pub mod phasor;
pub mod solver;

pub use phasor::VoltagePhasor;
pub use solver::{
    DEFAULT_VOLTAGE_PU, FeederSolver, GridFederate, GridLoad, GridSolver, LoadProfile,
    LoadSetpoint, LoadVariation, MonitoredBus, SolveRequest, SolveResponse,
};
