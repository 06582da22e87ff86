//! Simulation participants: generation and storage.

/// Storage feedback controller and federate.
pub mod ess;
/// Renewable generation model and federate.
pub mod solar;

pub use ess::{ControlPolicy, EssController, EssFederate, EssMode, IdleBalancing, StorageState};
pub use solar::{Perturbation, PvArray, PvFederate};
