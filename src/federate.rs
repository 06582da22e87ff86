//! Generic driver loop, one instance per simulation participant.
//!
//! A federate's life is the same regardless of what it models: request the
//! next time, block until the coordinator grants it, read subscriptions,
//! compute, publish, repeat until the horizon or an external stop signal.
//! The participant-specific part is a [`FederateModel`]; the driver owns the
//! protocol so every participant requests the same fixed step and finalizes
//! on every exit path.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::bus::Bus;
use crate::coordinator::{FederateId, SimTime, TimeCoordinator};
use crate::error::{SolveError, SyncError};

/// One simulation participant's step function.
pub trait FederateModel: Send {
    fn name(&self) -> &'static str;

    /// Executes one granted step: read subscribed channels, compute, publish
    /// outputs.
    ///
    /// # Errors
    ///
    /// An error is per-step and already recovered by the model (its previous
    /// outputs remain on the bus); the driver logs it and the run continues.
    fn step(&mut self, t: SimTime, bus: &Bus) -> Result<(), SolveError>;
}

/// Drives one federate from time zero to the horizon.
pub struct FederateRuntime<'a> {
    coordinator: &'a TimeCoordinator,
    bus: &'a Bus,
    stop: &'a AtomicBool,
    id: FederateId,
    horizon: SimTime,
    step: SimTime,
}

impl<'a> FederateRuntime<'a> {
    pub fn new(
        coordinator: &'a TimeCoordinator,
        bus: &'a Bus,
        stop: &'a AtomicBool,
        id: FederateId,
        horizon: SimTime,
        step: SimTime,
    ) -> Self {
        Self {
            coordinator,
            bus,
            stop,
            id,
            horizon,
            step,
        }
    }

    /// Runs the loop to completion and returns the model (with its step log).
    ///
    /// The federate is finalized on every exit path — horizon reached, stop
    /// signal observed, or fatal synchronization error — so the remaining
    /// participants can keep forming grants and drain.
    ///
    /// # Errors
    ///
    /// Returns the [`SyncError`] that aborted the loop, after finalizing.
    pub fn run<M: FederateModel>(self, mut model: M) -> Result<M, SyncError> {
        let mut t: SimTime = 0.0;
        while t < self.horizon {
            if self.stop.load(Ordering::Relaxed) {
                debug!(federate = model.name(), t, "stop signal observed");
                break;
            }
            t = match self.coordinator.request_time(self.id, t + self.step) {
                Ok(granted) => granted,
                Err(e) => {
                    self.coordinator.finalize(self.id);
                    return Err(e);
                }
            };
            if let Err(e) = model.step(t, self.bus) {
                warn!(federate = model.name(), error = %e, "step failed; previous outputs stay on the bus");
            }
        }
        self.coordinator.finalize(self.id);
        debug!(federate = model.name(), t, "federate finished");
        Ok(model)
    }
}
