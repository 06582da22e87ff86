//! Error taxonomy for the co-simulation runtime.
//!
//! `ConfigError` and `SyncError` are fatal: the first is reported before any
//! step executes, the second names the offending federate and aborts the run.
//! `SolveError` is per-step and recoverable — the grid federate re-publishes
//! the previous voltages and the run continues.

use thiserror::Error;

use crate::coordinator::SimTime;

/// Invalid scenario configuration, reported before any step executes.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed validation. `field` is the dotted TOML path.
    #[error("config error: {field} — {message}")]
    Invalid { field: String, message: String },

    /// A federate asked for a channel name the bus does not know.
    #[error("config error: unknown channel \"{name}\"")]
    UnknownChannel { name: String },

    /// A channel was registered twice.
    #[error("config error: channel \"{name}\" registered more than once")]
    DuplicateChannel { name: String },

    /// Two federates claimed the same channel as their publication.
    #[error("config error: channel \"{name}\" already has a producer")]
    DuplicatePublisher { name: String },

    /// The scenario file could not be read.
    #[error("config error: cannot read \"{path}\": {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The scenario file is not valid TOML for the expected schema.
    #[error("config error: {0}")]
    Parse(String),

    /// An unknown preset name was requested.
    #[error("config error: unknown preset \"{name}\", available: {available}")]
    UnknownPreset { name: String, available: String },
}

impl ConfigError {
    /// Shorthand for a field validation error.
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Violation of the lockstep time protocol. Fatal, carries the federate name.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A federate requested a time behind its own clock.
    #[error(
        "federate \"{federate}\" requested t={requested} behind its own clock t={local_time}"
    )]
    TimeRegression {
        federate: String,
        requested: SimTime,
        local_time: SimTime,
    },

    /// A grant never formed because some federates never issued a request.
    #[error("federate \"{federate}\" stalled waiting for a grant; no request from: {missing}")]
    Stalled { federate: String, missing: String },

    /// An operation referenced a federate after it finalized.
    #[error("federate \"{federate}\" already finalized")]
    Finalized { federate: String },
}

/// The grid solver failed to produce a solution for one step.
///
/// Recoverable: the previous step's voltages stay on the bus and the record
/// for this step is flagged stale.
#[derive(Debug, Clone, Error)]
#[error("power flow did not converge at t={time}: {reason}")]
pub struct SolveError {
    pub time: SimTime,
    pub reason: String,
}

/// Top-level failure of a scenario run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    /// A federate thread panicked.
    #[error("federate thread \"{federate}\" panicked")]
    FederatePanic { federate: String },
}
