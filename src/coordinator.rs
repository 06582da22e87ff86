//! Conservative lockstep time arbitration.
//!
//! Every federate registers before the run starts, then repeatedly asks to
//! advance its clock. A request blocks until every non-finalized federate has
//! one outstanding; the grant is the minimum requested time, and exactly the
//! federates that asked for that minimum are released. A federate whose
//! request is larger stays blocked, so no participant ever observes simulated
//! time beyond the smallest outstanding request.
//!
//! `request_time` is the only blocking operation in the system. An optional
//! stall timeout turns a permanent stall (some federate never requesting)
//! into a [`SyncError::Stalled`] naming the missing participants.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::error::SyncError;

/// Simulated time. Units (seconds or hours) are a scenario concern; every
/// federate in a run uses the same fixed step.
pub type SimTime = f64;

/// Coordinator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Accepting registrations; no request seen yet.
    Idle,
    /// At least one time request seen.
    Running,
    /// Every registered federate has finalized.
    Drained,
}

/// Handle for a registered federate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FederateId(usize);

struct FedEntry {
    name: String,
    local_time: SimTime,
    pending: Option<SimTime>,
    finalized: bool,
}

struct CoordInner {
    feds: Vec<FedEntry>,
    state: CoordinatorState,
}

/// Arbitrates logical-time advancement across all registered federates.
pub struct TimeCoordinator {
    inner: Mutex<CoordInner>,
    released: Condvar,
    stall_timeout: Option<Duration>,
}

impl TimeCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CoordInner {
                feds: Vec::new(),
                state: CoordinatorState::Idle,
            }),
            released: Condvar::new(),
            stall_timeout: None,
        }
    }

    /// Like [`TimeCoordinator::new`], but a federate blocked longer than
    /// `timeout` wall-clock time fails with [`SyncError::Stalled`].
    pub fn with_stall_timeout(timeout: Duration) -> Self {
        Self {
            stall_timeout: Some(timeout),
            ..Self::new()
        }
    }

    /// Registers a federate. Clocks start at zero.
    ///
    /// # Panics
    ///
    /// Panics if called after the first time request; the federate set is
    /// fixed once the run starts.
    pub fn register(&self, name: &str) -> FederateId {
        let mut inner = self.inner.lock();
        assert!(
            inner.state == CoordinatorState::Idle,
            "federates must register before the run starts"
        );
        inner.feds.push(FedEntry {
            name: name.to_string(),
            local_time: 0.0,
            pending: None,
            finalized: false,
        });
        FederateId(inner.feds.len() - 1)
    }

    /// Requests advancement to time `t` and blocks until granted.
    ///
    /// Returns the granted time, which equals `t` (a federate is released
    /// only when its own request is the joint minimum). The granted sequence
    /// per federate is non-decreasing.
    ///
    /// # Errors
    ///
    /// [`SyncError::TimeRegression`] if `t` is behind the federate's clock,
    /// reported immediately and without blocking; [`SyncError::Stalled`] if
    /// a stall timeout is configured and expires; [`SyncError::Finalized`]
    /// if the federate already finalized.
    pub fn request_time(&self, id: FederateId, t: SimTime) -> Result<SimTime, SyncError> {
        let mut inner = self.inner.lock();
        {
            let entry = &mut inner.feds[id.0];
            if entry.finalized {
                return Err(SyncError::Finalized {
                    federate: entry.name.clone(),
                });
            }
            if t < entry.local_time {
                return Err(SyncError::TimeRegression {
                    federate: entry.name.clone(),
                    requested: t,
                    local_time: entry.local_time,
                });
            }
            trace!(federate = %entry.name, requested = t, "time request");
            entry.pending = Some(t);
        }
        inner.state = CoordinatorState::Running;
        if Self::try_release(&mut inner) {
            self.released.notify_all();
        }

        while inner.feds[id.0].pending.is_some() {
            match self.stall_timeout {
                Some(limit) => {
                    let timed_out = self.released.wait_for(&mut inner, limit).timed_out();
                    if timed_out && inner.feds[id.0].pending.is_some() {
                        let missing: Vec<&str> = inner
                            .feds
                            .iter()
                            .filter(|f| !f.finalized && f.pending.is_none())
                            .map(|f| f.name.as_str())
                            .collect();
                        return Err(SyncError::Stalled {
                            federate: inner.feds[id.0].name.clone(),
                            missing: missing.join(", "),
                        });
                    }
                }
                None => self.released.wait(&mut inner),
            }
        }
        Ok(inner.feds[id.0].local_time)
    }

    /// Removes the federate from arbitration. Idempotent. Its absence may
    /// release a grant the others were waiting on; once every federate has
    /// finalized the coordinator is `Drained`.
    pub fn finalize(&self, id: FederateId) {
        let mut inner = self.inner.lock();
        {
            let entry = &mut inner.feds[id.0];
            if entry.finalized {
                return;
            }
            debug!(federate = %entry.name, "federate finalized");
            entry.finalized = true;
            entry.pending = None;
        }
        if inner.feds.iter().all(|f| f.finalized) {
            inner.state = CoordinatorState::Drained;
        } else {
            Self::try_release(&mut inner);
        }
        self.released.notify_all();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CoordinatorState {
        self.inner.lock().state
    }

    /// The federate's granted clock.
    pub fn local_time(&self, id: FederateId) -> SimTime {
        self.inner.lock().feds[id.0].local_time
    }

    /// Releases every federate whose request equals the joint minimum, if
    /// all active federates have an outstanding request. Returns whether a
    /// grant was released.
    fn try_release(inner: &mut CoordInner) -> bool {
        let mut grant = SimTime::INFINITY;
        let mut active = 0;
        for f in inner.feds.iter().filter(|f| !f.finalized) {
            active += 1;
            match f.pending {
                Some(t) => grant = grant.min(t),
                None => return false,
            }
        }
        if active == 0 {
            return false;
        }
        for f in inner.feds.iter_mut().filter(|f| !f.finalized) {
            if f.pending == Some(grant) {
                f.local_time = grant;
                f.pending = None;
            }
        }
        debug!(grant, "time grant released");
        true
    }
}

impl Default for TimeCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
