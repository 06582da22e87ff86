//! Grid solver adapter and the federate that drives it.
//!
//! The solver itself is an external collaborator: it accepts per-step load,
//! generation, and storage setpoints, and returns per-bus voltage phasors or
//! an explicit failure. [`FeederSolver`] is the built-in stand-in — a radial
//! voltage-drop model, not a power-flow implementation.

use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::{debug, trace};

use crate::bus::{Bus, Publication, Subscription, Value, channel};
use crate::coordinator::SimTime;
use crate::devices::ess::EssMode;
use crate::error::{ConfigError, SolveError};
use crate::federate::FederateModel;
use crate::grid::phasor::VoltagePhasor;

/// Voltage read by subscribers before the first solve is visible.
pub const DEFAULT_VOLTAGE_PU: f32 = 0.98;

/// Magnitudes outside this band are treated as a failed solve.
const PLAUSIBLE_PU: std::ops::RangeInclusive<f32> = 0.5..=1.5;

/// A configured load with its base setpoint.
#[derive(Debug, Clone)]
pub struct GridLoad {
    pub name: String,
    pub kw: f32,
    pub kvar: f32,
    /// Fixed loads keep their base setpoint; the rest follow the profile.
    pub fixed: bool,
}

/// One load's setpoint for a single step.
#[derive(Debug, Clone)]
pub struct LoadSetpoint {
    pub name: String,
    pub kw: f32,
    pub kvar: f32,
}

/// Everything the solver needs for one step.
#[derive(Debug, Clone)]
pub struct SolveRequest {
    pub time: SimTime,
    pub loads: Vec<LoadSetpoint>,
    pub generation_kw: f32,
    /// Storage power magnitude; direction is carried by `storage_mode`.
    pub storage_kw: f32,
    pub storage_mode: EssMode,
}

/// Solved per-bus voltages.
#[derive(Debug, Clone)]
pub struct SolveResponse {
    pub buses: Vec<(String, VoltagePhasor)>,
}

/// Synchronous power-flow boundary: solved or explicitly failed, per step.
pub trait GridSolver: Send {
    fn solve(&mut self, request: &SolveRequest) -> Result<SolveResponse, SolveError>;
}

/// Splits a signed storage command (positive = discharge) into the
/// magnitude-plus-mode form the solver boundary expects.
pub fn split_storage_command(command_kw: f32) -> (f32, EssMode) {
    if command_kw > 0.0 {
        (command_kw, EssMode::Discharging)
    } else if command_kw < 0.0 {
        (-command_kw, EssMode::Charging)
    } else {
        (0.0, EssMode::Idle)
    }
}

/// Gaussian noise via the Box-Muller transform.
fn gaussian_noise(rng: &mut StdRng, std_dev: f32) -> f32 {
    if std_dev <= 0.0 {
        return 0.0;
    }
    let u1: f32 = rng.random::<f32>().clamp(1e-6, 1.0);
    let u2: f32 = rng.random::<f32>();
    let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos();
    z0 * std_dev
}

/// An additive sinusoidal component of the load factor.
#[derive(Debug, Clone)]
pub struct LoadVariation {
    pub amplitude: f32,
    /// Period in simulated time units.
    pub period: f64,
}

/// Time-varying scaling factor applied to every non-fixed load.
///
/// A slow diurnal swing plus shorter variation terms, with optional seeded
/// Gaussian noise; the factor never goes negative.
#[derive(Debug, Clone)]
pub struct LoadProfile {
    base_factor: f32,
    diurnal_amplitude: f32,
    day_length: f64,
    variations: Vec<LoadVariation>,
    noise_std: f32,
    rng: StdRng,
}

impl LoadProfile {
    /// # Panics
    ///
    /// Panics if `day_length` or a variation period is not positive;
    /// scenario validation rejects these first.
    pub fn new(
        base_factor: f32,
        diurnal_amplitude: f32,
        day_length: f64,
        variations: Vec<LoadVariation>,
        noise_std: f32,
        seed: u64,
    ) -> Self {
        assert!(day_length > 0.0, "day_length must be > 0");
        assert!(
            variations.iter().all(|v| v.period > 0.0),
            "variation periods must be > 0"
        );
        Self {
            base_factor,
            diurnal_amplitude,
            day_length,
            variations,
            noise_std: noise_std.max(0.0),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Load factor at time `t`, `>= 0`.
    pub fn factor(&mut self, t: SimTime) -> f32 {
        use std::f64::consts::PI;
        let mut f = self.base_factor as f64
            + self.diurnal_amplitude as f64 * (2.0 * PI * t / self.day_length).sin();
        for v in &self.variations {
            f += v.amplitude as f64 * (2.0 * PI * t / v.period).sin();
        }
        let f = f as f32 + gaussian_noise(&mut self.rng, self.noise_std);
        f.max(0.0)
    }
}

/// A bus whose voltage is solved and published, with its electrical
/// distance from the source (1.0 = end of feeder).
#[derive(Debug, Clone)]
pub struct MonitoredBus {
    pub id: String,
    pub distance: f32,
}

/// Built-in radial feeder model.
///
/// `v(bus) = source - distance * (r * P_MW + x * Q_MVAr)` with a small angle
/// proportional to the net flow, and optional seeded measurement noise.
/// Declares a failed solve when a magnitude comes out non-finite or
/// implausible.
pub struct FeederSolver {
    source_pu: f32,
    r_pu_per_mw: f32,
    x_pu_per_mvar: f32,
    angle_rad_per_mw: f32,
    buses: Vec<MonitoredBus>,
    noise_std: f32,
    rng: StdRng,
}

impl FeederSolver {
    pub fn new(
        source_pu: f32,
        r_pu_per_mw: f32,
        x_pu_per_mvar: f32,
        angle_rad_per_mw: f32,
        buses: Vec<MonitoredBus>,
        noise_std: f32,
        seed: u64,
    ) -> Self {
        Self {
            source_pu,
            r_pu_per_mw,
            x_pu_per_mvar,
            angle_rad_per_mw,
            buses,
            noise_std: noise_std.max(0.0),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl GridSolver for FeederSolver {
    fn solve(&mut self, request: &SolveRequest) -> Result<SolveResponse, SolveError> {
        let load_kw: f32 = request.loads.iter().map(|l| l.kw).sum();
        let load_kvar: f32 = request.loads.iter().map(|l| l.kvar).sum();
        let storage_kw = match request.storage_mode {
            EssMode::Charging => request.storage_kw,
            EssMode::Discharging => -request.storage_kw,
            EssMode::Idle => 0.0,
        };

        let p_mw = (load_kw - request.generation_kw + storage_kw) / 1000.0;
        let q_mvar = load_kvar / 1000.0;

        let mut buses = Vec::with_capacity(self.buses.len());
        for bus in &self.buses {
            let drop = bus.distance * (self.r_pu_per_mw * p_mw + self.x_pu_per_mvar * q_mvar);
            let magnitude = self.source_pu - drop + gaussian_noise(&mut self.rng, self.noise_std);
            let angle = -bus.distance * self.angle_rad_per_mw * p_mw;

            if !magnitude.is_finite() || !PLAUSIBLE_PU.contains(&magnitude) {
                return Err(SolveError {
                    time: request.time,
                    reason: format!("bus {} voltage {magnitude:.3} pu out of range", bus.id),
                });
            }
            buses.push((bus.id.clone(), VoltagePhasor::from_polar(magnitude, angle)));
        }
        Ok(SolveResponse { buses })
    }
}

/// One solved (or stale) step at the feedback bus.
#[derive(Debug, Clone)]
pub struct GridLogRow {
    pub time: SimTime,
    pub voltage_pu: f32,
    pub angle_rad: f32,
    /// True when this step re-published the previous solution after a
    /// failed solve.
    pub stale: bool,
}

/// The grid federate: applies the latest setpoints, solves, publishes one
/// phasor per monitored bus.
pub struct GridFederate<S: GridSolver> {
    solver: S,
    loads: Vec<GridLoad>,
    profile: LoadProfile,
    sub_pv: Subscription,
    sub_ess: Subscription,
    /// Publication per monitored bus, in `bus_ids` order.
    bus_ids: Vec<String>,
    outputs: Vec<Publication>,
    feedback_idx: usize,
    /// Last storage setpoint actually applied.
    storage_kw: f32,
    /// Previous solution, re-published when a solve fails.
    last: Option<Vec<(String, VoltagePhasor)>>,
    log: Vec<GridLogRow>,
}

impl<S: GridSolver> GridFederate<S> {
    /// # Errors
    ///
    /// Fails at startup on unregistered channels, a second producer on a
    /// voltage channel, or a feedback bus that is not monitored.
    pub fn new(
        solver: S,
        loads: Vec<GridLoad>,
        profile: LoadProfile,
        bus_ids: Vec<String>,
        feedback_bus: &str,
        bus: &Bus,
    ) -> Result<Self, ConfigError> {
        let feedback_idx = bus_ids
            .iter()
            .position(|id| id == feedback_bus)
            .ok_or_else(|| {
                ConfigError::invalid(
                    "grid.feedback_bus",
                    format!("\"{feedback_bus}\" is not a monitored bus"),
                )
            })?;
        let outputs = bus_ids
            .iter()
            .map(|id| bus.publisher(&channel::bus_voltage(id)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            solver,
            loads,
            profile,
            sub_pv: bus.subscriber(channel::PV_OUTPUT)?,
            sub_ess: bus.subscriber(channel::ESS_OUTPUT)?,
            bus_ids,
            outputs,
            feedback_idx,
            storage_kw: 0.0,
            last: None,
            log: Vec::new(),
        })
    }

    pub fn into_log(self) -> Vec<GridLogRow> {
        self.log
    }

    fn publish_solution(&self, t: SimTime, buses: &[(String, VoltagePhasor)], bus: &Bus) {
        for (id, phasor) in buses {
            if let Some(idx) = self.bus_ids.iter().position(|b| b == id) {
                bus.publish(self.outputs[idx], t, Value::Phasor(*phasor));
            }
        }
    }

    fn feedback(&self, buses: &[(String, VoltagePhasor)]) -> Option<VoltagePhasor> {
        let id = &self.bus_ids[self.feedback_idx];
        buses
            .iter()
            .find(|(bus_id, _)| bus_id == id)
            .map(|(_, phasor)| *phasor)
    }
}

impl<S: GridSolver> FederateModel for GridFederate<S> {
    fn name(&self) -> &'static str {
        "grid"
    }

    fn step(&mut self, t: SimTime, bus: &Bus) -> Result<(), SolveError> {
        // Apply a new storage setpoint only when the command changed since
        // the last check.
        if bus.consume_updated(self.sub_ess, t) {
            self.storage_kw = bus.read(self.sub_ess, t).scalar();
            trace!(t, command_kw = self.storage_kw, "storage setpoint received");
        }
        let generation_kw = bus.read(self.sub_pv, t).scalar();

        let factor = self.profile.factor(t);
        let loads = self
            .loads
            .iter()
            .map(|l| {
                let f = if l.fixed { 1.0 } else { factor };
                LoadSetpoint {
                    name: l.name.clone(),
                    kw: l.kw * f,
                    kvar: l.kvar * f,
                }
            })
            .collect();

        let (storage_kw, storage_mode) = split_storage_command(self.storage_kw);
        let request = SolveRequest {
            time: t,
            loads,
            generation_kw,
            storage_kw,
            storage_mode,
        };

        match self.solver.solve(&request) {
            Ok(response) => {
                self.publish_solution(t, &response.buses, bus);
                let fb = self.feedback(&response.buses);
                debug!(
                    t,
                    generation_kw,
                    storage_kw = self.storage_kw,
                    voltage_pu = fb.map(|p| p.magnitude()).unwrap_or(DEFAULT_VOLTAGE_PU),
                    "solve ok"
                );
                self.log.push(GridLogRow {
                    time: t,
                    voltage_pu: fb.map(|p| p.magnitude()).unwrap_or(DEFAULT_VOLTAGE_PU),
                    angle_rad: fb.map(|p| p.angle_rad()).unwrap_or(0.0),
                    stale: false,
                });
                self.last = Some(response.buses);
                Ok(())
            }
            Err(e) => {
                // Keep the grid observable: the previous solution stands in
                // for this step.
                let fb = match &self.last {
                    Some(prev) => {
                        self.publish_solution(t, prev, bus);
                        self.feedback(prev)
                    }
                    None => None,
                };
                self.log.push(GridLogRow {
                    time: t,
                    voltage_pu: fb.map(|p| p.magnitude()).unwrap_or(DEFAULT_VOLTAGE_PU),
                    angle_rad: fb.map(|p| p.angle_rad()).unwrap_or(0.0),
                    stale: true,
                });
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ieee13ish_loads() -> Vec<GridLoad> {
        vec![
            GridLoad {
                name: "671".to_string(),
                kw: 1155.0,
                kvar: 660.0,
                fixed: true,
            },
            GridLoad {
                name: "675a".to_string(),
                kw: 485.0,
                kvar: 190.0,
                fixed: false,
            },
            GridLoad {
                name: "646".to_string(),
                kw: 230.0,
                kvar: 132.0,
                fixed: false,
            },
        ]
    }

    fn monitored() -> Vec<MonitoredBus> {
        vec![
            MonitoredBus {
                id: "650".to_string(),
                distance: 0.1,
            },
            MonitoredBus {
                id: "680".to_string(),
                distance: 1.0,
            },
            MonitoredBus {
                id: "692".to_string(),
                distance: 0.8,
            },
        ]
    }

    fn solver(noise_std: f32, seed: u64) -> FeederSolver {
        FeederSolver::new(1.0, 0.004, 0.002, 0.01, monitored(), noise_std, seed)
    }

    fn request(generation_kw: f32, storage_kw: f32, mode: EssMode) -> SolveRequest {
        SolveRequest {
            time: 1.0,
            loads: ieee13ish_loads()
                .iter()
                .map(|l| LoadSetpoint {
                    name: l.name.clone(),
                    kw: l.kw,
                    kvar: l.kvar,
                })
                .collect(),
            generation_kw,
            storage_kw,
            storage_mode: mode,
        }
    }

    #[test]
    fn split_matches_sign_convention() {
        assert_eq!(split_storage_command(60.0), (60.0, EssMode::Discharging));
        assert_eq!(split_storage_command(-60.0), (60.0, EssMode::Charging));
        assert_eq!(split_storage_command(0.0), (0.0, EssMode::Idle));
    }

    #[test]
    fn voltage_drops_with_distance() {
        let mut s = solver(0.0, 0);
        let out = s.solve(&request(600.0, 0.0, EssMode::Idle)).expect("solve");
        let mag: Vec<f32> = out.buses.iter().map(|(_, p)| p.magnitude()).collect();
        // 650 (0.1) > 692 (0.8) > 680 (1.0)
        assert!(mag[0] > mag[2] && mag[2] > mag[1]);
        assert!(mag.iter().all(|m| (0.9..=1.0).contains(m)));
    }

    #[test]
    fn discharge_raises_the_feeder_voltage() {
        let mut s = solver(0.0, 0);
        let idle = s.solve(&request(600.0, 0.0, EssMode::Idle)).expect("solve");
        let discharging = s
            .solve(&request(600.0, 200.0, EssMode::Discharging))
            .expect("solve");
        let charging = s
            .solve(&request(600.0, 200.0, EssMode::Charging))
            .expect("solve");

        let v = |r: &SolveResponse| r.buses[1].1.magnitude();
        assert!(v(&discharging) > v(&idle));
        assert!(v(&charging) < v(&idle));
    }

    #[test]
    fn implausible_voltage_is_a_solve_error() {
        // Absurd load makes the drop blow past the plausible band.
        let mut s = solver(0.0, 0);
        let mut req = request(0.0, 0.0, EssMode::Idle);
        req.loads[0].kw = 1.0e6;
        let err = s.solve(&req).expect_err("diverge");
        assert!(err.reason.contains("out of range"));
    }

    #[test]
    fn measurement_noise_is_seed_deterministic() {
        let mut a = solver(0.002, 42);
        let mut b = solver(0.002, 42);
        for _ in 0..10 {
            let ra = a.solve(&request(600.0, 0.0, EssMode::Idle)).expect("a");
            let rb = b.solve(&request(600.0, 0.0, EssMode::Idle)).expect("b");
            assert_eq!(
                ra.buses.iter().map(|(_, p)| p.magnitude()).collect::<Vec<_>>(),
                rb.buses.iter().map(|(_, p)| p.magnitude()).collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn load_profile_is_deterministic_and_non_negative() {
        let mk = || {
            LoadProfile::new(
                0.6,
                0.4,
                1440.0,
                vec![
                    LoadVariation {
                        amplitude: 0.15,
                        period: 30.0,
                    },
                    LoadVariation {
                        amplitude: 0.1,
                        period: 10.0,
                    },
                ],
                0.01,
                7,
            )
        };
        let mut a = mk();
        let mut b = mk();
        for t in 0..300 {
            let t = t as SimTime;
            let fa = a.factor(t);
            assert!(fa >= 0.0);
            assert_eq!(fa, b.factor(t));
        }
    }

    /// Fails on a chosen step, solves a fixed profile otherwise.
    struct FlakySolver {
        fail_at: SimTime,
        inner: FeederSolver,
    }

    impl GridSolver for FlakySolver {
        fn solve(&mut self, request: &SolveRequest) -> Result<SolveResponse, SolveError> {
            if request.time == self.fail_at {
                return Err(SolveError {
                    time: request.time,
                    reason: "injected non-convergence".to_string(),
                });
            }
            self.inner.solve(request)
        }
    }

    fn grid_bus() -> Bus {
        let bus = Bus::new();
        bus.register(channel::PV_OUTPUT, Value::Scalar(0.0))
            .expect("register pv");
        bus.register(channel::ESS_OUTPUT, Value::Scalar(0.0))
            .expect("register ess");
        for id in ["650", "680", "692"] {
            bus.register(
                &channel::bus_voltage(id),
                Value::Phasor(VoltagePhasor::new(DEFAULT_VOLTAGE_PU, 0.0)),
            )
            .expect("register bus");
        }
        bus
    }

    fn grid_federate<S: GridSolver>(solver: S, bus: &Bus) -> GridFederate<S> {
        GridFederate::new(
            solver,
            ieee13ish_loads(),
            LoadProfile::new(1.0, 0.0, 1440.0, Vec::new(), 0.0, 0),
            vec!["650".to_string(), "680".to_string(), "692".to_string()],
            "680",
            bus,
        )
        .expect("federate")
    }

    #[test]
    fn failed_solve_republishes_previous_voltage_and_run_continues() {
        let bus = grid_bus();
        let sub = bus.subscriber(&channel::bus_voltage("680")).expect("sub");
        let mut fed = grid_federate(
            FlakySolver {
                fail_at: 2.0,
                inner: solver(0.0, 0),
            },
            &bus,
        );

        fed.step(1.0, &bus).expect("step 1");
        let v1 = bus.read(sub, 2.0).scalar();

        fed.step(2.0, &bus).expect_err("step 2 fails");
        // The step-2 publication equals step 1's solution.
        assert_eq!(bus.read(sub, 3.0).scalar(), v1);

        fed.step(3.0, &bus).expect("step 3 recovers");
        let log = fed.into_log();
        assert_eq!(
            log.iter().map(|r| r.stale).collect::<Vec<_>>(),
            vec![false, true, false]
        );
        assert_eq!(log[1].voltage_pu, log[0].voltage_pu);
    }

    #[test]
    fn unknown_feedback_bus_is_a_config_error() {
        let bus = grid_bus();
        let result = GridFederate::new(
            solver(0.0, 0),
            ieee13ish_loads(),
            LoadProfile::new(1.0, 0.0, 1440.0, Vec::new(), 0.0, 0),
            vec!["650".to_string()],
            "999",
            &bus,
        );
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn storage_setpoint_is_applied_only_when_updated() {
        let bus = grid_bus();
        let ess_pub = bus.publisher(channel::ESS_OUTPUT).expect("claim");
        let mut fed = grid_federate(solver(0.0, 0), &bus);

        fed.step(1.0, &bus).expect("step 1");
        assert_eq!(fed.storage_kw, 0.0);

        bus.publish(ess_pub, 1.0, Value::Scalar(-60.0));
        fed.step(2.0, &bus).expect("step 2");
        assert_eq!(fed.storage_kw, -60.0);

        // No new command: the applied setpoint is held.
        fed.step(3.0, &bus).expect("step 3");
        assert_eq!(fed.storage_kw, -60.0);
    }
}
