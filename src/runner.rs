//! Scenario orchestration: builds the bus and coordinator from
//! configuration, runs one thread per federate, and merges the per-federate
//! step logs into the persisted run log.

use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

use tracing::{error, info};

use crate::bus::{Bus, Value, channel};
use crate::config::ScenarioConfig;
use crate::coordinator::{FederateId, TimeCoordinator};
use crate::devices::{
    ControlPolicy, EssController, EssFederate, IdleBalancing, Perturbation, PvArray, PvFederate,
    StorageState,
};
use crate::error::{RunError, SyncError};
use crate::federate::FederateRuntime;
use crate::grid::{
    DEFAULT_VOLTAGE_PU, FeederSolver, GridFederate, GridLoad, GridSolver, LoadProfile,
    LoadVariation, MonitoredBus, VoltagePhasor,
};
use crate::telemetry::StepRecord;

/// Load-profile RNG offset, to avoid correlation with solver noise.
const PROFILE_SEED_OFFSET: u64 = 1;

/// Runs a scenario with the built-in feeder solver.
///
/// # Errors
///
/// Configuration errors surface before any step executes; a fatal
/// synchronization error or federate panic aborts the run.
pub fn run_scenario(cfg: &ScenarioConfig) -> Result<Vec<StepRecord>, RunError> {
    let stop = AtomicBool::new(false);
    run_scenario_with(cfg, feeder_solver_from(cfg), &stop)
}

/// Builds the built-in feeder solver for a scenario.
pub fn feeder_solver_from(cfg: &ScenarioConfig) -> FeederSolver {
    let sv = &cfg.grid.solver;
    FeederSolver::new(
        sv.source_pu,
        sv.r_pu_per_mw,
        sv.x_pu_per_mvar,
        sv.angle_rad_per_mw,
        cfg.grid
            .buses
            .iter()
            .map(|b| MonitoredBus {
                id: b.id.clone(),
                distance: b.distance,
            })
            .collect(),
        sv.noise_std,
        cfg.simulation.seed,
    )
}

/// Runs a scenario with an injected grid solver and external stop signal.
///
/// Setting `stop` causes every federate to finalize at its next step
/// boundary; the records collected so far are returned and all invariants
/// hold.
///
/// # Errors
///
/// See [`run_scenario`].
pub fn run_scenario_with<S: GridSolver>(
    cfg: &ScenarioConfig,
    solver: S,
    stop: &AtomicBool,
) -> Result<Vec<StepRecord>, RunError> {
    let mut errors = cfg.validate();
    if !errors.is_empty() {
        for e in &errors {
            error!(%e, "invalid scenario");
        }
        return Err(RunError::Config(errors.remove(0)));
    }

    let bus = Bus::new();
    bus.register(channel::PV_OUTPUT, Value::Scalar(0.0))?;
    bus.register(channel::ESS_OUTPUT, Value::Scalar(0.0))?;
    for b in &cfg.grid.buses {
        bus.register(
            &channel::bus_voltage(&b.id),
            Value::Phasor(VoltagePhasor::new(DEFAULT_VOLTAGE_PU, 0.0)),
        )?;
    }

    let coordinator =
        TimeCoordinator::with_stall_timeout(Duration::from_secs(cfg.simulation.stall_timeout_s));

    let pv = PvFederate::new(pv_array_from(cfg), &bus)?;
    let feedback_channel = channel::bus_voltage(&cfg.grid.feedback_bus);
    let ess = if cfg.storage.enabled {
        Some(EssFederate::new(
            ess_controller_from(cfg),
            &bus,
            &feedback_channel,
        )?)
    } else {
        None
    };
    let grid = GridFederate::new(
        solver,
        cfg.grid
            .loads
            .iter()
            .map(|l| GridLoad {
                name: l.name.clone(),
                kw: l.kw,
                kvar: l.kvar,
                fixed: l.fixed,
            })
            .collect(),
        load_profile_from(cfg),
        cfg.grid.buses.iter().map(|b| b.id.clone()).collect(),
        &cfg.grid.feedback_bus,
        &bus,
    )?;

    let pv_id = coordinator.register("pv");
    let ess_entry: Option<(EssFederate, FederateId)> =
        ess.map(|m| (m, coordinator.register("ess")));
    let grid_id = coordinator.register("grid");

    let horizon = cfg.simulation.horizon;
    let step = cfg.simulation.step;
    info!(
        horizon,
        step,
        policy = %cfg.control.policy,
        storage = cfg.storage.enabled,
        "scenario start"
    );

    let (pv_res, ess_res, grid_res) = thread::scope(|s| {
        let coord = &coordinator;
        let bus_ref = &bus;
        let pv_handle = s.spawn(move || {
            FederateRuntime::new(coord, bus_ref, stop, pv_id, horizon, step).run(pv)
        });
        let ess_handle = ess_entry.map(|(model, id)| {
            s.spawn(move || {
                FederateRuntime::new(coord, bus_ref, stop, id, horizon, step).run(model)
            })
        });
        let grid_handle = s.spawn(move || {
            FederateRuntime::new(coord, bus_ref, stop, grid_id, horizon, step).run(grid)
        });
        (
            pv_handle.join(),
            ess_handle.map(|h| h.join()),
            grid_handle.join(),
        )
    });

    let pv_model = unwrap_join("pv", pv_res)?;
    let ess_model = match ess_res {
        Some(res) => Some(unwrap_join("ess", res)?),
        None => None,
    };
    let grid_model = unwrap_join("grid", grid_res)?;

    let grid_log = grid_model.into_log();
    let records: Vec<StepRecord> = match ess_model {
        Some(model) => model
            .into_log()
            .iter()
            .enumerate()
            .map(|(i, e)| StepRecord {
                time: e.time,
                generation_kw: e.pv_kw,
                storage_command_kw: e.command_kw,
                soc: e.soc,
                voltage_pu: Some(e.voltage_pu),
                stale: grid_log.get(i).map(|g| g.stale).unwrap_or(false),
            })
            .collect(),
        None => pv_model
            .into_log()
            .iter()
            .enumerate()
            .map(|(i, p)| StepRecord {
                time: p.time,
                generation_kw: p.pv_kw,
                storage_command_kw: 0.0,
                soc: cfg.storage.initial_soc,
                voltage_pu: grid_log.get(i).map(|g| g.voltage_pu),
                stale: grid_log.get(i).map(|g| g.stale).unwrap_or(false),
            })
            .collect(),
    };

    info!(steps = records.len(), "run complete");
    Ok(records)
}

fn unwrap_join<M>(
    name: &str,
    res: thread::Result<Result<M, SyncError>>,
) -> Result<M, RunError> {
    match res {
        Ok(Ok(model)) => Ok(model),
        Ok(Err(e)) => Err(RunError::Sync(e)),
        Err(_) => Err(RunError::FederatePanic {
            federate: name.to_string(),
        }),
    }
}

fn pv_array_from(cfg: &ScenarioConfig) -> PvArray {
    PvArray::new(
        cfg.solar.base_kw,
        cfg.solar.peak_kw,
        cfg.simulation.horizon,
        cfg.solar
            .perturbations
            .iter()
            .map(|p| Perturbation {
                amplitude_kw: p.amplitude_kw,
                period: p.period,
            })
            .collect(),
    )
}

fn ess_controller_from(cfg: &ScenarioConfig) -> EssController {
    let st = &cfg.storage;
    let c = &cfg.control;
    let policy = if c.policy == "threshold" {
        ControlPolicy::Threshold {
            upper_kw: c.upper_threshold_kw,
            lower_kw: c.lower_threshold_kw,
        }
    } else {
        ControlPolicy::Voltage {
            target_pu: c.target_voltage_pu,
            deadband_pu: c.deadband_pu,
            gain_kw_per_pu: c.gain_kw_per_pu,
        }
    };
    EssController::new(
        StorageState {
            soc: st.initial_soc,
            capacity_kwh: st.capacity_kwh,
            max_power_kw: st.max_power_kw,
            min_soc: st.min_soc,
            max_soc: st.max_soc,
        },
        policy,
        IdleBalancing {
            trickle_kw: c.trickle_kw,
            trickle_rate: c.trickle_rate,
            soc_high: c.soc_high,
            soc_low: c.soc_low,
        },
    )
}

fn load_profile_from(cfg: &ScenarioConfig) -> LoadProfile {
    let p = &cfg.grid.profile;
    LoadProfile::new(
        p.base_factor,
        p.diurnal_amplitude,
        p.day_length,
        p.variations
            .iter()
            .map(|v| LoadVariation {
                amplitude: v.amplitude,
                period: v.period,
            })
            .collect(),
        p.noise_std,
        cfg.simulation.seed.wrapping_add(PROFILE_SEED_OFFSET),
    )
}
