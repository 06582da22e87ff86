//! Energy-storage feedback controller and federate.
//!
//! The controller is the consumer of the data-exchange layer: each granted
//! step it reads the most recent supply and voltage readings, picks a mode,
//! and publishes a bounded power command.
//!
//! # Sign convention
//!
//! The published command is **positive when discharging** (injecting into
//! the grid) and **negative when charging**. The state of charge follows
//! `soc' = soc - command / capacity`; every clamp is applied to the command
//! before it is published, so the recorded command and the resulting SOC
//! never disagree.

use std::fmt;

use tracing::debug;

use crate::bus::{Bus, Publication, Subscription, Value, channel};
use crate::coordinator::SimTime;
use crate::error::{ConfigError, SolveError};
use crate::federate::FederateModel;

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EssMode {
    Idle,
    Charging,
    Discharging,
}

impl EssMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EssMode::Idle => "idle",
            EssMode::Charging => "charging",
            EssMode::Discharging => "discharging",
        }
    }
}

impl fmt::Display for EssMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage plant ratings and state of charge.
#[derive(Debug, Clone, Copy)]
pub struct StorageState {
    /// State of charge, kept in `[min_soc, max_soc]`.
    pub soc: f32,
    /// Usable energy capacity in kWh.
    pub capacity_kwh: f32,
    /// Power rating in kW (both directions).
    pub max_power_kw: f32,
    /// Lower SOC bound.
    pub min_soc: f32,
    /// Upper SOC bound.
    pub max_soc: f32,
}

/// Which correction rule drives the controller.
#[derive(Debug, Clone, Copy)]
pub enum ControlPolicy {
    /// React to the observed feedback-bus voltage: charge on over-voltage,
    /// discharge on under-voltage, proportional to the error outside a
    /// deadband.
    Voltage {
        target_pu: f32,
        deadband_pu: f32,
        gain_kw_per_pu: f32,
    },
    /// React to the supply level: charge when generation is above the upper
    /// threshold, discharge when below the lower one.
    Threshold { upper_kw: f32, lower_kw: f32 },
}

/// Trickle rule shared by both policies when no correction is active:
/// bleed off a high SOC, top up a low one, else stay idle.
#[derive(Debug, Clone, Copy)]
pub struct IdleBalancing {
    /// Trickle power cap in kW.
    pub trickle_kw: f32,
    /// Fraction of stored/free energy moved per trickle step.
    pub trickle_rate: f32,
    /// SOC above which the controller trickle-discharges.
    pub soc_high: f32,
    /// SOC below which the controller trickle-charges.
    pub soc_low: f32,
}

/// The command chosen for one step, with the SOC after applying it.
#[derive(Debug, Clone, Copy)]
pub struct EssDecision {
    /// Published power in kW (positive = discharge, negative = charge).
    pub power_kw: f32,
    pub mode: EssMode,
    /// State of charge after the command.
    pub soc: f32,
}

/// Commands below this are rounding residue from an exhausted SOC bound;
/// the controller outputs zero and stays idle instead.
const MIN_COMMAND_KW: f32 = 1e-3;

/// Threshold/feedback state machine owning the [`StorageState`].
#[derive(Debug, Clone)]
pub struct EssController {
    state: StorageState,
    policy: ControlPolicy,
    balancing: IdleBalancing,
    mode: EssMode,
}

impl EssController {
    /// Creates a controller.
    ///
    /// # Panics
    ///
    /// Panics on non-positive capacity or power rating, or inverted SOC
    /// bounds; scenario validation reports these as configuration errors
    /// before construction.
    pub fn new(state: StorageState, policy: ControlPolicy, balancing: IdleBalancing) -> Self {
        assert!(state.capacity_kwh > 0.0, "capacity must be > 0");
        assert!(state.max_power_kw > 0.0, "max power must be > 0");
        assert!(
            0.0 <= state.min_soc && state.min_soc < state.max_soc && state.max_soc <= 1.0,
            "SOC bounds must satisfy 0 <= min < max <= 1"
        );
        assert!(
            (state.min_soc..=state.max_soc).contains(&state.soc),
            "initial SOC must be within bounds"
        );
        Self {
            state,
            policy,
            balancing,
            mode: EssMode::Idle,
        }
    }

    pub fn soc(&self) -> f32 {
        self.state.soc
    }

    pub fn mode(&self) -> EssMode {
        self.mode
    }

    /// Runs one control step on the latest readings and updates the SOC.
    ///
    /// The returned command already respects the power rating and both SOC
    /// bounds; no input sequence can drive the SOC outside
    /// `[min_soc, max_soc]`.
    pub fn step(&mut self, generation_kw: f32, voltage_pu: f32) -> EssDecision {
        let (power_kw, mode) = match self.policy {
            ControlPolicy::Voltage {
                target_pu,
                deadband_pu,
                gain_kw_per_pu,
            } => {
                let error = voltage_pu - target_pu;
                if error.abs() > deadband_pu {
                    if error > 0.0 {
                        // Over-voltage: absorb power, bounded by rating and
                        // the headroom left below max_soc.
                        self.charge(error.abs() * gain_kw_per_pu)
                    } else {
                        self.discharge(error.abs() * gain_kw_per_pu)
                    }
                } else {
                    self.balance()
                }
            }
            ControlPolicy::Threshold { upper_kw, lower_kw } => {
                if generation_kw > upper_kw {
                    self.charge(self.charge_headroom_kw())
                } else if generation_kw < lower_kw {
                    self.discharge(self.discharge_headroom_kw())
                } else {
                    self.balance()
                }
            }
        };

        self.state.soc = (self.state.soc - power_kw / self.state.capacity_kwh)
            .clamp(self.state.min_soc, self.state.max_soc);
        self.mode = mode;

        debug_assert!(power_kw.abs() <= self.state.max_power_kw);
        debug_assert!((self.state.min_soc..=self.state.max_soc).contains(&self.state.soc));

        EssDecision {
            power_kw,
            mode,
            soc: self.state.soc,
        }
    }

    /// Largest one-step charge that keeps the SOC at or below `max_soc`.
    fn charge_headroom_kw(&self) -> f32 {
        (self.state.max_soc - self.state.soc) * self.state.capacity_kwh
    }

    /// Largest one-step discharge that keeps the SOC at or above `min_soc`.
    fn discharge_headroom_kw(&self) -> f32 {
        (self.state.soc - self.state.min_soc) * self.state.capacity_kwh
    }

    fn charge(&self, want_kw: f32) -> (f32, EssMode) {
        let power = want_kw
            .min(self.state.max_power_kw)
            .min(self.charge_headroom_kw());
        if power > MIN_COMMAND_KW {
            (-power, EssMode::Charging)
        } else {
            (0.0, EssMode::Idle)
        }
    }

    fn discharge(&self, want_kw: f32) -> (f32, EssMode) {
        let power = want_kw
            .min(self.state.max_power_kw)
            .min(self.discharge_headroom_kw());
        if power > MIN_COMMAND_KW {
            (power, EssMode::Discharging)
        } else {
            (0.0, EssMode::Idle)
        }
    }

    fn balance(&self) -> (f32, EssMode) {
        let b = self.balancing;
        if self.state.soc > b.soc_high {
            self.discharge(
                b.trickle_kw
                    .min(self.state.soc * self.state.capacity_kwh * b.trickle_rate),
            )
        } else if self.state.soc < b.soc_low {
            self.charge(
                b.trickle_kw
                    .min((1.0 - self.state.soc) * self.state.capacity_kwh * b.trickle_rate),
            )
        } else {
            (0.0, EssMode::Idle)
        }
    }
}

/// One controller step as observed and decided.
#[derive(Debug, Clone, Copy)]
pub struct EssLogRow {
    pub time: SimTime,
    /// Supply reading used for this step.
    pub pv_kw: f32,
    /// Voltage reading used for this step.
    pub voltage_pu: f32,
    pub command_kw: f32,
    pub soc: f32,
    pub mode: EssMode,
}

/// The storage federate: reads supply and feedback voltage, runs the
/// controller, publishes the command on [`channel::ESS_OUTPUT`].
pub struct EssFederate {
    controller: EssController,
    sub_pv: Subscription,
    sub_voltage: Subscription,
    output: Publication,
    log: Vec<EssLogRow>,
}

impl EssFederate {
    /// `feedback_channel` is the voltage channel the controller reacts to
    /// (for the voltage policy) and records alongside every step.
    ///
    /// # Errors
    ///
    /// Fails at startup on unregistered channels or a second producer on
    /// the command channel.
    pub fn new(
        controller: EssController,
        bus: &Bus,
        feedback_channel: &str,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            controller,
            sub_pv: bus.subscriber(channel::PV_OUTPUT)?,
            sub_voltage: bus.subscriber(feedback_channel)?,
            output: bus.publisher(channel::ESS_OUTPUT)?,
            log: Vec::new(),
        })
    }

    pub fn into_log(self) -> Vec<EssLogRow> {
        self.log
    }
}

impl FederateModel for EssFederate {
    fn name(&self) -> &'static str {
        "ess"
    }

    fn step(&mut self, t: SimTime, bus: &Bus) -> Result<(), SolveError> {
        let pv_kw = bus.read(self.sub_pv, t).scalar();
        // A phasor reading collapses to its magnitude; a scalar is taken
        // as one directly.
        let voltage_pu = bus.read(self.sub_voltage, t).scalar();

        let decision = self.controller.step(pv_kw, voltage_pu);
        bus.publish(self.output, t, Value::Scalar(decision.power_kw));

        debug!(
            t,
            pv_kw,
            voltage_pu,
            command_kw = decision.power_kw,
            soc = decision.soc,
            mode = %decision.mode,
            "ess step"
        );
        self.log.push(EssLogRow {
            time: t,
            pv_kw,
            voltage_pu,
            command_kw: decision.power_kw,
            soc: decision.soc,
            mode: decision.mode,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(soc: f32) -> StorageState {
        StorageState {
            soc,
            capacity_kwh: 500.0,
            max_power_kw: 200.0,
            min_soc: 0.05,
            max_soc: 0.95,
        }
    }

    fn balancing() -> IdleBalancing {
        IdleBalancing {
            trickle_kw: 20.0,
            trickle_rate: 0.05,
            soc_high: 0.8,
            soc_low: 0.2,
        }
    }

    fn voltage_policy() -> ControlPolicy {
        ControlPolicy::Voltage {
            target_pu: 0.99,
            deadband_pu: 0.005,
            gain_kw_per_pu: 2000.0,
        }
    }

    fn threshold_policy() -> ControlPolicy {
        ControlPolicy::Threshold {
            upper_kw: 600.0,
            lower_kw: 400.0,
        }
    }

    #[test]
    #[should_panic]
    fn zero_capacity_panics() {
        let mut s = state(0.5);
        s.capacity_kwh = 0.0;
        EssController::new(s, voltage_policy(), balancing());
    }

    #[test]
    #[should_panic]
    fn zero_power_rating_panics() {
        let mut s = state(0.5);
        s.max_power_kw = 0.0;
        EssController::new(s, voltage_policy(), balancing());
    }

    #[test]
    #[should_panic]
    fn inverted_soc_bounds_panic() {
        let mut s = state(0.5);
        s.min_soc = 0.9;
        s.max_soc = 0.1;
        EssController::new(s, voltage_policy(), balancing());
    }

    #[test]
    fn voltage_feedback_scenario() {
        // capacity 500 kWh, 200 kW, SOC bounds [0.05, 0.95], initial 0.5,
        // target 0.99 pu, deadband 0.005.
        let mut ess = EssController::new(state(0.5), voltage_policy(), balancing());

        // Step 1: 0.995 pu is inside the deadband.
        let d1 = ess.step(0.0, 0.995);
        assert_eq!(d1.mode, EssMode::Idle);
        assert_eq!(d1.power_kw, 0.0);
        assert_eq!(d1.soc, 0.5);

        // Steps 2-3: over-voltage, error 0.03 -> 60 kW charge each.
        let d2 = ess.step(0.0, 1.02);
        assert_eq!(d2.mode, EssMode::Charging);
        assert!(d2.power_kw < 0.0);
        assert!((d2.power_kw + 60.0).abs() < 1e-3);
        assert!(d2.soc > 0.5);

        let d3 = ess.step(0.0, 1.02);
        assert_eq!(d3.mode, EssMode::Charging);
        assert!(d3.soc > d2.soc);

        // Step 4: under-voltage, symmetric discharge.
        let d4 = ess.step(0.0, 0.96);
        assert_eq!(d4.mode, EssMode::Discharging);
        assert!(d4.power_kw > 0.0);
        assert!(d4.soc < d3.soc);

        // Step 5: back on target; SOC sits mid-band, no trickle.
        let d5 = ess.step(0.0, 0.99);
        assert_eq!(d5.mode, EssMode::Idle);
        assert_eq!(d5.power_kw, 0.0);
        assert_eq!(d5.soc, d4.soc);
    }

    #[test]
    fn charge_stops_at_max_soc_without_overshoot() {
        let mut ess = EssController::new(state(0.94), voltage_policy(), balancing());
        // Error 0.06 wants 120 kW, headroom allows only 5 kWh.
        let d = ess.step(0.0, 1.05);
        assert_eq!(d.mode, EssMode::Charging);
        assert!((d.power_kw + 5.0).abs() < 1e-3);
        assert!(d.soc <= 0.95);

        // Saturated: headroom exhausted, output zero, mode Idle.
        let d = ess.step(0.0, 1.05);
        assert_eq!(d.mode, EssMode::Idle);
        assert_eq!(d.power_kw, 0.0);
        assert!(d.soc <= 0.95);
    }

    #[test]
    fn discharge_stops_at_min_soc_without_undershoot() {
        let mut ess = EssController::new(state(0.06), voltage_policy(), balancing());
        let d = ess.step(0.0, 0.9);
        assert_eq!(d.mode, EssMode::Discharging);
        assert!(d.soc >= 0.05);

        let d = ess.step(0.0, 0.9);
        assert_eq!(d.mode, EssMode::Idle);
        assert_eq!(d.power_kw, 0.0);
    }

    #[test]
    fn threshold_policy_charges_on_high_generation() {
        let mut ess = EssController::new(state(0.5), threshold_policy(), balancing());
        let d = ess.step(700.0, 0.0);
        assert_eq!(d.mode, EssMode::Charging);
        // min(200, (0.95 - 0.5) * 500) = 200.
        assert!((d.power_kw + 200.0).abs() < 1e-3);
    }

    #[test]
    fn threshold_policy_discharges_on_low_generation() {
        let mut ess = EssController::new(state(0.5), threshold_policy(), balancing());
        let d = ess.step(300.0, 0.0);
        assert_eq!(d.mode, EssMode::Discharging);
        assert!((d.power_kw - 200.0).abs() < 1e-3);
    }

    #[test]
    fn threshold_policy_balances_in_between() {
        let mut ess = EssController::new(state(0.5), threshold_policy(), balancing());
        let d = ess.step(500.0, 0.0);
        assert_eq!(d.mode, EssMode::Idle);
        assert_eq!(d.power_kw, 0.0);
    }

    #[test]
    fn trickle_discharge_above_high_band() {
        let mut ess = EssController::new(state(0.9), threshold_policy(), balancing());
        let d = ess.step(500.0, 0.0);
        assert_eq!(d.mode, EssMode::Discharging);
        // min(20, 0.9 * 500 * 0.05) = 20.
        assert!((d.power_kw - 20.0).abs() < 1e-3);
        assert!(d.soc < 0.9);
    }

    #[test]
    fn trickle_charge_below_low_band() {
        let mut ess = EssController::new(state(0.1), threshold_policy(), balancing());
        let d = ess.step(500.0, 0.0);
        assert_eq!(d.mode, EssMode::Charging);
        assert!((d.power_kw + 20.0).abs() < 1e-3);
        assert!(d.soc > 0.1);
    }

    #[test]
    fn soc_and_power_stay_bounded_for_any_input_sequence() {
        let mut ess = EssController::new(state(0.5), voltage_policy(), balancing());
        // Sweep a hostile voltage sequence, including far-out-of-range values.
        for i in 0..1000 {
            let v = 0.5 + 1.0 * ((i * 7919) % 101) as f32 / 100.0;
            let g = ((i * 31) % 1200) as f32;
            let d = ess.step(g, v);
            assert!(d.power_kw.abs() <= 200.0, "power bound violated: {d:?}");
            assert!((0.05..=0.95).contains(&d.soc), "soc bound violated: {d:?}");
        }
    }

    #[test]
    fn replay_reproduces_commands_and_soc_bit_for_bit() {
        let inputs: Vec<(f32, f32)> = (0..50)
            .map(|i| (600.0 + (i as f32) * 3.0, 0.97 + 0.001 * i as f32))
            .collect();

        let mut a = EssController::new(state(0.5), voltage_policy(), balancing());
        let first: Vec<EssDecision> = inputs.iter().map(|&(g, v)| a.step(g, v)).collect();

        let mut b = EssController::new(state(0.5), voltage_policy(), balancing());
        for (&(g, v), d) in inputs.iter().zip(&first) {
            let replayed = b.step(g, v);
            assert_eq!(replayed.power_kw, d.power_kw);
            assert_eq!(replayed.soc, d.soc);
            assert_eq!(replayed.mode, d.mode);
        }
    }
}
