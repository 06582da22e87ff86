//! Renewable generation model and federate.

use std::f64::consts::PI;

use tracing::trace;

use crate::bus::{Bus, Publication, Value, channel};
use crate::coordinator::SimTime;
use crate::error::{ConfigError, SolveError};
use crate::federate::FederateModel;

/// An additive sinusoidal cloud term on top of the base waveform.
#[derive(Debug, Clone)]
pub struct Perturbation {
    /// Amplitude in kW.
    pub amplitude_kw: f32,
    /// Period in simulated time units.
    pub period: f64,
}

/// A PV plant producing a deterministic, non-negative supply signal.
///
/// The output is a slow half-sine over the full horizon (a diurnal or
/// ramping pattern) on top of a constant base, plus any number of shorter
/// sinusoidal perturbations representing cloud variability. The sum is
/// clamped at zero; the same time input always yields the same output.
#[derive(Debug, Clone)]
pub struct PvArray {
    base_kw: f32,
    peak_kw: f32,
    horizon: f64,
    perturbations: Vec<Perturbation>,
}

impl PvArray {
    /// Creates a PV plant.
    ///
    /// # Panics
    ///
    /// Panics if `horizon` or any perturbation period is not positive;
    /// scenario validation rejects these before construction.
    pub fn new(base_kw: f32, peak_kw: f32, horizon: f64, perturbations: Vec<Perturbation>) -> Self {
        assert!(horizon > 0.0, "horizon must be > 0");
        assert!(
            perturbations.iter().all(|p| p.period > 0.0),
            "perturbation periods must be > 0"
        );
        Self {
            base_kw: base_kw.max(0.0),
            peak_kw: peak_kw.max(0.0),
            horizon,
            perturbations,
        }
    }

    /// Supply at time `t` in kW, always `>= 0`.
    pub fn output_kw(&self, t: SimTime) -> f32 {
        let base = self.base_kw as f64 + self.peak_kw as f64 * (PI * t / self.horizon).sin();
        let clouds: f64 = self
            .perturbations
            .iter()
            .map(|p| p.amplitude_kw as f64 * (2.0 * PI * t / p.period).sin())
            .sum();
        (base + clouds).max(0.0) as f32
    }
}

/// One published supply sample.
#[derive(Debug, Clone, Copy)]
pub struct PvLogRow {
    pub time: SimTime,
    pub pv_kw: f32,
}

/// The generation federate: computes the supply signal at each granted step
/// and publishes it on [`channel::PV_OUTPUT`].
pub struct PvFederate {
    array: PvArray,
    output: Publication,
    log: Vec<PvLogRow>,
}

impl PvFederate {
    /// # Errors
    ///
    /// Fails at startup if the supply channel is unregistered or already
    /// has a producer.
    pub fn new(array: PvArray, bus: &Bus) -> Result<Self, ConfigError> {
        Ok(Self {
            array,
            output: bus.publisher(channel::PV_OUTPUT)?,
            log: Vec::new(),
        })
    }

    /// Consumes the federate and returns its per-step log.
    pub fn into_log(self) -> Vec<PvLogRow> {
        self.log
    }
}

impl FederateModel for PvFederate {
    fn name(&self) -> &'static str {
        "pv"
    }

    fn step(&mut self, t: SimTime, bus: &Bus) -> Result<(), SolveError> {
        let pv_kw = self.array.output_kw(t);
        bus.publish(self.output, t, Value::Scalar(pv_kw));
        trace!(t, pv_kw, "pv supply published");
        self.log.push(PvLogRow { time: t, pv_kw });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diurnal() -> PvArray {
        // 24 h horizon, 1 MW peak, one 6 h cloud term.
        PvArray::new(
            0.0,
            1000.0,
            24.0,
            vec![Perturbation {
                amplitude_kw: 50.0,
                period: 6.0,
            }],
        )
    }

    #[test]
    fn output_is_idempotent() {
        let pv = diurnal();
        for t in 0..24 {
            let t = t as SimTime;
            assert_eq!(pv.output_kw(t), pv.output_kw(t));
        }
    }

    #[test]
    fn output_is_never_negative() {
        let pv = PvArray::new(
            0.0,
            10.0,
            24.0,
            vec![Perturbation {
                amplitude_kw: 500.0,
                period: 3.0,
            }],
        );
        for t in 0..240 {
            assert!(pv.output_kw(t as SimTime / 10.0) >= 0.0);
        }
    }

    #[test]
    fn diurnal_peak_is_at_midday() {
        let pv = PvArray::new(0.0, 1000.0, 24.0, Vec::new());
        assert_eq!(pv.output_kw(0.0), 0.0);
        assert!((pv.output_kw(12.0) - 1000.0).abs() < 1e-3);
        assert!(pv.output_kw(6.0) > 600.0);
    }

    #[test]
    fn constant_base_with_fast_clouds() {
        // The 5-minute profile: 600 kW base with 10 s and 60 s variation.
        let pv = PvArray::new(
            600.0,
            0.0,
            300.0,
            vec![
                Perturbation {
                    amplitude_kw: 100.0,
                    period: 10.0,
                },
                Perturbation {
                    amplitude_kw: 50.0,
                    period: 60.0,
                },
            ],
        );
        assert_eq!(pv.output_kw(0.0), 600.0);
        // Bounded by base ± the perturbation amplitudes.
        for t in 0..300 {
            let kw = pv.output_kw(t as SimTime);
            assert!((450.0..=750.0).contains(&kw), "t={t} kw={kw}");
        }
    }

    #[test]
    #[should_panic]
    fn zero_horizon_panics() {
        PvArray::new(0.0, 100.0, 0.0, Vec::new());
    }

    #[test]
    fn negative_base_and_peak_clamped_to_zero() {
        let pv = PvArray::new(-5.0, -10.0, 24.0, Vec::new());
        assert_eq!(pv.output_kw(12.0), 0.0);
    }

    #[test]
    fn federate_publishes_and_logs_each_step() {
        let bus = Bus::new();
        bus.register(channel::PV_OUTPUT, Value::Scalar(0.0))
            .expect("register");
        let sub = bus.subscriber(channel::PV_OUTPUT).expect("subscribe");
        let mut fed = PvFederate::new(diurnal(), &bus).expect("federate");

        fed.step(1.0, &bus).expect("step");
        fed.step(2.0, &bus).expect("step");

        // Strictly-before visibility: at t=2 the t=1 sample is readable.
        let pv = diurnal();
        assert_eq!(bus.read(sub, 2.0).scalar(), pv.output_kw(1.0));

        let log = fed.into_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].time, 1.0);
        assert_eq!(log[1].pv_kw, pv.output_kw(2.0));
    }
}
