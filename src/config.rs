//! TOML-based scenario configuration and preset definitions.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// Top-level scenario configuration parsed from TOML.
///
/// All fields have defaults matching the baseline scenario (the 5-minute
/// voltage-control run). Load from TOML with
/// [`ScenarioConfig::from_toml_file`] or use [`ScenarioConfig::baseline`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioConfig {
    /// Timing and global parameters.
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// PV generation parameters.
    #[serde(default)]
    pub solar: SolarConfig,
    /// Storage plant ratings and SOC bounds.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Storage control policy parameters.
    #[serde(default)]
    pub control: ControlConfig,
    /// Feeder loads, monitored buses, and solver parameters.
    #[serde(default)]
    pub grid: GridConfig,
}

/// Timing and global parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Run horizon in simulated time units (seconds or hours; every other
    /// duration in the scenario uses the same unit).
    pub horizon: f64,
    /// Fixed step size shared by every federate (must be > 0).
    pub step: f64,
    /// Master random seed (measurement and load noise).
    pub seed: u64,
    /// Wall-clock seconds a federate may wait for a grant before the run
    /// is declared stalled.
    pub stall_timeout_s: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            horizon: 300.0,
            step: 1.0,
            seed: 42,
            stall_timeout_s: 30,
        }
    }
}

/// One sinusoidal cloud term.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PerturbationConfig {
    /// Amplitude (kW).
    pub amplitude_kw: f32,
    /// Period in simulated time units (must be > 0).
    pub period: f64,
}

/// PV generation parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolarConfig {
    /// Constant floor output (kW).
    pub base_kw: f32,
    /// Peak of the half-sine waveform spanning the horizon (kW).
    pub peak_kw: f32,
    /// Additive cloud perturbations.
    pub perturbations: Vec<PerturbationConfig>,
}

impl Default for SolarConfig {
    fn default() -> Self {
        Self {
            base_kw: 600.0,
            peak_kw: 0.0,
            perturbations: vec![
                PerturbationConfig {
                    amplitude_kw: 100.0,
                    period: 10.0,
                },
                PerturbationConfig {
                    amplitude_kw: 50.0,
                    period: 60.0,
                },
            ],
        }
    }
}

/// Storage plant ratings and SOC bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Whether the run includes the storage federate at all.
    pub enabled: bool,
    /// Energy capacity (kWh, must be > 0).
    pub capacity_kwh: f32,
    /// Power rating in both directions (kW, must be > 0).
    pub max_power_kw: f32,
    /// Lower SOC bound.
    pub min_soc: f32,
    /// Upper SOC bound.
    pub max_soc: f32,
    /// Initial state of charge.
    pub initial_soc: f32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity_kwh: 500.0,
            max_power_kw: 200.0,
            min_soc: 0.05,
            max_soc: 0.95,
            initial_soc: 0.5,
        }
    }
}

/// Storage control policy parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlConfig {
    /// Policy: `"voltage"` (feedback on the monitored bus voltage) or
    /// `"threshold"` (react to the generation level).
    pub policy: String,
    /// Voltage policy: target (pu).
    pub target_voltage_pu: f32,
    /// Voltage policy: deadband around the target (pu).
    pub deadband_pu: f32,
    /// Voltage policy: command per pu of error (kW/pu).
    pub gain_kw_per_pu: f32,
    /// Threshold policy: charge above this generation level (kW).
    pub upper_threshold_kw: f32,
    /// Threshold policy: discharge below this generation level (kW).
    pub lower_threshold_kw: f32,
    /// Idle balancing: trickle power cap (kW).
    pub trickle_kw: f32,
    /// Idle balancing: fraction of energy moved per trickle step.
    pub trickle_rate: f32,
    /// Idle balancing: trickle-discharge above this SOC.
    pub soc_high: f32,
    /// Idle balancing: trickle-charge below this SOC.
    pub soc_low: f32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            policy: "voltage".to_string(),
            target_voltage_pu: 0.99,
            deadband_pu: 0.005,
            gain_kw_per_pu: 2000.0,
            upper_threshold_kw: 600.0,
            lower_threshold_kw: 400.0,
            trickle_kw: 20.0,
            trickle_rate: 0.05,
            soc_high: 0.8,
            soc_low: 0.2,
        }
    }
}

/// One configured feeder load.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadConfig {
    pub name: String,
    pub kw: f32,
    pub kvar: f32,
    /// Fixed loads ignore the load profile.
    #[serde(default)]
    pub fixed: bool,
}

/// One monitored bus.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    pub id: String,
    /// Electrical distance from the source (1.0 = end of feeder).
    pub distance: f32,
}

/// One sinusoidal load-factor variation.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariationConfig {
    pub amplitude: f32,
    /// Period in simulated time units (must be > 0).
    pub period: f64,
}

/// Time-varying load factor applied to non-fixed loads.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfileConfig {
    pub base_factor: f32,
    pub diurnal_amplitude: f32,
    /// Length of the diurnal cycle in simulated time units (must be > 0).
    pub day_length: f64,
    pub variations: Vec<VariationConfig>,
    /// Gaussian noise on the factor (0 disables).
    pub noise_std: f32,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            base_factor: 0.6,
            diurnal_amplitude: 0.4,
            day_length: 1440.0,
            variations: vec![
                VariationConfig {
                    amplitude: 0.15,
                    period: 30.0,
                },
                VariationConfig {
                    amplitude: 0.1,
                    period: 10.0,
                },
            ],
            noise_std: 0.0,
        }
    }
}

/// Built-in feeder solver parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolverConfig {
    /// Source voltage (pu).
    pub source_pu: f32,
    /// Resistive drop per MW of net flow, per unit distance.
    pub r_pu_per_mw: f32,
    /// Reactive drop per MVAr, per unit distance.
    pub x_pu_per_mvar: f32,
    /// Angle shift per MW of net flow, per unit distance (rad).
    pub angle_rad_per_mw: f32,
    /// Gaussian measurement noise on solved magnitudes (0 disables).
    pub noise_std: f32,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            source_pu: 1.0,
            r_pu_per_mw: 0.004,
            x_pu_per_mvar: 0.002,
            angle_rad_per_mw: 0.01,
            noise_std: 0.0,
        }
    }
}

/// Feeder loads, monitored buses, load profile, and solver parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GridConfig {
    /// Bus whose voltage the storage controller reacts to.
    pub feedback_bus: String,
    /// Buses whose voltages are solved and published.
    pub buses: Vec<BusConfig>,
    /// Load setpoints (the IEEE 13-bus set by default).
    pub loads: Vec<LoadConfig>,
    #[serde(default)]
    pub profile: ProfileConfig,
    #[serde(default)]
    pub solver: SolverConfig,
}

impl Default for GridConfig {
    fn default() -> Self {
        let load = |name: &str, kw: f32, kvar: f32| LoadConfig {
            name: name.to_string(),
            kw,
            kvar,
            fixed: false,
        };
        Self {
            feedback_bus: "680".to_string(),
            buses: vec![
                BusConfig {
                    id: "650".to_string(),
                    distance: 0.1,
                },
                BusConfig {
                    id: "680".to_string(),
                    distance: 1.0,
                },
                BusConfig {
                    id: "692".to_string(),
                    distance: 0.8,
                },
            ],
            loads: vec![
                LoadConfig {
                    name: "671".to_string(),
                    kw: 1155.0,
                    kvar: 660.0,
                    fixed: true,
                },
                load("634a", 160.0, 110.0),
                load("634b", 120.0, 90.0),
                load("634c", 120.0, 90.0),
                load("645", 170.0, 125.0),
                load("646", 230.0, 132.0),
                load("692", 170.0, 151.0),
                load("675a", 485.0, 190.0),
                load("675b", 68.0, 60.0),
                load("675c", 290.0, 212.0),
                load("611", 170.0, 80.0),
                load("652", 128.0, 86.0),
                load("670a", 17.0, 10.0),
                load("670b", 66.0, 38.0),
                load("670c", 117.0, 68.0),
            ],
            profile: ProfileConfig::default(),
            solver: SolverConfig::default(),
        }
    }
}

impl ScenarioConfig {
    /// The 5-minute voltage-control run: 1 s steps, constant-base PV with
    /// fast cloud terms, voltage-feedback storage policy.
    pub fn baseline() -> Self {
        Self {
            simulation: SimulationConfig::default(),
            solar: SolarConfig::default(),
            storage: StorageConfig::default(),
            control: ControlConfig::default(),
            grid: GridConfig::default(),
        }
    }

    /// The 24-hour run: 1 h steps, diurnal half-sine PV, generation
    /// threshold storage policy, static loads.
    pub fn diurnal() -> Self {
        Self {
            simulation: SimulationConfig {
                horizon: 24.0,
                step: 1.0,
                ..SimulationConfig::default()
            },
            solar: SolarConfig {
                base_kw: 0.0,
                peak_kw: 1000.0,
                perturbations: vec![PerturbationConfig {
                    amplitude_kw: 50.0,
                    period: 6.0,
                }],
            },
            storage: StorageConfig {
                min_soc: 0.1,
                max_soc: 0.9,
                ..StorageConfig::default()
            },
            control: ControlConfig {
                policy: "threshold".to_string(),
                ..ControlConfig::default()
            },
            grid: GridConfig {
                profile: ProfileConfig {
                    base_factor: 1.0,
                    diurnal_amplitude: 0.0,
                    day_length: 24.0,
                    variations: Vec::new(),
                    noise_std: 0.0,
                },
                ..GridConfig::default()
            },
        }
    }

    /// Baseline without the storage federate, for side-by-side comparison.
    pub fn no_storage() -> Self {
        let mut cfg = Self::baseline();
        cfg.storage.enabled = false;
        cfg
    }

    /// Available preset names.
    pub const PRESETS: &[&str] = &["baseline", "diurnal", "no_storage"];

    /// Loads a scenario from a named preset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownPreset`] for an unknown name.
    pub fn from_preset(name: &str) -> Result<Self, ConfigError> {
        match name {
            "baseline" => Ok(Self::baseline()),
            "diurnal" => Ok(Self::diurnal()),
            "no_storage" => Ok(Self::no_storage()),
            _ => Err(ConfigError::UnknownPreset {
                name: name.to_string(),
                available: Self::PRESETS.join(", "),
            }),
        }
    }

    /// Parses a scenario from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read or the TOML is
    /// invalid.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses a scenario from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the TOML is invalid or contains unknown
    /// fields.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validates all fields and returns every violation.
    ///
    /// Returns an empty vector if the configuration is valid; validation
    /// runs before any federate is constructed.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let s = &self.simulation;

        if s.horizon <= 0.0 {
            errors.push(ConfigError::invalid("simulation.horizon", "must be > 0"));
        }
        if s.step <= 0.0 {
            errors.push(ConfigError::invalid("simulation.step", "must be > 0"));
        }
        if s.step > 0.0 && s.horizon > 0.0 && s.step > s.horizon {
            errors.push(ConfigError::invalid(
                "simulation.step",
                "must be <= simulation.horizon",
            ));
        }

        for (i, p) in self.solar.perturbations.iter().enumerate() {
            if p.period <= 0.0 {
                errors.push(ConfigError::invalid(
                    &format!("solar.perturbations[{i}].period"),
                    "must be > 0",
                ));
            }
        }

        let st = &self.storage;
        if st.capacity_kwh <= 0.0 {
            errors.push(ConfigError::invalid("storage.capacity_kwh", "must be > 0"));
        }
        if st.max_power_kw <= 0.0 {
            errors.push(ConfigError::invalid("storage.max_power_kw", "must be > 0"));
        }
        if !(0.0..=1.0).contains(&st.min_soc)
            || !(0.0..=1.0).contains(&st.max_soc)
            || st.min_soc >= st.max_soc
        {
            errors.push(ConfigError::invalid(
                "storage.min_soc",
                "SOC bounds must satisfy 0 <= min < max <= 1",
            ));
        } else if !(st.min_soc..=st.max_soc).contains(&st.initial_soc) {
            errors.push(ConfigError::invalid(
                "storage.initial_soc",
                "must be within [min_soc, max_soc]",
            ));
        }

        let c = &self.control;
        if c.policy != "voltage" && c.policy != "threshold" {
            errors.push(ConfigError::invalid(
                "control.policy",
                format!("must be \"voltage\" or \"threshold\", got \"{}\"", c.policy),
            ));
        }
        if c.deadband_pu < 0.0 {
            errors.push(ConfigError::invalid("control.deadband_pu", "must be >= 0"));
        }
        if c.gain_kw_per_pu < 0.0 {
            errors.push(ConfigError::invalid("control.gain_kw_per_pu", "must be >= 0"));
        }
        if c.upper_threshold_kw <= c.lower_threshold_kw {
            errors.push(ConfigError::invalid(
                "control.upper_threshold_kw",
                "must be > control.lower_threshold_kw",
            ));
        }
        if c.trickle_kw < 0.0 {
            errors.push(ConfigError::invalid("control.trickle_kw", "must be >= 0"));
        }
        if !(0.0..=1.0).contains(&c.soc_low)
            || !(0.0..=1.0).contains(&c.soc_high)
            || c.soc_low >= c.soc_high
        {
            errors.push(ConfigError::invalid(
                "control.soc_low",
                "balancing bands must satisfy 0 <= low < high <= 1",
            ));
        }

        let g = &self.grid;
        if g.buses.is_empty() {
            errors.push(ConfigError::invalid("grid.buses", "must not be empty"));
        }
        if !g.buses.iter().any(|b| b.id == g.feedback_bus) {
            errors.push(ConfigError::invalid(
                "grid.feedback_bus",
                format!("\"{}\" is not a monitored bus", g.feedback_bus),
            ));
        }
        if g.profile.day_length <= 0.0 {
            errors.push(ConfigError::invalid("grid.profile.day_length", "must be > 0"));
        }
        for (i, v) in g.profile.variations.iter().enumerate() {
            if v.period <= 0.0 {
                errors.push(ConfigError::invalid(
                    &format!("grid.profile.variations[{i}].period"),
                    "must be > 0",
                ));
            }
        }
        if g.solver.source_pu <= 0.0 {
            errors.push(ConfigError::invalid("grid.solver.source_pu", "must be > 0"));
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_presets_are_valid() {
        for name in ScenarioConfig::PRESETS {
            let cfg = ScenarioConfig::from_preset(name).expect("preset loads");
            let errors = cfg.validate();
            assert!(errors.is_empty(), "preset \"{name}\" should be valid: {errors:?}");
        }
    }

    #[test]
    fn from_preset_unknown() {
        let err = ScenarioConfig::from_preset("nonexistent");
        assert!(matches!(err, Err(ConfigError::UnknownPreset { .. })));
    }

    #[test]
    fn valid_toml_parses() {
        let toml = r#"
[simulation]
horizon = 24.0
step = 1.0
seed = 99

[solar]
base_kw = 0.0
peak_kw = 800.0

[[solar.perturbations]]
amplitude_kw = 40.0
period = 6.0

[storage]
capacity_kwh = 250.0
initial_soc = 0.4

[control]
policy = "threshold"
upper_threshold_kw = 500.0
lower_threshold_kw = 300.0

[grid]
feedback_bus = "680"
"#;
        let cfg = ScenarioConfig::from_toml_str(toml).expect("valid TOML should parse");
        assert_eq!(cfg.simulation.horizon, 24.0);
        assert_eq!(cfg.simulation.seed, 99);
        assert_eq!(cfg.solar.perturbations.len(), 1);
        assert_eq!(cfg.storage.capacity_kwh, 250.0);
        assert_eq!(cfg.control.policy, "threshold");
        // Unset sections keep defaults.
        assert_eq!(cfg.storage.max_power_kw, 200.0);
        assert_eq!(cfg.grid.loads.len(), 15);
    }

    #[test]
    fn invalid_toml_unknown_field() {
        let toml = r#"
[simulation]
horizon = 24.0
bogus_field = true
"#;
        assert!(matches!(
            ScenarioConfig::from_toml_str(toml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let cfg = ScenarioConfig::from_toml_str("[simulation]\nseed = 7\n").expect("parse");
        assert_eq!(cfg.simulation.seed, 7);
        assert_eq!(cfg.simulation.horizon, 300.0);
        assert_eq!(cfg.solar.base_kw, 600.0);
    }

    #[test]
    fn validation_catches_zero_horizon() {
        let mut cfg = ScenarioConfig::baseline();
        cfg.simulation.horizon = 0.0;
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.to_string().contains("simulation.horizon")));
    }

    #[test]
    fn validation_catches_zero_capacity() {
        let mut cfg = ScenarioConfig::baseline();
        cfg.storage.capacity_kwh = 0.0;
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.to_string().contains("storage.capacity_kwh")));
    }

    #[test]
    fn validation_catches_zero_power_rating() {
        let mut cfg = ScenarioConfig::baseline();
        cfg.storage.max_power_kw = -1.0;
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.to_string().contains("storage.max_power_kw")));
    }

    #[test]
    fn validation_catches_inverted_soc_bounds() {
        let mut cfg = ScenarioConfig::baseline();
        cfg.storage.min_soc = 0.9;
        cfg.storage.max_soc = 0.1;
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.to_string().contains("storage.min_soc")));
    }

    #[test]
    fn validation_catches_out_of_band_initial_soc() {
        let mut cfg = ScenarioConfig::baseline();
        cfg.storage.initial_soc = 0.99;
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.to_string().contains("storage.initial_soc")));
    }

    #[test]
    fn validation_catches_bad_policy() {
        let mut cfg = ScenarioConfig::baseline();
        cfg.control.policy = "pid".to_string();
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.to_string().contains("control.policy")));
    }

    #[test]
    fn validation_catches_unmonitored_feedback_bus() {
        let mut cfg = ScenarioConfig::baseline();
        cfg.grid.feedback_bus = "999".to_string();
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.to_string().contains("grid.feedback_bus")));
    }

    #[test]
    fn diurnal_preset_uses_threshold_policy() {
        let cfg = ScenarioConfig::diurnal();
        assert_eq!(cfg.control.policy, "threshold");
        assert_eq!(cfg.simulation.horizon, 24.0);
        assert_eq!(cfg.solar.peak_kw, 1000.0);
    }

    #[test]
    fn no_storage_preset_disables_storage_only() {
        let cfg = ScenarioConfig::no_storage();
        assert!(!cfg.storage.enabled);
        assert_eq!(cfg.simulation.horizon, ScenarioConfig::baseline().simulation.horizon);
    }
}
