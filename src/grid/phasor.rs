//! Typed complex voltage value.
//!
//! The power-flow boundary produces rectangular complex voltages; everything
//! downstream wants magnitude and angle. Representing the pair as a fixed
//! struct keeps the conversion in one place instead of re-deriving it from a
//! 2-element vector wherever a reading is consumed.

/// A per-unit bus voltage in rectangular form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltagePhasor {
    /// Real part (pu).
    pub re: f32,
    /// Imaginary part (pu).
    pub im: f32,
}

impl VoltagePhasor {
    /// Creates a phasor from rectangular components.
    pub fn new(re: f32, im: f32) -> Self {
        Self { re, im }
    }

    /// Creates a phasor from magnitude (pu) and angle (radians).
    pub fn from_polar(magnitude: f32, angle_rad: f32) -> Self {
        Self {
            re: magnitude * angle_rad.cos(),
            im: magnitude * angle_rad.sin(),
        }
    }

    /// Voltage magnitude in pu, always `>= 0`.
    pub fn magnitude(&self) -> f32 {
        self.re.hypot(self.im)
    }

    /// Voltage angle in radians.
    pub fn angle_rad(&self) -> f32 {
        self.im.atan2(self.re)
    }
}
