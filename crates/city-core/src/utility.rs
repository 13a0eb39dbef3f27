//! Piecewise-linear utility of living in a block at a given density.

use contracts::UtilityConfig;

/// Lower clamp applied to densities before evaluation.
pub const DENSITY_FLOOR: f64 = 1e-6;
/// Upper clamp applied to densities before evaluation.
pub const DENSITY_CEIL: f64 = 1.0 - 1e-6;

/// `u(rho) = 2*rho` up to half occupancy, then falls linearly from 1 towards
/// `m` as the block fills up. The slope changes at `rho = 0.5` unless `m = 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UtilityCurve {
    m: f64,
}

impl UtilityCurve {
    pub fn new(m: f64) -> Self {
        Self { m }
    }

    pub fn value(&self, density: f64) -> f64 {
        let rho = density.clamp(DENSITY_FLOOR, DENSITY_CEIL);
        if rho <= 0.5 {
            2.0 * rho
        } else {
            self.m + 2.0 * (1.0 - self.m) * (1.0 - rho)
        }
    }

    pub fn config(&self) -> UtilityConfig {
        UtilityConfig::piecewise_linear(self.m)
    }
}
