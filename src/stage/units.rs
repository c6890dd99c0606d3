// Counts <-> physical units for the geared rotary stage

use std::f64::consts::PI;

/// Default gearbox reduction of the stage
pub const GEAR_RATIO: f64 = 70.0;

/// Encoder counts per motor revolution
pub const COUNTS_PER_REVOLUTION: f64 = 10_000.0;

/// Maps raw encoder counts to output-shaft angle
///
/// All position conversions subtract the zero offset first, so the same
/// converter serves any zero reference the operator sets at runtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitConverter {
    gear_ratio: f64,
    counts_per_revolution: f64,
}

impl Default for UnitConverter {
    fn default() -> Self {
        Self::new(GEAR_RATIO, COUNTS_PER_REVOLUTION)
    }
}

impl UnitConverter {
    pub const fn new(gear_ratio: f64, counts_per_revolution: f64) -> Self {
        Self {
            gear_ratio,
            counts_per_revolution,
        }
    }

    /// Output-shaft radians per encoder count
    pub fn radians_per_count(&self) -> f64 {
        2.0 * PI / (self.counts_per_revolution * self.gear_ratio)
    }

    pub fn counts_to_degrees(&self, counts: i32, zero_offset: i32) -> f64 {
        let relative = i64::from(counts) - i64::from(zero_offset);
        relative as f64 * self.radians_per_count() * (180.0 / PI)
    }

    pub fn degrees_to_counts(&self, degrees: f64, zero_offset: i32) -> i32 {
        let relative = (degrees * (PI / 180.0) / self.radians_per_count()).round() as i64;
        (relative + i64::from(zero_offset)).clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
    }

    /// Velocity carries no offset
    pub fn counts_per_sec_to_degrees_per_sec(&self, counts_per_sec: f64) -> f64 {
        counts_per_sec * self.radians_per_count() * (180.0 / PI)
    }
}
