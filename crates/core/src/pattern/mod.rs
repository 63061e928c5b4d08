use std::f32::consts::PI;

use serde::{Deserialize, Serialize};

/// Lower bound applied to the pattern speed wherever it is used as a divisor.
pub const MIN_SPEED: f32 = 0.01;

const THROB_PERIOD_SECONDS: f32 = 0.42;
const THROB_DUTY_CYCLE: f32 = 0.64;

/// Shape applied to a raw intensity signal over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PatternKind {
    #[default]
    Linear,
    Sine,
    Throb,
}

/// Pattern settings owned by a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    pub pattern: PatternKind,
    pub min_strength: f32,
    pub max_strength: f32,
    pub speed: f32,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            pattern: PatternKind::Linear,
            min_strength: 0.0,
            max_strength: 1.0,
            speed: 1.0,
        }
    }
}

impl PatternConfig {
    pub fn new(pattern: PatternKind) -> Self {
        Self {
            pattern,
            ..Default::default()
        }
    }

    /// Speed clamped to [`MIN_SPEED`] so it is always safe to divide by.
    pub fn effective_speed(&self) -> f32 {
        if self.speed.is_finite() {
            self.speed.max(MIN_SPEED)
        } else {
            MIN_SPEED
        }
    }

    /// Shapes `value` at `phase` seconds into the loop and maps the result
    /// into the configured strength band.
    ///
    /// The function is pure: identical inputs always produce identical output.
    /// `delta` is accepted for patterns that react to rate of change; none of
    /// the current shapes use it.
    pub fn apply(&self, value: f32, _delta: f32, phase: f32) -> f32 {
        let value = if value.is_finite() { value } else { 0.0 };
        let result = match self.pattern {
            PatternKind::Linear => value,
            PatternKind::Sine => {
                ((phase * self.effective_speed() * 2.0 * PI).sin() * 0.5 + 0.5) * value
            }
            PatternKind::Throb => {
                let period = THROB_PERIOD_SECONDS / self.effective_speed();
                let t = phase.rem_euclid(period) / period;
                if t < THROB_DUTY_CYCLE {
                    value
                } else {
                    0.0
                }
            }
        };

        map_range(result, self.min_strength, self.max_strength)
    }
}

/// Maps a shaped result into `[min, max]`, keeping non-positive results off.
pub fn map_range(result: f32, min: f32, max: f32) -> f32 {
    if result.is_nan() || result <= 0.0 {
        return 0.0;
    }
    min + result * (max - min)
}
