use std::time::Instant;

/// Decay applied to the held value per 100 ms elapsed when inputs drop.
const DECAY_PER_STEP: f64 = 0.98;
const STEP_MS: f64 = 100.0;

/// Smoothed tracker of a value that may oscillate rapidly.
///
/// Rises instantly to higher inputs; on lower inputs the held value
/// decays exponentially from the last peak instead of following the drop.
/// Used on the consumers' desired bitrate so a momentary dip does not
/// yank the estimator's target around.
#[derive(Debug)]
pub struct TrendCalculator {
    value: u32,
    highest_value: u32,
    highest_at: Option<Instant>,
    last_input: u32,
}

impl TrendCalculator {
    pub fn new() -> TrendCalculator {
        TrendCalculator {
            value: 0,
            highest_value: 0,
            highest_at: None,
            last_input: 0,
        }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn update(&mut self, value: u32, now: Instant) {
        self.last_input = value;

        if value >= self.value {
            self.value = value;
            self.highest_value = value;
            self.highest_at = Some(now);
            return;
        }

        let Some(highest_at) = self.highest_at else {
            self.value = value;
            return;
        };

        let elapsed_ms = now.duration_since(highest_at).as_millis() as f64;
        let decayed = self.highest_value as f64 * DECAY_PER_STEP.powf(elapsed_ms / STEP_MS);

        self.value = (decayed as u32).max(value);
    }

    /// Overwrite the held value, bypassing decay.
    pub fn force_update(&mut self, value: u32, now: Instant) {
        self.value = value;
        self.highest_value = value;
        self.highest_at = Some(now);
        self.last_input = value;
    }

    /// Whether the raw input has fallen well below the smoothed value,
    /// i.e. the demand is swinging rather than settled.
    pub fn is_unstable(&self) -> bool {
        self.value > 0 && (self.last_input as f64) < self.value as f64 * 0.75
    }
}

impl Default for TrendCalculator {
    fn default() -> Self {
        Self::new()
    }
}
