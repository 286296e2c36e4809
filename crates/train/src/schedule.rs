//! Learning-rate schedules.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum LearningRateSchedule {
    Constant {
        value: f32,
    },
    /// Linear warmup from `init_value` to `peak_value`, then cosine decay to
    /// `end_value` at `decay_steps` (counted from step 0).
    WarmupCosine {
        init_value: f32,
        peak_value: f32,
        warmup_steps: usize,
        decay_steps: usize,
        end_value: f32,
    },
    /// Linear warmup, then `peak_value / sqrt(step / timescale)` once past the timescale.
    Rsqrt {
        init_value: f32,
        peak_value: f32,
        warmup_steps: usize,
        timescale: usize,
    },
}

impl Default for LearningRateSchedule {
    fn default() -> Self {
        LearningRateSchedule::Constant { value: 3e-4 }
    }
}

fn warmup(init: f32, peak: f32, warmup_steps: usize, step: usize) -> f32 {
    if warmup_steps == 0 {
        return peak;
    }
    let frac = (step as f32 / warmup_steps as f32).min(1.0);
    init + (peak - init) * frac
}

impl LearningRateSchedule {
    pub fn validate(&self) -> Result<()> {
        match *self {
            LearningRateSchedule::Constant { value } => {
                ensure!(value >= 0.0, "learning rate must be non-negative")
            }
            LearningRateSchedule::WarmupCosine {
                peak_value,
                warmup_steps,
                decay_steps,
                ..
            } => {
                ensure!(peak_value >= 0.0, "peak learning rate must be non-negative");
                ensure!(
                    decay_steps > warmup_steps,
                    "decay_steps ({}) must exceed warmup_steps ({})",
                    decay_steps,
                    warmup_steps
                );
            }
            LearningRateSchedule::Rsqrt {
                peak_value, timescale, ..
            } => {
                ensure!(peak_value >= 0.0, "peak learning rate must be non-negative");
                ensure!(timescale > 0, "rsqrt timescale must be positive");
            }
        }
        Ok(())
    }

    pub fn value(&self, step: usize) -> f32 {
        match *self {
            LearningRateSchedule::Constant { value } => value,
            LearningRateSchedule::WarmupCosine {
                init_value,
                peak_value,
                warmup_steps,
                decay_steps,
                end_value,
            } => {
                if step < warmup_steps {
                    return warmup(init_value, peak_value, warmup_steps, step);
                }
                let span = decay_steps.saturating_sub(warmup_steps).max(1);
                let progress = ((step - warmup_steps) as f32 / span as f32).min(1.0);
                let cosine = 0.5 * (1.0 + (std::f32::consts::PI * progress).cos());
                end_value + (peak_value - end_value) * cosine
            }
            LearningRateSchedule::Rsqrt {
                init_value,
                peak_value,
                warmup_steps,
                timescale,
            } => {
                if step < warmup_steps {
                    return warmup(init_value, peak_value, warmup_steps, step);
                }
                let ratio = (step as f32 / timescale as f32).max(1.0);
                peak_value / ratio.sqrt()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn warmup_cosine_shape() {
        let schedule = LearningRateSchedule::WarmupCosine {
            init_value: 0.0,
            peak_value: 1.0,
            warmup_steps: 10,
            decay_steps: 110,
            end_value: 0.1,
        };
        schedule.validate().unwrap();
        assert_eq!(schedule.value(0), 0.0);
        assert_abs_diff_eq!(schedule.value(5), 0.5);
        assert_abs_diff_eq!(schedule.value(10), 1.0);
        assert_abs_diff_eq!(schedule.value(60), 0.55, epsilon = 1e-5);
        assert_abs_diff_eq!(schedule.value(110), 0.1, epsilon = 1e-6);
        assert_abs_diff_eq!(schedule.value(500), 0.1, epsilon = 1e-6);
    }

    #[test]
    fn rsqrt_decays_after_timescale() {
        let schedule = LearningRateSchedule::Rsqrt {
            init_value: 0.0,
            peak_value: 1.0,
            warmup_steps: 4,
            timescale: 100,
        };
        assert_abs_diff_eq!(schedule.value(2), 0.5);
        assert_eq!(schedule.value(50), 1.0);
        assert_abs_diff_eq!(schedule.value(400), 0.5);
    }

    #[test]
    fn schedule_parses_from_toml() {
        let schedule: LearningRateSchedule = toml::from_str(
            "name = \"warmup_cosine\"\ninit_value = 0.0\npeak_value = 3e-4\nwarmup_steps = 100\ndecay_steps = 1000\nend_value = 0.0\n",
        )
        .unwrap();
        assert!(matches!(schedule, LearningRateSchedule::WarmupCosine { warmup_steps: 100, .. }));
        let bad = LearningRateSchedule::WarmupCosine {
            init_value: 0.0,
            peak_value: 1.0,
            warmup_steps: 10,
            decay_steps: 10,
            end_value: 0.0,
        };
        assert!(bad.validate().is_err());
    }
}
