//! Per-frame transforms: history windows, action chunks and goal relabeling.

use crate::trajectory::Trajectory;
use anyhow::{ensure, Result};
use ndarray::{s, stack, Array1, Array2, Array3, ArrayD, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalRelabeling {
    /// Goal drawn uniformly from the current step to the end of the trajectory.
    #[default]
    Uniform,
    /// Final observation of the trajectory.
    Last,
    /// No goal observations; tasks carry language only.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub window_size: usize,
    pub action_horizon: usize,
    pub goal_relabeling: GoalRelabeling,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_size: 2,
            action_horizon: 1,
            goal_relabeling: GoalRelabeling::Uniform,
        }
    }
}

impl WindowConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.window_size > 0, "window_size must be positive");
        ensure!(self.action_horizon > 0, "action_horizon must be positive");
        Ok(())
    }
}

/// One training example ending at a single trajectory step.
#[derive(Debug, Clone)]
pub struct Sample {
    pub dataset: String,
    pub language_instruction: String,
    /// `(window, ...)` per observation name.
    pub observations: BTreeMap<String, ArrayD<f32>>,
    /// `(window,)`; false for steps before the trajectory start.
    pub pad_mask: Array1<bool>,
    /// Goal observation per name, without a time axis.
    pub tasks: BTreeMap<String, ArrayD<f32>>,
    /// `(window, action_horizon, action_dim)`
    pub actions: Array3<f32>,
    /// `(window, action_horizon)`; false past the trajectory end.
    pub action_pad_mask: Array2<bool>,
}

/// Builds the sample whose last window step is `step`, drawing the goal from `rng`.
pub fn make_sample(
    trajectory: &Trajectory,
    step: usize,
    config: &WindowConfig,
    rng: &mut fastrand::Rng,
) -> Result<Sample> {
    let len = trajectory.len();
    ensure!(step < len, "step {} is outside a trajectory of {} steps", step, len);
    let window = config.window_size;
    let horizon = config.action_horizon;

    // source index of each window step; steps before the start repeat frame 0
    let history: Vec<usize> = (0..window)
        .map(|w| (step + w + 1).saturating_sub(window))
        .collect();
    let pad_mask = Array1::from_shape_fn(window, |w| step + w + 1 >= window);

    let mut observations = BTreeMap::new();
    for (key, obs) in &trajectory.observations {
        let frames: Vec<_> = history.iter().map(|&i| obs.index_axis(Axis(0), i)).collect();
        observations.insert(key.clone(), stack(Axis(0), &frames)?);
    }

    let action_dim = trajectory.action_dim();
    let mut actions = Array3::zeros((window, horizon, action_dim));
    let mut action_pad_mask = Array2::from_elem((window, horizon), false);
    for (w, &source) in history.iter().enumerate() {
        for h in 0..horizon {
            let target = source + h;
            let clamped = target.min(len - 1);
            actions
                .slice_mut(s![w, h, ..])
                .assign(&trajectory.actions.row(clamped));
            action_pad_mask[[w, h]] = target < len;
        }
    }

    let goal = match config.goal_relabeling {
        GoalRelabeling::Uniform => Some(rng.usize(step..len)),
        GoalRelabeling::Last => Some(len - 1),
        GoalRelabeling::None => None,
    };
    let tasks = match goal {
        Some(goal) => trajectory
            .observations
            .iter()
            .map(|(key, obs)| (key.clone(), obs.index_axis(Axis(0), goal).to_owned()))
            .collect(),
        None => BTreeMap::new(),
    };

    Ok(Sample {
        dataset: trajectory.dataset.clone(),
        language_instruction: trajectory.language_instruction.clone(),
        observations,
        pad_mask,
        tasks,
        actions,
        action_pad_mask,
    })
}
