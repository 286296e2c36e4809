//! Procedurally generated reaching demonstrations.
//!
//! Each scene holds a red and a blue target; the instruction names one of them
//! and the arm moves toward it. The camera image shows both targets and the
//! arm (green), so the correct action depends on image and instruction alike.

use crate::registry::{ActionEncoding, DatasetConfig, DatasetRegistry};
use crate::trajectory::Trajectory;
use anyhow::{ensure, Result};
use ndarray::{Array2, ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const IMAGE_KEY: &str = "image";
pub const WRIST_KEY: &str = "wrist_image";
pub const STATE_KEY: &str = "state";
pub const GRIPPER_KEY: &str = "gripper";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticConfig {
    pub min_len: usize,
    pub max_len: usize,
    pub image_size: usize,
    /// At least 3: planar motion in the first two dims, gripper in the last.
    pub action_dim: usize,
    pub gain: f32,
    pub noise: f32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            min_len: 8,
            max_len: 16,
            image_size: 16,
            action_dim: 7,
            gain: 0.3,
            noise: 0.01,
        }
    }
}

impl SyntheticConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.min_len > 0 && self.min_len <= self.max_len, "invalid length range");
        ensure!(self.image_size >= 4, "image_size must be at least 4");
        ensure!(self.action_dim >= 3, "action_dim must be at least 3");
        Ok(())
    }
}

/// Registry entry matching the keys written by [`generate`].
pub fn dataset_config() -> DatasetConfig {
    DatasetConfig {
        image_obs_keys: vec![Some(IMAGE_KEY.to_string()), Some(WRIST_KEY.to_string())],
        depth_obs_keys: vec![None, None],
        state_obs_keys: vec![Some(STATE_KEY.to_string()), Some(GRIPPER_KEY.to_string())],
        action_encoding: ActionEncoding::EefPos,
    }
}

fn pixel(coord: f32, size: usize) -> usize {
    (((coord + 1.0) / 2.0) * (size - 1) as f32).round().clamp(0.0, (size - 1) as f32) as usize
}

fn draw(image: &mut ArrayD<f32>, t: usize, pos: [f32; 2], channel: usize) {
    let size = image.shape()[1];
    let (cy, cx) = (pixel(pos[1], size), pixel(pos[0], size));
    for y in cy.saturating_sub(1)..=(cy + 1).min(size - 1) {
        for x in cx.saturating_sub(1)..=(cx + 1).min(size - 1) {
            image[[t, y, x, channel]] = 1.0;
        }
    }
}

fn point(rng: &mut fastrand::Rng) -> [f32; 2] {
    [rng.f32() * 1.6 - 0.8, rng.f32() * 1.6 - 0.8]
}

/// One reaching trajectory.
pub fn generate_one(dataset: &str, config: &SyntheticConfig, rng: &mut fastrand::Rng) -> Trajectory {
    let len = rng.usize(config.min_len..=config.max_len);
    let size = config.image_size;
    let targets = [point(rng), point(rng)];
    let chosen = rng.usize(0..2);
    let goal = targets[chosen];
    let instruction = if chosen == 0 {
        "move to the red target"
    } else {
        "move to the blue target"
    };

    let mut position = point(rng);
    let mut image = ArrayD::zeros(IxDyn(&[len, size, size, 3]));
    let mut wrist = ArrayD::zeros(IxDyn(&[len, size / 2, size / 2, 3]));
    let mut state = Array2::zeros((len, 2));
    let mut gripper = ArrayD::zeros(IxDyn(&[len]));
    let mut actions = Array2::zeros((len, config.action_dim));

    for t in 0..len {
        draw(&mut image, t, targets[0], 0);
        draw(&mut image, t, targets[1], 2);
        draw(&mut image, t, position, 1);
        state[[t, 0]] = position[0];
        state[[t, 1]] = position[1];

        let delta = [goal[0] - position[0], goal[1] - position[1]];
        let distance = (delta[0] * delta[0] + delta[1] * delta[1]).sqrt();
        let close = if distance < 0.15 { 1.0 } else { 0.0 };
        gripper[[t]] = close;
        wrist
            .index_axis_mut(ndarray::Axis(0), t)
            .fill((1.0 - distance).clamp(0.0, 1.0));

        let step = [
            (config.gain * delta[0]).clamp(-0.5, 0.5),
            (config.gain * delta[1]).clamp(-0.5, 0.5),
        ];
        actions[[t, 0]] = step[0];
        actions[[t, 1]] = step[1];
        actions[[t, config.action_dim - 1]] = close;
        position = [
            (position[0] + step[0] + (rng.f32() - 0.5) * config.noise).clamp(-1.0, 1.0),
            (position[1] + step[1] + (rng.f32() - 0.5) * config.noise).clamp(-1.0, 1.0),
        ];
    }

    let mut observations = BTreeMap::new();
    observations.insert(IMAGE_KEY.to_string(), image);
    observations.insert(WRIST_KEY.to_string(), wrist);
    observations.insert(STATE_KEY.to_string(), state.into_dyn());
    observations.insert(GRIPPER_KEY.to_string(), gripper);
    Trajectory {
        dataset: dataset.to_string(),
        language_instruction: instruction.to_string(),
        observations,
        actions,
    }
}

pub fn generate(dataset: &str, count: usize, config: &SyntheticConfig, rng: &mut fastrand::Rng) -> Vec<Trajectory> {
    (0..count).map(|_| generate_one(dataset, config, rng)).collect()
}

/// Writes `train` and `val` splits under `<data_dir>/<name>/` and registers the
/// dataset in `<data_dir>/registry.toml`, keeping existing entries.
pub fn write_dataset(
    data_dir: &Path,
    name: &str,
    train: usize,
    val: usize,
    config: &SyntheticConfig,
    rng: &mut fastrand::Rng,
) -> Result<PathBuf> {
    config.validate()?;
    ensure!(train > 0, "need at least one training trajectory");
    for (split, count) in [("train", train), ("val", val)] {
        for (i, trajectory) in generate(name, count, config, rng).iter().enumerate() {
            trajectory.save(data_dir.join(name).join(split).join(format!("{i:05}.safetensors")))?;
        }
    }

    let registry_path = data_dir.join("registry.toml");
    let mut registry = if registry_path.exists() {
        DatasetRegistry::from_file(&registry_path)?
    } else {
        DatasetRegistry::default()
    };
    registry.insert(name, dataset_config());
    fs::write(&registry_path, registry.to_toml_string()?)?;
    info!(
        dir = %data_dir.join(name).display(),
        train,
        val,
        "wrote synthetic dataset"
    );
    Ok(registry_path)
}
