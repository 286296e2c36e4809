//! Action and proprio statistics, their on-disk cache, and normalization.

use crate::trajectory::Trajectory;
use anyhow::{ensure, Context, Result};
use ndarray::{Array1, Array2, ArrayD, Axis};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

pub const STATISTICS_FILE: &str = "dataset_statistics.json";
pub const PROPRIO_KEY: &str = "proprio";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationType {
    /// Zero mean, unit variance.
    #[default]
    Normal,
    /// Maps `[min, max]` to `[-1, 1]` and clips.
    Bounds,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayStatistics {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
    pub min: Vec<f32>,
    pub max: Vec<f32>,
}

impl ArrayStatistics {
    /// Per-column statistics of `(N, D)` rows.
    pub fn from_rows(rows: &Array2<f32>) -> Result<Self> {
        ensure!(rows.nrows() > 0, "cannot compute statistics of zero rows");
        let mean = rows
            .mean_axis(Axis(0))
            .context("empty statistics input")?;
        let std = rows.std_axis(Axis(0), 0.0);
        let min = rows.fold_axis(Axis(0), f32::INFINITY, |acc, &x| acc.min(x));
        let max = rows.fold_axis(Axis(0), f32::NEG_INFINITY, |acc, &x| acc.max(x));
        Ok(Self {
            mean: mean.to_vec(),
            std: std.to_vec(),
            min: min.to_vec(),
            max: max.to_vec(),
        })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Normalizes the last axis of `values` in place.
    pub fn normalize(&self, values: &mut ArrayD<f32>, kind: NormalizationType) -> Result<()> {
        let dim = values.shape().last().copied().unwrap_or(0);
        ensure!(
            dim == self.dim(),
            "statistics cover {} dims, values have {}",
            self.dim(),
            dim
        );
        match kind {
            NormalizationType::None => {}
            NormalizationType::Normal => {
                let mean = Array1::from(self.mean.clone());
                let std = Array1::from_iter(self.std.iter().map(|s| s + 1e-8));
                for mut lane in values.lanes_mut(Axis(values.ndim() - 1)) {
                    lane -= &mean;
                    lane /= &std;
                }
            }
            NormalizationType::Bounds => {
                for mut lane in values.lanes_mut(Axis(values.ndim() - 1)) {
                    for (i, x) in lane.iter_mut().enumerate() {
                        let range = self.max[i] - self.min[i] + 1e-8;
                        *x = (2.0 * (*x - self.min[i]) / range - 1.0).clamp(-1.0, 1.0);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn unnormalize(&self, values: &mut ArrayD<f32>, kind: NormalizationType) -> Result<()> {
        let dim = values.shape().last().copied().unwrap_or(0);
        ensure!(dim == self.dim(), "statistics cover {} dims, values have {}", self.dim(), dim);
        for mut lane in values.lanes_mut(Axis(values.ndim() - 1)) {
            for (i, x) in lane.iter_mut().enumerate() {
                *x = match kind {
                    NormalizationType::None => *x,
                    NormalizationType::Normal => *x * (self.std[i] + 1e-8) + self.mean[i],
                    NormalizationType::Bounds => {
                        (*x + 1.0) / 2.0 * (self.max[i] - self.min[i] + 1e-8) + self.min[i]
                    }
                };
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetStatistics {
    pub action: ArrayStatistics,
    pub proprio: Option<ArrayStatistics>,
    pub num_transitions: usize,
    pub num_trajectories: usize,
}

fn stack_rows<'a>(arrays: impl Iterator<Item = &'a ArrayD<f32>>) -> Result<Option<Array2<f32>>> {
    let mut rows: Vec<f32> = Vec::new();
    let mut width = None;
    let mut count = 0;
    for array in arrays {
        ensure!(array.ndim() == 2, "expected (T, D) values, got {:?}", array.shape());
        let d = array.shape()[1];
        ensure!(
            *width.get_or_insert(d) == d,
            "inconsistent widths across trajectories"
        );
        rows.extend(array.iter());
        count += array.shape()[0];
    }
    match width {
        Some(d) => Ok(Some(Array2::from_shape_vec((count, d), rows)?)),
        None => Ok(None),
    }
}

impl DatasetStatistics {
    pub fn compute(trajectories: &[Trajectory]) -> Result<Self> {
        ensure!(!trajectories.is_empty(), "no trajectories to compute statistics from");
        let actions: Vec<ArrayD<f32>> = trajectories
            .iter()
            .map(|t| t.actions.clone().into_dyn())
            .collect();
        let action_rows = stack_rows(actions.iter())?.context("no actions")?;
        let proprio_rows = stack_rows(trajectories.iter().filter_map(|t| t.observations.get(PROPRIO_KEY)))?;
        Ok(Self {
            action: ArrayStatistics::from_rows(&action_rows)?,
            proprio: proprio_rows.as_ref().map(ArrayStatistics::from_rows).transpose()?,
            num_transitions: action_rows.nrows(),
            num_trajectories: trajectories.len(),
        })
    }

    pub fn load_from_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let stats = serde_json::from_slice(&data).with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(stats))
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let blob = serde_json::to_vec_pretty(self)?;
        fs::write(path, blob).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Returns the cached statistics in `dir`, computing and caching them on a miss.
    pub fn load_or_compute(dir: &Path, trajectories: &[Trajectory]) -> Result<Self> {
        let path = dir.join(STATISTICS_FILE);
        if let Some(stats) = Self::load_from_file(&path)? {
            debug!(path = %path.display(), "using cached dataset statistics");
            return Ok(stats);
        }
        let stats = Self::compute(trajectories)?;
        stats.save_to_file(&path)?;
        info!(
            path = %path.display(),
            transitions = stats.num_transitions,
            trajectories = stats.num_trajectories,
            "computed dataset statistics"
        );
        Ok(stats)
    }

    /// Normalizes actions and proprio of `trajectory` in place.
    pub fn normalize(&self, trajectory: &mut Trajectory, kind: NormalizationType) -> Result<()> {
        let mut actions = trajectory.actions.clone().into_dyn();
        self.action.normalize(&mut actions, kind)?;
        trajectory.actions = actions.into_dimensionality()?;
        if let (Some(stats), Some(proprio)) = (&self.proprio, trajectory.observations.get_mut(PROPRIO_KEY)) {
            stats.normalize(proprio, kind)?;
        }
        Ok(())
    }
}
