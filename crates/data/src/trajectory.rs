//! Trajectories and their safetensors storage.
//!
//! A file holds one trajectory: an `action` tensor `(T, A)`, one
//! `observation.<key>` tensor per recorded stream (leading time axis) and the
//! `language_instruction` string in the header metadata.

use anyhow::{bail, ensure, Context, Result};
use ndarray::{Array2, ArrayD, ArrayViewD, Axis, IxDyn};
use safetensors::tensor::{Dtype, TensorView, View};
use safetensors::SafeTensors;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

pub const ACTION_KEY: &str = "action";
pub const OBSERVATION_PREFIX: &str = "observation.";
pub const LANGUAGE_KEY: &str = "language_instruction";

#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    pub dataset: String,
    pub language_instruction: String,
    /// Each entry has a leading time axis of length `len()`.
    pub observations: BTreeMap<String, ArrayD<f32>>,
    /// `(T, action_dim)`
    pub actions: Array2<f32>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.actions.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.nrows() == 0
    }

    pub fn action_dim(&self) -> usize {
        self.actions.ncols()
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.is_empty(), "trajectory from '{}' has no steps", self.dataset);
        for (key, obs) in &self.observations {
            ensure!(
                obs.ndim() >= 1 && obs.shape()[0] == self.len(),
                "observation '{}' has {:?} steps, actions have {}",
                key,
                obs.shape().first(),
                self.len()
            );
        }
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut tensors: BTreeMap<String, Buffer> = BTreeMap::new();
        tensors.insert(ACTION_KEY.to_string(), Buffer::from_array(self.actions.view().into_dyn()));
        for (key, obs) in &self.observations {
            tensors.insert(format!("{OBSERVATION_PREFIX}{key}"), Buffer::from_array(obs.view()));
        }
        let metadata = HashMap::from([
            (LANGUAGE_KEY.to_string(), self.language_instruction.clone()),
            ("dataset".to_string(), self.dataset.clone()),
        ]);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
        }
        safetensors::serialize_to_file(
            tensors.iter().map(|(k, v)| (k.as_str(), v)),
            &Some(metadata),
            path,
        )
        .with_context(|| format!("failed to write trajectory {}", path.display()))?;
        Ok(())
    }

    /// Reads a trajectory file; `dataset` overrides the name stored in the file.
    pub fn load(path: impl AsRef<Path>, dataset: &str) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let (_, header) = SafeTensors::read_metadata(&data).context("failed to parse safetensors header")?;
        let language_instruction = header
            .metadata()
            .as_ref()
            .and_then(|m| m.get(LANGUAGE_KEY).cloned())
            .unwrap_or_default();
        let tensors = SafeTensors::deserialize(&data).context("failed to parse safetensors")?;

        let action = tensors
            .tensor(ACTION_KEY)
            .with_context(|| format!("{} has no '{}' tensor", path.display(), ACTION_KEY))?;
        let action = tensor_to_array(&action, ACTION_KEY)?;
        ensure!(action.ndim() == 2, "'action' must be (T, A), got {:?}", action.shape());
        let actions = action.into_dimensionality()?;

        let mut observations = BTreeMap::new();
        for name in tensors.names() {
            if let Some(key) = name.strip_prefix(OBSERVATION_PREFIX) {
                let view = tensors.tensor(name)?;
                observations.insert(key.to_string(), tensor_to_array(&view, name)?);
            }
        }
        let trajectory = Self {
            dataset: dataset.to_string(),
            language_instruction,
            observations,
            actions,
        };
        trajectory
            .validate()
            .with_context(|| format!("invalid trajectory {}", path.display()))?;
        Ok(trajectory)
    }
}

fn tensor_to_array(view: &TensorView<'_>, name: &str) -> Result<ArrayD<f32>> {
    let bytes = view.data();
    let values: Vec<f32> = match view.dtype() {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::F64 => bytes
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
            .collect(),
        Dtype::U8 => bytes.iter().map(|&b| b as f32 / 255.0).collect(),
        Dtype::BOOL => bytes.iter().map(|&b| if b != 0 { 1.0 } else { 0.0 }).collect(),
        other => bail!("tensor '{}' has unsupported dtype {:?}", name, other),
    };
    Ok(ArrayD::from_shape_vec(IxDyn(view.shape()), values)?)
}

struct Buffer {
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

impl Buffer {
    fn from_array(array: ArrayViewD<'_, f32>) -> Self {
        Self {
            shape: array.shape().to_vec(),
            bytes: array.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }
}

impl View for &Buffer {
    fn dtype(&self) -> Dtype {
        Dtype::F32
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.bytes)
    }

    fn data_len(&self) -> usize {
        self.bytes.len()
    }
}

/// Sorted `*.safetensors` files of `<data_dir>/<name>/<split>`.
pub fn trajectory_files(data_dir: &Path, name: &str, split: &str) -> Result<Vec<PathBuf>> {
    let dir = data_dir.join(name).join(split);
    let mut files = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "safetensors") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Nearest-neighbour resize of `(T, H, W, C)` frames to `(T, height, width, C)`.
pub fn resize_nearest(frames: &ArrayD<f32>, height: usize, width: usize) -> Result<ArrayD<f32>> {
    ensure!(
        frames.ndim() == 4,
        "expected (T, H, W, C) frames, got {:?}",
        frames.shape()
    );
    ensure!(height > 0 && width > 0, "resize target must be non-empty");
    let (t, h, w, c) = (frames.shape()[0], frames.shape()[1], frames.shape()[2], frames.shape()[3]);
    if (h, w) == (height, width) {
        return Ok(frames.clone());
    }
    ensure!(h > 0 && w > 0, "cannot resize empty frames");
    Ok(ArrayD::from_shape_fn(IxDyn(&[t, height, width, c]), |idx| {
        let y = (idx[1] * h) / height;
        let x = (idx[2] * w) / width;
        frames[[idx[0], y, x, idx[3]]]
    }))
}

/// Adds a trailing channel axis to `(T, H, W)` frames.
pub fn ensure_channels(frames: ArrayD<f32>) -> ArrayD<f32> {
    if frames.ndim() == 3 {
        frames.insert_axis(Axis(3))
    } else {
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample() -> Trajectory {
        let mut observations = BTreeMap::new();
        observations.insert(
            "image".to_string(),
            ArrayD::from_shape_fn(IxDyn(&[3, 4, 4, 3]), |i| (i[0] + i[1]) as f32 / 10.0),
        );
        observations.insert("state".to_string(), array![[0.1f32, 0.2], [0.3, 0.4], [0.5, 0.6]].into_dyn());
        Trajectory {
            dataset: "toy".into(),
            language_instruction: "pick up the block".into(),
            observations,
            actions: array![[1.0f32, 0.0], [0.0, 1.0], [0.5, 0.5]],
        }
    }

    #[test]
    fn trajectory_survives_a_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toy/train/000.safetensors");
        let trajectory = sample();
        trajectory.save(&path).unwrap();

        let loaded = Trajectory::load(&path, "toy").unwrap();
        assert_eq!(loaded, trajectory);
        assert_eq!(
            trajectory_files(dir.path(), "toy", "train").unwrap(),
            vec![path]
        );
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let mut trajectory = sample();
        trajectory.actions = array![[1.0f32, 0.0]];
        assert!(trajectory.validate().is_err());
    }

    #[test]
    fn nearest_resize_picks_source_pixels() {
        let frames = ArrayD::from_shape_fn(IxDyn(&[1, 2, 2, 1]), |i| (i[1] * 2 + i[2]) as f32);
        let up = resize_nearest(&frames, 4, 4).unwrap();
        assert_eq!(up.shape(), &[1, 4, 4, 1]);
        assert_eq!(up[[0, 0, 1, 0]], 0.0);
        assert_eq!(up[[0, 1, 3, 0]], 1.0);
        assert_eq!(up[[0, 3, 0, 0]], 2.0);
        assert_eq!(up[[0, 3, 3, 0]], 3.0);
        let down = resize_nearest(&up, 2, 2).unwrap();
        assert_eq!(down, frames);
    }
}
