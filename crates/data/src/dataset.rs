//! Loading datasets of a mixture and sampling interleaved batches from them.

use crate::augment::{augment_sample, ImageAugmentConfig};
use crate::batch::Batch;
use crate::config::DataConfig;
use crate::mixes::{log_data_mixture, make_dataset_kwargs_and_weights, DatasetKwargs};
use crate::registry::DatasetRegistry;
use crate::statistics::{DatasetStatistics, NormalizationType, PROPRIO_KEY, STATISTICS_FILE};
use crate::trajectory::{ensure_channels, resize_nearest, trajectory_files, Trajectory};
use crate::transforms::{make_sample, WindowConfig};
use crate::word_tokenizer::WordTokenizer;
use anyhow::{ensure, Context, Result};
use ndarray::{concatenate, ArrayD, Axis, IxDyn};
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Maps a stored trajectory onto canonical observation names.
///
/// Cameras become `image_<i>` and `depth_<i>` in the order of the configured
/// keys, state keys are concatenated into `proprio`. Missing slots are zeros.
pub fn restructure(
    raw: Trajectory,
    kwargs: &DatasetKwargs,
    image_size: [usize; 2],
    depth_size: [usize; 2],
) -> Result<Trajectory> {
    let len = raw.len();
    let source = |key: &str| {
        raw.observations
            .get(key)
            .with_context(|| format!("dataset '{}' has no observation '{}'", kwargs.name, key))
    };

    let mut observations = BTreeMap::new();
    for (i, key) in kwargs.image_obs_keys.iter().enumerate() {
        let [h, w] = image_size;
        let frames = match key {
            Some(key) => {
                let frames = ensure_channels(source(key.as_str())?.clone());
                ensure!(
                    frames.ndim() == 4 && frames.shape()[3] == 3,
                    "image '{}' of '{}' must be (T, H, W, 3), got {:?}",
                    key,
                    kwargs.name,
                    frames.shape()
                );
                resize_nearest(&frames, h, w)?
            }
            None => ArrayD::zeros(IxDyn(&[len, h, w, 3])),
        };
        observations.insert(format!("image_{i}"), frames);
    }
    for (i, key) in kwargs.depth_obs_keys.iter().enumerate() {
        let [h, w] = depth_size;
        let frames = match key {
            Some(key) => {
                let frames = ensure_channels(source(key.as_str())?.clone());
                ensure!(
                    frames.ndim() == 4 && frames.shape()[3] == 1,
                    "depth '{}' of '{}' must be (T, H, W) or (T, H, W, 1), got {:?}",
                    key,
                    kwargs.name,
                    frames.shape()
                );
                resize_nearest(&frames, h, w)?
            }
            None => ArrayD::zeros(IxDyn(&[len, h, w, 1])),
        };
        observations.insert(format!("depth_{i}"), frames);
    }
    if !kwargs.state_obs_keys.is_empty() {
        let mut parts = Vec::with_capacity(kwargs.state_obs_keys.len());
        for key in &kwargs.state_obs_keys {
            let part = match key {
                Some(key) => {
                    let state = source(key.as_str())?;
                    let width = state.len() / len.max(1);
                    state
                        .to_shape((len, width))
                        .with_context(|| format!("state '{}' is not (T, ...)", key))?
                        .into_owned()
                }
                None => ndarray::Array2::zeros((len, 1)),
            };
            parts.push(part);
        }
        let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
        observations.insert(PROPRIO_KEY.to_string(), concatenate(Axis(1), &views)?.into_dyn());
    }

    let trajectory = Trajectory {
        dataset: kwargs.name.clone(),
        language_instruction: raw.language_instruction,
        observations,
        actions: raw.actions,
    };
    trajectory.validate()?;
    Ok(trajectory)
}

/// All trajectories of one dataset split, normalized with the dataset's statistics.
#[derive(Debug, Clone)]
pub struct TrajectoryDataset {
    pub name: String,
    pub trajectories: Vec<Trajectory>,
    pub statistics: DatasetStatistics,
    /// Cumulative trajectory lengths, for uniform frame sampling.
    offsets: Vec<usize>,
}

fn load_split(kwargs: &DatasetKwargs, split: &str, config: &DataConfig) -> Result<Vec<Trajectory>> {
    let files = trajectory_files(&kwargs.data_dir, &kwargs.name, split)?;
    ensure!(
        !files.is_empty(),
        "no trajectories in {}",
        kwargs.data_dir.join(&kwargs.name).join(split).display()
    );
    files
        .par_iter()
        .map(|path| {
            let raw = Trajectory::load(path, &kwargs.name)?;
            restructure(raw, kwargs, config.image_size, config.depth_size())
                .with_context(|| format!("while loading {}", path.display()))
        })
        .collect()
}

impl TrajectoryDataset {
    /// Normalizes `trajectories` with `statistics`.
    pub fn new(
        name: impl Into<String>,
        mut trajectories: Vec<Trajectory>,
        statistics: DatasetStatistics,
        normalization: NormalizationType,
    ) -> Result<Self> {
        let name = name.into();
        ensure!(!trajectories.is_empty(), "dataset '{}' has no trajectories", name);
        ensure!(
            trajectories.iter().any(|t| !t.is_empty()),
            "dataset '{}' has no frames",
            name
        );
        for trajectory in &mut trajectories {
            statistics.normalize(trajectory, normalization)?;
        }
        let offsets = trajectories
            .iter()
            .scan(0, |total, t| {
                *total += t.len();
                Some(*total)
            })
            .collect();
        Ok(Self {
            name,
            trajectories,
            statistics,
            offsets,
        })
    }

    /// Computes statistics from the trajectories themselves.
    pub fn from_trajectories(
        name: impl Into<String>,
        trajectories: Vec<Trajectory>,
        normalization: NormalizationType,
    ) -> Result<Self> {
        let statistics = DatasetStatistics::compute(&trajectories)?;
        Self::new(name, trajectories, statistics, normalization)
    }

    /// Loads `split`; statistics always describe the training split and are cached
    /// next to the data.
    pub fn load(kwargs: &DatasetKwargs, split: &str, config: &DataConfig) -> Result<Self> {
        let trajectories = load_split(kwargs, split, config)?;
        let stats_dir = kwargs.data_dir.join(&kwargs.name);
        let statistics = match DatasetStatistics::load_from_file(&stats_dir.join(STATISTICS_FILE))? {
            Some(stats) => stats,
            None if split == config.train_split => {
                DatasetStatistics::load_or_compute(&stats_dir, &trajectories)?
            }
            None => {
                let train = load_split(kwargs, &config.train_split, config)?;
                DatasetStatistics::load_or_compute(&stats_dir, &train)?
            }
        };
        info!(
            dataset = %kwargs.name,
            split,
            trajectories = trajectories.len(),
            "loaded dataset"
        );
        Self::new(kwargs.name.clone(), trajectories, statistics, config.normalization)
    }

    pub fn num_frames(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    /// Sample at a frame drawn uniformly over the whole dataset.
    pub fn sample(&self, window: &WindowConfig, rng: &mut fastrand::Rng) -> Result<crate::transforms::Sample> {
        let frame = rng.usize(0..self.num_frames());
        let index = self.offsets.partition_point(|&end| end <= frame);
        let start = if index == 0 { 0 } else { self.offsets[index - 1] };
        make_sample(&self.trajectories[index], frame - start, window, rng)
    }
}

/// Weighted interleaving of several datasets.
#[derive(Debug, Clone)]
pub struct InterleavedDataset {
    pub datasets: Vec<TrajectoryDataset>,
    /// Normalized sampling probabilities, one per dataset.
    pub weights: Vec<f64>,
    pub window: WindowConfig,
    pub tokenizer: Option<WordTokenizer>,
    pub action_dim: usize,
    pub proprio_dim: Option<usize>,
    pub augment: Option<ImageAugmentConfig>,
}

impl InterleavedDataset {
    pub fn new(
        datasets: Vec<TrajectoryDataset>,
        weights: &[f64],
        window: WindowConfig,
        balance: bool,
    ) -> Result<Self> {
        window.validate()?;
        ensure!(!datasets.is_empty(), "no datasets to interleave");
        ensure!(
            datasets.len() == weights.len(),
            "{} datasets but {} weights",
            datasets.len(),
            weights.len()
        );
        let mut weights: Vec<f64> = weights
            .iter()
            .zip(&datasets)
            .map(|(&w, d)| if balance { w * d.num_frames() as f64 } else { w })
            .collect();
        let total: f64 = weights.iter().sum();
        ensure!(total > 0.0, "sampling weights sum to zero");
        for w in &mut weights {
            *w /= total;
        }
        let action_dim = datasets
            .iter()
            .flat_map(|d| d.trajectories.iter().map(|t| t.action_dim()))
            .max()
            .unwrap_or(0);
        Ok(Self {
            datasets,
            weights,
            window,
            tokenizer: None,
            action_dim,
            proprio_dim: None,
            augment: None,
        })
    }

    pub fn with_tokenizer(mut self, tokenizer: Option<WordTokenizer>) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    pub fn with_padding(mut self, action_dim: usize, proprio_dim: Option<usize>) -> Result<Self> {
        ensure!(
            action_dim >= self.action_dim,
            "action_dim {} is smaller than the widest dataset ({})",
            action_dim,
            self.action_dim
        );
        self.action_dim = action_dim;
        self.proprio_dim = proprio_dim;
        Ok(self)
    }

    pub fn with_augmentation(mut self, augment: Option<ImageAugmentConfig>) -> Result<Self> {
        if let Some(augment) = &augment {
            augment.validate()?;
        }
        self.augment = augment;
        Ok(self)
    }

    /// Resolves the configured mixture and loads `split` of every dataset.
    pub fn from_config(config: &DataConfig, split: &str) -> Result<Self> {
        config.validate()?;
        let registry = DatasetRegistry::from_file(config.registry_path())?;
        let mix = config.mix.resolve()?;
        let (kwargs, weights) =
            make_dataset_kwargs_and_weights(&mix, &registry, &config.data_dir, &config.mix_options)?;
        ensure!(!kwargs.is_empty(), "no dataset of the mixture can be loaded");
        log_data_mixture(&kwargs, &weights);

        let datasets = kwargs
            .iter()
            .map(|kw| TrajectoryDataset::load(kw, split, config))
            .collect::<Result<Vec<_>>>()?;
        let tokenizer = if config.language_tokens > 0 {
            Some(WordTokenizer::new(config.vocab_size, config.language_tokens)?)
        } else {
            None
        };
        let augment = if split == config.train_split {
            config.image_augment.clone()
        } else {
            None
        };
        Self::new(datasets, &weights, config.window(), config.balance_weights)?
            .with_tokenizer(tokenizer)
            .with_padding(config.action_dim, config.proprio_dim)?
            .with_augmentation(augment)
    }

    pub fn statistics(&self) -> BTreeMap<String, DatasetStatistics> {
        self.datasets
            .iter()
            .map(|d| (d.name.clone(), d.statistics.clone()))
            .collect()
    }

    /// Index of a dataset drawn according to the sampling weights.
    pub fn sample_dataset(&self, rng: &mut fastrand::Rng) -> usize {
        let draw = rng.f64();
        let mut cumulative = 0.0;
        for (i, w) in self.weights.iter().enumerate() {
            cumulative += w;
            if draw < cumulative {
                return i;
            }
        }
        self.weights.len() - 1
    }

    pub fn sample_batch(&self, batch_size: usize, rng: &mut fastrand::Rng) -> Result<Batch> {
        ensure!(batch_size > 0, "batch_size must be positive");
        let samples = (0..batch_size)
            .map(|_| {
                let index = self.sample_dataset(rng);
                let mut sample = self.datasets[index].sample(&self.window, rng)?;
                if let Some(augment) = &self.augment {
                    augment_sample(&mut sample, augment, rng)?;
                }
                Ok(sample)
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(batch_size, "sampled batch");
        Batch::collate(&samples, self.tokenizer.as_ref(), self.action_dim, self.proprio_dim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ActionEncoding;
    use crate::transforms::GoalRelabeling;
    use ndarray::Array2;
    use std::path::PathBuf;

    fn constant_trajectory(dataset: &str, len: usize, value: f32, action_dim: usize) -> Trajectory {
        let mut observations = BTreeMap::new();
        observations.insert(
            PROPRIO_KEY.to_string(),
            ArrayD::from_elem(IxDyn(&[len, 2]), value),
        );
        Trajectory {
            dataset: dataset.into(),
            language_instruction: format!("reach {value}"),
            observations,
            actions: Array2::from_shape_fn((len, action_dim), |(t, _)| value + t as f32),
        }
    }

    fn window() -> WindowConfig {
        WindowConfig {
            window_size: 2,
            action_horizon: 2,
            goal_relabeling: GoalRelabeling::Uniform,
        }
    }

    #[test]
    fn restructure_names_cameras_and_concatenates_state() {
        let mut raw = constant_trajectory("raw", 3, 1.0, 2);
        raw.observations.insert(
            "rgb".into(),
            ArrayD::from_elem(IxDyn(&[3, 8, 8, 3]), 0.5),
        );
        raw.observations.insert("grip".into(), ArrayD::from_elem(IxDyn(&[3]), 2.0));
        let kwargs = DatasetKwargs {
            name: "raw".into(),
            data_dir: PathBuf::from("/unused"),
            image_obs_keys: vec![Some("rgb".into()), None],
            depth_obs_keys: vec![None],
            state_obs_keys: vec![Some("proprio".into()), None, Some("grip".into())],
            action_encoding: ActionEncoding::EefPos,
        };
        let restructured = restructure(raw, &kwargs, [4, 4], [2, 2]).unwrap();
        let keys: Vec<_> = restructured.observations.keys().cloned().collect();
        assert_eq!(keys, vec!["depth_0", "image_0", "image_1", "proprio"]);
        assert_eq!(restructured.observations["image_0"].shape(), &[3, 4, 4, 3]);
        assert!(restructured.observations["image_1"].iter().all(|&v| v == 0.0));
        assert_eq!(restructured.observations["depth_0"].shape(), &[3, 2, 2, 1]);
        assert_eq!(
            restructured.observations["proprio"].index_axis(Axis(0), 0).iter().copied().collect::<Vec<_>>(),
            vec![1.0, 1.0, 0.0, 2.0]
        );
    }

    #[test]
    fn missing_source_key_is_an_error() {
        let raw = constant_trajectory("raw", 3, 1.0, 2);
        let kwargs = DatasetKwargs {
            name: "raw".into(),
            data_dir: PathBuf::from("/unused"),
            image_obs_keys: vec![Some("rgb".into())],
            depth_obs_keys: Vec::new(),
            state_obs_keys: Vec::new(),
            action_encoding: ActionEncoding::EefPos,
        };
        assert!(restructure(raw, &kwargs, [4, 4], [4, 4]).is_err());
    }

    #[test]
    fn frames_are_sampled_from_every_trajectory() {
        let trajectories = vec![
            constant_trajectory("a", 2, 0.0, 1),
            constant_trajectory("a", 5, 10.0, 1),
        ];
        let dataset = TrajectoryDataset::from_trajectories("a", trajectories, NormalizationType::None).unwrap();
        assert_eq!(dataset.num_frames(), 7);
        let mut rng = fastrand::Rng::with_seed(2);
        let mut seen = [0usize; 2];
        for _ in 0..200 {
            let sample = dataset.sample(&window(), &mut rng).unwrap();
            seen[(sample.language_instruction == "reach 10") as usize] += 1;
        }
        assert!(seen[0] > 20 && seen[1] > 100, "{seen:?}");
    }

    #[test]
    fn datasets_without_frames_are_rejected() {
        let statistics = DatasetStatistics::compute(&[constant_trajectory("a", 3, 1.0, 1)]).unwrap();
        let empty = vec![constant_trajectory("a", 0, 1.0, 1)];
        let err = TrajectoryDataset::new("a", empty, statistics, NormalizationType::None).unwrap_err();
        assert!(err.to_string().contains("no frames"), "{err}");
    }

    #[test]
    fn weights_are_normalized_and_optionally_balanced() {
        let small = TrajectoryDataset::from_trajectories(
            "small",
            vec![constant_trajectory("small", 2, 0.0, 1)],
            NormalizationType::None,
        )
        .unwrap();
        let large = TrajectoryDataset::from_trajectories(
            "large",
            vec![constant_trajectory("large", 6, 0.0, 1)],
            NormalizationType::None,
        )
        .unwrap();
        let plain = InterleavedDataset::new(vec![small.clone(), large.clone()], &[3.0, 1.0], window(), false).unwrap();
        assert_eq!(plain.weights, vec![0.75, 0.25]);
        let balanced = InterleavedDataset::new(vec![small, large], &[1.0, 1.0], window(), true).unwrap();
        assert_eq!(balanced.weights, vec![0.25, 0.75]);
    }

    #[test]
    fn batches_pad_to_the_widest_action_space() {
        let a = TrajectoryDataset::from_trajectories(
            "a",
            vec![constant_trajectory("a", 4, 1.0, 2)],
            NormalizationType::Normal,
        )
        .unwrap();
        let b = TrajectoryDataset::from_trajectories(
            "b",
            vec![constant_trajectory("b", 4, 2.0, 3)],
            NormalizationType::Normal,
        )
        .unwrap();
        let interleaved = InterleavedDataset::new(vec![a, b], &[1.0, 1.0], window(), false)
            .unwrap()
            .with_tokenizer(Some(WordTokenizer::new(32, 3).unwrap()));
        let mut rng = fastrand::Rng::with_seed(9);
        let batch = interleaved.sample_batch(8, &mut rng).unwrap();
        assert_eq!(batch.actions.dim(), (8, 2, 2, 3));
        assert_eq!(batch.observations[PROPRIO_KEY].shape(), &[8, 2, 2]);
        assert_eq!(batch.tasks[PROPRIO_KEY].shape(), &[8, 2]);
        assert_eq!(batch.language.as_ref().unwrap().dim(), (8, 3));
        assert!(interleaved.with_padding(2, None).is_err());
    }
}
