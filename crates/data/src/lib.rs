//! Robot demonstration data: storage, mixtures, normalization and batching.

pub mod augment;
pub mod batch;
pub mod config;
pub mod dataset;
pub mod mixes;
pub mod registry;
pub mod statistics;
pub mod synthetic;
pub mod trajectory;
pub mod transforms;
pub mod word_tokenizer;

pub use augment::{AugmentOp, ImageAugmentConfig, ResizedCropConfig};
pub use batch::Batch;
pub use config::{DataConfig, MixSpec};
pub use dataset::{InterleavedDataset, TrajectoryDataset};
pub use mixes::{
    format_data_mixture, make_dataset_kwargs_and_weights, named_mix, DatasetKwargs, MixOptions, OXE_FRANKA_MIX,
    OXE_FULL_MIX, RT_X_MIX,
};
pub use registry::{ActionEncoding, DatasetConfig, DatasetRegistry};
pub use statistics::{ArrayStatistics, DatasetStatistics, NormalizationType};
pub use trajectory::Trajectory;
pub use transforms::{GoalRelabeling, Sample, WindowConfig};
pub use word_tokenizer::WordTokenizer;
