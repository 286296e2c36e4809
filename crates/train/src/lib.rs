//! Training for policyforge: AdamW, learning-rate schedules, the trainer loop and the CLI.

#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod metrics;
pub mod optimizer;
pub mod schedule;
pub mod trainer;

pub use config::TrainConfig;
pub use metrics::{MetricsRecord, MetricsWriter, Split};
pub use optimizer::{AdamW, FrozenKeys, OptimizerConfig, StepStats};
pub use schedule::LearningRateSchedule;
pub use trainer::{evaluate_checkpoint, TrainSummary, Trainer};
