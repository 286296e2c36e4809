//! Training run configuration.

use crate::optimizer::OptimizerConfig;
use anyhow::{ensure, Context, Result};
use policyforge_data::DataConfig;
use policyforge_model::{ModelConfig, TokenizerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn default_batch_size() -> usize {
    32
}

fn default_num_steps() -> usize {
    1000
}

fn default_log_interval() -> usize {
    10
}

fn default_eval_interval() -> usize {
    100
}

fn default_eval_batches() -> usize {
    4
}

fn default_save_interval() -> usize {
    500
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_num_steps")]
    pub num_steps: usize,
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    /// Zero disables evaluation.
    #[serde(default = "default_eval_interval")]
    pub eval_interval: usize,
    #[serde(default = "default_eval_batches")]
    pub eval_batches: usize,
    /// Zero keeps only the final checkpoint.
    #[serde(default = "default_save_interval")]
    pub save_interval: usize,
    #[serde(default)]
    pub save_dir: Option<PathBuf>,
    /// Checkpoint whose matching parameters initialize the model.
    #[serde(default)]
    pub pretrained: Option<PathBuf>,
    /// Glob patterns over parameter names excluded from updates.
    #[serde(default)]
    pub frozen_keys: Vec<String>,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    pub data: DataConfig,
    pub model: ModelConfig,
}

impl TrainConfig {
    /// Parses TOML or JSON depending on the file extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        let config: TrainConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)
                .with_context(|| format!("failed to parse {}", path.display()))?,
            _ => toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))?,
        };
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "batch_size must be positive");
        ensure!(self.num_steps > 0, "num_steps must be positive");
        ensure!(self.log_interval > 0, "log_interval must be positive");
        ensure!(
            self.eval_interval == 0 || self.eval_batches > 0,
            "eval_batches must be positive when evaluation is enabled"
        );
        self.optimizer.validate()?;
        self.data.validate()?;
        self.model.validate()?;

        ensure!(
            self.data.window_size <= self.model.max_horizon,
            "window_size ({}) exceeds the model's max_horizon ({})",
            self.data.window_size,
            self.model.max_horizon
        );
        for (name, head) in &self.model.heads {
            ensure!(
                head.action_dim() <= self.data.action_dim,
                "head '{}' predicts {} action dims but the data provides {}",
                name,
                head.action_dim(),
                self.data.action_dim
            );
            ensure!(
                head.pred_horizon() <= self.data.action_horizon,
                "head '{}' pred_horizon ({}) exceeds the data action_horizon ({})",
                name,
                head.pred_horizon(),
                self.data.action_horizon
            );
        }
        let language: Vec<_> = self
            .model
            .task_tokenizers
            .iter()
            .chain(&self.model.observation_tokenizers)
            .filter_map(|(name, tokenizer)| match tokenizer {
                TokenizerConfig::Language(cfg) => Some((name, cfg)),
                _ => None,
            })
            .collect();
        for (name, cfg) in &language {
            ensure!(
                self.data.language_tokens > 0,
                "tokenizer '{}' needs language inputs but language_tokens is 0",
                name
            );
            ensure!(
                cfg.vocab_size >= self.data.vocab_size,
                "tokenizer '{}' vocab_size ({}) is smaller than the data vocab_size ({})",
                name,
                cfg.vocab_size,
                self.data.vocab_size
            );
        }
        Ok(())
    }
}
