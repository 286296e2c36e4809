//! Model configuration: transformer backbone, tokenizers, readouts and heads.

use anyhow::{bail, ensure, Result};
pub use policyforge_kernels::ActivationKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_dropout() -> f32 {
    0.1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransformerConfig {
    pub num_layers: usize,
    pub mlp_dim: usize,
    pub num_attention_heads: usize,
    #[serde(default = "default_dropout")]
    pub dropout_rate: f32,
    #[serde(default = "default_dropout")]
    pub attention_dropout_rate: f32,
    /// MLP nonlinearity of every encoder block.
    #[serde(default)]
    pub activation: ActivationKind,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            num_layers: 4,
            mlp_dim: 1024,
            num_attention_heads: 8,
            dropout_rate: 0.1,
            attention_dropout_rate: 0.1,
            activation: ActivationKind::Gelu,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BinType {
    #[default]
    Uniform,
    Normal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BinningConfig {
    pub n_bins: usize,
    #[serde(default)]
    pub bin_type: BinType,
    #[serde(default)]
    pub low: f32,
    #[serde(default = "one")]
    pub high: f32,
}

fn one() -> f32 {
    1.0
}

impl Default for BinningConfig {
    fn default() -> Self {
        Self {
            n_bins: 256,
            bin_type: BinType::Uniform,
            low: 0.0,
            high: 1.0,
        }
    }
}

fn default_num_tokens() -> usize {
    8
}

fn default_bottleneck() -> usize {
    128
}

fn default_obs_stack_keys() -> Vec<String> {
    vec!["image_.*".to_string(), "depth_.*".to_string()]
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageTokenizerConfig {
    pub patch_size: usize,
    pub embed_dim: usize,
    #[serde(default = "default_true")]
    pub early_fusion: bool,
    #[serde(default = "default_num_tokens")]
    pub num_tokens: usize,
    #[serde(default = "default_obs_stack_keys")]
    pub obs_stack_keys: Vec<String>,
    #[serde(default)]
    pub task_stack_keys: Vec<String>,
    #[serde(default)]
    pub task_film_keys: Vec<String>,
    #[serde(default = "default_bottleneck")]
    pub bottleneck_dim: usize,
    #[serde(default = "default_dropout")]
    pub dropout_rate: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LanguageTokenizerConfig {
    pub vocab_size: usize,
    pub embed_dim: usize,
    #[serde(default)]
    pub projection_dim: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LowdimTokenizerConfig {
    pub obs_keys: Vec<String>,
    pub embed_dim: usize,
    #[serde(default)]
    pub binning: BinningConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenizerConfig {
    Image(ImageTokenizerConfig),
    Language(LanguageTokenizerConfig),
    Lowdim(LowdimTokenizerConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscreteHeadConfig {
    pub readout_key: String,
    #[serde(default = "one_usize")]
    pub pred_horizon: usize,
    pub action_dim: usize,
    #[serde(default)]
    pub binning: BinningConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContinuousHeadConfig {
    pub readout_key: String,
    #[serde(default = "one_usize")]
    pub pred_horizon: usize,
    pub action_dim: usize,
}

fn one_usize() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HeadConfig {
    Discrete(DiscreteHeadConfig),
    Continuous(ContinuousHeadConfig),
}

impl HeadConfig {
    pub fn readout_key(&self) -> &str {
        match self {
            HeadConfig::Discrete(cfg) => &cfg.readout_key,
            HeadConfig::Continuous(cfg) => &cfg.readout_key,
        }
    }

    pub fn pred_horizon(&self) -> usize {
        match self {
            HeadConfig::Discrete(cfg) => cfg.pred_horizon,
            HeadConfig::Continuous(cfg) => cfg.pred_horizon,
        }
    }

    pub fn action_dim(&self) -> usize {
        match self {
            HeadConfig::Discrete(cfg) => cfg.action_dim,
            HeadConfig::Continuous(cfg) => cfg.action_dim,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    pub token_embedding_size: usize,
    pub max_horizon: usize,
    #[serde(default)]
    pub transformer: TransformerConfig,
    #[serde(default)]
    pub observation_tokenizers: BTreeMap<String, TokenizerConfig>,
    #[serde(default)]
    pub task_tokenizers: BTreeMap<String, TokenizerConfig>,
    /// Readout group name -> tokens per timestep.
    #[serde(default)]
    pub readouts: BTreeMap<String, usize>,
    #[serde(default)]
    pub heads: BTreeMap<String, HeadConfig>,
}

impl ModelConfig {
    /// Small image + proprio + language policy with a discrete action head.
    pub fn small(action_dim: usize) -> Self {
        let mut observation_tokenizers = BTreeMap::new();
        observation_tokenizers.insert(
            "image".to_string(),
            TokenizerConfig::Image(ImageTokenizerConfig {
                patch_size: 8,
                embed_dim: 64,
                early_fusion: true,
                num_tokens: 16,
                obs_stack_keys: vec!["image_.*".to_string()],
                task_stack_keys: vec!["image_.*".to_string()],
                task_film_keys: Vec::new(),
                bottleneck_dim: 64,
                dropout_rate: 0.1,
            }),
        );
        observation_tokenizers.insert(
            "proprio".to_string(),
            TokenizerConfig::Lowdim(LowdimTokenizerConfig {
                obs_keys: vec!["proprio".to_string()],
                embed_dim: 32,
                binning: BinningConfig {
                    n_bins: 64,
                    bin_type: BinType::Normal,
                    low: -1.0,
                    high: 1.0,
                },
            }),
        );
        let mut task_tokenizers = BTreeMap::new();
        task_tokenizers.insert(
            "language".to_string(),
            TokenizerConfig::Language(LanguageTokenizerConfig {
                vocab_size: 1024,
                embed_dim: 64,
                projection_dim: None,
            }),
        );
        let mut readouts = BTreeMap::new();
        readouts.insert("action".to_string(), 1);
        let mut heads = BTreeMap::new();
        heads.insert(
            "action".to_string(),
            HeadConfig::Discrete(DiscreteHeadConfig {
                readout_key: "action".to_string(),
                pred_horizon: 1,
                action_dim,
                binning: BinningConfig {
                    n_bins: 256,
                    bin_type: BinType::Normal,
                    low: -1.0,
                    high: 1.0,
                },
            }),
        );

        Self {
            token_embedding_size: 128,
            max_horizon: 4,
            transformer: TransformerConfig {
                num_layers: 2,
                mlp_dim: 256,
                num_attention_heads: 4,
                dropout_rate: 0.1,
                attention_dropout_rate: 0.1,
                activation: ActivationKind::Gelu,
            },
            observation_tokenizers,
            task_tokenizers,
            readouts,
            heads,
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.token_embedding_size > 0, "token_embedding_size must be positive");
        ensure!(self.max_horizon > 0, "max_horizon must be positive");
        let heads = self.transformer.num_attention_heads;
        ensure!(heads > 0, "num_attention_heads must be positive");
        ensure!(
            self.token_embedding_size % heads == 0,
            "token_embedding_size ({}) must be divisible by num_attention_heads ({})",
            self.token_embedding_size,
            heads
        );
        for rate in [self.transformer.dropout_rate, self.transformer.attention_dropout_rate] {
            ensure!((0.0..1.0).contains(&rate), "dropout rate {} must be in [0, 1)", rate);
        }
        ensure!(
            !self.observation_tokenizers.is_empty() || !self.task_tokenizers.is_empty(),
            "at least one tokenizer is required"
        );
        for (name, tokenizer) in self.observation_tokenizers.iter().chain(&self.task_tokenizers) {
            validate_tokenizer(name, tokenizer)?;
        }
        for (name, &count) in &self.readouts {
            ensure!(count > 0, "readout '{}' needs at least one token", name);
        }
        ensure!(!self.heads.is_empty(), "at least one head is required");
        for (name, head) in &self.heads {
            if !self.readouts.contains_key(head.readout_key()) {
                bail!(
                    "head '{}' reads from unknown readout '{}'",
                    name,
                    head.readout_key()
                );
            }
            ensure!(head.pred_horizon() > 0, "head '{}' pred_horizon must be positive", name);
            ensure!(head.action_dim() > 0, "head '{}' action_dim must be positive", name);
            if let HeadConfig::Discrete(cfg) = head {
                validate_binning(name, &cfg.binning)?;
            }
        }
        Ok(())
    }
}

fn validate_tokenizer(name: &str, config: &TokenizerConfig) -> Result<()> {
    match config {
        TokenizerConfig::Image(cfg) => {
            ensure!(cfg.patch_size > 0, "tokenizer '{}' patch_size must be positive", name);
            ensure!(cfg.embed_dim > 0, "tokenizer '{}' embed_dim must be positive", name);
            ensure!(cfg.num_tokens > 0, "tokenizer '{}' num_tokens must be positive", name);
            ensure!(
                !cfg.obs_stack_keys.is_empty(),
                "tokenizer '{}' needs at least one obs_stack_keys pattern",
                name
            );
        }
        TokenizerConfig::Language(cfg) => {
            ensure!(cfg.vocab_size > 3, "tokenizer '{}' vocab_size must exceed the reserved ids", name);
            ensure!(cfg.embed_dim > 0, "tokenizer '{}' embed_dim must be positive", name);
        }
        TokenizerConfig::Lowdim(cfg) => {
            ensure!(!cfg.obs_keys.is_empty(), "tokenizer '{}' needs obs_keys", name);
            ensure!(cfg.embed_dim > 0, "tokenizer '{}' embed_dim must be positive", name);
            validate_binning(name, &cfg.binning)?;
        }
    }
    Ok(())
}

fn validate_binning(name: &str, binning: &BinningConfig) -> Result<()> {
    ensure!(binning.n_bins > 1, "'{}' needs at least two bins", name);
    if binning.bin_type == BinType::Uniform {
        ensure!(
            binning.high > binning.low,
            "'{}' bin range [{}, {}] is empty",
            name,
            binning.low,
            binning.high
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_config_is_valid() {
        ModelConfig::small(7).validate().unwrap();
    }

    #[test]
    fn rejects_head_with_unknown_readout() {
        let mut config = ModelConfig::small(7);
        config.readouts.clear();
        config.readouts.insert("value".to_string(), 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_indivisible_embedding() {
        let mut config = ModelConfig::small(7);
        config.token_embedding_size = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn tokenizer_kind_round_trips_through_json() {
        let config = ModelConfig::small(3);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"kind\":\"image\""));
        let back: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
