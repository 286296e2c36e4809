use crate::augment::ImageAugmentConfig;
use crate::mixes::{named_mix, MixOptions};
use crate::statistics::NormalizationType;
use crate::transforms::{GoalRelabeling, WindowConfig};
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A built-in mixture name or an explicit `[name, weight]` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MixSpec {
    Named(String),
    Explicit(Vec<(String, f64)>),
}

impl MixSpec {
    pub fn resolve(&self) -> Result<Vec<(String, f64)>> {
        match self {
            MixSpec::Named(name) => named_mix(name),
            MixSpec::Explicit(entries) => Ok(entries.clone()),
        }
    }
}

fn default_split() -> String {
    "train".to_string()
}

fn default_val_split() -> String {
    "val".to_string()
}

fn default_image_size() -> [usize; 2] {
    [64, 64]
}

fn default_window_size() -> usize {
    2
}

fn default_one() -> usize {
    1
}

fn default_language_tokens() -> usize {
    16
}

fn default_vocab_size() -> usize {
    1024
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    pub data_dir: PathBuf,
    /// Dataset registry TOML; defaults to `<data_dir>/registry.toml`.
    #[serde(default)]
    pub registry: Option<PathBuf>,
    pub mix: MixSpec,
    #[serde(default)]
    pub mix_options: MixOptions,
    #[serde(default = "default_split")]
    pub train_split: String,
    #[serde(default = "default_val_split")]
    pub val_split: String,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_one")]
    pub action_horizon: usize,
    #[serde(default)]
    pub goal_relabeling: GoalRelabeling,
    #[serde(default)]
    pub normalization: NormalizationType,
    /// `[height, width]` every camera image is resized to.
    #[serde(default = "default_image_size")]
    pub image_size: [usize; 2],
    #[serde(default)]
    pub depth_size: Option<[usize; 2]>,
    /// Weight datasets by their number of frames as well as their mixture weight.
    #[serde(default)]
    pub balance_weights: bool,
    /// Actions of every dataset are zero-padded to this width.
    pub action_dim: usize,
    #[serde(default)]
    pub proprio_dim: Option<usize>,
    /// Zero disables language inputs.
    #[serde(default = "default_language_tokens")]
    pub language_tokens: usize,
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    /// Applied to camera images of the training split only.
    #[serde(default)]
    pub image_augment: Option<ImageAugmentConfig>,
}

impl DataConfig {
    pub fn window(&self) -> WindowConfig {
        WindowConfig {
            window_size: self.window_size,
            action_horizon: self.action_horizon,
            goal_relabeling: self.goal_relabeling,
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.registry
            .clone()
            .unwrap_or_else(|| self.data_dir.join("registry.toml"))
    }

    pub fn depth_size(&self) -> [usize; 2] {
        self.depth_size.unwrap_or(self.image_size)
    }

    pub fn validate(&self) -> Result<()> {
        self.window().validate()?;
        ensure!(self.action_dim > 0, "action_dim must be positive");
        ensure!(
            self.image_size.iter().all(|&s| s > 0),
            "image_size must be positive, got {:?}",
            self.image_size
        );
        ensure!(
            self.depth_size().iter().all(|&s| s > 0),
            "depth_size must be positive"
        );
        if let MixSpec::Explicit(entries) = &self.mix {
            ensure!(!entries.is_empty(), "data mixture is empty");
            for (name, weight) in entries {
                ensure!(
                    weight.is_finite() && *weight >= 0.0,
                    "dataset '{}' has invalid weight {}",
                    name,
                    weight
                );
            }
        }
        ensure!(
            self.language_tokens == 0 || self.vocab_size > 3,
            "vocab_size must exceed the reserved ids"
        );
        if let Some(augment) = &self.image_augment {
            augment.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_with_defaults() {
        let cfg: DataConfig = toml::from_str(
            r#"
data_dir = "/data"
mix = "rt_x"
action_dim = 7
"#,
        )
        .unwrap();
        assert_eq!(cfg.window_size, 2);
        assert_eq!(cfg.goal_relabeling, GoalRelabeling::Uniform);
        assert_eq!(cfg.registry_path(), PathBuf::from("/data/registry.toml"));
        assert_eq!(cfg.depth_size(), [64, 64]);
        assert_eq!(cfg.mix.resolve().unwrap().len(), 11);
        assert!(cfg.mix_options.deduplicate);
        cfg.validate().unwrap();
    }

    #[test]
    fn explicit_mix_from_toml() {
        let cfg: DataConfig = toml::from_str(
            r#"
data_dir = "/data"
mix = [["synthetic", 1.0], ["other", 0.5]]
action_dim = 7
goal_relabeling = "last"
normalization = "bounds"
"#,
        )
        .unwrap();
        assert_eq!(
            cfg.mix.resolve().unwrap(),
            vec![("synthetic".to_string(), 1.0), ("other".to_string(), 0.5)]
        );
        assert_eq!(cfg.normalization, NormalizationType::Bounds);
    }

    #[test]
    fn image_augmentation_from_toml() {
        let cfg: DataConfig = toml::from_str(
            r#"
data_dir = "/data"
mix = "rt_x"
action_dim = 7

[image_augment]
random_resized_crop = { scale = [0.8, 1.0], ratio = [0.9, 1.1] }
random_brightness = 0.2
random_contrast = [0.8, 1.2]
augment_order = ["random_resized_crop", "random_brightness", "random_contrast"]
"#,
        )
        .unwrap();
        let augment = cfg.image_augment.as_ref().unwrap();
        assert_eq!(augment.augment_order.len(), 3);
        assert_eq!(augment.random_saturation, None);
        cfg.validate().unwrap();

        let mut broken = cfg.clone();
        if let Some(augment) = broken.image_augment.as_mut() {
            augment.augment_order.push(crate::augment::AugmentOp::RandomHue);
        }
        assert!(broken.validate().is_err());
    }

    #[test]
    fn negative_weights_fail_validation() {
        let cfg: DataConfig = toml::from_str(
            r#"
data_dir = "/data"
mix = [["synthetic", -1.0]]
action_dim = 7
"#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }
}
