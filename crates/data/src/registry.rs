//! Per-dataset source key configuration, read from TOML.
//!
//! ```toml
//! [datasets.bridge_dataset]
//! image_obs_keys = ["image_0", "", "wrist"]
//! depth_obs_keys = ["", "", ""]
//! state_obs_keys = ["eef_state", "", "gripper_state"]
//! action_encoding = "eef_pos"
//! ```
//!
//! An empty key marks a camera or state slot the dataset does not record;
//! it is filled with zeros at load time.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionEncoding {
    /// End-effector position and rotation deltas plus gripper.
    EefPos,
    JointPos,
    /// End-effector position plus 6-D rotation representation.
    EefR6,
}

mod optional_keys {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(keys: &[Option<String>], serializer: S) -> Result<S::Ok, S::Error> {
        let flat: Vec<&str> = keys.iter().map(|k| k.as_deref().unwrap_or("")).collect();
        flat.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Option<String>>, D::Error> {
        let flat = Vec::<String>::deserialize(deserializer)?;
        Ok(flat
            .into_iter()
            .map(|k| if k.is_empty() { None } else { Some(k) })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    #[serde(with = "optional_keys")]
    pub image_obs_keys: Vec<Option<String>>,
    #[serde(default, with = "optional_keys")]
    pub depth_obs_keys: Vec<Option<String>>,
    #[serde(default, with = "optional_keys")]
    pub state_obs_keys: Vec<Option<String>>,
    pub action_encoding: ActionEncoding,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetRegistry {
    #[serde(default)]
    pub datasets: BTreeMap<String, DatasetConfig>,
}

impl DatasetRegistry {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse dataset registry")
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("in {}", path.display()))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn get(&self, name: &str) -> Option<&DatasetConfig> {
        self.datasets.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, config: DatasetConfig) {
        self.datasets.insert(name.into(), config);
    }
}
