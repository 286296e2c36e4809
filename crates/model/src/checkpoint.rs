//! Parameter checkpoints: safetensors weights plus a JSON sidecar.

use crate::config::ModelConfig;
use crate::param::Parameterized;
use crate::policy::PolicyModel;
use crate::tokenizers::InputSpec;
use anyhow::{bail, Context, Result};
use safetensors::tensor::{Dtype, View};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const PARAMS_FILE: &str = "params.safetensors";
pub const META_FILE: &str = "config.json";

/// Everything besides the weights needed to rebuild a [`PolicyModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub step: usize,
    pub config: ModelConfig,
    pub spec: InputSpec,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// Model parameters left at their current values (absent or differently shaped in the file).
    pub skipped: Vec<String>,
    /// Tensors in the file that no parameter claimed.
    pub unused: Vec<String>,
}

/// Little-endian f32 tensor ready for serialization.
#[derive(Debug, Clone)]
struct TensorBuffer {
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

impl View for &TensorBuffer {
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

fn collect_tensors(model: &mut impl Parameterized) -> BTreeMap<String, TensorBuffer> {
    let mut tensors = BTreeMap::new();
    model.visit_params("", &mut |name, param| {
        let bytes = param.value.iter().flat_map(|v| v.to_le_bytes()).collect();
        tensors.insert(
            name.to_string(),
            TensorBuffer {
                shape: param.value.shape().to_vec(),
                bytes,
            },
        );
    });
    tensors
}

/// Writes every named parameter of `model` to a safetensors file.
pub fn save_params(path: impl AsRef<Path>, model: &mut impl Parameterized) -> Result<()> {
    let path = path.as_ref();
    let tensors = collect_tensors(model);
    let metadata: HashMap<String, String> =
        HashMap::from([("format".to_string(), "policyforge".to_string())]);
    safetensors::serialize_to_file(
        tensors.iter().map(|(name, buffer)| (name.as_str(), buffer)),
        &Some(metadata),
        path,
    )
    .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn read_f32(view: &safetensors::tensor::TensorView<'_>, name: &str) -> Result<Vec<f32>> {
    if view.dtype() != Dtype::F32 {
        bail!("tensor '{}' has dtype {:?}, expected F32", name, view.dtype());
    }
    Ok(view
        .data()
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Copies tensors from `path` into parameters with the same name and shape.
///
/// With `strict`, any parameter that cannot be filled is an error; otherwise
/// those names are reported in [`LoadReport::skipped`].
pub fn load_params(path: impl AsRef<Path>, model: &mut impl Parameterized, strict: bool) -> Result<LoadReport> {
    let path = path.as_ref();
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let tensors = SafeTensors::deserialize(&data).context("failed to parse safetensors")?;

    let mut decoded = BTreeMap::new();
    for name in tensors.names() {
        let view = tensors
            .tensor(name)
            .with_context(|| format!("tensor '{}' not found", name))?;
        decoded.insert(name.clone(), (view.shape().to_vec(), read_f32(&view, name)?));
    }

    let mut report = LoadReport::default();
    let mut claimed = BTreeSet::new();
    model.visit_params("", &mut |name, mut param| match decoded.get(name) {
        Some((shape, values)) if shape.as_slice() == param.value.shape() => {
            for (dst, src) in param.value.iter_mut().zip(values) {
                *dst = *src;
            }
            claimed.insert(name.to_string());
            report.loaded.push(name.to_string());
        }
        Some((shape, _)) => {
            warn!(
                param = name,
                file_shape = ?shape,
                model_shape = ?param.value.shape(),
                "checkpoint tensor shape differs, keeping initialization"
            );
            claimed.insert(name.to_string());
            report.skipped.push(name.to_string());
        }
        None => report.skipped.push(name.to_string()),
    });
    report.unused = decoded
        .keys()
        .filter(|name| !claimed.contains(*name))
        .cloned()
        .collect();

    if strict && !report.skipped.is_empty() {
        bail!(
            "{} parameters could not be restored from {}: {:?}",
            report.skipped.len(),
            path.display(),
            report.skipped
        );
    }
    info!(
        path = %path.display(),
        loaded = report.loaded.len(),
        skipped = report.skipped.len(),
        unused = report.unused.len(),
        "loaded parameters"
    );
    Ok(report)
}

/// Writes `params.safetensors` and `config.json` into `dir`, creating it if needed.
pub fn save_checkpoint(dir: impl AsRef<Path>, model: &mut PolicyModel, step: usize) -> Result<PathBuf> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    save_params(dir.join(PARAMS_FILE), model)?;
    let meta = CheckpointMeta {
        step,
        config: model.config.clone(),
        spec: model.spec.clone(),
    };
    let json = serde_json::to_string_pretty(&meta)?;
    fs::write(dir.join(META_FILE), json)
        .with_context(|| format!("failed to write {}", dir.join(META_FILE).display()))?;
    info!(dir = %dir.display(), step, "saved checkpoint");
    Ok(dir.to_path_buf())
}

pub fn load_meta(dir: impl AsRef<Path>) -> Result<CheckpointMeta> {
    let path = dir.as_ref().join(META_FILE);
    let text = fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

/// Rebuilds the model described by the sidecar and strictly restores its weights.
pub fn load_checkpoint(dir: impl AsRef<Path>, rng: &mut fastrand::Rng) -> Result<(PolicyModel, CheckpointMeta)> {
    let dir = dir.as_ref();
    let meta = load_meta(dir)?;
    let mut model = PolicyModel::new(meta.config.clone(), meta.spec.clone(), rng)?;
    load_params(dir.join(PARAMS_FILE), &mut model, true)?;
    Ok((model, meta))
}
