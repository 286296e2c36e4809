//! Named dataset mixtures and the per-dataset load arguments derived from them.

use crate::registry::{ActionEncoding, DatasetRegistry};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub type DataMix = &'static [(&'static str, f64)];

pub const RT_X_MIX: DataMix = &[
    ("fractal20220817_data", 1.0),
    ("kuka", 0.1),
    ("bridge_dataset", 1.0),
    ("taco_play", 2.0),
    ("jaco_play", 4.0),
    ("berkeley_cable_routing", 2.0),
    ("roboturk", 2.0),
    ("nyu_door_opening_surprising_effectiveness", 10.0),
    ("viola", 10.0),
    ("berkeley_autolab_ur5", 4.0),
    ("toto", 4.0),
];

pub const OXE_FRANKA_MIX: DataMix = &[
    ("taco_play", 1.0),
    ("berkeley_cable_routing", 1.0),
    ("viola", 1.0),
    ("toto", 1.0),
    ("stanford_hydra_dataset_converted_externally_to_rlds", 5.0),
    ("austin_buds_dataset_converted_externally_to_rlds", 5.0),
    ("nyu_franka_play_dataset_converted_externally_to_rlds", 10.0),
    ("maniskill_dataset_converted_externally_to_rlds", 0.2),
    ("furniture_bench_dataset_converted_externally_to_rlds", 1.0),
    ("cmu_franka_exploration_dataset_converted_externally_to_rlds", 5.0),
    ("austin_sailor_dataset_converted_externally_to_rlds", 5.0),
    ("austin_sirius_dataset_converted_externally_to_rlds", 5.0),
    ("berkeley_rpt_converted_externally_to_rlds", 1.0),
    ("kaist_nonprehensile_converted_externally_to_rlds", 2.0),
    ("stanford_robocook_converted_externally_to_rlds", 1.0),
    ("iamlab_cmu_pickup_insert_converted_externally_to_rlds", 1.0),
    ("utaustin_mutex", 2.0),
    ("cmu_play_fusion", 4.0),
];

pub const OXE_FULL_MIX: DataMix = &[
    ("fractal20220817_data", 1.0),
    ("kuka", 1.0),
    ("bridge_dataset", 1.0),
    ("taco_play", 1.0),
    ("jaco_play", 1.0),
    ("berkeley_cable_routing", 1.0),
    ("roboturk", 1.0),
    ("nyu_door_opening_surprising_effectiveness", 1.0),
    ("viola", 1.0),
    ("berkeley_autolab_ur5", 1.0),
    ("toto", 1.0),
    ("language_table", 1.0),
    ("columbia_cairlab_pusht_real", 1.0),
    ("stanford_kuka_multimodal_dataset_converted_externally_to_rlds", 1.0),
    ("nyu_rot_dataset_converted_externally_to_rlds", 1.0),
    ("stanford_hydra_dataset_converted_externally_to_rlds", 1.0),
    ("austin_buds_dataset_converted_externally_to_rlds", 1.0),
    ("nyu_franka_play_dataset_converted_externally_to_rlds", 1.0),
    ("maniskill_dataset_converted_externally_to_rlds", 1.0),
    ("furniture_bench_dataset_converted_externally_to_rlds", 1.0),
    ("cmu_franka_exploration_dataset_converted_externally_to_rlds", 1.0),
    ("ucsd_kitchen_dataset_converted_externally_to_rlds", 1.0),
    ("ucsd_pick_and_place_dataset_converted_externally_to_rlds", 1.0),
    ("austin_sailor_dataset_converted_externally_to_rlds", 1.0),
    ("austin_sirius_dataset_converted_externally_to_rlds", 1.0),
    ("bc_z", 1.0),
    ("utokyo_pr2_opening_fridge_converted_externally_to_rlds", 1.0),
    ("utokyo_pr2_tabletop_manipulation_converted_externally_to_rlds", 1.0),
    ("utokyo_xarm_pick_and_place_converted_externally_to_rlds", 1.0),
    ("utokyo_xarm_bimanual_converted_externally_to_rlds", 1.0),
    ("robo_net", 1.0),
    ("berkeley_mvp_converted_externally_to_rlds", 1.0),
    ("berkeley_rpt_converted_externally_to_rlds", 1.0),
    ("kaist_nonprehensile_converted_externally_to_rlds", 1.0),
    ("stanford_mask_vit_converted_externally_to_rlds", 1.0),
    ("tokyo_u_lsmo_converted_externally_to_rlds", 1.0),
    ("dlr_sara_pour_converted_externally_to_rlds", 1.0),
    ("dlr_sara_grid_clamp_converted_externally_to_rlds", 1.0),
    ("dlr_edan_shared_control_converted_externally_to_rlds", 1.0),
    ("asu_table_top_converted_externally_to_rlds", 1.0),
    ("stanford_robocook_converted_externally_to_rlds", 1.0),
    ("imperialcollege_sawyer_wrist_cam", 1.0),
    ("iamlab_cmu_pickup_insert_converted_externally_to_rlds", 1.0),
    ("uiuc_d3field", 1.0),
    ("utaustin_mutex", 1.0),
    ("berkeley_fanuc_manipulation", 1.0),
    ("cmu_playing_with_food", 1.0),
    ("cmu_play_fusion", 1.0),
    ("cmu_stretch", 1.0),
    ("berkeley_gnm_recon", 1.0),
    ("berkeley_gnm_cory_hall", 1.0),
    ("berkeley_gnm_sac_son", 1.0),
];

/// Built-in mixture by name: `rt_x`, `oxe_franka` or `oxe_full`.
pub fn named_mix(name: &str) -> Result<Vec<(String, f64)>> {
    let mix = match name {
        "rt_x" => RT_X_MIX,
        "oxe_franka" => OXE_FRANKA_MIX,
        "oxe_full" => OXE_FULL_MIX,
        other => bail!("unknown data mixture '{other}' (expected rt_x, oxe_franka or oxe_full)"),
    };
    Ok(mix.iter().map(|(n, w)| (n.to_string(), *w)).collect())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixOptions {
    /// Keep only the first occurrence of each dataset name.
    pub deduplicate: bool,
    pub n_third_person_cameras: usize,
    pub n_wrist_cameras: usize,
    pub load_depth: bool,
    pub load_proprio: bool,
}

impl Default for MixOptions {
    fn default() -> Self {
        Self {
            deduplicate: true,
            n_third_person_cameras: 1,
            n_wrist_cameras: 0,
            load_depth: true,
            load_proprio: true,
        }
    }
}

/// Everything needed to load one dataset of a mixture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetKwargs {
    pub name: String,
    pub data_dir: PathBuf,
    pub image_obs_keys: Vec<Option<String>>,
    pub depth_obs_keys: Vec<Option<String>>,
    pub state_obs_keys: Vec<Option<String>>,
    pub action_encoding: ActionEncoding,
}

fn select_cameras(keys: &[Option<String>], n_third_person: usize, n_wrist: usize) -> Vec<Option<String>> {
    let mut selected: Vec<Option<String>> = keys.iter().take(n_third_person).cloned().collect();
    if n_wrist > 0 {
        let start = keys.len().saturating_sub(n_wrist);
        selected.extend(keys[start..].iter().cloned());
    }
    selected
}

/// Resolves a mixture against the registry and returns per-dataset load arguments
/// with their sampling weights.
///
/// Only `eef_pos` action encodings are kept; other datasets are skipped with a warning.
pub fn make_dataset_kwargs_and_weights(
    mix: &[(String, f64)],
    registry: &DatasetRegistry,
    data_dir: &Path,
    options: &MixOptions,
) -> Result<(Vec<DatasetKwargs>, Vec<f64>)> {
    let mut entries: Vec<(String, f64)> = Vec::with_capacity(mix.len());
    if options.deduplicate {
        let mut seen = BTreeSet::new();
        for (name, weight) in mix {
            if seen.insert(name.as_str()) {
                entries.push((name.clone(), *weight));
            } else {
                warn!(dataset = %name, weight, "skipping duplicate dataset");
            }
        }
    } else {
        entries.extend(mix.iter().cloned());
    }

    let mut kwargs = Vec::with_capacity(entries.len());
    let mut weights = Vec::with_capacity(entries.len());
    for (name, weight) in entries {
        let config = registry
            .get(&name)
            .with_context(|| format!("dataset '{name}' is not in the registry"))?;
        if config.action_encoding != ActionEncoding::EefPos {
            warn!(
                dataset = %name,
                encoding = ?config.action_encoding,
                "skipping dataset: only eef_pos action encoding is supported"
            );
            continue;
        }
        let image_obs_keys = select_cameras(
            &config.image_obs_keys,
            options.n_third_person_cameras,
            options.n_wrist_cameras,
        );
        let depth_obs_keys = if options.load_depth {
            select_cameras(
                &config.depth_obs_keys,
                options.n_third_person_cameras,
                options.n_wrist_cameras,
            )
        } else {
            Vec::new()
        };
        let state_obs_keys = if options.load_proprio {
            config.state_obs_keys.clone()
        } else {
            Vec::new()
        };
        kwargs.push(DatasetKwargs {
            name,
            data_dir: data_dir.to_path_buf(),
            image_obs_keys,
            depth_obs_keys,
            state_obs_keys,
            action_encoding: config.action_encoding,
        });
        weights.push(weight);
    }
    Ok((kwargs, weights))
}

const TABLE_WIDTH: usize = 86;

/// Fixed-width table of dataset names and sampling weights.
pub fn format_data_mixture(kwargs: &[DatasetKwargs], weights: &[f64]) -> String {
    let border = "#".repeat(TABLE_WIDTH);
    let mut out = String::new();
    let _ = writeln!(out, "{border}");
    let title = format!("# Loading the following {} datasets (incl. sampling weight):", kwargs.len());
    let _ = writeln!(out, "{title:<width$}#", width = TABLE_WIDTH - 1);
    for (kw, weight) in kwargs.iter().zip(weights) {
        let pad = 80usize.saturating_sub(kw.name.len());
        let _ = writeln!(out, "# {}: {:=>pad$.6} #", kw.name, weight, pad = pad);
    }
    let _ = write!(out, "{border}");
    out
}

/// Logs the mixture table at info level.
pub fn log_data_mixture(kwargs: &[DatasetKwargs], weights: &[f64]) {
    for line in format_data_mixture(kwargs, weights).lines() {
        info!("{line}");
    }
}
