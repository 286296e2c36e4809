//! Transformer over named token groups with group-level attention rules.
//!
//! Prefix groups (task tokens) sit before every timestep. Timestep groups
//! carry `(batch, horizon, tokens, dim)` and are interleaved per timestep.
//! A token attends another token when its group is allowed to and the other
//! token is not later in time.

use crate::config::TransformerConfig;
use crate::param::{ParamMut, Parameterized};
use crate::transformer::{Transformer, TransformerCache};
use anyhow::{bail, ensure, Result};
use ndarray::{concatenate, s, Array2, Array3, Array4, ArrayView2, ArrayView3, Axis};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PrefixGroup {
    pub name: String,
    /// `(batch, tokens, dim)`
    pub tokens: Array3<f32>,
    pub attends_to: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TimestepGroup {
    pub name: String,
    /// `(batch, horizon, tokens, dim)`
    pub tokens: Array4<f32>,
    pub attends_to: Vec<String>,
}

impl PrefixGroup {
    pub fn new(name: impl Into<String>, tokens: Array3<f32>, attends_to: &[&str]) -> Self {
        Self {
            name: name.into(),
            tokens,
            attends_to: attends_to.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl TimestepGroup {
    pub fn new(name: impl Into<String>, tokens: Array4<f32>, attends_to: &[&str]) -> Self {
        Self {
            name: name.into(),
            tokens,
            attends_to: attends_to.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Prefix tokens order before every timestep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TokenPosition {
    Prefix,
    Timestep(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenMetadata {
    pub group_name: String,
    pub position: TokenPosition,
    pub attends_to: Vec<String>,
}

impl TokenMetadata {
    pub fn should_attend_to(&self, other: &TokenMetadata) -> bool {
        let group_allowed = self.group_name == other.group_name
            || self
                .attends_to
                .iter()
                .any(|pattern| group_matches(pattern, &other.group_name));
        group_allowed && other.position <= self.position
    }
}

/// `obs_*` matches every group starting with `obs_`; anything else is an exact name.
pub fn group_matches(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

#[derive(Debug, Clone)]
struct GroupLayout {
    name: String,
    num_tokens: usize,
    attends_to: Vec<String>,
}

/// Shapes needed to split the transformer output back into groups.
#[derive(Debug, Clone)]
pub struct SequenceLayout {
    batch: usize,
    horizon: usize,
    dim: usize,
    prefix: Vec<GroupLayout>,
    timestep: Vec<GroupLayout>,
}

impl SequenceLayout {
    fn new(prefix: &[PrefixGroup], timestep: &[TimestepGroup]) -> Result<Self> {
        let Some(first) = timestep.first() else {
            bail!("block transformer needs at least one timestep group");
        };
        let (batch, horizon, _, dim) = first.tokens.dim();
        for group in timestep {
            let (b, t, _, d) = group.tokens.dim();
            ensure!(
                b == batch && d == dim,
                "timestep group '{}' has shape {:?}, expected batch {} and width {}",
                group.name,
                group.tokens.shape(),
                batch,
                dim
            );
            ensure!(
                t == horizon,
                "timestep group '{}' has horizon {}, expected {}",
                group.name,
                t,
                horizon
            );
        }
        for group in prefix {
            let (b, _, d) = group.tokens.dim();
            ensure!(
                b == batch && d == dim,
                "prefix group '{}' has shape {:?}, expected batch {} and width {}",
                group.name,
                group.tokens.shape(),
                batch,
                dim
            );
        }

        Ok(Self {
            batch,
            horizon,
            dim,
            prefix: prefix
                .iter()
                .map(|g| GroupLayout {
                    name: g.name.clone(),
                    num_tokens: g.tokens.dim().1,
                    attends_to: g.attends_to.clone(),
                })
                .collect(),
            timestep: timestep
                .iter()
                .map(|g| GroupLayout {
                    name: g.name.clone(),
                    num_tokens: g.tokens.dim().2,
                    attends_to: g.attends_to.clone(),
                })
                .collect(),
        })
    }

    fn prefix_len(&self) -> usize {
        self.prefix.iter().map(|g| g.num_tokens).sum()
    }

    fn tokens_per_step(&self) -> usize {
        self.timestep.iter().map(|g| g.num_tokens).sum()
    }

    fn seq_len(&self) -> usize {
        self.prefix_len() + self.horizon * self.tokens_per_step()
    }

    fn metadata(&self) -> Vec<TokenMetadata> {
        let mut tokens = Vec::with_capacity(self.seq_len());
        for group in &self.prefix {
            for _ in 0..group.num_tokens {
                tokens.push(TokenMetadata {
                    group_name: group.name.clone(),
                    position: TokenPosition::Prefix,
                    attends_to: group.attends_to.clone(),
                });
            }
        }
        for t in 0..self.horizon {
            for group in &self.timestep {
                for _ in 0..group.num_tokens {
                    tokens.push(TokenMetadata {
                        group_name: group.name.clone(),
                        position: TokenPosition::Timestep(t),
                        attends_to: group.attends_to.clone(),
                    });
                }
            }
        }
        tokens
    }

    fn describe(&self) -> String {
        let prefix: Vec<String> = self
            .prefix
            .iter()
            .map(|g| format!("{}[{}]", g.name, g.num_tokens))
            .collect();
        let timestep: Vec<String> = self
            .timestep
            .iter()
            .map(|g| format!("{}[{}]", g.name, g.num_tokens))
            .collect();
        format!(
            "prefix: {} | per timestep (x{}): {}",
            prefix.join(", "),
            self.horizon,
            timestep.join(", ")
        )
    }

    /// Concatenates per-group arrays in layout order into `(batch, seq_len, dim)`.
    fn assemble(&self, prefix: &[ArrayView3<'_, f32>], timestep: &[ndarray::ArrayView4<'_, f32>]) -> Result<Array3<f32>> {
        let prefix_tokens = if prefix.is_empty() {
            Array3::zeros((self.batch, 0, self.dim))
        } else {
            concatenate(Axis(1), prefix)?
        };
        let per_step = concatenate(Axis(2), timestep)?;
        let folded = per_step
            .to_shape((self.batch, self.horizon * self.tokens_per_step(), self.dim))?
            .into_owned();
        Ok(concatenate(Axis(1), &[prefix_tokens.view(), folded.view()])?)
    }

    fn split(&self, sequence: ArrayView3<'_, f32>) -> Result<(Vec<Array3<f32>>, Vec<Array4<f32>>)> {
        let prefix_len = self.prefix_len();
        let mut prefix = Vec::with_capacity(self.prefix.len());
        let mut offset = 0;
        for group in &self.prefix {
            prefix.push(
                sequence
                    .slice(s![.., offset..offset + group.num_tokens, ..])
                    .to_owned(),
            );
            offset += group.num_tokens;
        }

        let per_step = self.tokens_per_step();
        let steps = sequence.slice(s![.., prefix_len.., ..]);
        let steps = steps.to_shape((self.batch, self.horizon, per_step, self.dim))?;
        let mut timestep = Vec::with_capacity(self.timestep.len());
        let mut offset = 0;
        for group in &self.timestep {
            timestep.push(
                steps
                    .slice(s![.., .., offset..offset + group.num_tokens, ..])
                    .to_owned(),
            );
            offset += group.num_tokens;
        }
        Ok((prefix, timestep))
    }
}

/// Concatenates prefix groups and the horizon-folded timestep groups into `(batch, seq_len, dim)`.
pub fn assemble_input_tokens(prefix: &[PrefixGroup], timestep: &[TimestepGroup]) -> Result<Array3<f32>> {
    let layout = SequenceLayout::new(prefix, timestep)?;
    let prefix_views: Vec<_> = prefix.iter().map(|g| g.tokens.view()).collect();
    let timestep_views: Vec<_> = timestep.iter().map(|g| g.tokens.view()).collect();
    layout.assemble(&prefix_views, &timestep_views)
}

/// Builds the `(batch, seq_len, seq_len)` attention mask; `pad_mask` is `(batch, horizon)`.
pub fn generate_attention_mask(
    prefix: &[PrefixGroup],
    timestep: &[TimestepGroup],
    pad_mask: ArrayView2<'_, bool>,
) -> Result<Array3<bool>> {
    let layout = SequenceLayout::new(prefix, timestep)?;
    attention_mask_for(&layout, pad_mask)
}

fn attention_mask_for(layout: &SequenceLayout, pad_mask: ArrayView2<'_, bool>) -> Result<Array3<bool>> {
    ensure!(
        pad_mask.dim() == (layout.batch, layout.horizon),
        "pad mask {:?} does not match batch {} and horizon {}",
        pad_mask.dim(),
        layout.batch,
        layout.horizon
    );
    let metadata = layout.metadata();
    let n = metadata.len();
    let rules = Array2::from_shape_fn((n, n), |(i, j)| metadata[i].should_attend_to(&metadata[j]));
    Ok(Array3::from_shape_fn((layout.batch, n, n), |(b, i, j)| {
        let column_present = match metadata[j].position {
            TokenPosition::Prefix => true,
            TokenPosition::Timestep(t) => pad_mask[[b, t]],
        };
        rules[[i, j]] && column_present
    }))
}

#[derive(Debug, Clone)]
pub struct BlockTransformerCache {
    layout: SequenceLayout,
    transformer: TransformerCache,
}

/// Output groups keep the names and `attends_to` of the inputs.
#[derive(Debug, Clone)]
pub struct BlockOutputs {
    pub prefix: Vec<PrefixGroup>,
    pub timestep: Vec<TimestepGroup>,
}

impl BlockOutputs {
    pub fn timestep_group(&self, name: &str) -> Option<&TimestepGroup> {
        self.timestep.iter().find(|g| g.name == name)
    }

    pub fn prefix_group(&self, name: &str) -> Option<&PrefixGroup> {
        self.prefix.iter().find(|g| g.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct BlockTransformer {
    pub transformer: Transformer,
}

impl BlockTransformer {
    pub fn new(dim: usize, config: &TransformerConfig, rng: &mut fastrand::Rng) -> Result<Self> {
        Ok(Self {
            transformer: Transformer::new(dim, config, rng)?,
        })
    }

    pub fn forward(
        &self,
        prefix: &[PrefixGroup],
        timestep: &[TimestepGroup],
        pad_mask: ArrayView2<'_, bool>,
        train: bool,
        rng: &mut fastrand::Rng,
    ) -> Result<(BlockOutputs, BlockTransformerCache)> {
        let layout = SequenceLayout::new(prefix, timestep)?;
        debug!(
            seq_len = layout.seq_len(),
            layout = %layout.describe(),
            "block transformer groups"
        );

        let tokens = assemble_input_tokens(prefix, timestep)?;
        let mask = attention_mask_for(&layout, pad_mask)?;
        let (output, transformer_cache) = self.transformer.forward(tokens.view(), mask.view(), train, rng)?;
        let (prefix_out, timestep_out) = layout.split(output.view())?;

        let outputs = BlockOutputs {
            prefix: prefix_out
                .into_iter()
                .zip(&layout.prefix)
                .map(|(tokens, g)| PrefixGroup {
                    name: g.name.clone(),
                    tokens,
                    attends_to: g.attends_to.clone(),
                })
                .collect(),
            timestep: timestep_out
                .into_iter()
                .zip(&layout.timestep)
                .map(|(tokens, g)| TimestepGroup {
                    name: g.name.clone(),
                    tokens,
                    attends_to: g.attends_to.clone(),
                })
                .collect(),
        };
        Ok((
            outputs,
            BlockTransformerCache {
                layout,
                transformer: transformer_cache,
            },
        ))
    }

    /// Gradients are given per output group in forward order; returns input gradients in the same order.
    pub fn backward(
        &mut self,
        cache: &BlockTransformerCache,
        prefix_grads: &[Array3<f32>],
        timestep_grads: &[Array4<f32>],
    ) -> Result<(Vec<Array3<f32>>, Vec<Array4<f32>>)> {
        let layout = &cache.layout;
        ensure!(
            prefix_grads.len() == layout.prefix.len() && timestep_grads.len() == layout.timestep.len(),
            "expected {} prefix and {} timestep gradients, got {} and {}",
            layout.prefix.len(),
            layout.timestep.len(),
            prefix_grads.len(),
            timestep_grads.len()
        );
        for (grad, group) in prefix_grads.iter().zip(&layout.prefix) {
            ensure!(
                grad.dim() == (layout.batch, group.num_tokens, layout.dim),
                "gradient for prefix group '{}' has shape {:?}",
                group.name,
                grad.shape()
            );
        }
        for (grad, group) in timestep_grads.iter().zip(&layout.timestep) {
            ensure!(
                grad.dim() == (layout.batch, layout.horizon, group.num_tokens, layout.dim),
                "gradient for timestep group '{}' has shape {:?}",
                group.name,
                grad.shape()
            );
        }

        let prefix_views: Vec<_> = prefix_grads.iter().map(|g| g.view()).collect();
        let timestep_views: Vec<_> = timestep_grads.iter().map(|g| g.view()).collect();
        let grad_output = layout.assemble(&prefix_views, &timestep_views)?;
        let grad_input = self.transformer.backward(&cache.transformer, grad_output.view())?;
        layout.split(grad_input.view())
    }
}

impl Parameterized for BlockTransformer {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, ParamMut<'_>)) {
        self.transformer.visit_params(prefix, visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActivationKind;
    use approx::assert_abs_diff_eq;
    use ndarray::Array;

    fn tokens3(b: usize, n: usize, d: usize, seed: f32) -> Array3<f32> {
        Array::from_shape_fn((b, n, d), |(i, j, k)| ((i * 31 + j * 7 + k) as f32 * 0.17 + seed).sin())
    }

    fn tokens4(b: usize, t: usize, n: usize, d: usize, seed: f32) -> Array4<f32> {
        Array::from_shape_fn((b, t, n, d), |(i, j, k, l)| {
            ((i * 53 + j * 13 + k * 5 + l) as f32 * 0.11 + seed).cos()
        })
    }

    fn groups(b: usize, t: usize, d: usize) -> (Vec<PrefixGroup>, Vec<TimestepGroup>) {
        let prefix = vec![PrefixGroup::new("task_language", tokens3(b, 2, d, 0.0), &["task_*"])];
        let timestep = vec![
            TimestepGroup::new("obs_image", tokens4(b, t, 2, d, 1.0), &["task_*", "obs_*"]),
            TimestepGroup::new("readout_action", tokens4(b, t, 1, d, 2.0), &["task_*", "obs_*"]),
        ];
        (prefix, timestep)
    }

    fn config() -> TransformerConfig {
        TransformerConfig {
            num_layers: 2,
            mlp_dim: 16,
            num_attention_heads: 2,
            dropout_rate: 0.0,
            attention_dropout_rate: 0.0,
            activation: ActivationKind::Gelu,
        }
    }

    #[test]
    fn wildcard_patterns_match_prefixes() {
        assert!(group_matches("obs_*", "obs_image"));
        assert!(!group_matches("obs_*", "readout_action"));
        assert!(group_matches("task_language", "task_language"));
        assert!(!group_matches("task_language", "task_language_2"));
    }

    #[test]
    fn assembly_places_prefix_first_and_interleaves_timesteps() {
        let (prefix, timestep) = groups(1, 2, 4);
        let tokens = assemble_input_tokens(&prefix, &timestep).unwrap();
        assert_eq!(tokens.dim(), (1, 2 + 2 * 3, 4));
        assert_eq!(tokens.slice(s![0, 1, ..]), prefix[0].tokens.slice(s![0, 1, ..]));
        // second timestep starts with the image tokens
        assert_eq!(tokens.slice(s![0, 5, ..]), timestep[0].tokens.slice(s![0, 1, 0, ..]));
        assert_eq!(tokens.slice(s![0, 7, ..]), timestep[1].tokens.slice(s![0, 1, 0, ..]));
    }

    #[test]
    fn empty_prefix_assembles_timesteps_only() {
        let (_, timestep) = groups(2, 3, 4);
        let tokens = assemble_input_tokens(&[], &timestep).unwrap();
        assert_eq!(tokens.dim(), (2, 9, 4));
    }

    #[test]
    fn mismatched_horizons_are_rejected() {
        let (prefix, mut timestep) = groups(1, 2, 4);
        timestep[1].tokens = tokens4(1, 3, 1, 4, 0.0);
        assert!(assemble_input_tokens(&prefix, &timestep).is_err());
    }

    #[test]
    fn attention_mask_follows_group_rules() {
        let (prefix, timestep) = groups(1, 2, 4);
        let pad = Array2::from_elem((1, 2), true);
        let mask = generate_attention_mask(&prefix, &timestep, pad.view()).unwrap();
        // layout: [task0, task1, img0_t0, img1_t0, ro_t0, img0_t1, img1_t1, ro_t1]
        let m = mask.index_axis(Axis(0), 0);

        // task tokens only see task tokens
        assert!(m[[0, 1]]);
        assert!((2..8).all(|j| !m[[0, j]] && !m[[1, j]]));
        // observations see the task, themselves and earlier observations
        assert!(m[[2, 0]] && m[[2, 3]] && m[[5, 2]]);
        // causal across timesteps
        assert!(!m[[2, 5]]);
        // nobody but the readout group reads the readout
        assert!(!m[[2, 4]] && !m[[5, 4]] && !m[[6, 7]]);
        // readouts see observations of their own and earlier timesteps
        assert!(m[[4, 2]] && m[[7, 2]] && m[[7, 6]] && m[[7, 4]]);
        assert!(!m[[4, 5]]);
    }

    #[test]
    fn padded_timesteps_are_hidden_from_every_row() {
        let (prefix, timestep) = groups(2, 2, 4);
        let pad = ndarray::array![[false, true], [true, true]];
        let mask = generate_attention_mask(&prefix, &timestep, pad.view()).unwrap();
        for i in 0..8 {
            for j in 2..5 {
                assert!(!mask[[0, i, j]]);
            }
        }
        assert!(mask[[1, 7, 2]]);
        assert!(mask[[0, 7, 5]]);
    }

    #[test]
    fn unattended_group_does_not_change_other_outputs() {
        let mut rng = fastrand::Rng::with_seed(9);
        let model = BlockTransformer::new(8, &config(), &mut rng).unwrap();
        let (prefix, timestep) = groups(2, 3, 8);
        let pad = ndarray::array![[true, true, true], [false, true, true]];
        let (base, _) = model.forward(&prefix, &timestep, pad.view(), false, &mut rng).unwrap();

        let mut extended = timestep.clone();
        extended.push(TimestepGroup::new(
            "readout_extra",
            tokens4(2, 3, 2, 8, 5.0),
            &["task_*", "obs_*", "readout_*"],
        ));
        let (more, _) = model.forward(&prefix, &extended, pad.view(), false, &mut rng).unwrap();

        assert_eq!(more.timestep.len(), 3);
        assert_eq!(more.timestep[2].name, "readout_extra");
        for (a, b) in base.timestep.iter().zip(&more.timestep) {
            assert_eq!(a.name, b.name);
            for (x, y) in a.tokens.iter().zip(b.tokens.iter()) {
                assert_abs_diff_eq!(x, y, epsilon = 1e-5);
            }
        }
        for (x, y) in base.prefix[0].tokens.iter().zip(more.prefix[0].tokens.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-5);
        }
    }

    #[test]
    fn backward_returns_gradients_per_group() {
        let mut rng = fastrand::Rng::with_seed(10);
        let mut model = BlockTransformer::new(8, &config(), &mut rng).unwrap();
        let (prefix, timestep) = groups(1, 2, 8);
        let pad = Array2::from_elem((1, 2), true);
        let (out, cache) = model.forward(&prefix, &timestep, pad.view(), false, &mut rng).unwrap();

        let prefix_grads: Vec<_> = out.prefix.iter().map(|g| Array3::zeros(g.tokens.raw_dim())).collect();
        let timestep_grads: Vec<_> = out
            .timestep
            .iter()
            .map(|g| {
                if g.name.starts_with("readout_") {
                    Array4::ones(g.tokens.raw_dim())
                } else {
                    Array4::zeros(g.tokens.raw_dim())
                }
            })
            .collect();
        let (gp, gt) = model.backward(&cache, &prefix_grads, &timestep_grads).unwrap();
        assert_eq!(gp[0].dim(), (1, 2, 8));
        assert_eq!(gt[0].dim(), (1, 2, 2, 8));
        assert_eq!(gt[1].dim(), (1, 2, 1, 8));
        // the readout reads the image tokens, so they receive gradient
        assert!(gt[0].iter().any(|g| g.abs() > 1e-6));
    }
}
