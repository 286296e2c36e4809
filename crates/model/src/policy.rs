//! Transformer policy: modality tokenizers, block transformer and action heads.

use crate::block_transformer::{BlockOutputs, BlockTransformer, BlockTransformerCache, PrefixGroup, TimestepGroup};
use crate::config::ModelConfig;
use crate::heads::{ActionHead, HeadLossCache, HeadMetrics};
use crate::nn::Linear;
use crate::param::{scoped, uniform_limit_for_std, Param, ParamMut, Parameterized};
use crate::tokenizers::{InputSpec, Tokenizer, TokenizerCache, TokenizerInputs};
use anyhow::{ensure, Context, Result};
use ndarray::{s, Array2, Array3, Array4, ArrayD, Axis, Ix3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Model inputs for a batch of `horizon`-step windows.
#[derive(Debug, Clone)]
pub struct PolicyInputs {
    /// `(batch, horizon, ...)` per observation name.
    pub observations: BTreeMap<String, ArrayD<f32>>,
    /// `(batch, ...)` per task name.
    pub tasks: BTreeMap<String, ArrayD<f32>>,
    /// `(batch, tokens)` language token ids.
    pub language: Option<Array2<usize>>,
    /// `(batch, horizon)`, true for real timesteps.
    pub pad_mask: Array2<bool>,
}

impl PolicyInputs {
    pub fn batch_size(&self) -> usize {
        self.pad_mask.nrows()
    }

    pub fn horizon(&self) -> usize {
        self.pad_mask.ncols()
    }

    /// Element shapes of these inputs, used to size the tokenizers.
    pub fn input_spec(&self) -> Result<InputSpec> {
        let mut spec = InputSpec::default();
        for (name, obs) in &self.observations {
            ensure!(obs.ndim() >= 2, "observation '{}' lacks batch and time axes", name);
            spec.observations.insert(name.clone(), obs.shape()[2..].to_vec());
        }
        for (name, task) in &self.tasks {
            ensure!(task.ndim() >= 1, "task input '{}' lacks a batch axis", name);
            spec.tasks.insert(name.clone(), task.shape()[1..].to_vec());
        }
        spec.language_len = self.language.as_ref().map_or(0, |l| l.ncols());
        Ok(spec)
    }
}

/// Supervision for a batch.
#[derive(Debug, Clone)]
pub struct ActionTargets {
    /// `(batch, horizon, action_horizon, action_dim)`
    pub actions: Array4<f32>,
    /// `(batch, horizon, action_horizon)`, true for real future actions.
    pub action_pad_mask: Array3<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyMetrics {
    /// Sum of the head losses.
    pub loss: f32,
    pub heads: BTreeMap<String, HeadMetrics>,
}

/// Tokenizer plus the projection and position embedding that map its output into the transformer width.
#[derive(Debug, Clone)]
pub struct TokenizerBranch {
    pub name: String,
    pub tokenizer: Tokenizer,
    pub projection: Linear,
    /// `(steps, tokens, dim)`; one step for task branches, `max_horizon` for observations.
    pub position: Param<Ix3>,
}

#[derive(Debug, Clone)]
pub struct Readout {
    pub name: String,
    /// `(max_horizon, tokens, dim)`
    pub embedding: Param<Ix3>,
}

#[derive(Debug, Clone)]
pub struct HeadBranch {
    pub name: String,
    pub readout: String,
    pub head: ActionHead,
}

#[derive(Debug, Clone)]
struct BranchCache {
    tokenizer: TokenizerCache,
    tokens: Array4<f32>,
}

#[derive(Debug, Clone)]
pub struct PolicyCache {
    tasks: Vec<BranchCache>,
    observations: Vec<BranchCache>,
    block: BlockTransformerCache,
}

#[derive(Debug, Clone)]
pub struct PolicyModel {
    pub config: ModelConfig,
    pub spec: InputSpec,
    pub task_tokenizers: Vec<TokenizerBranch>,
    pub observation_tokenizers: Vec<TokenizerBranch>,
    pub readouts: Vec<Readout>,
    pub transformer: BlockTransformer,
    pub heads: Vec<HeadBranch>,
}

fn position_embedding(steps: usize, tokens: usize, dim: usize, rng: &mut fastrand::Rng) -> Param<Ix3> {
    Param::uniform((steps, tokens, dim), uniform_limit_for_std(0.02), rng)
}

impl TokenizerBranch {
    fn new(
        name: &str,
        tokenizer: Tokenizer,
        steps: usize,
        dim: usize,
        rng: &mut fastrand::Rng,
    ) -> Self {
        let projection = Linear::new(tokenizer.output_dim(), dim, true, rng);
        let position = position_embedding(steps, tokenizer.num_tokens(), dim, rng);
        Self {
            name: name.to_string(),
            tokenizer,
            projection,
            position,
        }
    }

    /// Tokenizes, projects and adds the first `inputs.horizon` position embeddings.
    fn forward(
        &self,
        inputs: &TokenizerInputs<'_>,
        train: bool,
        rng: &mut fastrand::Rng,
    ) -> Result<(Array4<f32>, BranchCache)> {
        let (raw, tokenizer) = self.tokenizer.forward(inputs, train, rng)?;
        let projected = self.projection.forward_nd(raw.view())?;
        let position = self
            .position
            .value
            .slice(s![..inputs.horizon, .., ..])
            .insert_axis(Axis(0));
        let tokens = projected + &position;
        Ok((tokens, BranchCache { tokenizer, tokens: raw }))
    }

    fn backward(&mut self, cache: &BranchCache, grad: Array4<f32>) -> Result<()> {
        let steps = grad.dim().1;
        let mut position_grad = self.position.grad.slice_mut(s![..steps, .., ..]);
        position_grad += &grad.sum_axis(Axis(0));
        let grad_raw = self.projection.backward_nd(cache.tokens.view(), grad.view())?;
        self.tokenizer.backward(&cache.tokenizer, grad_raw)
    }
}

impl PolicyModel {
    pub fn new(config: ModelConfig, spec: InputSpec, rng: &mut fastrand::Rng) -> Result<Self> {
        config.validate()?;
        let dim = config.token_embedding_size;

        let task_spec = spec.tasks_as_observations();
        let mut task_tokenizers = Vec::with_capacity(config.task_tokenizers.len());
        for (name, cfg) in &config.task_tokenizers {
            let tokenizer = Tokenizer::new(cfg, &task_spec, rng)
                .with_context(|| format!("building task tokenizer '{name}'"))?;
            task_tokenizers.push(TokenizerBranch::new(name, tokenizer, 1, dim, rng));
        }
        let mut observation_tokenizers = Vec::with_capacity(config.observation_tokenizers.len());
        for (name, cfg) in &config.observation_tokenizers {
            let tokenizer = Tokenizer::new(cfg, &spec, rng)
                .with_context(|| format!("building observation tokenizer '{name}'"))?;
            observation_tokenizers.push(TokenizerBranch::new(name, tokenizer, config.max_horizon, dim, rng));
        }
        let readouts = config
            .readouts
            .iter()
            .map(|(name, &tokens)| Readout {
                name: name.clone(),
                embedding: position_embedding(config.max_horizon, tokens, dim, rng),
            })
            .collect();
        let transformer = BlockTransformer::new(dim, &config.transformer, rng)?;
        let heads = config
            .heads
            .iter()
            .map(|(name, cfg)| {
                Ok(HeadBranch {
                    name: name.clone(),
                    readout: cfg.readout_key().to_string(),
                    head: ActionHead::new(cfg, dim, rng)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut model = Self {
            config,
            spec,
            task_tokenizers,
            observation_tokenizers,
            readouts,
            transformer,
            heads,
        };
        let parameters = model.num_params();
        info!(
            parameters,
            task_tokenizers = model.task_tokenizers.len(),
            observation_tokenizers = model.observation_tokenizers.len(),
            "policy model initialized"
        );
        Ok(model)
    }

    fn check_inputs(&self, inputs: &PolicyInputs) -> Result<(usize, usize)> {
        let (batch, horizon) = inputs.pad_mask.dim();
        ensure!(batch > 0, "empty batch");
        ensure!(
            horizon > 0 && horizon <= self.config.max_horizon,
            "window of {} steps is outside 1..={} (max_horizon)",
            horizon,
            self.config.max_horizon
        );
        Ok((batch, horizon))
    }

    /// Runs tokenizers and the transformer; outputs hold every token group.
    pub fn forward(
        &self,
        inputs: &PolicyInputs,
        train: bool,
        rng: &mut fastrand::Rng,
    ) -> Result<(BlockOutputs, PolicyCache)> {
        let (batch, horizon) = self.check_inputs(inputs)?;

        let expanded: BTreeMap<String, ArrayD<f32>> = inputs
            .tasks
            .iter()
            .map(|(k, v)| (k.clone(), v.clone().insert_axis(Axis(1))))
            .collect();
        let task_inputs = TokenizerInputs {
            observations: &expanded,
            tasks: &inputs.tasks,
            language: inputs.language.as_ref(),
            batch,
            horizon: 1,
        };
        let mut prefix = Vec::with_capacity(self.task_tokenizers.len());
        let mut task_caches = Vec::with_capacity(self.task_tokenizers.len());
        for branch in &self.task_tokenizers {
            let (tokens, cache) = branch.forward(&task_inputs, train, rng)?;
            let tokens = tokens.index_axis_move(Axis(1), 0);
            prefix.push(PrefixGroup::new(format!("task_{}", branch.name), tokens, &["task_*"]));
            task_caches.push(cache);
        }

        let obs_inputs = TokenizerInputs {
            observations: &inputs.observations,
            tasks: &inputs.tasks,
            language: inputs.language.as_ref(),
            batch,
            horizon,
        };
        let mut timestep = Vec::with_capacity(self.observation_tokenizers.len() + self.readouts.len());
        let mut obs_caches = Vec::with_capacity(self.observation_tokenizers.len());
        for branch in &self.observation_tokenizers {
            let (tokens, cache) = branch.forward(&obs_inputs, train, rng)?;
            timestep.push(TimestepGroup::new(
                format!("obs_{}", branch.name),
                tokens,
                &["task_*", "obs_*"],
            ));
            obs_caches.push(cache);
        }
        for readout in &self.readouts {
            let (_, n, dim) = readout.embedding.value.dim();
            let tokens = readout
                .embedding
                .value
                .slice(s![..horizon, .., ..])
                .insert_axis(Axis(0))
                .broadcast((batch, horizon, n, dim))
                .context("readout embedding does not broadcast over the batch")?
                .to_owned();
            timestep.push(TimestepGroup::new(
                format!("readout_{}", readout.name),
                tokens,
                &["task_*", "obs_*"],
            ));
        }

        let (outputs, block) = self
            .transformer
            .forward(&prefix, &timestep, inputs.pad_mask.view(), train, rng)?;
        Ok((
            outputs,
            PolicyCache {
                tasks: task_caches,
                observations: obs_caches,
                block,
            },
        ))
    }

    fn readout_tokens<'a>(&self, outputs: &'a BlockOutputs, readout: &str) -> Result<&'a TimestepGroup> {
        let group = format!("readout_{readout}");
        outputs
            .timestep_group(&group)
            .with_context(|| format!("transformer output has no group '{group}'"))
    }

    fn head_losses(
        &self,
        outputs: &BlockOutputs,
        inputs: &PolicyInputs,
        targets: &ActionTargets,
    ) -> Result<(PolicyMetrics, Vec<HeadLossCache>)> {
        let (batch, horizon) = inputs.pad_mask.dim();
        let (b, t, action_horizon, action_dim) = targets.actions.dim();
        ensure!(
            (b, t) == (batch, horizon) && targets.action_pad_mask.dim() == (b, t, action_horizon),
            "targets {:?} / {:?} do not match batch {} horizon {}",
            targets.actions.dim(),
            targets.action_pad_mask.dim(),
            batch,
            horizon
        );

        let mut metrics = PolicyMetrics::default();
        let mut caches = Vec::with_capacity(self.heads.len());
        for branch in &self.heads {
            let (h, a) = (branch.head.pred_horizon(), branch.head.action_dim());
            ensure!(
                h <= action_horizon && a <= action_dim,
                "head '{}' predicts {}x{} actions but targets are {}x{}",
                branch.name,
                h,
                a,
                action_horizon,
                action_dim
            );
            let readouts = self.readout_tokens(outputs, &branch.readout)?;
            let (head_metrics, cache) = branch.head.loss(
                readouts.tokens.view(),
                targets.actions.slice(s![.., .., ..h, ..a]),
                inputs.pad_mask.view(),
                targets.action_pad_mask.slice(s![.., .., ..h]),
            )?;
            metrics.loss += head_metrics.loss;
            metrics.heads.insert(branch.name.clone(), head_metrics);
            caches.push(cache);
        }
        Ok((metrics, caches))
    }

    /// Training step: computes the loss with dropout enabled and accumulates gradients.
    pub fn loss_and_backward(
        &mut self,
        inputs: &PolicyInputs,
        targets: &ActionTargets,
        rng: &mut fastrand::Rng,
    ) -> Result<PolicyMetrics> {
        let (outputs, cache) = self.forward(inputs, true, rng)?;
        let (metrics, head_caches) = self.head_losses(&outputs, inputs, targets)?;

        let mut timestep_grads: Vec<Array4<f32>> = outputs
            .timestep
            .iter()
            .map(|g| Array4::zeros(g.tokens.raw_dim()))
            .collect();
        for (branch, head_cache) in self.heads.iter_mut().zip(&head_caches) {
            let grad = branch.head.backward(head_cache)?;
            let group = format!("readout_{}", branch.readout);
            let idx = outputs
                .timestep
                .iter()
                .position(|g| g.name == group)
                .with_context(|| format!("transformer output has no group '{group}'"))?;
            timestep_grads[idx] += &grad;
        }
        let prefix_grads: Vec<Array3<f32>> = outputs
            .prefix
            .iter()
            .map(|g| Array3::zeros(g.tokens.raw_dim()))
            .collect();

        let (prefix_grads, timestep_grads) =
            self.transformer
                .backward(&cache.block, &prefix_grads, &timestep_grads)?;

        for ((branch, branch_cache), grad) in self
            .task_tokenizers
            .iter_mut()
            .zip(&cache.tasks)
            .zip(prefix_grads)
        {
            branch.backward(branch_cache, grad.insert_axis(Axis(1)))?;
        }
        let mut timestep_grads = timestep_grads.into_iter();
        for (branch, branch_cache) in self.observation_tokenizers.iter_mut().zip(&cache.observations) {
            let grad = timestep_grads.next().context("missing observation gradient")?;
            branch.backward(branch_cache, grad)?;
        }
        for readout in &mut self.readouts {
            let grad = timestep_grads.next().context("missing readout gradient")?;
            let steps = grad.dim().1;
            let mut embedding_grad = readout.embedding.grad.slice_mut(s![..steps, .., ..]);
            embedding_grad += &grad.sum_axis(Axis(0));
        }

        debug!(loss = metrics.loss, "policy loss and gradients computed");
        Ok(metrics)
    }

    /// Loss and metrics without dropout or gradients.
    pub fn evaluate(
        &self,
        inputs: &PolicyInputs,
        targets: &ActionTargets,
        rng: &mut fastrand::Rng,
    ) -> Result<PolicyMetrics> {
        let (outputs, _) = self.forward(inputs, false, rng)?;
        Ok(self.head_losses(&outputs, inputs, targets)?.0)
    }

    /// Decoded `(batch, horizon, pred_horizon, action_dim)` actions per head.
    pub fn predict_actions(
        &self,
        inputs: &PolicyInputs,
        rng: &mut fastrand::Rng,
    ) -> Result<BTreeMap<String, Array4<f32>>> {
        let (outputs, _) = self.forward(inputs, false, rng)?;
        let mut actions = BTreeMap::new();
        for branch in &self.heads {
            let readouts = self.readout_tokens(&outputs, &branch.readout)?;
            actions.insert(branch.name.clone(), branch.head.predict_actions(readouts.tokens.view())?);
        }
        Ok(actions)
    }
}

impl Parameterized for PolicyModel {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, ParamMut<'_>)) {
        for (group, branches) in [
            ("task", &mut self.task_tokenizers),
            ("obs", &mut self.observation_tokenizers),
        ] {
            for branch in branches.iter_mut() {
                let name = &branch.name;
                branch
                    .tokenizer
                    .visit_params(&scoped(prefix, &format!("{group}_tokenizers.{name}")), visitor);
                branch
                    .projection
                    .visit_params(&scoped(prefix, &format!("{group}_projections.{name}")), visitor);
                visitor(
                    &scoped(prefix, &format!("{group}_pos_embeddings.{name}")),
                    branch.position.as_mut(),
                );
            }
        }
        for readout in &mut self.readouts {
            visitor(
                &scoped(prefix, &format!("readout_embeddings.{}", readout.name)),
                readout.embedding.as_mut(),
            );
        }
        self.transformer.visit_params(&scoped(prefix, "transformer"), visitor);
        for branch in &mut self.heads {
            branch
                .head
                .visit_params(&scoped(prefix, &format!("heads.{}", branch.name)), visitor);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{
        ActivationKind, BinType, BinningConfig, ContinuousHeadConfig, HeadConfig, ImageTokenizerConfig,
        LanguageTokenizerConfig, LowdimTokenizerConfig, TokenizerConfig, TransformerConfig,
    };
    use approx::assert_relative_eq;
    use ndarray::IxDyn;

    pub(crate) fn tiny_config() -> ModelConfig {
        let mut config = ModelConfig {
            token_embedding_size: 16,
            max_horizon: 3,
            transformer: TransformerConfig {
                num_layers: 1,
                mlp_dim: 32,
                num_attention_heads: 2,
                dropout_rate: 0.0,
                attention_dropout_rate: 0.0,
                activation: ActivationKind::Gelu,
            },
            observation_tokenizers: BTreeMap::new(),
            task_tokenizers: BTreeMap::new(),
            readouts: BTreeMap::new(),
            heads: BTreeMap::new(),
        };
        config.observation_tokenizers.insert(
            "image".into(),
            TokenizerConfig::Image(ImageTokenizerConfig {
                patch_size: 4,
                embed_dim: 8,
                early_fusion: true,
                num_tokens: 4,
                obs_stack_keys: vec!["image_.*".into()],
                task_stack_keys: vec!["image_.*".into()],
                task_film_keys: Vec::new(),
                bottleneck_dim: 8,
                dropout_rate: 0.0,
            }),
        );
        config.observation_tokenizers.insert(
            "proprio".into(),
            TokenizerConfig::Lowdim(LowdimTokenizerConfig {
                obs_keys: vec!["proprio".into()],
                embed_dim: 8,
                binning: BinningConfig {
                    n_bins: 16,
                    bin_type: BinType::Normal,
                    low: -1.0,
                    high: 1.0,
                },
            }),
        );
        config.task_tokenizers.insert(
            "language".into(),
            TokenizerConfig::Language(LanguageTokenizerConfig {
                vocab_size: 32,
                embed_dim: 8,
                projection_dim: None,
            }),
        );
        config.readouts.insert("action".into(), 1);
        config.heads.insert(
            "action".into(),
            HeadConfig::Discrete(crate::config::DiscreteHeadConfig {
                readout_key: "action".into(),
                pred_horizon: 2,
                action_dim: 2,
                binning: BinningConfig {
                    n_bins: 32,
                    bin_type: BinType::Uniform,
                    low: -1.0,
                    high: 1.0,
                },
            }),
        );
        config
    }

    pub(crate) fn tiny_batch(batch: usize, horizon: usize) -> (PolicyInputs, ActionTargets) {
        let mut observations = BTreeMap::new();
        observations.insert(
            "image_primary".to_string(),
            ArrayD::from_shape_fn(IxDyn(&[batch, horizon, 8, 8, 3]), |i| {
                ((i[0] + i[1] * 2 + i[2] + i[4]) % 4) as f32 / 4.0
            }),
        );
        observations.insert(
            "proprio".to_string(),
            ArrayD::from_shape_fn(IxDyn(&[batch, horizon, 2]), |i| (i[0] as f32 - 0.5) + i[2] as f32 * 0.3),
        );
        let mut tasks = BTreeMap::new();
        tasks.insert(
            "image_primary".to_string(),
            ArrayD::from_shape_fn(IxDyn(&[batch, 8, 8, 3]), |i| (i[0] % 2) as f32),
        );
        let language = Array2::from_shape_fn((batch, 4), |(b, l)| if l < 2 { 3 + b + l } else { 0 });
        let pad_mask = Array2::from_shape_fn((batch, horizon), |(b, t)| !(b == 1 && t == 0));
        let actions = Array4::from_shape_fn((batch, horizon, 2, 2), |(b, t, h, a)| {
            if b % 2 == 0 {
                0.5 - 0.1 * (t + h) as f32 + a as f32 * 0.2
            } else {
                -0.4 + 0.05 * (t * h) as f32 - a as f32 * 0.1
            }
        });
        let action_pad_mask = Array3::from_shape_fn((batch, horizon, 2), |(_, t, h)| t + h < horizon);
        (
            PolicyInputs {
                observations,
                tasks,
                language: Some(language),
                pad_mask,
            },
            ActionTargets {
                actions,
                action_pad_mask,
            },
        )
    }

    fn model(config: ModelConfig, rng: &mut fastrand::Rng) -> PolicyModel {
        let (inputs, _) = tiny_batch(2, 2);
        PolicyModel::new(config, inputs.input_spec().unwrap(), rng).unwrap()
    }

    #[test]
    fn groups_are_named_after_their_source() {
        let mut rng = fastrand::Rng::with_seed(0);
        let model = model(tiny_config(), &mut rng);
        let (inputs, _) = tiny_batch(2, 2);
        let (outputs, _) = model.forward(&inputs, false, &mut rng).unwrap();
        let prefix: Vec<_> = outputs.prefix.iter().map(|g| g.name.as_str()).collect();
        let timestep: Vec<_> = outputs.timestep.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(prefix, vec!["task_language"]);
        assert_eq!(timestep, vec!["obs_image", "obs_proprio", "readout_action"]);
        assert_eq!(outputs.prefix[0].tokens.dim(), (2, 4, 16));
        assert_eq!(outputs.timestep[1].tokens.dim(), (2, 2, 2, 16));
    }

    #[test]
    fn parameter_names_are_dotted_paths() {
        let mut rng = fastrand::Rng::with_seed(0);
        let mut model = model(tiny_config(), &mut rng);
        let names = model.param_names();
        for expected in [
            "task_tokenizers.language.embedding.embedding",
            "obs_tokenizers.image.encoder.patch_embedding.kernel",
            "obs_pos_embeddings.proprio",
            "readout_embeddings.action",
            "transformer.layers.0.attention.query.kernel",
            "transformer.encoder_norm.scale",
            "heads.action.projection.bias",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}: {names:?}");
        }
    }

    #[test]
    fn rejects_windows_longer_than_max_horizon() {
        let mut rng = fastrand::Rng::with_seed(0);
        let model = model(tiny_config(), &mut rng);
        let (inputs, _) = tiny_batch(1, 4);
        assert!(model.forward(&inputs, false, &mut rng).is_err());
    }

    #[test]
    fn predictions_cover_every_head() {
        let mut rng = fastrand::Rng::with_seed(0);
        let model = model(tiny_config(), &mut rng);
        let (inputs, _) = tiny_batch(3, 2);
        let actions = model.predict_actions(&inputs, &mut rng).unwrap();
        assert_eq!(actions["action"].dim(), (3, 2, 2, 2));
    }

    #[test]
    fn gradient_steps_reduce_the_loss() {
        let mut rng = fastrand::Rng::with_seed(5);
        let mut model = model(tiny_config(), &mut rng);
        let (inputs, targets) = tiny_batch(2, 2);
        let initial = model.evaluate(&inputs, &targets, &mut rng).unwrap().loss;
        for _ in 0..20 {
            model.zero_grad();
            model.loss_and_backward(&inputs, &targets, &mut rng).unwrap();
            model.visit_params("", &mut |_, mut p| {
                let step = p.grad.mapv(|g| g * 0.05);
                p.value -= &step;
            });
        }
        let trained = model.evaluate(&inputs, &targets, &mut rng).unwrap().loss;
        assert!(trained < initial, "loss went from {initial} to {trained}");
    }

    #[test]
    fn parameter_gradient_matches_finite_difference() {
        let mut rng = fastrand::Rng::with_seed(7);
        let mut config = tiny_config();
        config.heads.clear();
        config.heads.insert(
            "action".into(),
            HeadConfig::Continuous(ContinuousHeadConfig {
                readout_key: "action".into(),
                pred_horizon: 2,
                action_dim: 2,
            }),
        );
        let mut model = model(config, &mut rng);
        let (inputs, targets) = tiny_batch(2, 2);

        model.zero_grad();
        model.loss_and_backward(&inputs, &targets, &mut rng).unwrap();

        let probes = [
            "readout_embeddings.action",
            "task_pos_embeddings.language",
            "obs_projections.image.kernel",
            "transformer.layers.0.mlp.dense_0.kernel",
        ];
        for probe in probes {
            let mut analytic = 0.0;
            model.visit_params("", &mut |name, p| {
                if name == probe {
                    analytic = p.grad.iter().next().copied().unwrap_or(0.0);
                }
            });
            let mut perturb = |model: &mut PolicyModel, delta: f32| {
                model.visit_params("", &mut |name, mut p| {
                    if name == probe {
                        if let Some(v) = p.value.iter_mut().next() {
                            *v += delta;
                        }
                    }
                });
            };
            // Smaller than the 0.02 init scale of embeddings.
            let h = 1e-3;
            perturb(&mut model, h);
            let plus = model.evaluate(&inputs, &targets, &mut rng).unwrap().loss;
            perturb(&mut model, -2.0 * h);
            let minus = model.evaluate(&inputs, &targets, &mut rng).unwrap().loss;
            perturb(&mut model, h);
            assert_relative_eq!(
                analytic,
                (plus - minus) / (2.0 * h),
                epsilon = 2e-3,
                max_relative = 2e-2
            );
        }
    }
}
