//! Behavior-cloning training loop.

use crate::config::TrainConfig;
use crate::metrics::{average_metrics, MetricsRecord, MetricsWriter, Split};
use crate::optimizer::{AdamW, FrozenKeys, StepStats};
use anyhow::{ensure, Context, Result};
use policyforge_data::statistics::STATISTICS_FILE;
use policyforge_data::InterleavedDataset;
use policyforge_model::checkpoint::PARAMS_FILE;
use policyforge_model::{load_checkpoint, load_params, save_checkpoint, Parameterized, PolicyMetrics, PolicyModel};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const FINAL_CHECKPOINT: &str = "final";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainSummary {
    pub steps: usize,
    pub first_train_loss: f32,
    pub final_train: PolicyMetrics,
    pub final_val: Option<PolicyMetrics>,
    pub checkpoint: Option<PathBuf>,
}

pub struct Trainer {
    pub config: TrainConfig,
    pub model: PolicyModel,
    pub optimizer: AdamW,
    pub train_data: InterleavedDataset,
    pub val_data: Option<InterleavedDataset>,
    rng: fastrand::Rng,
    metrics: Option<MetricsWriter>,
    step: usize,
}

impl Trainer {
    /// Loads the data mixture, sizes the model from a sample batch and applies
    /// pretrained weights when configured.
    pub fn new(config: TrainConfig) -> Result<Self> {
        config.validate()?;
        let train_data = InterleavedDataset::from_config(&config.data, &config.data.train_split)?;
        let val_data = if config.eval_interval > 0 {
            match InterleavedDataset::from_config(&config.data, &config.data.val_split) {
                Ok(data) => Some(data),
                Err(err) => {
                    warn!(split = %config.data.val_split, error = %err, "validation split unavailable; evaluation disabled");
                    None
                }
            }
        } else {
            None
        };
        Self::from_parts(config, train_data, val_data)
    }

    pub fn from_parts(
        config: TrainConfig,
        train_data: InterleavedDataset,
        val_data: Option<InterleavedDataset>,
    ) -> Result<Self> {
        config.validate()?;
        let mut rng = fastrand::Rng::with_seed(config.seed);
        let example = train_data.sample_batch(1, &mut rng)?;
        let spec = example.policy_inputs().input_spec()?;
        let mut model = PolicyModel::new(config.model.clone(), spec, &mut rng)?;

        if let Some(pretrained) = &config.pretrained {
            let report = load_params(pretrained.join(PARAMS_FILE), &mut model, false)
                .with_context(|| format!("failed to load pretrained weights from {}", pretrained.display()))?;
            ensure!(
                !report.loaded.is_empty(),
                "no parameter of {} matches the model",
                pretrained.display()
            );
        }

        let frozen = FrozenKeys::new(&config.frozen_keys)?;
        if !frozen.is_empty() {
            let names = model.param_names();
            let count = names.iter().filter(|n| frozen.is_frozen(n)).count();
            ensure!(count > 0, "frozen_keys {:?} match no parameter", config.frozen_keys);
            info!(frozen = count, total = names.len(), "freezing parameters");
        }
        let optimizer = AdamW::new(config.optimizer.clone(), frozen)?;
        let metrics = match &config.save_dir {
            Some(dir) => Some(MetricsWriter::create(dir)?),
            None => None,
        };

        Ok(Self {
            config,
            model,
            optimizer,
            train_data,
            val_data,
            rng,
            metrics,
            step: 0,
        })
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Samples a batch, computes gradients and applies one optimizer update.
    pub fn train_step(&mut self) -> Result<(PolicyMetrics, StepStats)> {
        let batch = self.train_data.sample_batch(self.config.batch_size, &mut self.rng)?;
        let (inputs, targets) = batch.into_model_inputs();
        self.model.zero_grad();
        let metrics = self.model.loss_and_backward(&inputs, &targets, &mut self.rng)?;
        ensure!(metrics.loss.is_finite(), "loss diverged at step {}", self.step);
        let stats = self.optimizer.step(&mut self.model)?;
        self.step += 1;
        Ok((metrics, stats))
    }

    /// Mean metrics over `eval_batches` validation batches, drawn from a
    /// fixed seed so successive evaluations see the same data.
    pub fn evaluate(&self) -> Result<Option<PolicyMetrics>> {
        let Some(val) = &self.val_data else {
            return Ok(None);
        };
        let metrics = evaluate_batches(
            &self.model,
            val,
            self.config.eval_batches,
            self.config.batch_size,
            self.config.seed.wrapping_add(1),
        )?;
        Ok(Some(metrics))
    }

    /// Writes a checkpoint and the dataset statistics needed to unnormalize its actions.
    pub fn save(&mut self, dir: &Path) -> Result<PathBuf> {
        let path = save_checkpoint(dir, &mut self.model, self.step)?;
        let stats = serde_json::to_vec_pretty(&self.train_data.statistics())?;
        fs::write(dir.join(STATISTICS_FILE), stats)
            .with_context(|| format!("failed to write statistics into {}", dir.display()))?;
        Ok(path)
    }

    fn record(&mut self, record: MetricsRecord) -> Result<()> {
        if let Some(writer) = &mut self.metrics {
            writer.append(&record)?;
        }
        Ok(())
    }

    pub fn run(&mut self) -> Result<TrainSummary> {
        let total = self.config.num_steps;
        let parameters = self.model.num_params();
        info!(steps = total, batch_size = self.config.batch_size, parameters, "starting training");
        let mut first_train_loss = None;
        let mut last_train = PolicyMetrics::default();
        let mut last_val = None;
        let mut checkpoint = None;

        while self.step < total {
            let (metrics, stats) = self.train_step()?;
            let step = self.step;
            first_train_loss.get_or_insert(metrics.loss);

            if step % self.config.log_interval == 0 || step == total {
                info!(
                    step,
                    loss = metrics.loss,
                    lr = stats.learning_rate,
                    grad_norm = stats.grad_norm,
                    "train"
                );
                let record = MetricsRecord::new(step, Split::Train, &metrics)
                    .with_optimizer(stats.learning_rate, stats.grad_norm);
                self.record(record)?;
            }

            if self.config.eval_interval > 0 && (step % self.config.eval_interval == 0 || step == total) {
                if let Some(val) = self.evaluate()? {
                    info!(step, loss = val.loss, "validation");
                    self.record(MetricsRecord::new(step, Split::Val, &val))?;
                    last_val = Some(val);
                }
            }

            if let Some(dir) = self.config.save_dir.clone() {
                if self.config.save_interval > 0 && step % self.config.save_interval == 0 && step < total {
                    self.save(&dir.join(format!("step_{step}")))?;
                }
                if step == total {
                    checkpoint = Some(self.save(&dir.join(FINAL_CHECKPOINT))?);
                }
            }
            last_train = metrics;
        }

        let summary = TrainSummary {
            steps: self.step,
            first_train_loss: first_train_loss.unwrap_or(last_train.loss),
            final_train: last_train,
            final_val: last_val,
            checkpoint,
        };
        info!(
            steps = summary.steps,
            first_loss = summary.first_train_loss,
            final_loss = summary.final_train.loss,
            "training finished"
        );
        Ok(summary)
    }
}

fn evaluate_batches(
    model: &PolicyModel,
    data: &InterleavedDataset,
    batches: usize,
    batch_size: usize,
    seed: u64,
) -> Result<PolicyMetrics> {
    let mut rng = fastrand::Rng::with_seed(seed);
    let results = (0..batches)
        .map(|_| {
            let (inputs, targets) = data.sample_batch(batch_size, &mut rng)?.into_model_inputs();
            model.evaluate(&inputs, &targets, &mut rng)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(average_metrics(&results))
}

/// Metrics of a saved checkpoint on the configured validation split.
pub fn evaluate_checkpoint(config: &TrainConfig, checkpoint: &Path) -> Result<PolicyMetrics> {
    config.validate()?;
    let data = InterleavedDataset::from_config(&config.data, &config.data.val_split)?;
    let (model, meta) = load_checkpoint(checkpoint, &mut fastrand::Rng::with_seed(config.seed))?;
    info!(checkpoint = %checkpoint.display(), step = meta.step, "evaluating checkpoint");
    evaluate_batches(
        &model,
        &data,
        config.eval_batches.max(1),
        config.batch_size,
        config.seed.wrapping_add(1),
    )
}
