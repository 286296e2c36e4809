//! AdamW with global-norm clipping and frozen parameters.

use crate::schedule::LearningRateSchedule;
use anyhow::{ensure, Context, Result};
use ndarray::ArrayD;
use policyforge_model::Parameterized;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub learning_rate: LearningRateSchedule,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    /// Decoupled decay, applied to parameters with two or more dimensions.
    pub weight_decay: f32,
    /// Global gradient-norm limit.
    pub clip_gradient: Option<f32>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: LearningRateSchedule::default(),
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
            clip_gradient: Some(1.0),
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<()> {
        self.learning_rate.validate()?;
        ensure!(
            (0.0..1.0).contains(&self.beta1) && (0.0..1.0).contains(&self.beta2),
            "betas must lie in [0, 1), got {} and {}",
            self.beta1,
            self.beta2
        );
        ensure!(self.eps > 0.0, "eps must be positive");
        ensure!(self.weight_decay >= 0.0, "weight_decay must be non-negative");
        if let Some(clip) = self.clip_gradient {
            ensure!(clip > 0.0, "clip_gradient must be positive");
        }
        Ok(())
    }
}

/// Glob patterns (`*` any run of characters, `?` one character) over parameter names.
#[derive(Debug, Clone, Default)]
pub struct FrozenKeys {
    patterns: Vec<Regex>,
}

impl FrozenKeys {
    pub fn new(globs: &[String]) -> Result<Self> {
        let patterns = globs
            .iter()
            .map(|glob| {
                let mut pattern = String::from("^");
                for ch in glob.chars() {
                    match ch {
                        '*' => pattern.push_str(".*"),
                        '?' => pattern.push('.'),
                        other => pattern.push_str(&regex::escape(&other.to_string())),
                    }
                }
                pattern.push('$');
                Regex::new(&pattern).with_context(|| format!("invalid frozen key '{glob}'"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_frozen(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(name))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// L2 norm over all gradients of trainable parameters.
pub fn global_grad_norm(model: &mut impl Parameterized, frozen: &FrozenKeys) -> f32 {
    let mut total = 0.0f64;
    model.visit_params("", &mut |name, param| {
        if !frozen.is_frozen(name) {
            total += param.grad.iter().map(|&g| (g as f64) * (g as f64)).sum::<f64>();
        }
    });
    total.sqrt() as f32
}

/// Rescales gradients so their global norm is at most `max_norm`; returns the norm before clipping.
pub fn clip_gradients(model: &mut impl Parameterized, frozen: &FrozenKeys, max_norm: f32) -> f32 {
    let norm = global_grad_norm(model, frozen);
    if norm > max_norm && norm > 0.0 {
        let scale = max_norm / norm;
        model.visit_params("", &mut |name, mut param| {
            if !frozen.is_frozen(name) {
                param.grad.mapv_inplace(|g| g * scale);
            }
        });
    }
    norm
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StepStats {
    pub learning_rate: f32,
    pub grad_norm: f32,
    pub update_norm: f32,
}

#[derive(Debug, Clone)]
struct Moments {
    first: ArrayD<f32>,
    second: ArrayD<f32>,
}

#[derive(Debug, Clone)]
pub struct AdamW {
    pub config: OptimizerConfig,
    pub frozen: FrozenKeys,
    step: usize,
    moments: HashMap<String, Moments>,
}

impl AdamW {
    pub fn new(config: OptimizerConfig, frozen: FrozenKeys) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            frozen,
            step: 0,
            moments: HashMap::new(),
        })
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Learning rate the next [`AdamW::step`] will use.
    pub fn learning_rate(&self) -> f32 {
        self.config.learning_rate.value(self.step)
    }

    /// Clips, then applies one update to every trainable parameter.
    pub fn step(&mut self, model: &mut impl Parameterized) -> Result<StepStats> {
        let grad_norm = match self.config.clip_gradient {
            Some(max_norm) => clip_gradients(model, &self.frozen, max_norm),
            None => global_grad_norm(model, &self.frozen),
        };
        ensure!(grad_norm.is_finite(), "gradient norm is not finite at step {}", self.step);

        let lr = self.learning_rate();
        self.step += 1;
        let t = self.step as i32;
        let OptimizerConfig {
            beta1,
            beta2,
            eps,
            weight_decay,
            ..
        } = self.config;
        let bias1 = 1.0 - beta1.powi(t);
        let bias2 = 1.0 - beta2.powi(t);

        let frozen = &self.frozen;
        let moments = &mut self.moments;
        let mut update_sq = 0.0f64;
        model.visit_params("", &mut |name, mut param| {
            if frozen.is_frozen(name) {
                return;
            }
            let state = moments.entry(name.to_string()).or_insert_with(|| Moments {
                first: ArrayD::zeros(param.value.raw_dim()),
                second: ArrayD::zeros(param.value.raw_dim()),
            });
            let decay = if param.value.ndim() >= 2 { weight_decay } else { 0.0 };
            ndarray::Zip::from(&mut param.value)
                .and(&param.grad)
                .and(&mut state.first)
                .and(&mut state.second)
                .for_each(|w, &g, m, v| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / bias1;
                    let v_hat = *v / bias2;
                    let update = lr * (m_hat / (v_hat.sqrt() + eps) + decay * *w);
                    update_sq += (update as f64) * (update as f64);
                    *w -= update;
                });
        });

        let stats = StepStats {
            learning_rate: lr,
            grad_norm,
            update_norm: update_sq.sqrt() as f32,
        };
        debug!(step = self.step, lr, grad_norm, "optimizer step");
        Ok(stats)
    }
}
