//! Action heads reading from readout tokens.

use crate::config::{ContinuousHeadConfig, DiscreteHeadConfig, HeadConfig};
use crate::nn::Linear;
use crate::param::{scoped, ParamMut, Parameterized};
use crate::tokenizers::BinTokenizer;
use anyhow::{ensure, Result};
use ndarray::{Array2, Array4, ArrayView2, ArrayView3, ArrayView4, Axis};
use policyforge_kernels::{mean_squared_error, softmax_cross_entropy};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HeadMetrics {
    pub loss: f32,
    /// Mean squared error of the decoded actions.
    pub mse: f32,
    /// Fraction of correctly predicted action bins; discrete heads only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f32>,
    /// Number of supervised action rows.
    pub supervised: f32,
}

/// Gradient state kept between [`ActionHead::loss`] and [`ActionHead::backward`].
#[derive(Debug, Clone)]
pub struct HeadLossCache {
    shape: (usize, usize, usize, usize),
    pooled: Array2<f32>,
    grad_output: Array2<f32>,
}

#[derive(Debug, Clone)]
pub struct DiscreteActionHead {
    pub pred_horizon: usize,
    pub action_dim: usize,
    pub bins: BinTokenizer,
    pub projection: Linear,
}

#[derive(Debug, Clone)]
pub struct ContinuousActionHead {
    pub pred_horizon: usize,
    pub action_dim: usize,
    pub projection: Linear,
}

#[derive(Debug, Clone)]
pub enum ActionHead {
    Discrete(DiscreteActionHead),
    Continuous(ContinuousActionHead),
}

/// Mean over the readout tokens: `(batch, horizon, tokens, dim) -> (batch * horizon, dim)`.
fn pool(readouts: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
    let (b, t, n, d) = readouts.dim();
    ensure!(n > 0, "action head needs at least one readout token");
    let pooled = readouts.sum_axis(Axis(2)) / n as f32;
    Ok(pooled.to_shape((b * t, d))?.into_owned())
}

/// Row weights for `(batch * horizon * pred_horizon)` action rows.
fn supervision_weights(
    pad_mask: ArrayView2<'_, bool>,
    action_pad_mask: ArrayView3<'_, bool>,
) -> Vec<f32> {
    let (b, t, h) = action_pad_mask.dim();
    let mut weights = Vec::with_capacity(b * t * h);
    for bi in 0..b {
        for ti in 0..t {
            for hi in 0..h {
                let supervised = pad_mask[[bi, ti]] && action_pad_mask[[bi, ti, hi]];
                weights.push(if supervised { 1.0 } else { 0.0 });
            }
        }
    }
    weights
}

impl DiscreteActionHead {
    pub fn new(config: &DiscreteHeadConfig, dim: usize, rng: &mut fastrand::Rng) -> Result<Self> {
        let bins = BinTokenizer::new(&config.binning)?;
        let out = config.pred_horizon * config.action_dim * bins.n_bins;
        Ok(Self {
            pred_horizon: config.pred_horizon,
            action_dim: config.action_dim,
            bins,
            projection: Linear::new(dim, out, true, rng),
        })
    }

    /// Logits reshaped to `(batch * horizon * pred_horizon * action_dim, n_bins)`.
    fn logits(&self, pooled: &Array2<f32>) -> Result<Array2<f32>> {
        let logits = self.projection.forward(pooled.view())?;
        let rows = logits.nrows() * self.pred_horizon * self.action_dim;
        Ok(logits.into_shape_with_order((rows, self.bins.n_bins))?)
    }

    fn predict(&self, readouts: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        let (b, t, _, _) = readouts.dim();
        let logits = self.logits(&pool(readouts)?)?;
        let centers = self.bins.bin_centers();
        let decoded: Vec<f32> = logits
            .rows()
            .into_iter()
            .map(|row| centers[argmax(row.iter().copied())])
            .collect();
        Ok(Array4::from_shape_vec((b, t, self.pred_horizon, self.action_dim), decoded)?)
    }

    fn loss(
        &self,
        readouts: ArrayView4<'_, f32>,
        actions: ArrayView4<'_, f32>,
        weights: &[f32],
    ) -> Result<(HeadMetrics, HeadLossCache)> {
        let pooled = pool(readouts)?;
        let logits = self.logits(&pooled)?;
        let targets: Vec<usize> = actions.iter().map(|&a| self.bins.encode_value(a)).collect();
        let row_weights: Vec<f32> = weights
            .iter()
            .flat_map(|&w| std::iter::repeat(w).take(self.action_dim))
            .collect();
        let (loss, probs) = softmax_cross_entropy(logits.view(), &targets, &row_weights)?;

        let centers = self.bins.bin_centers();
        let total: f32 = row_weights.iter().sum();
        let (mut correct, mut squared) = (0.0f32, 0.0f32);
        for ((row, (&target, &weight)), &action) in probs
            .rows()
            .into_iter()
            .zip(targets.iter().zip(&row_weights))
            .zip(actions.iter())
        {
            let predicted = argmax(row.iter().copied());
            if predicted == target {
                correct += weight;
            }
            let err = centers[predicted] - action;
            squared += weight * err * err;
        }
        let norm = if total > 0.0 { 1.0 / total } else { 0.0 };

        let rows = pooled.nrows();
        let grad_output = loss
            .grad
            .into_shape_with_order((rows, self.projection.out_dim()))?;
        Ok((
            HeadMetrics {
                loss: loss.loss,
                mse: squared * norm,
                accuracy: Some(correct * norm),
                supervised: weights.iter().sum(),
            },
            HeadLossCache {
                shape: readouts.dim(),
                pooled,
                grad_output,
            },
        ))
    }
}

impl ContinuousActionHead {
    pub fn new(config: &ContinuousHeadConfig, dim: usize, rng: &mut fastrand::Rng) -> Self {
        Self {
            pred_horizon: config.pred_horizon,
            action_dim: config.action_dim,
            projection: Linear::new(dim, config.pred_horizon * config.action_dim, true, rng),
        }
    }

    fn predict(&self, readouts: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        let (b, t, _, _) = readouts.dim();
        let out = self.projection.forward(pool(readouts)?.view())?;
        Ok(out.into_shape_with_order((b, t, self.pred_horizon, self.action_dim))?)
    }

    fn loss(
        &self,
        readouts: ArrayView4<'_, f32>,
        actions: ArrayView4<'_, f32>,
        weights: &[f32],
    ) -> Result<(HeadMetrics, HeadLossCache)> {
        let pooled = pool(readouts)?;
        let out = self.projection.forward(pooled.view())?;
        let rows = out.nrows();
        let prediction = out.into_shape_with_order((rows * self.pred_horizon, self.action_dim))?;
        let target = actions.to_shape((rows * self.pred_horizon, self.action_dim))?;
        let loss = mean_squared_error(prediction.view(), target.view(), weights)?;
        let grad_output = loss
            .grad
            .into_shape_with_order((rows, self.projection.out_dim()))?;
        Ok((
            HeadMetrics {
                loss: loss.loss,
                mse: loss.loss,
                accuracy: None,
                supervised: weights.iter().sum(),
            },
            HeadLossCache {
                shape: readouts.dim(),
                pooled,
                grad_output,
            },
        ))
    }
}

fn argmax(values: impl Iterator<Item = f32>) -> usize {
    let mut best = (0, f32::NEG_INFINITY);
    for (i, v) in values.enumerate() {
        if v > best.1 {
            best = (i, v);
        }
    }
    best.0
}

impl ActionHead {
    pub fn new(config: &HeadConfig, dim: usize, rng: &mut fastrand::Rng) -> Result<Self> {
        Ok(match config {
            HeadConfig::Discrete(cfg) => ActionHead::Discrete(DiscreteActionHead::new(cfg, dim, rng)?),
            HeadConfig::Continuous(cfg) => ActionHead::Continuous(ContinuousActionHead::new(cfg, dim, rng)),
        })
    }

    pub fn pred_horizon(&self) -> usize {
        match self {
            ActionHead::Discrete(h) => h.pred_horizon,
            ActionHead::Continuous(h) => h.pred_horizon,
        }
    }

    pub fn action_dim(&self) -> usize {
        match self {
            ActionHead::Discrete(h) => h.action_dim,
            ActionHead::Continuous(h) => h.action_dim,
        }
    }

    fn projection_mut(&mut self) -> &mut Linear {
        match self {
            ActionHead::Discrete(h) => &mut h.projection,
            ActionHead::Continuous(h) => &mut h.projection,
        }
    }

    /// Decoded actions `(batch, horizon, pred_horizon, action_dim)`; discrete heads take the argmax bin.
    pub fn predict_actions(&self, readouts: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        match self {
            ActionHead::Discrete(h) => h.predict(readouts),
            ActionHead::Continuous(h) => h.predict(readouts),
        }
    }

    /// Loss of `(batch, horizon, tokens, dim)` readouts against `(batch, horizon, pred_horizon, action_dim)`
    /// actions. Only steps with `pad_mask && action_pad_mask` are supervised.
    pub fn loss(
        &self,
        readouts: ArrayView4<'_, f32>,
        actions: ArrayView4<'_, f32>,
        pad_mask: ArrayView2<'_, bool>,
        action_pad_mask: ArrayView3<'_, bool>,
    ) -> Result<(HeadMetrics, HeadLossCache)> {
        let (b, t, _, _) = readouts.dim();
        let expected = (b, t, self.pred_horizon(), self.action_dim());
        ensure!(
            actions.dim() == expected,
            "actions {:?} do not match head output {:?}",
            actions.dim(),
            expected
        );
        ensure!(
            pad_mask.dim() == (b, t) && action_pad_mask.dim() == (b, t, self.pred_horizon()),
            "masks {:?} and {:?} do not match batch {} horizon {} pred_horizon {}",
            pad_mask.dim(),
            action_pad_mask.dim(),
            b,
            t,
            self.pred_horizon()
        );
        let weights = supervision_weights(pad_mask, action_pad_mask);
        match self {
            ActionHead::Discrete(h) => h.loss(readouts, actions, &weights),
            ActionHead::Continuous(h) => h.loss(readouts, actions, &weights),
        }
    }

    /// Accumulates projection gradients and returns the gradient for the readout tokens.
    pub fn backward(&mut self, cache: &HeadLossCache) -> Result<Array4<f32>> {
        let (b, t, n, d) = cache.shape;
        let grad_pooled = self
            .projection_mut()
            .backward(cache.pooled.view(), cache.grad_output.view())?;
        let grad_pooled = grad_pooled.into_shape_with_order((b, t, 1, d))? / n as f32;
        Ok(grad_pooled
            .broadcast((b, t, n, d))
            .ok_or_else(|| anyhow::anyhow!("pooled gradient does not broadcast to readouts"))?
            .to_owned())
    }
}

impl Parameterized for ActionHead {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, ParamMut<'_>)) {
        self.projection_mut().visit_params(&scoped(prefix, "projection"), visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BinType, BinningConfig};
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    fn discrete() -> ActionHead {
        let mut rng = fastrand::Rng::with_seed(0);
        ActionHead::new(
            &HeadConfig::Discrete(DiscreteHeadConfig {
                readout_key: "action".into(),
                pred_horizon: 2,
                action_dim: 3,
                binning: BinningConfig {
                    n_bins: 16,
                    bin_type: BinType::Uniform,
                    low: -1.0,
                    high: 1.0,
                },
            }),
            4,
            &mut rng,
        )
        .unwrap()
    }

    fn readouts() -> Array4<f32> {
        Array4::from_shape_fn((2, 3, 2, 4), |(b, t, n, d)| ((b * 24 + t * 8 + n * 4 + d) as f32 * 0.3).sin())
    }

    #[test]
    fn predictions_have_action_shape() {
        let head = discrete();
        let actions = head.predict_actions(readouts().view()).unwrap();
        assert_eq!(actions.dim(), (2, 3, 2, 3));
        assert!(actions.iter().all(|a| a.abs() < 1.0));
    }

    #[test]
    fn fully_masked_batch_has_zero_loss_and_gradient() {
        let mut head = discrete();
        let actions = Array4::zeros((2, 3, 2, 3));
        let pad = ndarray::Array2::from_elem((2, 3), false);
        let action_pad = Array3::from_elem((2, 3, 2), true);
        let (metrics, cache) = head
            .loss(readouts().view(), actions.view(), pad.view(), action_pad.view())
            .unwrap();
        assert_eq!(metrics.loss, 0.0);
        assert_eq!(metrics.supervised, 0.0);
        let grad = head.backward(&cache).unwrap();
        assert!(grad.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn discrete_training_step_reduces_loss() {
        let mut head = discrete();
        let actions = Array4::from_shape_fn((2, 3, 2, 3), |(b, _, h, a)| (b as f32 - 0.5) * 0.8 + h as f32 * 0.1 - a as f32 * 0.2);
        let pad = ndarray::Array2::from_elem((2, 3), true);
        let action_pad = Array3::from_shape_fn((2, 3, 2), |(_, t, h)| t + h < 3);
        let inputs = readouts();
        let (before, cache) = head.loss(inputs.view(), actions.view(), pad.view(), action_pad.view()).unwrap();
        assert_eq!(before.supervised, 10.0);
        head.backward(&cache).unwrap();
        head.visit_params("", &mut |_, mut p| {
            let step = p.grad.mapv(|g| g * 0.1);
            p.value -= &step;
        });
        let (after, _) = head.loss(inputs.view(), actions.view(), pad.view(), action_pad.view()).unwrap();
        assert!(after.loss < before.loss);
    }

    #[test]
    fn continuous_readout_gradient_matches_finite_difference() {
        let mut rng = fastrand::Rng::with_seed(1);
        let mut head = ActionHead::new(
            &HeadConfig::Continuous(ContinuousHeadConfig {
                readout_key: "action".into(),
                pred_horizon: 1,
                action_dim: 2,
            }),
            4,
            &mut rng,
        )
        .unwrap();
        let actions = Array4::from_shape_fn((2, 3, 1, 2), |(b, t, _, a)| (b + t) as f32 * 0.1 - a as f32);
        let pad = ndarray::array![[true, true, false], [true, false, false]];
        let action_pad = Array3::from_elem((2, 3, 1), true);
        let mut inputs = readouts();

        let (_, cache) = head.loss(inputs.view(), actions.view(), pad.view(), action_pad.view()).unwrap();
        let grad = head.backward(&cache).unwrap();

        let h = 1e-2;
        for idx in [[0, 0, 1, 2], [1, 0, 0, 3], [0, 2, 1, 0]] {
            let orig = inputs[idx];
            inputs[idx] = orig + h;
            let plus = head.loss(inputs.view(), actions.view(), pad.view(), action_pad.view()).unwrap().0.loss;
            inputs[idx] = orig - h;
            let minus = head.loss(inputs.view(), actions.view(), pad.view(), action_pad.view()).unwrap().0.loss;
            inputs[idx] = orig;
            assert_abs_diff_eq!(grad[idx], (plus - minus) / (2.0 * h), epsilon = 1e-3);
        }
        // padded step [0, 2] gets no gradient
        assert_eq!(grad[[0, 2, 1, 0]], 0.0);
    }
}
