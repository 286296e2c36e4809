use crate::nn::{LayerNorm, MlpBlock, MlpCache};
use crate::param::{scoped, ParamMut, Parameterized};
use anyhow::{ensure, Result};
use ndarray::{Array2, Array3, Array4, ArrayView3, ArrayView4, Axis};
use policyforge_kernels::{softmax_backward, softmax_inplace, LayerNormCache};

/// Learns `num_tokens` softmax-weighted mixtures of a variable set of input tokens.
#[derive(Debug, Clone)]
pub struct TokenLearner {
    pub num_tokens: usize,
    pub layer_norm: LayerNorm,
    pub mlp: MlpBlock,
}

#[derive(Debug, Clone)]
pub struct TokenLearnerCache {
    inputs: Array3<f32>,
    norm: LayerNormCache,
    mlp: MlpCache,
    /// `(groups, num_tokens, input_tokens)`
    weights: Array3<f32>,
}

impl TokenLearner {
    pub fn new(
        dim: usize,
        num_tokens: usize,
        bottleneck_dim: usize,
        dropout_rate: f32,
        rng: &mut fastrand::Rng,
    ) -> Self {
        Self {
            num_tokens,
            layer_norm: LayerNorm::new(dim),
            mlp: MlpBlock::new(dim, bottleneck_dim, num_tokens, dropout_rate, rng),
        }
    }

    /// `(groups, input_tokens, dim) -> (groups, num_tokens, dim)`.
    pub fn forward(
        &self,
        inputs: ArrayView3<'_, f32>,
        train: bool,
        rng: &mut fastrand::Rng,
    ) -> Result<(Array3<f32>, TokenLearnerCache)> {
        let (groups, n, dim) = inputs.dim();
        ensure!(n > 0, "token learner needs at least one input token");
        let rows = inputs.to_shape((groups * n, dim))?;
        let (normed, norm) = self.layer_norm.forward(rows.view())?;
        let (logits, mlp) = self.mlp.forward(normed.view(), train, rng)?;

        let logits = logits.into_shape_with_order((groups, n, self.num_tokens))?;
        let mut weights = logits.permuted_axes([0, 2, 1]).as_standard_layout().into_owned();
        let mut outputs = Array3::<f32>::zeros((groups, self.num_tokens, dim));
        for g in 0..groups {
            softmax_inplace(weights.index_axis_mut(Axis(0), g));
            outputs
                .index_axis_mut(Axis(0), g)
                .assign(&weights.index_axis(Axis(0), g).dot(&inputs.index_axis(Axis(0), g)));
        }

        Ok((
            outputs,
            TokenLearnerCache {
                inputs: inputs.to_owned(),
                norm,
                mlp,
                weights,
            },
        ))
    }

    pub fn backward(&mut self, cache: &TokenLearnerCache, grad_output: ArrayView3<'_, f32>) -> Result<Array3<f32>> {
        let (groups, n, dim) = cache.inputs.dim();
        ensure!(
            grad_output.dim() == (groups, self.num_tokens, dim),
            "token learner gradient {:?} does not match output ({}, {}, {})",
            grad_output.dim(),
            groups,
            self.num_tokens,
            dim
        );

        let mut grad_inputs = Array3::<f32>::zeros((groups, n, dim));
        let mut grad_logits = Array3::<f32>::zeros((groups, n, self.num_tokens));
        for g in 0..groups {
            let weights = cache.weights.index_axis(Axis(0), g);
            let inputs = cache.inputs.index_axis(Axis(0), g);
            let grad = grad_output.index_axis(Axis(0), g);
            grad_inputs
                .index_axis_mut(Axis(0), g)
                .assign(&weights.t().dot(&grad));
            let grad_weights = grad.dot(&inputs.t());
            let grad_scores = softmax_backward(weights, grad_weights.view())?;
            grad_logits.index_axis_mut(Axis(0), g).assign(&grad_scores.t());
        }

        let grad_logits: Array2<f32> = grad_logits.into_shape_with_order((groups * n, self.num_tokens))?;
        let grad_normed = self.mlp.backward(&cache.mlp, grad_logits)?;
        let grad_rows = self.layer_norm.backward(&cache.norm, grad_normed.view())?;
        grad_inputs += &grad_rows.into_shape_with_order((groups, n, dim))?;
        Ok(grad_inputs)
    }

    /// Applies the learner to every timestep of `(batch, horizon, tokens, dim)`.
    pub fn forward_4d(
        &self,
        inputs: ArrayView4<'_, f32>,
        train: bool,
        rng: &mut fastrand::Rng,
    ) -> Result<(Array4<f32>, TokenLearnerCache)> {
        let (b, t, n, d) = inputs.dim();
        let flat = inputs.to_shape((b * t, n, d))?;
        let (out, cache) = self.forward(flat.view(), train, rng)?;
        Ok((out.into_shape_with_order((b, t, self.num_tokens, d))?, cache))
    }

    pub fn backward_4d(&mut self, cache: &TokenLearnerCache, grad_output: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        let (b, t, nt, d) = grad_output.dim();
        let n = cache.inputs.dim().1;
        let flat = grad_output.to_shape((b * t, nt, d))?;
        let grad = self.backward(cache, flat.view())?;
        Ok(grad.into_shape_with_order((b, t, n, d))?)
    }
}

impl Parameterized for TokenLearner {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, ParamMut<'_>)) {
        self.layer_norm.visit_params(&scoped(prefix, "layer_norm"), visitor);
        self.mlp.visit_params(&scoped(prefix, "mlp"), visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::s;

    #[test]
    fn outputs_are_convex_combinations_of_inputs() {
        let mut rng = fastrand::Rng::with_seed(2);
        let learner = TokenLearner::new(4, 3, 8, 0.0, &mut rng);
        let inputs = Array3::from_shape_fn((2, 5, 4), |(g, n, d)| (g * 20 + n * 4 + d) as f32);
        let (out, cache) = learner.forward(inputs.view(), false, &mut rng).unwrap();
        assert_eq!(out.dim(), (2, 3, 4));
        for row in cache.weights.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-5);
        }
        // every output lies within the input range of its group
        let group = out.slice(s![1, .., 0]);
        assert!(group.iter().all(|&v| (20.0..=36.0).contains(&v)));
    }

    #[test]
    fn input_gradient_matches_finite_difference() {
        let mut rng = fastrand::Rng::with_seed(6);
        let mut learner = TokenLearner::new(3, 2, 5, 0.0, &mut rng);
        let mut inputs = Array3::from_shape_fn((1, 4, 3), |(_, n, d)| ((n * 3 + d) as f32 * 0.9).sin());
        let weights = Array3::from_shape_fn((1, 2, 3), |(_, n, d)| 0.5 + n as f32 - 0.3 * d as f32);

        let (_, cache) = learner.forward(inputs.view(), false, &mut rng).unwrap();
        let grad = learner.backward(&cache, weights.view()).unwrap();

        let h = 1e-2;
        for n in 0..4 {
            for d in 0..3 {
                let orig = inputs[[0, n, d]];
                inputs[[0, n, d]] = orig + h;
                let plus = (learner.forward(inputs.view(), false, &mut rng).unwrap().0 * &weights).sum();
                inputs[[0, n, d]] = orig - h;
                let minus = (learner.forward(inputs.view(), false, &mut rng).unwrap().0 * &weights).sum();
                inputs[[0, n, d]] = orig;
                assert_abs_diff_eq!(grad[[0, n, d]], (plus - minus) / (2.0 * h), epsilon = 1e-2);
            }
        }
    }

    #[test]
    fn four_dim_inputs_keep_batch_and_time() {
        let mut rng = fastrand::Rng::with_seed(1);
        let mut learner = TokenLearner::new(4, 2, 8, 0.0, &mut rng);
        let inputs = Array4::from_elem((2, 3, 6, 4), 0.5f32);
        let (out, cache) = learner.forward_4d(inputs.view(), false, &mut rng).unwrap();
        assert_eq!(out.dim(), (2, 3, 2, 4));
        let grad = learner.backward_4d(&cache, Array4::ones((2, 3, 2, 4)).view()).unwrap();
        assert_eq!(grad.dim(), (2, 3, 6, 4));
    }
}
