//! Basic layers: dense, layer norm, embedding, dropout and the MLP block.
//!
//! Layers keep their parameters in [`Param`]s. `forward` never mutates the
//! layer; `backward` consumes whatever the caller kept from `forward`,
//! accumulates parameter gradients and returns the input gradient.

use crate::param::{scoped, uniform_limit_for_std, xavier_limit, Param, ParamMut, Parameterized};
use anyhow::{bail, ensure, Context, Result};
use ndarray::{Array, Array2, ArrayView, ArrayView2, Dimension, Ix1, Ix2, Zip};
use policyforge_kernels::{
    activation_backward, apply_activation, layer_norm_backward, layer_norm_forward,
    linear_backward, linear_forward, ActivationKind, LayerNormCache,
};

/// Flattens every axis but the last into rows.
pub fn as_rows<D: Dimension>(x: &ArrayView<'_, f32, D>) -> Result<Array2<f32>> {
    let width = *x.shape().last().context("cannot flatten a scalar")?;
    let rows = if width == 0 { 0 } else { x.len() / width };
    Ok(x.to_shape((rows, width))?.into_owned())
}

/// Inverse of [`as_rows`]: reshapes rows back to `shape` with the last axis replaced by `width`.
pub fn from_rows<D: Dimension>(rows: Array2<f32>, shape: &D, width: usize) -> Result<Array<f32, D>> {
    let mut dim = shape.clone();
    let last = dim.ndim() - 1;
    dim[last] = width;
    Ok(rows.into_shape_with_order(dim)?)
}

#[derive(Debug, Clone)]
pub struct Linear {
    pub kernel: Param<Ix2>,
    pub bias: Option<Param<Ix1>>,
}

impl Linear {
    pub fn new(in_dim: usize, out_dim: usize, use_bias: bool, rng: &mut fastrand::Rng) -> Self {
        Self {
            kernel: Param::uniform((in_dim, out_dim), xavier_limit(in_dim, out_dim), rng),
            bias: use_bias.then(|| Param::zeros(out_dim)),
        }
    }

    pub fn in_dim(&self) -> usize {
        self.kernel.value.nrows()
    }

    pub fn out_dim(&self) -> usize {
        self.kernel.value.ncols()
    }

    pub fn forward(&self, input: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        linear_forward(
            input,
            self.kernel.value.view(),
            self.bias.as_ref().map(|b| b.value.view()),
        )
    }

    pub fn backward(
        &mut self,
        input: ArrayView2<'_, f32>,
        grad_output: ArrayView2<'_, f32>,
    ) -> Result<Array2<f32>> {
        let grads = linear_backward(input, self.kernel.value.view(), grad_output)?;
        self.kernel.accumulate(&grads.kernel)?;
        if let Some(bias) = self.bias.as_mut() {
            bias.accumulate(&grads.bias)?;
        }
        Ok(grads.input)
    }

    /// Applies the layer to the last axis of an arbitrary-rank input.
    pub fn forward_nd<D: Dimension>(&self, input: ArrayView<'_, f32, D>) -> Result<Array<f32, D>> {
        let rows = as_rows(&input)?;
        let output = self.forward(rows.view())?;
        from_rows(output, &input.raw_dim(), self.out_dim())
    }

    pub fn backward_nd<D: Dimension>(
        &mut self,
        input: ArrayView<'_, f32, D>,
        grad_output: ArrayView<'_, f32, D>,
    ) -> Result<Array<f32, D>> {
        let rows = as_rows(&input)?;
        let grad_rows = as_rows(&grad_output)?;
        let grad_input = self.backward(rows.view(), grad_rows.view())?;
        from_rows(grad_input, &input.raw_dim(), self.in_dim())
    }
}

impl Parameterized for Linear {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, ParamMut<'_>)) {
        visitor(&scoped(prefix, "kernel"), self.kernel.as_mut());
        if let Some(bias) = self.bias.as_mut() {
            visitor(&scoped(prefix, "bias"), bias.as_mut());
        }
    }
}

#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub scale: Param<Ix1>,
    pub bias: Param<Ix1>,
    pub epsilon: f32,
}

impl LayerNorm {
    pub fn new(dim: usize) -> Self {
        Self {
            scale: Param::new(Array::ones(dim)),
            bias: Param::zeros(dim),
            epsilon: 1e-6,
        }
    }

    pub fn forward(&self, input: ArrayView2<'_, f32>) -> Result<(Array2<f32>, LayerNormCache)> {
        layer_norm_forward(input, self.scale.value.view(), self.bias.value.view(), self.epsilon)
    }

    pub fn backward(
        &mut self,
        cache: &LayerNormCache,
        grad_output: ArrayView2<'_, f32>,
    ) -> Result<Array2<f32>> {
        let grads = layer_norm_backward(cache, self.scale.value.view(), grad_output)?;
        self.scale.accumulate(&grads.gamma)?;
        self.bias.accumulate(&grads.beta)?;
        Ok(grads.input)
    }
}

impl Parameterized for LayerNorm {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, ParamMut<'_>)) {
        visitor(&scoped(prefix, "scale"), self.scale.as_mut());
        visitor(&scoped(prefix, "bias"), self.bias.as_mut());
    }
}

#[derive(Debug, Clone)]
pub struct Embedding {
    pub table: Param<Ix2>,
}

impl Embedding {
    pub fn new(num_embeddings: usize, dim: usize, rng: &mut fastrand::Rng) -> Self {
        Self {
            table: Param::uniform((num_embeddings, dim), uniform_limit_for_std(0.02), rng),
        }
    }

    pub fn num_embeddings(&self) -> usize {
        self.table.value.nrows()
    }

    pub fn dim(&self) -> usize {
        self.table.value.ncols()
    }

    pub fn forward(&self, ids: &[usize]) -> Result<Array2<f32>> {
        let vocab = self.num_embeddings();
        if let Some(&bad) = ids.iter().find(|&&id| id >= vocab) {
            bail!("embedding id {} out of range for table of {}", bad, vocab);
        }
        let mut output = Array2::<f32>::zeros((ids.len(), self.dim()));
        for (mut row, &id) in output.rows_mut().into_iter().zip(ids) {
            row.assign(&self.table.value.row(id));
        }
        Ok(output)
    }

    pub fn backward(&mut self, ids: &[usize], grad_output: ArrayView2<'_, f32>) -> Result<()> {
        ensure!(
            grad_output.dim() == (ids.len(), self.dim()),
            "embedding gradient {:?} does not match {} ids of width {}",
            grad_output.dim(),
            ids.len(),
            self.dim()
        );
        for (row, &id) in grad_output.rows().into_iter().zip(ids) {
            let mut target = self.table.grad.row_mut(id);
            target += &row;
        }
        Ok(())
    }
}

impl Parameterized for Embedding {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, ParamMut<'_>)) {
        visitor(&scoped(prefix, "embedding"), self.table.as_mut());
    }
}

/// Inverted dropout. The mask stores `0` or `1 / keep` per element.
#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    pub rate: f32,
}

impl Dropout {
    pub fn new(rate: f32) -> Self {
        Self { rate }
    }

    pub fn forward<D: Dimension>(
        &self,
        input: Array<f32, D>,
        train: bool,
        rng: &mut fastrand::Rng,
    ) -> (Array<f32, D>, Option<Array<f32, D>>) {
        if !train || self.rate <= 0.0 {
            return (input, None);
        }
        let keep = 1.0 - self.rate;
        let mask = Array::from_shape_simple_fn(input.raw_dim(), || {
            if rng.f32() < keep {
                1.0 / keep
            } else {
                0.0
            }
        });
        (input * &mask, Some(mask))
    }

    pub fn backward<D: Dimension>(
        mask: Option<&Array<f32, D>>,
        grad_output: Array<f32, D>,
    ) -> Array<f32, D> {
        match mask {
            Some(mask) => grad_output * mask,
            None => grad_output,
        }
    }
}

/// Dense → activation → dropout → dense → dropout.
#[derive(Debug, Clone)]
pub struct MlpBlock {
    pub dense_in: Linear,
    pub dense_out: Linear,
    pub activation: ActivationKind,
    pub dropout: Dropout,
}

#[derive(Debug, Clone)]
pub struct MlpCache {
    input: Array2<f32>,
    pre_activation: Array2<f32>,
    hidden: Array2<f32>,
    hidden_dropout: Option<Array2<f32>>,
    output_dropout: Option<Array2<f32>>,
}

impl MlpBlock {
    pub fn new(
        in_dim: usize,
        mlp_dim: usize,
        out_dim: usize,
        dropout_rate: f32,
        rng: &mut fastrand::Rng,
    ) -> Self {
        Self {
            dense_in: Linear::new(in_dim, mlp_dim, true, rng),
            dense_out: Linear::new(mlp_dim, out_dim, true, rng),
            activation: ActivationKind::Gelu,
            dropout: Dropout::new(dropout_rate),
        }
    }

    pub fn with_activation(mut self, activation: ActivationKind) -> Self {
        self.activation = activation;
        self
    }

    pub fn forward(
        &self,
        input: ArrayView2<'_, f32>,
        train: bool,
        rng: &mut fastrand::Rng,
    ) -> Result<(Array2<f32>, MlpCache)> {
        let pre_activation = self.dense_in.forward(input)?;
        let activated = apply_activation(pre_activation.clone(), self.activation);
        let (hidden, hidden_dropout) = self.dropout.forward(activated, train, rng);
        let output = self.dense_out.forward(hidden.view())?;
        let (output, output_dropout) = self.dropout.forward(output, train, rng);
        Ok((
            output,
            MlpCache {
                input: input.to_owned(),
                pre_activation,
                hidden,
                hidden_dropout,
                output_dropout,
            },
        ))
    }

    pub fn backward(&mut self, cache: &MlpCache, grad_output: Array2<f32>) -> Result<Array2<f32>> {
        let grad = Dropout::backward(cache.output_dropout.as_ref(), grad_output);
        let grad_hidden = self.dense_out.backward(cache.hidden.view(), grad.view())?;
        let grad_hidden = Dropout::backward(cache.hidden_dropout.as_ref(), grad_hidden);
        let grad_pre =
            activation_backward(cache.pre_activation.view(), grad_hidden.view(), self.activation)?;
        self.dense_in.backward(cache.input.view(), grad_pre.view())
    }
}

impl Parameterized for MlpBlock {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, ParamMut<'_>)) {
        self.dense_in.visit_params(&scoped(prefix, "dense_0"), visitor);
        self.dense_out.visit_params(&scoped(prefix, "dense_1"), visitor);
    }
}

/// Adds `grad` into `acc` elementwise, used when several branches feed one tensor.
pub fn add_into<D: Dimension>(acc: &mut Array<f32, D>, grad: &Array<f32, D>) {
    Zip::from(acc).and(grad).for_each(|a, &g| *a += g);
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array3, Axis};

    #[test]
    fn forward_nd_matches_row_application() {
        let mut rng = fastrand::Rng::with_seed(3);
        let layer = Linear::new(4, 3, true, &mut rng);
        let input = Array3::from_shape_fn((2, 5, 4), |(a, b, c)| (a + b * c) as f32 * 0.1);
        let output = layer.forward_nd(input.view()).unwrap();
        assert_eq!(output.shape(), &[2, 5, 3]);

        let row = layer
            .forward(input.index_axis(Axis(0), 1).view())
            .unwrap();
        for j in 0..3 {
            assert_abs_diff_eq!(output[[1, 2, j]], row[[2, j]], epsilon = 1e-6);
        }
    }

    #[test]
    fn embedding_gradient_accumulates_per_id() {
        let mut rng = fastrand::Rng::with_seed(0);
        let mut table = Embedding::new(5, 2, &mut rng);
        let grad = Array2::from_elem((3, 2), 1.0f32);
        table.backward(&[1, 1, 4], grad.view()).unwrap();
        assert_eq!(table.table.grad[[1, 0]], 2.0);
        assert_eq!(table.table.grad[[4, 1]], 1.0);
        assert_eq!(table.table.grad[[0, 0]], 0.0);
        assert!(table.forward(&[5]).is_err());
    }

    #[test]
    fn dropout_is_identity_at_eval_and_preserves_scale_in_training() {
        let mut rng = fastrand::Rng::with_seed(11);
        let dropout = Dropout::new(0.25);
        let input = Array2::<f32>::ones((64, 64));
        let (eval, mask) = dropout.forward(input.clone(), false, &mut rng);
        assert!(mask.is_none());
        assert_eq!(eval, input);

        let (train, mask) = dropout.forward(input, true, &mut rng);
        assert!(mask.is_some());
        let mean = train.mean().unwrap();
        assert_abs_diff_eq!(mean, 1.0, epsilon = 0.05);
    }

    #[test]
    fn mlp_input_gradient_matches_finite_difference() {
        let mut rng = fastrand::Rng::with_seed(5);
        let mut mlp = MlpBlock::new(3, 6, 2, 0.0, &mut rng);
        let mut input = Array2::from_shape_fn((2, 3), |(i, j)| (i as f32 - j as f32) * 0.4);
        let weights = Array2::from_shape_fn((2, 2), |(i, j)| 1.0 + i as f32 - 0.5 * j as f32);

        let (_, cache) = mlp.forward(input.view(), false, &mut rng).unwrap();
        let grad = mlp.backward(&cache, weights.clone()).unwrap();

        let h = 1e-2;
        for i in 0..2 {
            for j in 0..3 {
                let orig = input[[i, j]];
                input[[i, j]] = orig + h;
                let plus = (mlp.forward(input.view(), false, &mut rng).unwrap().0 * &weights).sum();
                input[[i, j]] = orig - h;
                let minus = (mlp.forward(input.view(), false, &mut rng).unwrap().0 * &weights).sum();
                input[[i, j]] = orig;
                assert_abs_diff_eq!(grad[[i, j]], (plus - minus) / (2.0 * h), epsilon = 5e-3);
            }
        }
    }
}
