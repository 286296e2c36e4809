//! Pre-LN transformer encoder without built-in position embeddings.

use crate::attention::{AttentionCache, MultiHeadAttention};
use crate::config::TransformerConfig;
use crate::nn::{as_rows, from_rows, Dropout, LayerNorm, MlpBlock, MlpCache};
use crate::param::{scoped, ParamMut, Parameterized};
use anyhow::{ensure, Result};
use ndarray::{Array2, Array3, ArrayView3};
use policyforge_kernels::LayerNormCache;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct EncoderBlock {
    pub attention_norm: LayerNorm,
    pub attention: MultiHeadAttention,
    pub mlp_norm: LayerNorm,
    pub mlp: MlpBlock,
    pub dropout: Dropout,
}

#[derive(Debug, Clone)]
pub struct EncoderBlockCache {
    attention_norm: LayerNormCache,
    attention: AttentionCache,
    attention_dropout: Option<Array2<f32>>,
    mlp_norm: LayerNormCache,
    mlp: MlpCache,
}

impl EncoderBlock {
    pub fn new(dim: usize, config: &TransformerConfig, rng: &mut fastrand::Rng) -> Result<Self> {
        Ok(Self {
            attention_norm: LayerNorm::new(dim),
            attention: MultiHeadAttention::new(
                dim,
                config.num_attention_heads,
                config.attention_dropout_rate,
                rng,
            )?,
            mlp_norm: LayerNorm::new(dim),
            mlp: MlpBlock::new(dim, config.mlp_dim, dim, config.dropout_rate, rng)
                .with_activation(config.activation),
            dropout: Dropout::new(config.dropout_rate),
        })
    }

    /// `input` is `(batch * seq_len, dim)`; see [`MultiHeadAttention::forward`].
    pub fn forward(
        &self,
        input: Array2<f32>,
        mask: ArrayView3<'_, bool>,
        train: bool,
        rng: &mut fastrand::Rng,
    ) -> Result<(Array2<f32>, EncoderBlockCache)> {
        let (normed, attention_norm) = self.attention_norm.forward(input.view())?;
        let (attended, attention) = self.attention.forward(normed.view(), mask, train, rng)?;
        let (attended, attention_dropout) = self.dropout.forward(attended, train, rng);
        let residual = input + &attended;

        let (normed, mlp_norm) = self.mlp_norm.forward(residual.view())?;
        let (mlp_out, mlp) = self.mlp.forward(normed.view(), train, rng)?;
        let output = residual + &mlp_out;

        Ok((
            output,
            EncoderBlockCache {
                attention_norm,
                attention,
                attention_dropout,
                mlp_norm,
                mlp,
            },
        ))
    }

    pub fn backward(&mut self, cache: &EncoderBlockCache, grad_output: Array2<f32>) -> Result<Array2<f32>> {
        let grad_normed = self.mlp.backward(&cache.mlp, grad_output.clone())?;
        let grad_residual = grad_output + &self.mlp_norm.backward(&cache.mlp_norm, grad_normed.view())?;

        let grad_attended = Dropout::backward(cache.attention_dropout.as_ref(), grad_residual.clone());
        let grad_normed = self.attention.backward(&cache.attention, grad_attended.view())?;
        let grad_input =
            grad_residual + &self.attention_norm.backward(&cache.attention_norm, grad_normed.view())?;
        Ok(grad_input)
    }
}

impl Parameterized for EncoderBlock {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, ParamMut<'_>)) {
        self.attention_norm.visit_params(&scoped(prefix, "attention_norm"), visitor);
        self.attention.visit_params(&scoped(prefix, "attention"), visitor);
        self.mlp_norm.visit_params(&scoped(prefix, "mlp_norm"), visitor);
        self.mlp.visit_params(&scoped(prefix, "mlp"), visitor);
    }
}

#[derive(Debug, Clone)]
pub struct Transformer {
    pub layers: Vec<EncoderBlock>,
    pub encoder_norm: LayerNorm,
    pub input_dropout: Dropout,
}

#[derive(Debug, Clone)]
pub struct TransformerCache {
    shape: (usize, usize, usize),
    input_dropout: Option<Array2<f32>>,
    layers: Vec<EncoderBlockCache>,
    encoder_norm: LayerNormCache,
}

impl Transformer {
    pub fn new(dim: usize, config: &TransformerConfig, rng: &mut fastrand::Rng) -> Result<Self> {
        let layers = (0..config.num_layers)
            .map(|_| EncoderBlock::new(dim, config, rng))
            .collect::<Result<Vec<_>>>()?;
        debug!(
            layers = config.num_layers,
            activation = config.activation.name(),
            "built transformer"
        );
        Ok(Self {
            layers,
            encoder_norm: LayerNorm::new(dim),
            input_dropout: Dropout::new(config.dropout_rate),
        })
    }

    pub fn dim(&self) -> usize {
        self.encoder_norm.scale.value.len()
    }

    /// Runs `(batch, seq_len, dim)` tokens under a `(batch, seq_len, seq_len)` mask.
    pub fn forward(
        &self,
        tokens: ArrayView3<'_, f32>,
        mask: ArrayView3<'_, bool>,
        train: bool,
        rng: &mut fastrand::Rng,
    ) -> Result<(Array3<f32>, TransformerCache)> {
        let shape = tokens.dim();
        ensure!(
            shape.2 == self.dim(),
            "token width {} does not match transformer width {}",
            shape.2,
            self.dim()
        );
        ensure!(
            mask.dim() == (shape.0, shape.1, shape.1),
            "attention mask {:?} does not match {} sequences of {} tokens",
            mask.dim(),
            shape.0,
            shape.1
        );

        let (mut hidden, input_dropout) = self.input_dropout.forward(as_rows(&tokens)?, train, rng);
        let mut layer_caches = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (next, cache) = layer.forward(hidden, mask, train, rng)?;
            hidden = next;
            layer_caches.push(cache);
        }
        let (output, encoder_norm) = self.encoder_norm.forward(hidden.view())?;
        let output = from_rows(output, &tokens.raw_dim(), shape.2)?;

        Ok((
            output,
            TransformerCache {
                shape,
                input_dropout,
                layers: layer_caches,
                encoder_norm,
            },
        ))
    }

    pub fn backward(&mut self, cache: &TransformerCache, grad_output: ArrayView3<'_, f32>) -> Result<Array3<f32>> {
        ensure!(
            grad_output.dim() == cache.shape,
            "output gradient {:?} does not match forward shape {:?}",
            grad_output.dim(),
            cache.shape
        );
        let mut grad = self
            .encoder_norm
            .backward(&cache.encoder_norm, as_rows(&grad_output)?.view())?;
        for (layer, layer_cache) in self.layers.iter_mut().zip(&cache.layers).rev() {
            grad = layer.backward(layer_cache, grad)?;
        }
        let grad = Dropout::backward(cache.input_dropout.as_ref(), grad);
        let (batch, seq_len, dim) = cache.shape;
        Ok(grad.into_shape_with_order((batch, seq_len, dim))?)
    }
}

impl Parameterized for Transformer {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, ParamMut<'_>)) {
        for (idx, layer) in self.layers.iter_mut().enumerate() {
            layer.visit_params(&scoped(prefix, &format!("layers.{idx}")), visitor);
        }
        self.encoder_norm.visit_params(&scoped(prefix, "encoder_norm"), visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use policyforge_kernels::ActivationKind;

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
    fn output_rows_are_layer_normalized() {
        let mut rng = fastrand::Rng::with_seed(4);
        let transformer = Transformer::new(8, &config(), &mut rng).unwrap();
        let tokens = Array3::from_shape_fn((2, 3, 8), |(b, n, d)| (b + n * d) as f32 * 0.05);
        let mask = ndarray::Array3::from_elem((2, 3, 3), true);
        let (out, _) = transformer.forward(tokens.view(), mask.view(), false, &mut rng).unwrap();
        assert_eq!(out.dim(), (2, 3, 8));
        let mean: f32 = out.slice(ndarray::s![1, 2, ..]).mean().unwrap();
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-4);
    }

    #[test]
    fn mlp_activation_follows_config() {
        let relu = TransformerConfig {
            activation: ActivationKind::Relu,
            ..config()
        };
        let gelu_model = Transformer::new(8, &config(), &mut fastrand::Rng::with_seed(5)).unwrap();
        let relu_model = Transformer::new(8, &relu, &mut fastrand::Rng::with_seed(5)).unwrap();
        assert!(relu_model.layers.iter().all(|l| l.mlp.activation == ActivationKind::Relu));

        let mut rng = fastrand::Rng::with_seed(0);
        let tokens = Array3::from_shape_fn((1, 3, 8), |(_, n, d)| ((n * 8 + d) as f32 * 0.3).cos());
        let mask = Array3::from_elem((1, 3, 3), true);
        let (a, _) = gelu_model.forward(tokens.view(), mask.view(), false, &mut rng).unwrap();
        let (b, _) = relu_model.forward(tokens.view(), mask.view(), false, &mut rng).unwrap();
        let diff: f32 = (&a - &b).mapv(f32::abs).sum();
        assert!(diff > 1e-4);
    }

    #[test]
    fn input_gradient_matches_finite_difference() {
        let mut rng = fastrand::Rng::with_seed(8);
        let mut transformer = Transformer::new(4, &config(), &mut rng).unwrap();
        let mask = Array3::from_shape_fn((1, 3, 3), |(_, i, j)| j <= i);
        let mut tokens = Array3::from_shape_fn((1, 3, 4), |(_, n, d)| ((n * 4 + d) as f32 * 0.7).sin());
        let weights = Array3::from_shape_fn((1, 3, 4), |(_, n, d)| n as f32 * 0.3 - d as f32 * 0.2 + 0.1);

        let (_, cache) = transformer.forward(tokens.view(), mask.view(), false, &mut rng).unwrap();
        let grad = transformer.backward(&cache, weights.view()).unwrap();

        let h = 1e-2;
        for n in 0..3 {
            for d in 0..4 {
                let orig = tokens[[0, n, d]];
                tokens[[0, n, d]] = orig + h;
                let plus = (transformer.forward(tokens.view(), mask.view(), false, &mut rng).unwrap().0 * &weights).sum();
                tokens[[0, n, d]] = orig - h;
                let minus = (transformer.forward(tokens.view(), mask.view(), false, &mut rng).unwrap().0 * &weights).sum();
                tokens[[0, n, d]] = orig;
                assert_abs_diff_eq!(grad[[0, n, d]], (plus - minus) / (2.0 * h), epsilon = 1e-2);
            }
        }
    }
}
