//! Multi-head self-attention over token sequences.

use crate::nn::{Dropout, Linear};
use crate::param::{scoped, ParamMut, Parameterized};
use anyhow::{ensure, Result};
use ndarray::{s, Array2, ArrayView2, ArrayView3};
use policyforge_kernels::{attention_backward, attention_probs};

#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    pub query: Linear,
    pub key: Linear,
    pub value: Linear,
    pub out: Linear,
    pub num_heads: usize,
    pub dropout: Dropout,
}

/// Activations kept for [`MultiHeadAttention::backward`].
#[derive(Debug, Clone)]
pub struct AttentionCache {
    batch: usize,
    seq_len: usize,
    input: Array2<f32>,
    query: Array2<f32>,
    key: Array2<f32>,
    value: Array2<f32>,
    context: Array2<f32>,
    /// Softmax probabilities and dropout factors, indexed `batch * heads + head`.
    probs: Vec<Array2<f32>>,
    dropout: Vec<Option<Array2<f32>>>,
}

impl MultiHeadAttention {
    pub fn new(dim: usize, num_heads: usize, dropout_rate: f32, rng: &mut fastrand::Rng) -> Result<Self> {
        ensure!(num_heads > 0, "attention needs at least one head");
        ensure!(
            dim % num_heads == 0,
            "embedding size {} must be divisible by {} heads",
            dim,
            num_heads
        );
        Ok(Self {
            query: Linear::new(dim, dim, true, rng),
            key: Linear::new(dim, dim, true, rng),
            value: Linear::new(dim, dim, true, rng),
            out: Linear::new(dim, dim, true, rng),
            num_heads,
            dropout: Dropout::new(dropout_rate),
        })
    }

    pub fn head_dim(&self) -> usize {
        self.query.out_dim() / self.num_heads
    }

    /// `input` holds `batch` sequences flattened to `(batch * seq_len, dim)`;
    /// `mask` is `(batch, seq_len, seq_len)` and is shared by all heads.
    pub fn forward(
        &self,
        input: ArrayView2<'_, f32>,
        mask: ArrayView3<'_, bool>,
        train: bool,
        rng: &mut fastrand::Rng,
    ) -> Result<(Array2<f32>, AttentionCache)> {
        let (batch, seq_len, seq_len_k) = mask.dim();
        ensure!(
            seq_len == seq_len_k && batch * seq_len == input.nrows(),
            "attention mask {:?} incompatible with {} input rows",
            mask.dim(),
            input.nrows()
        );

        let query = self.query.forward(input)?;
        let key = self.key.forward(input)?;
        let value = self.value.forward(input)?;

        let head_dim = self.head_dim();
        let scale = 1.0 / (head_dim as f32).sqrt();
        let mut context = Array2::<f32>::zeros(query.dim());
        let mut probs = Vec::with_capacity(batch * self.num_heads);
        let mut dropout = Vec::with_capacity(batch * self.num_heads);

        for b in 0..batch {
            let rows = b * seq_len..(b + 1) * seq_len;
            for h in 0..self.num_heads {
                let cols = h * head_dim..(h + 1) * head_dim;
                let p = attention_probs(
                    query.slice(s![rows.clone(), cols.clone()]),
                    key.slice(s![rows.clone(), cols.clone()]),
                    Some(mask.slice(s![b, .., ..])),
                    scale,
                )?;
                let (dropped, factor) = self.dropout.forward(p.clone(), train, rng);
                context
                    .slice_mut(s![rows.clone(), cols.clone()])
                    .assign(&dropped.dot(&value.slice(s![rows.clone(), cols])));
                probs.push(p);
                dropout.push(factor);
            }
        }

        let output = self.out.forward(context.view())?;
        Ok((
            output,
            AttentionCache {
                batch,
                seq_len,
                input: input.to_owned(),
                query,
                key,
                value,
                context,
                probs,
                dropout,
            },
        ))
    }

    pub fn backward(&mut self, cache: &AttentionCache, grad_output: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        let grad_context = self.out.backward(cache.context.view(), grad_output)?;
        let head_dim = self.head_dim();
        let scale = 1.0 / (head_dim as f32).sqrt();

        let mut grad_query = Array2::<f32>::zeros(cache.query.dim());
        let mut grad_key = Array2::<f32>::zeros(cache.key.dim());
        let mut grad_value = Array2::<f32>::zeros(cache.value.dim());

        for b in 0..cache.batch {
            let rows = b * cache.seq_len..(b + 1) * cache.seq_len;
            for h in 0..self.num_heads {
                let cols = h * head_dim..(h + 1) * head_dim;
                let idx = b * self.num_heads + h;
                let grads = attention_backward(
                    cache.query.slice(s![rows.clone(), cols.clone()]),
                    cache.key.slice(s![rows.clone(), cols.clone()]),
                    cache.value.slice(s![rows.clone(), cols.clone()]),
                    cache.probs[idx].view(),
                    cache.dropout[idx].as_ref().map(|d| d.view()),
                    grad_context.slice(s![rows.clone(), cols.clone()]),
                    scale,
                )?;
                grad_query
                    .slice_mut(s![rows.clone(), cols.clone()])
                    .assign(&grads.query);
                grad_key
                    .slice_mut(s![rows.clone(), cols.clone()])
                    .assign(&grads.key);
                grad_value.slice_mut(s![rows.clone(), cols]).assign(&grads.value);
            }
        }

        let mut grad_input = self.query.backward(cache.input.view(), grad_query.view())?;
        grad_input += &self.key.backward(cache.input.view(), grad_key.view())?;
        grad_input += &self.value.backward(cache.input.view(), grad_value.view())?;
        Ok(grad_input)
    }
}

impl Parameterized for MultiHeadAttention {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, ParamMut<'_>)) {
        self.query.visit_params(&scoped(prefix, "query"), visitor);
        self.key.visit_params(&scoped(prefix, "key"), visitor);
        self.value.visit_params(&scoped(prefix, "value"), visitor);
        self.out.visit_params(&scoped(prefix, "out"), visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    fn causal(batch: usize, n: usize) -> Array3<bool> {
        Array3::from_shape_fn((batch, n, n), |(_, i, j)| j <= i)
    }

    #[test]
    fn rejects_indivisible_heads() {
        let mut rng = fastrand::Rng::with_seed(0);
        assert!(MultiHeadAttention::new(10, 3, 0.0, &mut rng).is_err());
    }

    #[test]
    fn causal_mask_hides_future_tokens() {
        let mut rng = fastrand::Rng::with_seed(1);
        let attn = MultiHeadAttention::new(8, 2, 0.0, &mut rng).unwrap();
        let mask = causal(1, 4);
        let mut input = Array2::from_shape_fn((4, 8), |(i, j)| ((i * 8 + j) as f32 * 0.13).sin());
        let (before, _) = attn.forward(input.view(), mask.view(), false, &mut rng).unwrap();

        input.row_mut(3).fill(5.0);
        let (after, _) = attn.forward(input.view(), mask.view(), false, &mut rng).unwrap();
        for i in 0..3 {
            for j in 0..8 {
                assert_abs_diff_eq!(before[[i, j]], after[[i, j]], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn single_head_matches_the_reference_kernel() {
        let mut rng = fastrand::Rng::with_seed(3);
        let attn = MultiHeadAttention::new(4, 1, 0.0, &mut rng).unwrap();
        let mask = causal(1, 3);
        let input = Array2::from_shape_fn((3, 4), |(i, j)| (i as f32 - j as f32) * 0.25);
        let (out, _) = attn.forward(input.view(), mask.view(), false, &mut rng).unwrap();

        let q = attn.query.forward(input.view()).unwrap();
        let k = attn.key.forward(input.view()).unwrap();
        let v = attn.value.forward(input.view()).unwrap();
        let (context, _) = policyforge_kernels::scaled_dot_product_attention(
            q.view(),
            k.view(),
            v.view(),
            Some(mask.slice(s![0, .., ..])),
            0.5,
        )
        .unwrap();
        let expected = attn.out.forward(context.view()).unwrap();
        for (a, b) in out.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn input_gradient_matches_finite_difference() {
        let mut rng = fastrand::Rng::with_seed(2);
        let mut attn = MultiHeadAttention::new(4, 2, 0.0, &mut rng).unwrap();
        let mask = causal(2, 3);
        let mut input = Array2::from_shape_fn((6, 4), |(i, j)| ((i * 4 + j) as f32 * 0.37).cos());
        let weights = Array2::from_shape_fn((6, 4), |(i, j)| (i as f32 * 0.2) - (j as f32 * 0.1));

        let (_, cache) = attn.forward(input.view(), mask.view(), false, &mut rng).unwrap();
        let grad = attn.backward(&cache, weights.view()).unwrap();

        let h = 1e-2;
        for i in 0..6 {
            for j in 0..4 {
                let orig = input[[i, j]];
                input[[i, j]] = orig + h;
                let plus = (attn.forward(input.view(), mask.view(), false, &mut rng).unwrap().0 * &weights).sum();
                input[[i, j]] = orig - h;
                let minus = (attn.forward(input.view(), mask.view(), false, &mut rng).unwrap().0 * &weights).sum();
                input[[i, j]] = orig;
                assert_abs_diff_eq!(grad[[i, j]], (plus - minus) / (2.0 * h), epsilon = 5e-3);
            }
        }
    }
}
