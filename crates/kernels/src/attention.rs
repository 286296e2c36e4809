//! Attention mechanism kernels.

use crate::utils::{masked_softmax_inplace, softmax_backward, softmax_inplace};
use anyhow::{ensure, Result};
use ndarray::{Array2, ArrayView2};

/// Softmax of scaled query-key scores for a single head.
///
/// `mask[i, j] == true` lets query `i` attend key `j`.
pub fn attention_probs(
    query: ArrayView2<'_, f32>,
    key: ArrayView2<'_, f32>,
    mask: Option<ArrayView2<'_, bool>>,
    scale: f32,
) -> Result<Array2<f32>> {
    ensure!(
        query.ncols() == key.ncols(),
        "query dim {} must match key dim {}",
        query.ncols(),
        key.ncols()
    );
    let mut scores = query.dot(&key.t());
    scores *= scale;

    match mask {
        Some(mask) => masked_softmax_inplace(scores.view_mut(), mask)?,
        None => softmax_inplace(scores.view_mut()),
    }
    Ok(scores)
}

/// Masked scaled dot-product attention for a single head. Returns the attended
/// values together with the attention probabilities.
pub fn scaled_dot_product_attention(
    query: ArrayView2<'_, f32>,
    key: ArrayView2<'_, f32>,
    value: ArrayView2<'_, f32>,
    mask: Option<ArrayView2<'_, bool>>,
    scale: f32,
) -> Result<(Array2<f32>, Array2<f32>)> {
    let scores = attention_probs(query, key, mask, scale)?;
    ensure!(
        scores.ncols() == value.nrows(),
        "scores column count {} differs from value rows {}",
        scores.ncols(),
        value.nrows()
    );
    let output = scores.dot(&value);
    Ok((output, scores))
}

pub struct AttentionGrads {
    pub query: Array2<f32>,
    pub key: Array2<f32>,
    pub value: Array2<f32>,
}

/// Backward pass of [`scaled_dot_product_attention`].
///
/// `dropout` is the elementwise factor (0 or 1/keep) applied to the softmax
/// probabilities before they were multiplied into `value`, if any.
pub fn attention_backward(
    query: ArrayView2<'_, f32>,
    key: ArrayView2<'_, f32>,
    value: ArrayView2<'_, f32>,
    probs: ArrayView2<'_, f32>,
    dropout: Option<ArrayView2<'_, f32>>,
    grad_output: ArrayView2<'_, f32>,
    scale: f32,
) -> Result<AttentionGrads> {
    ensure!(
        grad_output.dim() == (query.nrows(), value.ncols()),
        "output gradient {:?} incompatible with attention output ({}, {})",
        grad_output.dim(),
        query.nrows(),
        value.ncols()
    );
    let mut grad_probs = grad_output.dot(&value.t());
    let grad_value = match dropout {
        Some(dropout) => {
            grad_probs *= &dropout;
            (&probs * &dropout).t().dot(&grad_output)
        }
        None => probs.t().dot(&grad_output),
    };
    let mut grad_scores = softmax_backward(probs, grad_probs.view())?;
    grad_scores *= scale;

    Ok(AttentionGrads {
        query: grad_scores.dot(&key),
        key: grad_scores.t().dot(&query),
        value: grad_value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    fn inputs() -> (Array2<f32>, Array2<f32>, Array2<f32>) {
        let q = Array2::from_shape_fn((3, 4), |(i, j)| ((i * 4 + j) as f32 * 0.31).sin());
        let k = Array2::from_shape_fn((3, 4), |(i, j)| ((i * 4 + j) as f32 * 0.17).cos());
        let v = Array2::from_shape_fn((3, 2), |(i, j)| (i as f32 - j as f32) * 0.5);
        (q, k, v)
    }

    fn causal_mask(n: usize) -> Array2<bool> {
        Array2::from_shape_fn((n, n), |(i, j)| j <= i)
    }

    #[test]
    fn first_query_under_causal_mask_copies_first_value() {
        let (q, k, v) = inputs();
        let mask = causal_mask(3);
        let (out, probs) =
            scaled_dot_product_attention(q.view(), k.view(), v.view(), Some(mask.view()), 0.5)
                .unwrap();
        assert_abs_diff_eq!(probs[[0, 0]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(out[[0, 1]], v[[0, 1]], epsilon = 1e-6);
    }

    #[test]
    fn probabilities_respect_the_mask() {
        let (q, k, _) = inputs();
        let mask = causal_mask(3);
        let probs = attention_probs(q.view(), k.view(), Some(mask.view()), 0.5).unwrap();
        for i in 0..3 {
            assert_abs_diff_eq!(probs.row(i).sum(), 1.0, epsilon = 1e-6);
            for j in i + 1..3 {
                assert_eq!(probs[[i, j]], 0.0);
            }
        }
    }

    #[test]
    fn query_gradient_matches_finite_difference() {
        let (mut q, k, v) = inputs();
        let mask = causal_mask(3);
        let scale = 0.5;
        let loss = |q: &Array2<f32>| -> f32 {
            let (out, _) =
                scaled_dot_product_attention(q.view(), k.view(), v.view(), Some(mask.view()), scale)
                    .unwrap();
            out.iter().enumerate().map(|(i, x)| x * (i as f32 + 1.0)).sum()
        };

        let (out, probs) =
            scaled_dot_product_attention(q.view(), k.view(), v.view(), Some(mask.view()), scale)
                .unwrap();
        let grad_out = Array2::from_shape_fn(out.dim(), |(i, j)| (i * out.ncols() + j) as f32 + 1.0);
        let grads = attention_backward(
            q.view(),
            k.view(),
            v.view(),
            probs.view(),
            None,
            grad_out.view(),
            scale,
        )
        .unwrap();

        let h = 1e-2;
        for i in 0..3 {
            for j in 0..4 {
                let orig = q[[i, j]];
                q[[i, j]] = orig + h;
                let plus = loss(&q);
                q[[i, j]] = orig - h;
                let minus = loss(&q);
                q[[i, j]] = orig;
                assert_abs_diff_eq!(grads.query[[i, j]], (plus - minus) / (2.0 * h), epsilon = 5e-3);
            }
        }
    }
}
