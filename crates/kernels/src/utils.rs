//! Shared helpers for kernel implementations.

use crate::config::ActivationKind;
use anyhow::{ensure, Result};
use ndarray::{Array2, ArrayView2, ArrayViewMut2, Axis, Zip};
use rayon::prelude::*;

const GELU_C: f32 = 0.797_884_6; // sqrt(2 / pi)

pub fn ensure_same_shape(lhs: &ArrayView2<'_, f32>, rhs: &ArrayView2<'_, f32>, what: &str) -> Result<()> {
    ensure!(
        lhs.dim() == rhs.dim(),
        "{} shape mismatch: {:?} vs {:?}",
        what,
        lhs.dim(),
        rhs.dim()
    );
    Ok(())
}

/// Approximate GELU (tanh formulation).
pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + (GELU_C * (x + 0.044715 * x.powi(3))).tanh())
}

pub fn gelu_grad(x: f32) -> f32 {
    let inner = GELU_C * (x + 0.044715 * x.powi(3));
    let tanh = inner.tanh();
    let sech2 = 1.0 - tanh * tanh;
    0.5 * (1.0 + tanh) + 0.5 * x * sech2 * GELU_C * (1.0 + 3.0 * 0.044715 * x * x)
}

pub fn apply_activation(mut output: Array2<f32>, activation: ActivationKind) -> Array2<f32> {
    match activation {
        ActivationKind::None => {}
        ActivationKind::Relu => output.mapv_inplace(|x| x.max(0.0)),
        ActivationKind::Gelu => output.mapv_inplace(gelu),
    }
    output
}

/// Gradient through an activation given its pre-activation input.
pub fn activation_backward(
    pre_activation: ArrayView2<'_, f32>,
    grad_output: ArrayView2<'_, f32>,
    activation: ActivationKind,
) -> Result<Array2<f32>> {
    ensure_same_shape(&pre_activation, &grad_output, "activation gradient")?;
    let mut grad = grad_output.to_owned();
    match activation {
        ActivationKind::None => {}
        ActivationKind::Relu => Zip::from(&mut grad)
            .and(&pre_activation)
            .for_each(|g, &x| {
                if x <= 0.0 {
                    *g = 0.0;
                }
            }),
        ActivationKind::Gelu => Zip::from(&mut grad)
            .and(&pre_activation)
            .for_each(|g, &x| *g *= gelu_grad(x)),
    }
    Ok(grad)
}

pub fn softmax_inplace(mut scores: ArrayViewMut2<'_, f32>) {
    scores
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| {
            let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            row -= max;
            row.mapv_inplace(|x| x.exp());
            let sum = row.sum();
            row /= sum.max(f32::EPSILON);
        });
}

/// Row softmax restricted to columns where `mask` is true.
///
/// Masked entries get probability zero. A row with no allowed column becomes
/// all zeros instead of a uniform distribution over masked entries.
pub fn masked_softmax_inplace(
    mut scores: ArrayViewMut2<'_, f32>,
    mask: ArrayView2<'_, bool>,
) -> Result<()> {
    ensure!(
        scores.dim() == mask.dim(),
        "mask shape {:?} incompatible with scores {:?}",
        mask.dim(),
        scores.dim()
    );
    Zip::from(scores.rows_mut())
        .and(mask.rows())
        .par_for_each(|mut row, allowed| {
            let max = row
                .iter()
                .zip(allowed.iter())
                .filter(|(_, &ok)| ok)
                .map(|(&x, _)| x)
                .fold(f32::NEG_INFINITY, f32::max);
            if max == f32::NEG_INFINITY {
                row.fill(0.0);
                return;
            }
            let mut sum = 0.0f32;
            for (value, &ok) in row.iter_mut().zip(allowed.iter()) {
                *value = if ok { (*value - max).exp() } else { 0.0 };
                sum += *value;
            }
            row /= sum.max(f32::EPSILON);
        });
    Ok(())
}

/// Backward pass of a row softmax: `dx = p * (dp - sum(dp * p))`.
pub fn softmax_backward(
    probs: ArrayView2<'_, f32>,
    grad_probs: ArrayView2<'_, f32>,
) -> Result<Array2<f32>> {
    ensure_same_shape(&probs, &grad_probs, "softmax gradient")?;
    let mut grad = Array2::<f32>::zeros(probs.dim());
    Zip::from(grad.rows_mut())
        .and(probs.rows())
        .and(grad_probs.rows())
        .par_for_each(|mut out, p, dp| {
            let dot = p.dot(&dp);
            Zip::from(&mut out)
                .and(&p)
                .and(&dp)
                .for_each(|o, &p, &dp| *o = p * (dp - dot));
        });
    Ok(grad)
}
