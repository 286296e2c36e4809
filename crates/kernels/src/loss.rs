//! Supervised losses.

use crate::utils::softmax_inplace;
use anyhow::{bail, ensure, Result};
use ndarray::{Array2, ArrayView2, Axis};

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: f32,
    /// Gradient of `loss` with respect to the loss input.
    pub grad: Array2<f32>,
}

/// Weighted mean cross-entropy over rows of `logits`.
///
/// Rows with zero weight contribute neither loss nor gradient. When every
/// weight is zero the loss is zero.
pub fn softmax_cross_entropy(
    logits: ArrayView2<'_, f32>,
    targets: &[usize],
    weights: &[f32],
) -> Result<(LossOutput, Array2<f32>)> {
    let (rows, classes) = logits.dim();
    ensure!(
        targets.len() == rows && weights.len() == rows,
        "expected {} targets and weights, got {} and {}",
        rows,
        targets.len(),
        weights.len()
    );
    if let Some(&bad) = targets.iter().find(|&&t| t >= classes) {
        bail!("target class {} out of range for {} classes", bad, classes);
    }

    let mut probs = logits.to_owned();
    softmax_inplace(probs.view_mut());

    let total_weight: f32 = weights.iter().sum();
    let norm = if total_weight > 0.0 { 1.0 / total_weight } else { 0.0 };

    let mut loss = 0.0f32;
    let mut grad = probs.clone();
    for (row, (mut g, (&target, &weight))) in grad
        .axis_iter_mut(Axis(0))
        .zip(targets.iter().zip(weights))
        .enumerate()
    {
        loss -= weight * probs[[row, target]].max(1e-12).ln();
        g[target] -= 1.0;
        g *= weight * norm;
    }

    Ok((
        LossOutput {
            loss: loss * norm,
            grad,
        },
        probs,
    ))
}

/// Weighted mean squared error, averaged over weighted elements.
pub fn mean_squared_error(
    prediction: ArrayView2<'_, f32>,
    target: ArrayView2<'_, f32>,
    weights: &[f32],
) -> Result<LossOutput> {
    ensure!(
        prediction.dim() == target.dim(),
        "prediction {:?} and target {:?} differ in shape",
        prediction.dim(),
        target.dim()
    );
    ensure!(
        weights.len() == prediction.nrows(),
        "expected {} weights, got {}",
        prediction.nrows(),
        weights.len()
    );
    let cols = prediction.ncols() as f32;
    let total_weight: f32 = weights.iter().sum::<f32>() * cols;
    let norm = if total_weight > 0.0 { 1.0 / total_weight } else { 0.0 };

    let mut diff = &prediction - &target;
    let mut loss = 0.0f32;
    for (mut row, &weight) in diff.axis_iter_mut(Axis(0)).zip(weights) {
        loss += weight * row.iter().map(|d| d * d).sum::<f32>();
        row *= 2.0 * weight * norm;
    }
    Ok(LossOutput {
        loss: loss * norm,
        grad: diff,
    })
}
