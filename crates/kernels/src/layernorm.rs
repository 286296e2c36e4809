//! Layer normalization kernels.

use anyhow::ensure;
use anyhow::Result;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};

/// Values saved by [`layer_norm_forward`] for the backward pass.
#[derive(Debug, Clone)]
pub struct LayerNormCache {
    pub normalized: Array2<f32>,
    pub inv_std: Array1<f32>,
}

pub struct LayerNormGrads {
    pub input: Array2<f32>,
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
}

pub fn layer_norm_forward(
    data: ArrayView2<'_, f32>,
    gamma: ArrayView1<'_, f32>,
    beta: ArrayView1<'_, f32>,
    epsilon: f32,
) -> Result<(Array2<f32>, LayerNormCache)> {
    let feature_dim = data.len_of(Axis(1));
    ensure!(
        gamma.len() == feature_dim,
        "gamma length {} must equal feature dimension {}",
        gamma.len(),
        feature_dim
    );
    ensure!(
        beta.len() == feature_dim,
        "beta length {} must equal feature dimension {}",
        beta.len(),
        feature_dim
    );

    let mut normalized = data.to_owned();
    let mut inv_std = Array1::<f32>::zeros(data.nrows());

    Zip::from(normalized.rows_mut())
        .and(&mut inv_std)
        .par_for_each(|mut row, inv| {
            let len = row.len() as f32;
            let mean = row.iter().sum::<f32>() / len;
            let var = row.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / len;
            *inv = 1.0 / (var + epsilon).sqrt();
            let scale = *inv;
            row.mapv_inplace(|x| (x - mean) * scale);
        });

    let output = &normalized * &gamma + &beta;
    Ok((output, LayerNormCache { normalized, inv_std }))
}

pub fn layer_norm_backward(
    cache: &LayerNormCache,
    gamma: ArrayView1<'_, f32>,
    grad_output: ArrayView2<'_, f32>,
) -> Result<LayerNormGrads> {
    ensure!(
        grad_output.dim() == cache.normalized.dim(),
        "output gradient {:?} incompatible with cached activations {:?}",
        grad_output.dim(),
        cache.normalized.dim()
    );

    let grad_gamma = (&grad_output * &cache.normalized).sum_axis(Axis(0));
    let grad_beta = grad_output.sum_axis(Axis(0));
    let grad_normalized = &grad_output * &gamma;

    let mut grad_input = Array2::<f32>::zeros(grad_output.dim());
    Zip::from(grad_input.rows_mut())
        .and(grad_normalized.rows())
        .and(cache.normalized.rows())
        .and(&cache.inv_std)
        .par_for_each(|mut out, dxhat, xhat, &inv| {
            let len = dxhat.len() as f32;
            let mean_dxhat = dxhat.sum() / len;
            let mean_dxhat_xhat = dxhat.dot(&xhat) / len;
            Zip::from(&mut out)
                .and(&dxhat)
                .and(&xhat)
                .for_each(|o, &g, &x| *o = inv * (g - mean_dxhat - x * mean_dxhat_xhat));
        });

    Ok(LayerNormGrads {
        input: grad_input,
        gamma: grad_gamma,
        beta: grad_beta,
    })
}

/// Non-caching layer norm that returns a new array.
pub fn layer_norm(
    data: ArrayView2<'_, f32>,
    gamma: ArrayView1<'_, f32>,
    beta: ArrayView1<'_, f32>,
    epsilon: f32,
) -> Result<Array2<f32>> {
    layer_norm_forward(data, gamma, beta, epsilon).map(|(output, _)| output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2};

    #[test]
    fn layer_norm_zero_mean_unit_var() {
        let data = Array2::from_shape_fn((4, 8), |(i, j)| ((i + 1) * (j + 1)) as f32 * 0.125);
        let gamma = Array1::from_elem(8, 1.0f32);
        let beta = Array1::from_elem(8, 0.0f32);

        let output = layer_norm(data.view(), gamma.view(), beta.view(), 1e-5).expect("layer norm");

        for row in output.axis_iter(Axis(0)) {
            let len = row.len() as f32;
            let mean = row.iter().sum::<f32>() / len;
            let var = row.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / len;
            assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-4);
            assert_abs_diff_eq!(var, 1.0, epsilon = 5e-4);
        }
    }

    #[test]
    fn input_gradient_matches_finite_difference() {
        let mut data = Array2::from_shape_fn((2, 5), |(i, j)| ((i * 5 + j) as f32 * 0.9).sin());
        let gamma = Array1::from_shape_fn(5, |j| 0.5 + j as f32 * 0.25);
        let beta = Array1::from_elem(5, 0.1f32);
        // loss = sum(y * w) with a fixed weighting so the gradient is not trivially zero
        let weights = Array2::from_shape_fn((2, 5), |(i, j)| (i + j) as f32 * 0.3 - 0.4);
        let loss = |x: &Array2<f32>| -> f32 {
            (layer_norm(x.view(), gamma.view(), beta.view(), 1e-5).unwrap() * &weights).sum()
        };

        let (_, cache) = layer_norm_forward(data.view(), gamma.view(), beta.view(), 1e-5).unwrap();
        let grads = layer_norm_backward(&cache, gamma.view(), weights.view()).unwrap();

        let h = 1e-2;
        for i in 0..2 {
            for j in 0..5 {
                let orig = data[[i, j]];
                data[[i, j]] = orig + h;
                let plus = loss(&data);
                data[[i, j]] = orig - h;
                let minus = loss(&data);
                data[[i, j]] = orig;
                assert_abs_diff_eq!(grads.input[[i, j]], (plus - minus) / (2.0 * h), epsilon = 5e-3);
            }
        }
    }
}
