//! Dense (affine) kernels.

use anyhow::{bail, ensure, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

pub fn validate_matmul_inputs(lhs: &ArrayView2<'_, f32>, rhs: &ArrayView2<'_, f32>) -> Result<()> {
    if lhs.ncols() != rhs.nrows() {
        bail!(
            "matmul dimension mismatch: lhs {}x{} vs rhs {}x{}",
            lhs.nrows(),
            lhs.ncols(),
            rhs.nrows(),
            rhs.ncols()
        );
    }
    Ok(())
}

/// `y = x @ w + b` for `x: (rows, in)`, `w: (in, out)`, `b: (out,)`.
pub fn linear_forward(
    input: ArrayView2<'_, f32>,
    kernel: ArrayView2<'_, f32>,
    bias: Option<ArrayView1<'_, f32>>,
) -> Result<Array2<f32>> {
    validate_matmul_inputs(&input, &kernel)?;
    let mut output = input.dot(&kernel);
    if let Some(bias) = bias {
        ensure!(
            bias.len() == output.ncols(),
            "bias length {} incompatible with output {:?}",
            bias.len(),
            output.dim()
        );
        output += &bias;
    }
    Ok(output)
}

pub struct LinearGrads {
    pub input: Array2<f32>,
    pub kernel: Array2<f32>,
    pub bias: Array1<f32>,
}

/// Gradients of [`linear_forward`] with respect to input, kernel and bias.
pub fn linear_backward(
    input: ArrayView2<'_, f32>,
    kernel: ArrayView2<'_, f32>,
    grad_output: ArrayView2<'_, f32>,
) -> Result<LinearGrads> {
    ensure!(
        grad_output.nrows() == input.nrows() && grad_output.ncols() == kernel.ncols(),
        "output gradient {:?} incompatible with input {:?} and kernel {:?}",
        grad_output.dim(),
        input.dim(),
        kernel.dim()
    );
    Ok(LinearGrads {
        input: grad_output.dot(&kernel.t()),
        kernel: input.t().dot(&grad_output),
        bias: grad_output.sum_axis(Axis(0)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    #[test]
    fn linear_adds_bias_per_column() {
        let x = array![[1.0f32, 2.0], [3.0, 4.0]];
        let w = array![[1.0f32, 0.0, 1.0], [0.0, 1.0, 1.0]];
        let b = array![0.5f32, -0.5, 0.0];
        let y = linear_forward(x.view(), w.view(), Some(b.view())).unwrap();
        assert_eq!(y, array![[1.5f32, 1.5, 3.0], [3.5, 3.5, 7.0]]);
    }

    #[test]
    fn linear_rejects_mismatched_kernel() {
        let x = Array2::<f32>::zeros((2, 3));
        let w = Array2::<f32>::zeros((2, 3));
        assert!(linear_forward(x.view(), w.view(), None).is_err());
    }

    #[test]
    fn kernel_gradient_matches_finite_difference() {
        let x = Array2::from_shape_fn((3, 4), |(i, j)| ((i * 4 + j) as f32 * 0.37).sin());
        let mut w = Array2::from_shape_fn((4, 2), |(i, j)| ((i + 2 * j) as f32 * 0.21).cos());
        // loss = sum(y)
        let grad_out = Array2::<f32>::ones((3, 2));
        let grads = linear_backward(x.view(), w.view(), grad_out.view()).unwrap();

        let h = 1e-2;
        for i in 0..4 {
            for j in 0..2 {
                let orig = w[[i, j]];
                w[[i, j]] = orig + h;
                let plus = linear_forward(x.view(), w.view(), None).unwrap().sum();
                w[[i, j]] = orig - h;
                let minus = linear_forward(x.view(), w.view(), None).unwrap().sum();
                w[[i, j]] = orig;
                assert_abs_diff_eq!(grads.kernel[[i, j]], (plus - minus) / (2.0 * h), epsilon = 1e-3);
            }
        }
        assert_abs_diff_eq!(grads.bias[0], 3.0);
    }
}
