//! Trainable parameters and the visitor used by optimizers and checkpoints.

use anyhow::{ensure, Result};
use ndarray::{Array, ArrayBase, ArrayViewMutD, Data, Dimension, IntoDimension};

/// A named-by-position tensor together with its accumulated gradient.
#[derive(Debug, Clone)]
pub struct Param<D: Dimension> {
    pub value: Array<f32, D>,
    pub grad: Array<f32, D>,
}

impl<D: Dimension> Param<D> {
    pub fn new(value: Array<f32, D>) -> Self {
        let grad = Array::zeros(value.raw_dim());
        Self { value, grad }
    }

    pub fn zeros<Sh: IntoDimension<Dim = D>>(shape: Sh) -> Self {
        Self::new(Array::zeros(shape.into_dimension()))
    }

    /// Values drawn uniformly from `[-limit, limit]`.
    pub fn uniform<Sh: IntoDimension<Dim = D>>(shape: Sh, limit: f32, rng: &mut fastrand::Rng) -> Self {
        let value = Array::from_shape_simple_fn(shape.into_dimension(), || {
            (rng.f32() * 2.0 - 1.0) * limit
        });
        Self::new(value)
    }

    pub fn accumulate<S>(&mut self, grad: &ArrayBase<S, D>) -> Result<()>
    where
        S: Data<Elem = f32>,
    {
        ensure!(
            grad.shape() == self.grad.shape(),
            "gradient shape {:?} does not match parameter shape {:?}",
            grad.shape(),
            self.grad.shape()
        );
        self.grad += grad;
        Ok(())
    }

    pub fn as_mut(&mut self) -> ParamMut<'_> {
        ParamMut {
            value: self.value.view_mut().into_dyn(),
            grad: self.grad.view_mut().into_dyn(),
        }
    }
}

/// Dynamic-rank mutable view handed to [`Parameterized::visit_params`] visitors.
pub struct ParamMut<'a> {
    pub value: ArrayViewMutD<'a, f32>,
    pub grad: ArrayViewMutD<'a, f32>,
}

pub trait Parameterized {
    /// Calls `visitor` once per parameter with its dot-separated name.
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, ParamMut<'_>));

    fn zero_grad(&mut self) {
        self.visit_params("", &mut |_, mut param| param.grad.fill(0.0));
    }

    fn num_params(&mut self) -> usize {
        let mut total = 0;
        self.visit_params("", &mut |_, param| total += param.value.len());
        total
    }

    fn param_names(&mut self) -> Vec<String> {
        let mut names = Vec::new();
        self.visit_params("", &mut |name, _| names.push(name.to_string()));
        names
    }
}

/// Joins a parameter path component onto `prefix`.
pub fn scoped(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Glorot-uniform bound for a `(fan_in, fan_out)` kernel.
pub fn xavier_limit(fan_in: usize, fan_out: usize) -> f32 {
    (6.0 / (fan_in + fan_out).max(1) as f32).sqrt()
}

/// Uniform bound with the same variance as a normal of standard deviation `std`.
pub fn uniform_limit_for_std(std: f32) -> f32 {
    std * 3f32.sqrt()
}
