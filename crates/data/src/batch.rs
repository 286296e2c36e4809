use crate::statistics::PROPRIO_KEY;
use crate::transforms::Sample;
use crate::word_tokenizer::WordTokenizer;
use anyhow::{ensure, Context, Result};
use ndarray::{s, stack, Array2, Array3, Array4, ArrayD, Axis, IxDyn};
use policyforge_model::{ActionTargets, PolicyInputs};
use std::collections::BTreeMap;

/// Collated samples.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(batch, window, ...)`
    pub observations: BTreeMap<String, ArrayD<f32>>,
    /// `(batch, ...)`
    pub tasks: BTreeMap<String, ArrayD<f32>>,
    /// `(batch, max_tokens)`
    pub language: Option<Array2<usize>>,
    pub pad_mask: Array2<bool>,
    /// `(batch, window, action_horizon, action_dim)`
    pub actions: Array4<f32>,
    pub action_pad_mask: Array3<bool>,
    pub dataset_names: Vec<String>,
}

/// Zero-pads the last axis of `values` to `width`.
pub fn pad_last_axis(values: &ArrayD<f32>, width: usize) -> Result<ArrayD<f32>> {
    let current = values.shape().last().copied().context("cannot pad a scalar")?;
    ensure!(
        current <= width,
        "values of width {} do not fit the configured width {}",
        current,
        width
    );
    if current == width {
        return Ok(values.clone());
    }
    let mut shape = values.shape().to_vec();
    if let Some(last) = shape.last_mut() {
        *last = width;
    }
    let mut padded = ArrayD::zeros(IxDyn(&shape));
    padded
        .slice_each_axis_mut(|ax| {
            if ax.axis.index() == shape.len() - 1 {
                ndarray::Slice::from(..current)
            } else {
                ndarray::Slice::from(..)
            }
        })
        .assign(values);
    Ok(padded)
}

fn stack_named<'a>(
    samples: &'a [Sample],
    key: &str,
    pad_to: Option<usize>,
    pick: impl Fn(&'a Sample) -> Option<&'a ArrayD<f32>>,
) -> Result<ArrayD<f32>> {
    let arrays = samples
        .iter()
        .map(|sample| {
            let array = pick(sample)
                .with_context(|| format!("sample from '{}' lacks '{}'", sample.dataset, key))?;
            match pad_to {
                Some(width) => pad_last_axis(array, width),
                None => Ok(array.clone()),
            }
        })
        .collect::<Result<Vec<_>>>()?;
    let views: Vec<_> = arrays.iter().map(|a| a.view()).collect();
    stack(Axis(0), &views).with_context(|| format!("'{key}' has different shapes across samples"))
}

impl Batch {
    /// Stacks samples, zero-padding actions to `action_dim` and proprio to `proprio_dim`.
    ///
    /// Every sample must carry the same observation and task names.
    pub fn collate(
        samples: &[Sample],
        tokenizer: Option<&WordTokenizer>,
        action_dim: usize,
        proprio_dim: Option<usize>,
    ) -> Result<Self> {
        let first = samples.first().context("cannot collate an empty batch")?;

        let mut observations = BTreeMap::new();
        for key in first.observations.keys() {
            let pad_to = proprio_dim.filter(|_| key == PROPRIO_KEY);
            let stacked = stack_named(samples, key, pad_to, |s| s.observations.get(key))?;
            observations.insert(key.clone(), stacked);
        }
        let mut tasks = BTreeMap::new();
        for key in first.tasks.keys() {
            let pad_to = proprio_dim.filter(|_| key == PROPRIO_KEY);
            let stacked = stack_named(samples, key, pad_to, |s| s.tasks.get(key))?;
            tasks.insert(key.clone(), stacked);
        }

        let pad_views: Vec<_> = samples.iter().map(|s| s.pad_mask.view()).collect();
        let pad_mask = stack(Axis(0), &pad_views).context("samples have different window sizes")?;

        let (window, horizon, _) = first.actions.dim();
        let mut actions = Array4::zeros((samples.len(), window, horizon, action_dim));
        for (i, sample) in samples.iter().enumerate() {
            let (w, h, a) = sample.actions.dim();
            ensure!(
                (w, h) == (window, horizon),
                "sample from '{}' has a {}x{} action chunk, expected {}x{}",
                sample.dataset,
                w,
                h,
                window,
                horizon
            );
            ensure!(
                a <= action_dim,
                "dataset '{}' has {} action dims, more than the configured {}",
                sample.dataset,
                a,
                action_dim
            );
            actions.slice_mut(s![i, .., .., ..a]).assign(&sample.actions);
        }
        let mask_views: Vec<_> = samples.iter().map(|s| s.action_pad_mask.view()).collect();
        let action_pad_mask = stack(Axis(0), &mask_views)?;

        let language = tokenizer.map(|tok| {
            let texts: Vec<&str> = samples.iter().map(|s| s.language_instruction.as_str()).collect();
            tok.encode_batch(&texts)
        });

        Ok(Self {
            observations,
            tasks,
            language,
            pad_mask,
            actions,
            action_pad_mask,
            dataset_names: samples.iter().map(|s| s.dataset.clone()).collect(),
        })
    }

    pub fn batch_size(&self) -> usize {
        self.pad_mask.nrows()
    }

    pub fn policy_inputs(&self) -> PolicyInputs {
        PolicyInputs {
            observations: self.observations.clone(),
            tasks: self.tasks.clone(),
            language: self.language.clone(),
            pad_mask: self.pad_mask.clone(),
        }
    }

    pub fn into_model_inputs(self) -> (PolicyInputs, ActionTargets) {
        (
            PolicyInputs {
                observations: self.observations,
                tasks: self.tasks,
                language: self.language,
                pad_mask: self.pad_mask,
            },
            ActionTargets {
                actions: self.actions,
                action_pad_mask: self.action_pad_mask,
            },
        )
    }
}
