use super::bin::BinTokenizer;
use super::{regex_filter, InputSpec, TokenizerInputs};
use crate::config::LowdimTokenizerConfig;
use crate::nn::Embedding;
use crate::param::{scoped, ParamMut, Parameterized};
use anyhow::{ensure, Result};
use ndarray::{concatenate, Array4, ArrayD, Axis};

/// Bins every low-dimensional observation value and embeds each bin as one token.
#[derive(Debug, Clone)]
pub struct LowdimTokenizer {
    pub obs_keys: Vec<String>,
    pub dims: usize,
    pub bins: BinTokenizer,
    pub embedding: Embedding,
}

#[derive(Debug, Clone)]
pub struct LowdimTokenizerCache {
    ids: Vec<usize>,
}

impl LowdimTokenizer {
    pub fn new(config: &LowdimTokenizerConfig, spec: &InputSpec, rng: &mut fastrand::Rng) -> Result<Self> {
        let obs_keys = regex_filter(&config.obs_keys, spec.observations.keys())?;
        ensure!(
            !obs_keys.is_empty(),
            "no observation matches low-dimensional keys {:?}",
            config.obs_keys
        );
        let mut dims = 0;
        for key in &obs_keys {
            let shape = &spec.observations[key];
            ensure!(
                shape.len() == 1,
                "low-dimensional input '{}' must be a vector, got {:?}",
                key,
                shape
            );
            dims += shape[0];
        }
        let bins = BinTokenizer::new(&config.binning)?;
        let embedding = Embedding::new(bins.n_bins, config.embed_dim, rng);
        Ok(Self {
            obs_keys,
            dims,
            bins,
            embedding,
        })
    }

    pub fn num_tokens(&self) -> usize {
        self.dims
    }

    pub fn output_dim(&self) -> usize {
        self.embedding.dim()
    }

    pub fn forward(&self, inputs: &TokenizerInputs<'_>) -> Result<(Array4<f32>, LowdimTokenizerCache)> {
        let (b, t) = (inputs.batch, inputs.horizon);
        let mut parts: Vec<ArrayD<f32>> = Vec::with_capacity(self.obs_keys.len());
        for key in &self.obs_keys {
            let obs = inputs.observation(key)?;
            ensure!(
                obs.ndim() == 3 && obs.shape()[..2] == [b, t],
                "observation '{}' must be (batch, horizon, dims), got {:?}",
                key,
                obs.shape()
            );
            parts.push(obs.clone());
        }
        let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
        let values = concatenate(Axis(2), &views)?;
        ensure!(
            values.shape()[2] == self.dims,
            "expected {} low-dimensional values, got {}",
            self.dims,
            values.shape()[2]
        );
        // logical order (batch, time, dim) regardless of memory layout
        let ids: Vec<usize> = values.iter().map(|&x| self.bins.encode_value(x)).collect();
        let embedded = self.embedding.forward(&ids)?;
        let tokens = embedded.into_shape_with_order((b, t, self.dims, self.output_dim()))?;
        Ok((tokens, LowdimTokenizerCache { ids }))
    }

    pub fn backward(&mut self, cache: &LowdimTokenizerCache, grad_output: Array4<f32>) -> Result<()> {
        let dim = self.output_dim();
        let rows = grad_output.to_shape((cache.ids.len(), dim))?;
        self.embedding.backward(&cache.ids, rows.view())
    }
}

impl Parameterized for LowdimTokenizer {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, ParamMut<'_>)) {
        self.embedding.visit_params(&scoped(prefix, "bin_embedding"), visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BinType, BinningConfig};
    use ndarray::IxDyn;
    use std::collections::BTreeMap;

    #[test]
    fn each_dimension_becomes_one_token() {
        let mut rng = fastrand::Rng::with_seed(4);
        let mut spec = InputSpec::default();
        spec.observations.insert("proprio".into(), vec![3]);
        spec.observations.insert("image_primary".into(), vec![8, 8, 3]);
        let config = LowdimTokenizerConfig {
            obs_keys: vec!["proprio".into()],
            embed_dim: 5,
            binning: BinningConfig {
                n_bins: 4,
                bin_type: BinType::Uniform,
                low: -1.0,
                high: 1.0,
            },
        };
        let mut tokenizer = LowdimTokenizer::new(&config, &spec, &mut rng).unwrap();
        assert_eq!(tokenizer.num_tokens(), 3);

        let mut obs = BTreeMap::new();
        obs.insert(
            "proprio".to_string(),
            ArrayD::from_shape_vec(IxDyn(&[1, 2, 3]), vec![-0.9, 0.1, 0.9, -0.9, -0.9, 0.6]).unwrap(),
        );
        let tasks = BTreeMap::new();
        let inputs = TokenizerInputs {
            observations: &obs,
            tasks: &tasks,
            language: None,
            batch: 1,
            horizon: 2,
        };
        let (tokens, cache) = tokenizer.forward(&inputs).unwrap();
        assert_eq!(tokens.dim(), (1, 2, 3, 5));
        assert_eq!(cache.ids, vec![0, 2, 3, 0, 0, 3]);
        assert_eq!(tokens.slice(ndarray::s![0, 0, 0, ..]), tokens.slice(ndarray::s![0, 1, 1, ..]));

        tokenizer.backward(&cache, Array4::ones(tokens.raw_dim())).unwrap();
        assert_eq!(tokenizer.embedding.table.grad[[0, 0]], 3.0);
        assert_eq!(tokenizer.embedding.table.grad[[1, 0]], 0.0);
    }

    #[test]
    fn image_shaped_inputs_are_rejected() {
        let mut rng = fastrand::Rng::with_seed(0);
        let mut spec = InputSpec::default();
        spec.observations.insert("image_primary".into(), vec![8, 8, 3]);
        let config = LowdimTokenizerConfig {
            obs_keys: vec!["image_.*".into()],
            embed_dim: 5,
            binning: BinningConfig::default(),
        };
        assert!(LowdimTokenizer::new(&config, &spec, &mut rng).is_err());
    }
}
