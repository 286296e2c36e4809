use super::TokenizerInputs;
use crate::config::LanguageTokenizerConfig;
use crate::nn::{Embedding, Linear};
use crate::param::{scoped, ParamMut, Parameterized};
use anyhow::{ensure, Context, Result};
use ndarray::{Array2, Array4, Axis};

/// Embeds word-hash token ids; the same tokens are shown at every timestep.
#[derive(Debug, Clone)]
pub struct LanguageTokenizer {
    pub max_tokens: usize,
    pub embedding: Embedding,
    pub projection: Option<Linear>,
}

#[derive(Debug, Clone)]
pub struct LanguageTokenizerCache {
    ids: Vec<usize>,
    embedded: Array2<f32>,
    batch: usize,
}

impl LanguageTokenizer {
    pub fn new(config: &LanguageTokenizerConfig, max_tokens: usize, rng: &mut fastrand::Rng) -> Self {
        let embedding = Embedding::new(config.vocab_size, config.embed_dim, rng);
        let projection = config
            .projection_dim
            .map(|dim| Linear::new(config.embed_dim, dim, false, rng));
        Self {
            max_tokens,
            embedding,
            projection,
        }
    }

    pub fn num_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn output_dim(&self) -> usize {
        self.projection
            .as_ref()
            .map_or(self.embedding.dim(), |p| p.out_dim())
    }

    pub fn forward(&self, inputs: &TokenizerInputs<'_>) -> Result<(Array4<f32>, LanguageTokenizerCache)> {
        let language = inputs
            .language
            .context("language tokenizer needs language token ids")?;
        ensure!(
            language.dim() == (inputs.batch, self.max_tokens),
            "language ids {:?} do not match ({}, {})",
            language.dim(),
            inputs.batch,
            self.max_tokens
        );
        let ids: Vec<usize> = language.iter().copied().collect();
        let embedded = self.embedding.forward(&ids)?;
        let tokens = match &self.projection {
            Some(projection) => projection.forward(embedded.view())?,
            None => embedded.clone(),
        };
        let dim = tokens.ncols();
        let tokens = tokens
            .into_shape_with_order((inputs.batch, 1, self.max_tokens, dim))?
            .broadcast((inputs.batch, inputs.horizon, self.max_tokens, dim))
            .context("language tokens do not broadcast over time")?
            .to_owned();
        Ok((
            tokens,
            LanguageTokenizerCache {
                ids,
                embedded,
                batch: inputs.batch,
            },
        ))
    }

    pub fn backward(&mut self, cache: &LanguageTokenizerCache, grad_output: Array4<f32>) -> Result<()> {
        let dim = self.output_dim();
        ensure!(
            grad_output.dim().0 == cache.batch && grad_output.dim().2 == self.max_tokens,
            "language gradient {:?} does not match batch {}",
            grad_output.dim(),
            cache.batch
        );
        let summed = grad_output.sum_axis(Axis(1));
        let rows = summed.into_shape_with_order((cache.batch * self.max_tokens, dim))?;
        let grad_embedded = match self.projection.as_mut() {
            Some(projection) => projection.backward(cache.embedded.view(), rows.view())?,
            None => rows,
        };
        self.embedding.backward(&cache.ids, grad_embedded.view())
    }
}

impl Parameterized for LanguageTokenizer {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, ParamMut<'_>)) {
        self.embedding.visit_params(&scoped(prefix, "embedding"), visitor);
        if let Some(projection) = self.projection.as_mut() {
            projection.visit_params(&scoped(prefix, "projection"), visitor);
        }
    }
}
