//! Modality tokenizers: each turns one slice of the inputs into `(batch, horizon, tokens, dim)`.

mod bin;
mod image;
mod language;
mod lowdim;
mod token_learner;

pub use bin::{inverse_normal_cdf, BinTokenizer, EPS};
pub use image::{patchify, ImageTokenizer, ImageTokenizerCache, PatchEncoder, PatchEncoderCache};
pub use language::{LanguageTokenizer, LanguageTokenizerCache};
pub use lowdim::{LowdimTokenizer, LowdimTokenizerCache};
pub use token_learner::{TokenLearner, TokenLearnerCache};

use crate::config::TokenizerConfig;
use crate::param::{ParamMut, Parameterized};
use anyhow::{bail, ensure, Context, Result};
use ndarray::{Array2, Array4, ArrayD};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-element shapes of the model inputs, without batch and time axes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    /// `name -> shape` of one timestep of an observation.
    pub observations: BTreeMap<String, Vec<usize>>,
    /// `name -> shape` of one task entry (goal images, goal proprio).
    pub tasks: BTreeMap<String, Vec<usize>>,
    /// Number of language token ids per example; zero when the data has none.
    #[serde(default)]
    pub language_len: usize,
}

impl InputSpec {
    /// Spec seen by task tokenizers, which treat task entries as a single observation step.
    pub fn tasks_as_observations(&self) -> InputSpec {
        InputSpec {
            observations: self.tasks.clone(),
            tasks: self.tasks.clone(),
            language_len: self.language_len,
        }
    }
}

/// Borrowed inputs for one tokenizer call.
#[derive(Debug, Clone, Copy)]
pub struct TokenizerInputs<'a> {
    /// `(batch, horizon, ...)` per name.
    pub observations: &'a BTreeMap<String, ArrayD<f32>>,
    /// `(batch, ...)` per name.
    pub tasks: &'a BTreeMap<String, ArrayD<f32>>,
    /// `(batch, language_len)` token ids.
    pub language: Option<&'a Array2<usize>>,
    pub batch: usize,
    pub horizon: usize,
}

impl<'a> TokenizerInputs<'a> {
    pub fn observation(&self, key: &str) -> Result<&'a ArrayD<f32>> {
        self.observations
            .get(key)
            .with_context(|| format!("missing observation '{key}'"))
    }

    pub fn task(&self, key: &str) -> Result<&'a ArrayD<f32>> {
        self.tasks
            .get(key)
            .with_context(|| format!("missing task input '{key}'"))
    }
}

/// Names matched by any of `patterns`, in pattern order and then sorted name order.
///
/// Patterns match at the start of the name, so `image_.*` selects
/// `image_primary` but not `goal_image_primary`.
pub fn regex_filter<'a, I>(patterns: &[String], names: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut sorted: Vec<&String> = names.into_iter().collect();
    sorted.sort();
    let mut matched: Vec<String> = Vec::new();
    for pattern in patterns {
        let re = Regex::new(&format!("^(?:{pattern})"))
            .with_context(|| format!("invalid key pattern '{pattern}'"))?;
        for name in &sorted {
            if re.is_match(name) && !matched.iter().any(|m| m == *name) {
                matched.push((*name).clone());
            }
        }
    }
    Ok(matched)
}

#[derive(Debug, Clone)]
pub enum Tokenizer {
    Image(ImageTokenizer),
    Language(LanguageTokenizer),
    Lowdim(LowdimTokenizer),
}

#[derive(Debug, Clone)]
pub enum TokenizerCache {
    Image(ImageTokenizerCache),
    Language(LanguageTokenizerCache),
    Lowdim(LowdimTokenizerCache),
}

impl Tokenizer {
    pub fn new(config: &TokenizerConfig, spec: &InputSpec, rng: &mut fastrand::Rng) -> Result<Self> {
        Ok(match config {
            TokenizerConfig::Image(cfg) => Tokenizer::Image(ImageTokenizer::new(cfg, spec, rng)?),
            TokenizerConfig::Language(cfg) => {
                ensure!(
                    spec.language_len > 0,
                    "language tokenizer configured but the inputs carry no language"
                );
                Tokenizer::Language(LanguageTokenizer::new(cfg, spec.language_len, rng))
            }
            TokenizerConfig::Lowdim(cfg) => Tokenizer::Lowdim(LowdimTokenizer::new(cfg, spec, rng)?),
        })
    }

    pub fn num_tokens(&self) -> usize {
        match self {
            Tokenizer::Image(t) => t.num_tokens(),
            Tokenizer::Language(t) => t.num_tokens(),
            Tokenizer::Lowdim(t) => t.num_tokens(),
        }
    }

    pub fn output_dim(&self) -> usize {
        match self {
            Tokenizer::Image(t) => t.output_dim(),
            Tokenizer::Language(t) => t.output_dim(),
            Tokenizer::Lowdim(t) => t.output_dim(),
        }
    }

    pub fn forward(
        &self,
        inputs: &TokenizerInputs<'_>,
        train: bool,
        rng: &mut fastrand::Rng,
    ) -> Result<(Array4<f32>, TokenizerCache)> {
        let (tokens, cache) = match self {
            Tokenizer::Image(t) => {
                let (tokens, cache) = t.forward(inputs, train, rng)?;
                (tokens, TokenizerCache::Image(cache))
            }
            Tokenizer::Language(t) => {
                let (tokens, cache) = t.forward(inputs)?;
                (tokens, TokenizerCache::Language(cache))
            }
            Tokenizer::Lowdim(t) => {
                let (tokens, cache) = t.forward(inputs)?;
                (tokens, TokenizerCache::Lowdim(cache))
            }
        };
        let expected = (inputs.batch, inputs.horizon, self.num_tokens(), self.output_dim());
        ensure!(
            tokens.dim() == expected,
            "tokenizer produced {:?}, expected {:?}",
            tokens.dim(),
            expected
        );
        Ok((tokens, cache))
    }

    /// Accumulates parameter gradients; tokenizer inputs are data and get no gradient.
    pub fn backward(&mut self, cache: &TokenizerCache, grad_output: Array4<f32>) -> Result<()> {
        match (self, cache) {
            (Tokenizer::Image(t), TokenizerCache::Image(c)) => t.backward(c, grad_output),
            (Tokenizer::Language(t), TokenizerCache::Language(c)) => t.backward(c, grad_output),
            (Tokenizer::Lowdim(t), TokenizerCache::Lowdim(c)) => t.backward(c, grad_output),
            _ => bail!("tokenizer cache does not belong to this tokenizer"),
        }
    }
}

impl Parameterized for Tokenizer {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, ParamMut<'_>)) {
        match self {
            Tokenizer::Image(t) => t.visit_params(prefix, visitor),
            Tokenizer::Language(t) => t.visit_params(prefix, visitor),
            Tokenizer::Lowdim(t) => t.visit_params(prefix, visitor),
        }
    }
}
