use super::token_learner::{TokenLearner, TokenLearnerCache};
use super::{regex_filter, InputSpec, TokenizerInputs};
use crate::config::ImageTokenizerConfig;
use crate::nn::Linear;
use crate::param::{scoped, ParamMut, Parameterized};
use anyhow::{bail, ensure, Context, Result};
use ndarray::{
    concatenate, s, Array2, Array3, Array4, ArrayD, ArrayView2, ArrayView3, ArrayView4, Axis, Ix4,
    IxDyn,
};

/// Splits `(n, h, w, c)` images into non-overlapping `patch x patch` tiles,
/// one row of `patch * patch * c` values per tile, row-major over the grid.
pub fn patchify(images: ArrayView4<'_, f32>, patch: usize) -> Result<Array2<f32>> {
    let (n, h, w, c) = images.dim();
    ensure!(patch > 0, "patch size must be positive");
    ensure!(
        h % patch == 0 && w % patch == 0,
        "image size {}x{} is not divisible by patch size {}",
        h,
        w,
        patch
    );
    let (gh, gw) = (h / patch, w / patch);
    let tiles = images
        .to_owned()
        .into_shape_with_order(IxDyn(&[n, gh, patch, gw, patch, c]))?
        .permuted_axes(IxDyn(&[0, 1, 3, 2, 4, 5]));
    Ok(tiles
        .as_standard_layout()
        .to_shape((n * gh * gw, patch * patch * c))?
        .into_owned())
}

/// ViT stem: linear patch embedding with optional FiLM conditioning.
#[derive(Debug, Clone)]
pub struct PatchEncoder {
    pub patch_size: usize,
    pub channels: usize,
    pub patch_embedding: Linear,
    pub film: Option<Linear>,
}

#[derive(Debug, Clone)]
pub struct PatchEncoderCache {
    images: usize,
    patches: Array2<f32>,
    embedded: Array2<f32>,
    conditioning: Option<(Array2<f32>, Array2<f32>)>,
}

impl PatchEncoder {
    pub fn new(
        patch_size: usize,
        channels: usize,
        embed_dim: usize,
        film_dim: usize,
        rng: &mut fastrand::Rng,
    ) -> Self {
        Self {
            patch_size,
            channels,
            patch_embedding: Linear::new(patch_size * patch_size * channels, embed_dim, true, rng),
            film: (film_dim > 0).then(|| Linear::new(film_dim, 2 * embed_dim, true, rng)),
        }
    }

    pub fn embed_dim(&self) -> usize {
        self.patch_embedding.out_dim()
    }

    pub fn tokens_per_image(&self, height: usize, width: usize) -> usize {
        (height / self.patch_size) * (width / self.patch_size)
    }

    /// `(n, h, w, c)` images in `[0, 1]` to `(n, patches, embed_dim)` tokens.
    /// `conditioning` is `(n, film_dim)` and is required when FiLM is configured.
    pub fn forward(
        &self,
        images: ArrayView4<'_, f32>,
        conditioning: Option<ArrayView2<'_, f32>>,
    ) -> Result<(Array3<f32>, PatchEncoderCache)> {
        let (n, _, _, c) = images.dim();
        ensure!(
            c == self.channels,
            "patch encoder expects {} channels, got {}",
            self.channels,
            c
        );
        let patches = patchify(images, self.patch_size)?.mapv_into(|x| x * 2.0 - 1.0);
        let embedded = self.patch_embedding.forward(patches.view())?;
        let per_image = if n == 0 { 0 } else { embedded.nrows() / n };
        let dim = self.embed_dim();
        let tokens = embedded.to_shape((n, per_image, dim))?.into_owned();

        let (tokens, conditioning) = match (&self.film, conditioning) {
            (Some(film), Some(cond)) => {
                let (gamma, beta) = film_scales(film, cond, dim)?;
                let modulated = &tokens * &(&gamma + 1.0).insert_axis(Axis(1))
                    + &beta.view().insert_axis(Axis(1));
                (modulated.as_standard_layout().into_owned(), Some((cond.to_owned(), gamma)))
            }
            (Some(_), None) => bail!("FiLM conditioning is configured but no conditioning input was given"),
            (None, _) => (tokens, None),
        };

        Ok((
            tokens,
            PatchEncoderCache {
                images: n,
                patches,
                embedded,
                conditioning,
            },
        ))
    }

    pub fn backward(&mut self, cache: &PatchEncoderCache, grad_output: ArrayView3<'_, f32>) -> Result<()> {
        let dim = self.embed_dim();
        let per_image = if cache.images == 0 { 0 } else { cache.embedded.nrows() / cache.images };
        ensure!(
            grad_output.dim() == (cache.images, per_image, dim),
            "patch encoder gradient {:?} does not match ({}, {}, {})",
            grad_output.dim(),
            cache.images,
            per_image,
            dim
        );

        let grad_embedded = match (&mut self.film, &cache.conditioning) {
            (Some(film), Some((cond, gamma))) => {
                let embedded = cache.embedded.to_shape((cache.images, per_image, dim))?;
                let grad_gamma = (&grad_output * &embedded).sum_axis(Axis(1));
                let grad_beta = grad_output.sum_axis(Axis(1));
                let grad_film = concatenate(Axis(1), &[grad_gamma.view(), grad_beta.view()])?;
                film.backward(cond.view(), grad_film.view())?;
                &grad_output * &(gamma + 1.0).insert_axis(Axis(1))
            }
            _ => grad_output.to_owned(),
        };
        let rows = grad_embedded.to_shape((cache.images * per_image, dim))?;
        self.patch_embedding.backward(cache.patches.view(), rows.view())?;
        Ok(())
    }
}

fn film_scales(film: &Linear, cond: ArrayView2<'_, f32>, dim: usize) -> Result<(Array2<f32>, Array2<f32>)> {
    let scales = film.forward(cond)?;
    Ok((
        scales.slice(s![.., ..dim]).to_owned(),
        scales.slice(s![.., dim..]).to_owned(),
    ))
}

impl Parameterized for PatchEncoder {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, ParamMut<'_>)) {
        self.patch_embedding.visit_params(&scoped(prefix, "patch_embedding"), visitor);
        if let Some(film) = self.film.as_mut() {
            film.visit_params(&scoped(prefix, "film"), visitor);
        }
    }
}

/// Encodes the spatial observation and task inputs into image tokens.
#[derive(Debug, Clone)]
pub struct ImageTokenizer {
    pub early_fusion: bool,
    pub num_tokens: usize,
    pub obs_keys: Vec<String>,
    pub task_keys: Vec<String>,
    pub film_keys: Vec<String>,
    pub encoder: PatchEncoder,
    pub token_learner: Option<TokenLearner>,
}

#[derive(Debug, Clone)]
enum EncodedImages {
    /// One encoder call over all stacked channels.
    Early(PatchEncoderCache),
    /// One encoder call per observation image and per task image.
    Late {
        observations: Vec<PatchEncoderCache>,
        tasks: Vec<PatchEncoderCache>,
        tokens_per_image: usize,
        learner: TokenLearnerCache,
    },
}

#[derive(Debug, Clone)]
pub struct ImageTokenizerCache {
    batch: usize,
    horizon: usize,
    encoded: EncodedImages,
}

fn image_shape<'a>(shapes: &'a std::collections::BTreeMap<String, Vec<usize>>, key: &str) -> Result<&'a [usize]> {
    let shape = shapes
        .get(key)
        .with_context(|| format!("missing input '{key}'"))?;
    ensure!(
        shape.len() == 3,
        "spatial input '{}' must be (height, width, channels), got {:?}",
        key,
        shape
    );
    Ok(shape)
}

impl ImageTokenizer {
    pub fn new(config: &ImageTokenizerConfig, spec: &InputSpec, rng: &mut fastrand::Rng) -> Result<Self> {
        let obs_keys = regex_filter(&config.obs_stack_keys, spec.observations.keys())?;
        ensure!(
            !obs_keys.is_empty(),
            "no observation matches image keys {:?}",
            config.obs_stack_keys
        );
        let task_keys = regex_filter(&config.task_stack_keys, spec.tasks.keys())?;
        let film_keys = regex_filter(&config.task_film_keys, spec.tasks.keys())?;
        let film_dim: usize = film_keys
            .iter()
            .map(|k| spec.tasks[k].iter().product::<usize>())
            .sum();

        let mut shapes = Vec::new();
        for key in &obs_keys {
            shapes.push(image_shape(&spec.observations, key)?);
        }
        for key in &task_keys {
            shapes.push(image_shape(&spec.tasks, key)?);
        }
        let (height, width) = (shapes[0][0], shapes[0][1]);
        ensure!(
            shapes.iter().all(|s| s[0] == height && s[1] == width),
            "stacked images must share a resolution, got {:?}",
            shapes
        );

        if config.early_fusion {
            let channels = shapes.iter().map(|s| s[2]).sum();
            let encoder = PatchEncoder::new(config.patch_size, channels, config.embed_dim, film_dim, rng);
            let produced = encoder.tokens_per_image(height, width);
            ensure!(
                produced == config.num_tokens,
                "encoder produces {} tokens for {}x{} images but num_tokens is {}",
                produced,
                height,
                width,
                config.num_tokens
            );
            Ok(Self {
                early_fusion: true,
                num_tokens: config.num_tokens,
                obs_keys,
                task_keys,
                film_keys,
                encoder,
                token_learner: None,
            })
        } else {
            let channels = shapes[0][2];
            ensure!(
                shapes.iter().all(|s| s[2] == channels),
                "late fusion encodes images with a shared encoder; channel counts differ: {:?}",
                shapes
            );
            let encoder = PatchEncoder::new(config.patch_size, channels, config.embed_dim, film_dim, rng);
            let learner = TokenLearner::new(
                config.embed_dim,
                config.num_tokens,
                config.bottleneck_dim,
                config.dropout_rate,
                rng,
            );
            Ok(Self {
                early_fusion: false,
                num_tokens: config.num_tokens,
                obs_keys,
                task_keys,
                film_keys,
                encoder,
                token_learner: Some(learner),
            })
        }
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn output_dim(&self) -> usize {
        self.encoder.embed_dim()
    }

    /// `(batch, film_dim)` conditioning from the flattened FiLM task inputs.
    fn film_inputs(&self, inputs: &TokenizerInputs<'_>) -> Result<Option<Array2<f32>>> {
        if self.film_keys.is_empty() {
            return Ok(None);
        }
        let mut parts = Vec::with_capacity(self.film_keys.len());
        for key in &self.film_keys {
            let task = inputs.task(key)?;
            let width = task.len() / inputs.batch.max(1);
            parts.push(task.to_shape((inputs.batch, width))?.into_owned());
        }
        let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
        Ok(Some(concatenate(Axis(1), &views)?))
    }

    fn observation_images(&self, inputs: &TokenizerInputs<'_>) -> Result<Vec<ndarray::Array5<f32>>> {
        self.obs_keys
            .iter()
            .map(|key| {
                let obs = inputs.observation(key)?;
                ensure!(
                    obs.ndim() == 5 && obs.shape()[..2] == [inputs.batch, inputs.horizon],
                    "observation '{}' must be (batch, horizon, height, width, channels), got {:?}",
                    key,
                    obs.shape()
                );
                Ok(obs.view().into_dimensionality::<ndarray::Ix5>()?.to_owned())
            })
            .collect()
    }

    fn task_images(&self, inputs: &TokenizerInputs<'_>) -> Result<Vec<Array4<f32>>> {
        self.task_keys
            .iter()
            .map(|key| {
                let task = inputs.task(key)?;
                ensure!(
                    task.ndim() == 4 && task.shape()[0] == inputs.batch,
                    "task input '{}' must be (batch, height, width, channels), got {:?}",
                    key,
                    task.shape()
                );
                Ok(task.view().into_dimensionality::<Ix4>()?.to_owned())
            })
            .collect()
    }

    pub fn forward(
        &self,
        inputs: &TokenizerInputs<'_>,
        train: bool,
        rng: &mut fastrand::Rng,
    ) -> Result<(Array4<f32>, ImageTokenizerCache)> {
        let (b, t) = (inputs.batch, inputs.horizon);
        let observations = self.observation_images(inputs)?;
        let tasks = self.task_images(inputs)?;
        let film = self.film_inputs(inputs)?;
        let dim = self.output_dim();

        if self.early_fusion {
            let mut stacked: Vec<ArrayD<f32>> = observations.into_iter().map(|o| o.into_dyn()).collect();
            for task in tasks {
                let (_, h, w, c) = task.dim();
                let repeated = task
                    .insert_axis(Axis(1))
                    .broadcast((b, t, h, w, c))
                    .context("task image does not broadcast over time")?
                    .to_owned();
                stacked.push(repeated.into_dyn());
            }
            let views: Vec<_> = stacked.iter().map(|a| a.view()).collect();
            let fused = concatenate(Axis(4), &views)?;
            let (h, w, c) = (fused.shape()[2], fused.shape()[3], fused.shape()[4]);
            let flat = fused.to_shape((b * t, h, w, c))?;
            let cond = film.map(|f| repeat_rows(&f, t));
            let (tokens, cache) = self.encoder.forward(flat.view(), cond.as_ref().map(|c| c.view()))?;
            let n = tokens.dim().1;
            return Ok((
                tokens.to_shape((b, t, n, dim))?.into_owned(),
                ImageTokenizerCache {
                    batch: b,
                    horizon: t,
                    encoded: EncodedImages::Early(cache),
                },
            ));
        }

        let learner = self
            .token_learner
            .as_ref()
            .context("late fusion tokenizer has no token learner")?;
        let obs_cond = film.as_ref().map(|f| repeat_rows(f, t));
        let mut per_image: Vec<Array4<f32>> = Vec::new();
        let mut obs_caches = Vec::with_capacity(observations.len());
        for obs in &observations {
            let (_, _, h, w, c) = obs.dim();
            let flat = obs.to_shape((b * t, h, w, c))?;
            let (tokens, cache) = self
                .encoder
                .forward(flat.view(), obs_cond.as_ref().map(|c| c.view()))?;
            let n = tokens.dim().1;
            per_image.push(tokens.to_shape((b, t, n, dim))?.into_owned());
            obs_caches.push(cache);
        }
        let mut task_caches = Vec::with_capacity(tasks.len());
        for task in &tasks {
            let (tokens, cache) = self
                .encoder
                .forward(task.view(), film.as_ref().map(|c| c.view()))?;
            let n = tokens.dim().1;
            let repeated = tokens
                .insert_axis(Axis(1))
                .broadcast((b, t, n, dim))
                .context("task tokens do not broadcast over time")?
                .to_owned();
            per_image.push(repeated);
            task_caches.push(cache);
        }
        let tokens_per_image = per_image[0].dim().2;
        let views: Vec<_> = per_image.iter().map(|a| a.view()).collect();
        let combined = concatenate(Axis(2), &views)?;
        let (tokens, learner_cache) = learner.forward_4d(combined.view(), train, rng)?;

        Ok((
            tokens,
            ImageTokenizerCache {
                batch: b,
                horizon: t,
                encoded: EncodedImages::Late {
                    observations: obs_caches,
                    tasks: task_caches,
                    tokens_per_image,
                    learner: learner_cache,
                },
            },
        ))
    }

    pub fn backward(&mut self, cache: &ImageTokenizerCache, grad_output: Array4<f32>) -> Result<()> {
        let (b, t) = (cache.batch, cache.horizon);
        let dim = self.output_dim();
        match &cache.encoded {
            EncodedImages::Early(encoder_cache) => {
                let n = grad_output.dim().2;
                let grad = grad_output.to_shape((b * t, n, dim))?;
                self.encoder.backward(encoder_cache, grad.view())
            }
            EncodedImages::Late {
                observations,
                tasks,
                tokens_per_image,
                learner,
            } => {
                let token_learner = self
                    .token_learner
                    .as_mut()
                    .context("late fusion tokenizer has no token learner")?;
                let grad = token_learner.backward_4d(learner, grad_output.view())?;
                let n = *tokens_per_image;
                for (i, encoder_cache) in observations.iter().enumerate() {
                    let slice = grad.slice(s![.., .., i * n..(i + 1) * n, ..]);
                    let flat = slice.to_shape((b * t, n, dim))?;
                    self.encoder.backward(encoder_cache, flat.view())?;
                }
                let offset = observations.len();
                for (i, encoder_cache) in tasks.iter().enumerate() {
                    let j = offset + i;
                    let summed = grad.slice(s![.., .., j * n..(j + 1) * n, ..]).sum_axis(Axis(1));
                    self.encoder.backward(encoder_cache, summed.view())?;
                }
                Ok(())
            }
        }
    }
}

/// Repeats each row of `(batch, f)` `times` times, giving `(batch * times, f)`.
fn repeat_rows(rows: &Array2<f32>, times: usize) -> Array2<f32> {
    let (batch, width) = rows.dim();
    Array2::from_shape_fn((batch * times, width), |(i, j)| rows[[i / times, j]])
}

impl Parameterized for ImageTokenizer {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, ParamMut<'_>)) {
        self.encoder.visit_params(&scoped(prefix, "encoder"), visitor);
        if let Some(learner) = self.token_learner.as_mut() {
            learner.visit_params(&scoped(prefix, "token_learner"), visitor);
        }
    }
}
