//! Training-time image augmentation.
//!
//! Each camera of a sample draws one parameter set that is shared by every
//! frame of its history window and by its goal image.

use crate::transforms::Sample;
use anyhow::{ensure, Context, Result};
use ndarray::{Array3, ArrayView3, ArrayViewMut3, Axis, Ix3};
use serde::{Deserialize, Serialize};

const IMAGE_PREFIX: &str = "image_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AugmentOp {
    RandomResizedCrop,
    RandomBrightness,
    RandomContrast,
    RandomSaturation,
    RandomHue,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResizedCropConfig {
    /// Crop area as a fraction of the image area.
    pub scale: [f32; 2],
    /// Crop aspect ratio (width / height), drawn log-uniformly.
    pub ratio: [f32; 2],
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageAugmentConfig {
    #[serde(default)]
    pub random_resized_crop: Option<ResizedCropConfig>,
    /// Maximum absolute brightness shift.
    #[serde(default)]
    pub random_brightness: Option<f32>,
    #[serde(default)]
    pub random_contrast: Option<[f32; 2]>,
    #[serde(default)]
    pub random_saturation: Option<[f32; 2]>,
    /// Maximum absolute hue shift as a fraction of a full turn.
    #[serde(default)]
    pub random_hue: Option<f32>,
    pub augment_order: Vec<AugmentOp>,
}

/// One drawn augmentation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AugmentStep {
    /// Crop window in fractions of the image, resized back to full size.
    Crop {
        top: f32,
        left: f32,
        height: f32,
        width: f32,
    },
    Brightness(f32),
    Contrast(f32),
    Saturation(f32),
    Hue(f32),
}

fn ordered_range(name: &str, range: [f32; 2]) -> Result<()> {
    ensure!(
        range[0] >= 0.0 && range[0] <= range[1],
        "{} range {:?} must satisfy 0 <= low <= high",
        name,
        range
    );
    Ok(())
}

fn uniform(rng: &mut fastrand::Rng, low: f32, high: f32) -> f32 {
    low + (high - low) * rng.f32()
}

impl ImageAugmentConfig {
    /// Every op in `augment_order` must have its parameters set.
    pub fn validate(&self) -> Result<()> {
        for &op in &self.augment_order {
            let missing = || format!("{op:?} is in augment_order but has no parameters");
            match op {
                AugmentOp::RandomResizedCrop => {
                    let crop = self.random_resized_crop.with_context(missing)?;
                    ordered_range("crop scale", crop.scale)?;
                    ordered_range("crop ratio", crop.ratio)?;
                    ensure!(
                        crop.scale[0] > 0.0 && crop.scale[1] <= 1.0,
                        "crop scale {:?} must lie in (0, 1]",
                        crop.scale
                    );
                    ensure!(crop.ratio[0] > 0.0, "crop ratio {:?} must be positive", crop.ratio);
                }
                AugmentOp::RandomBrightness => {
                    let delta = self.random_brightness.with_context(missing)?;
                    ensure!(delta >= 0.0, "brightness delta {} must be non-negative", delta);
                }
                AugmentOp::RandomContrast => ordered_range("contrast", self.random_contrast.with_context(missing)?)?,
                AugmentOp::RandomSaturation => {
                    ordered_range("saturation", self.random_saturation.with_context(missing)?)?
                }
                AugmentOp::RandomHue => {
                    let delta = self.random_hue.with_context(missing)?;
                    ensure!((0.0..=0.5).contains(&delta), "hue delta {} must lie in [0, 0.5]", delta);
                }
            }
        }
        Ok(())
    }

    /// Draws one parameter set in `augment_order`; ops without parameters are skipped.
    pub fn sample_steps(&self, rng: &mut fastrand::Rng) -> Vec<AugmentStep> {
        let mut steps = Vec::with_capacity(self.augment_order.len());
        for op in &self.augment_order {
            let step = match op {
                AugmentOp::RandomResizedCrop => self.random_resized_crop.map(|c| sample_crop(&c, rng)),
                AugmentOp::RandomBrightness => self
                    .random_brightness
                    .map(|d| AugmentStep::Brightness(uniform(rng, -d, d))),
                AugmentOp::RandomContrast => self
                    .random_contrast
                    .map(|[lo, hi]| AugmentStep::Contrast(uniform(rng, lo, hi))),
                AugmentOp::RandomSaturation => self
                    .random_saturation
                    .map(|[lo, hi]| AugmentStep::Saturation(uniform(rng, lo, hi))),
                AugmentOp::RandomHue => self.random_hue.map(|d| AugmentStep::Hue(uniform(rng, -d, d))),
            };
            steps.extend(step);
        }
        steps
    }
}

fn sample_crop(config: &ResizedCropConfig, rng: &mut fastrand::Rng) -> AugmentStep {
    let area = uniform(rng, config.scale[0], config.scale[1]);
    let ratio = uniform(rng, config.ratio[0].ln(), config.ratio[1].ln()).exp();
    let width = (area * ratio).sqrt().min(1.0);
    let height = (area / ratio).sqrt().min(1.0);
    AugmentStep::Crop {
        top: uniform(rng, 0.0, 1.0 - height),
        left: uniform(rng, 0.0, 1.0 - width),
        height,
        width,
    }
}

/// Applies `steps` in order to an `(H, W, C)` image in [0, 1], clipping after each.
pub fn apply_steps(mut image: ArrayViewMut3<'_, f32>, steps: &[AugmentStep]) {
    for step in steps {
        match *step {
            AugmentStep::Crop {
                top,
                left,
                height,
                width,
            } => {
                let resized = crop_and_resize(image.view(), top, left, height, width);
                image.assign(&resized);
            }
            AugmentStep::Brightness(delta) => image.mapv_inplace(|x| x + delta),
            AugmentStep::Contrast(factor) => {
                for mut channel in image.axis_iter_mut(Axis(2)) {
                    let mean = channel.mean().unwrap_or(0.0);
                    channel.mapv_inplace(|x| (x - mean) * factor + mean);
                }
            }
            AugmentStep::Saturation(factor) => adjust_hsv(image.view_mut(), |h, s, v| (h, s * factor, v)),
            AugmentStep::Hue(delta) => adjust_hsv(image.view_mut(), |h, s, v| (h + delta, s, v)),
        }
        image.mapv_inplace(|x| x.clamp(0.0, 1.0));
    }
}

/// Bilinear resize of a fractional crop window back to the full image size.
fn crop_and_resize(image: ArrayView3<'_, f32>, top: f32, left: f32, height: f32, width: f32) -> Array3<f32> {
    let (h, w, c) = image.dim();
    if h == 0 || w == 0 {
        return image.to_owned();
    }
    let taps = |start: f32, extent: f32, size: usize| -> Vec<(usize, usize, f32)> {
        (0..size)
            .map(|i| {
                let src = (start * size as f32 + (i as f32 + 0.5) * extent - 0.5).clamp(0.0, (size - 1) as f32);
                let lo = src.floor() as usize;
                (lo, (lo + 1).min(size - 1), src - lo as f32)
            })
            .collect()
    };
    let rows = taps(top, height, h);
    let cols = taps(left, width, w);
    Array3::from_shape_fn((h, w, c), |(y, x, k)| {
        let (y0, y1, fy) = rows[y];
        let (x0, x1, fx) = cols[x];
        let upper = image[[y0, x0, k]] * (1.0 - fx) + image[[y0, x1, k]] * fx;
        let lower = image[[y1, x0, k]] * (1.0 - fx) + image[[y1, x1, k]] * fx;
        upper * (1.0 - fy) + lower * fy
    })
}

/// Color ops only touch RGB images.
fn adjust_hsv(mut image: ArrayViewMut3<'_, f32>, adjust: impl Fn(f32, f32, f32) -> (f32, f32, f32)) {
    if image.dim().2 != 3 {
        return;
    }
    for mut pixel in image.lanes_mut(Axis(2)) {
        let (h, s, v) = rgb_to_hsv(pixel[0], pixel[1], pixel[2]);
        let (h, s, v) = adjust(h, s, v);
        let (r, g, b) = hsv_to_rgb(h, s.clamp(0.0, 1.0), v);
        pixel[0] = r;
        pixel[1] = g;
        pixel[2] = b;
    }
}

/// Hue in [0, 1).
pub fn rgb_to_hsv(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    let hue = if delta <= 0.0 {
        0.0
    } else if max == r {
        ((g - b) / delta).rem_euclid(6.0) / 6.0
    } else if max == g {
        ((b - r) / delta + 2.0) / 6.0
    } else {
        ((r - g) / delta + 4.0) / 6.0
    };
    let saturation = if max > 0.0 { delta / max } else { 0.0 };
    (hue, saturation, max)
}

pub fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (f32, f32, f32) {
    let h6 = h.rem_euclid(1.0) * 6.0;
    let chroma = v * s;
    let x = chroma * (1.0 - (h6 % 2.0 - 1.0).abs());
    let m = v - chroma;
    let (r, g, b) = match h6 as u32 {
        0 => (chroma, x, 0.0),
        1 => (x, chroma, 0.0),
        2 => (0.0, chroma, x),
        3 => (0.0, x, chroma),
        4 => (x, 0.0, chroma),
        _ => (chroma, 0.0, x),
    };
    (r + m, g + m, b + m)
}

/// Augments every `image_*` observation of `sample` together with its goal image.
pub fn augment_sample(sample: &mut Sample, config: &ImageAugmentConfig, rng: &mut fastrand::Rng) -> Result<()> {
    let keys: Vec<String> = sample
        .observations
        .keys()
        .filter(|k| k.starts_with(IMAGE_PREFIX))
        .cloned()
        .collect();
    for key in keys {
        let steps = config.sample_steps(rng);
        if let Some(frames) = sample.observations.get_mut(&key) {
            ensure!(
                frames.ndim() == 4,
                "expected (window, H, W, C) frames for '{}', got {:?}",
                key,
                frames.shape()
            );
            for frame in frames.axis_iter_mut(Axis(0)) {
                // missing cameras stay zero
                if frame.iter().all(|&v| v == 0.0) {
                    continue;
                }
                apply_steps(frame.into_dimensionality::<Ix3>()?, &steps);
            }
        }
        if let Some(goal) = sample.tasks.get_mut(&key) {
            if goal.iter().any(|&v| v != 0.0) {
                apply_steps(goal.view_mut().into_dimensionality::<Ix3>()?, &steps);
            }
        }
    }
    Ok(())
}
