//! Per-sample augmentation transforms.
//!
//! Geometric transforms move image and label together so alignment is
//! preserved, and mark the sample [`reoriented`](crate::batch::SampleMeta::reoriented)
//! since its transform no longer describes the pixels. Randomness comes only from the RNG handed in by the
//! [`BatchAssembler`](crate::batch::BatchAssembler), which derives it from the
//! sample's sequence number; a fixed seed therefore reproduces every batch.

use ndarray::{Array2, Array3, Axis};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::batch::Sample;
use crate::error::ConfigError;

/// A transform from sample to sample.
pub trait Augmentation: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, sample: Sample, rng: &mut StdRng) -> Sample;
}

fn record(mut sample: Sample, name: &str) -> Sample {
    sample.meta.augmentations.push(name.to_string());
    sample
}

fn flip(mut sample: Sample, axis: usize) -> Sample {
    sample.image.invert_axis(Axis(axis + 1));
    if let Some(label) = sample.label.as_mut() {
        label.invert_axis(Axis(axis));
    }
    sample.meta.reoriented = true;
    sample
}

/// Mirror left-right with probability `p`.
#[derive(Debug, Clone, Copy)]
pub struct HorizontalFlip {
    pub p: f64,
}

impl Augmentation for HorizontalFlip {
    fn name(&self) -> &'static str {
        "horizontal_flip"
    }

    fn apply(&self, sample: Sample, rng: &mut StdRng) -> Sample {
        if rng.gen_bool(self.p) {
            record(flip(sample, 1), self.name())
        } else {
            sample
        }
    }
}

/// Mirror top-bottom with probability `p`.
#[derive(Debug, Clone, Copy)]
pub struct VerticalFlip {
    pub p: f64,
}

impl Augmentation for VerticalFlip {
    fn name(&self) -> &'static str {
        "vertical_flip"
    }

    fn apply(&self, sample: Sample, rng: &mut StdRng) -> Sample {
        if rng.gen_bool(self.p) {
            record(flip(sample, 0), self.name())
        } else {
            sample
        }
    }
}

/// Rotate a quarter turn counter-clockwise with probability `p`.
///
/// Non-square samples are left untouched since the output shape is fixed.
#[derive(Debug, Clone, Copy)]
pub struct Rotate90 {
    pub p: f64,
}

fn rot90_image(image: &Array3<f32>) -> Array3<f32> {
    let mut view = image.view();
    view.swap_axes(1, 2);
    view.invert_axis(Axis(1));
    view.as_standard_layout().into_owned()
}

fn rot90_label(label: &Array2<i64>) -> Array2<i64> {
    let mut view = label.view();
    view.swap_axes(0, 1);
    view.invert_axis(Axis(0));
    view.as_standard_layout().into_owned()
}

impl Augmentation for Rotate90 {
    fn name(&self) -> &'static str {
        "rotate90"
    }

    fn apply(&self, mut sample: Sample, rng: &mut StdRng) -> Sample {
        let (rows, cols) = sample.shape();
        if rows != cols || !rng.gen_bool(self.p) {
            return sample;
        }
        sample.image = rot90_image(&sample.image);
        sample.label = sample.label.as_ref().map(rot90_label);
        sample.meta.reoriented = true;
        record(sample, self.name())
    }
}

/// Per-band `(x - mean) / std`. Shorter lists repeat their last value.
#[derive(Debug, Clone)]
pub struct Normalize {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Augmentation for Normalize {
    fn name(&self) -> &'static str {
        "normalize"
    }

    fn apply(&self, mut sample: Sample, _rng: &mut StdRng) -> Sample {
        for (b, mut band) in sample.image.outer_iter_mut().enumerate() {
            let mean = self.mean.get(b).or(self.mean.last()).copied().unwrap_or(0.0);
            let std = self.std.get(b).or(self.std.last()).copied().unwrap_or(1.0);
            band.mapv_inplace(|v| (v - mean) / std);
        }
        record(sample, self.name())
    }
}

fn default_p() -> f64 {
    0.5
}

/// Serializable description of one augmentation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AugmentationConfig {
    HorizontalFlip {
        #[serde(default = "default_p")]
        p: f64,
    },
    VerticalFlip {
        #[serde(default = "default_p")]
        p: f64,
    },
    Rotate90 {
        #[serde(default = "default_p")]
        p: f64,
    },
    Normalize { mean: Vec<f32>, std: Vec<f32> },
}

impl AugmentationConfig {
    /// # Errors
    /// Returns a [`ConfigError`] for a probability outside `[0, 1]` or an
    /// invalid normalization.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::HorizontalFlip { p } | Self::VerticalFlip { p } | Self::Rotate90 { p } => {
                if (0.0..=1.0).contains(p) {
                    Ok(())
                } else {
                    Err(ConfigError::new(format!("augmentation probability {p} outside [0, 1]")))
                }
            }
            Self::Normalize { mean, std } => {
                if mean.is_empty() || std.is_empty() {
                    return Err(ConfigError::new("normalize needs at least one mean and std"));
                }
                if std.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
                    return Err(ConfigError::new("normalize std must be positive"));
                }
                Ok(())
            }
        }
    }

    /// # Errors
    /// See [`validate`](Self::validate).
    pub fn build(&self) -> Result<Box<dyn Augmentation>, ConfigError> {
        self.validate()?;
        Ok(match self {
            Self::HorizontalFlip { p } => Box::new(HorizontalFlip { p: *p }),
            Self::VerticalFlip { p } => Box::new(VerticalFlip { p: *p }),
            Self::Rotate90 { p } => Box::new(Rotate90 { p: *p }),
            Self::Normalize { mean, std } => Box::new(Normalize {
                mean: mean.clone(),
                std: std.clone(),
            }),
        })
    }
}

/// Build an ordered augmentation list.
///
/// # Errors
/// Returns the first invalid step.
pub fn build_all(configs: &[AugmentationConfig]) -> Result<Vec<Box<dyn Augmentation>>, ConfigError> {
    configs.iter().map(AugmentationConfig::build).collect()
}
