//! Samples, batches and the batch assembler.

use ndarray::{stack, Array2, Array3, Array4, ArrayView2, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use tracing::debug;

use crate::augment::Augmentation;
use crate::error::{Error, Result, ShapeError};
use crate::geometry::{BoundingBox, Crs, GeoTransform};
use crate::source::SourceId;

/// Where a sample came from, enough to trace a prediction back to the ground.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleMeta {
    /// Position in the sampler's sequence
    pub seq: u64,
    /// Query box, clipped to the extent for padded grid tiles
    pub bbox: BoundingBox,
    pub crs: Crs,
    /// Transform of the output grid, shared by image and label.
    ///
    /// Describes the pixels as sampled, before any geometric augmentation;
    /// see [`reoriented`](Self::reoriented).
    pub transform: GeoTransform,
    pub sources: Vec<SourceId>,
    pub source_names: Vec<String>,
    /// Names of augmentations applied, in order
    pub augmentations: Vec<String>,
    /// A flip or rotation moved pixels, so `transform` no longer maps them
    pub reoriented: bool,
}

/// One aligned image/label pair on the output grid.
#[derive(Debug, Clone)]
pub struct Sample {
    /// `[bands, rows, cols]`
    pub image: Array3<f32>,
    /// `[rows, cols]` class indices, if the corpus has labels
    pub label: Option<Array2<i64>>,
    pub meta: SampleMeta,
}

impl Sample {
    /// Output (rows, cols).
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        let (_, rows, cols) = self.image.dim();
        (rows, cols)
    }

    #[must_use]
    pub fn bands(&self) -> usize {
        self.image.dim().0
    }
}

/// Stacked samples plus per-sample metadata in the same order.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[n, bands, rows, cols]`
    pub images: Array4<f32>,
    /// `[n, rows, cols]`
    pub labels: Option<Array3<i64>>,
    /// `[n, classes, rows, cols]` one-hot labels, when enabled
    pub masks: Option<Array4<f32>>,
    pub meta: Vec<SampleMeta>,
    /// Set on a short batch: the sample sequence is exhausted
    pub is_last: bool,
}

impl Batch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.meta.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.meta.is_empty()
    }
}

/// Validates, augments and stacks samples into batches.
pub struct BatchAssembler {
    batch_size: usize,
    shape: (usize, usize),
    bands: usize,
    with_labels: bool,
    one_hot: Option<usize>,
    augmentations: Vec<Box<dyn Augmentation>>,
    seed: u64,
}

impl BatchAssembler {
    /// `shape` is the output (rows, cols); `bands` the image band count.
    #[must_use]
    pub fn new(batch_size: usize, shape: (usize, usize), bands: usize, with_labels: bool) -> Self {
        Self {
            batch_size: batch_size.max(1),
            shape,
            bands,
            with_labels,
            one_hot: None,
            augmentations: Vec::new(),
            seed: rand::random(),
        }
    }

    /// Augmentations applied to every sample, in this order.
    #[must_use]
    pub fn with_augmentations(mut self, augmentations: Vec<Box<dyn Augmentation>>) -> Self {
        self.augmentations = augmentations;
        self
    }

    /// Base seed for per-sample augmentation randomness.
    #[must_use]
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        if let Some(seed) = seed {
            self.seed = seed;
        }
        self
    }

    /// Also deliver labels as one-hot masks over `classes` channels.
    ///
    /// Classes outside `0..classes` (fill included) get an all-zero column.
    #[must_use]
    pub fn with_one_hot(mut self, classes: Option<usize>) -> Self {
        self.one_hot = classes;
        self
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Check one sample against the configured shape.
    ///
    /// # Errors
    /// Returns a [`ShapeError`] on any image or label mismatch.
    pub fn validate(&self, sample: &Sample) -> std::result::Result<(), ShapeError> {
        let expected = vec![self.bands, self.shape.0, self.shape.1];
        let found = sample.image.shape().to_vec();
        if found != expected {
            return Err(ShapeError {
                what: "image",
                expected,
                found,
                bbox: sample.meta.bbox,
            });
        }
        let expected = vec![self.shape.0, self.shape.1];
        match (&sample.label, self.with_labels) {
            (Some(label), true) if label.shape() == expected.as_slice() => Ok(()),
            (None, false) => Ok(()),
            (label, _) => Err(ShapeError {
                what: "label",
                expected: if self.with_labels { expected } else { Vec::new() },
                found: label.as_ref().map(|l| l.shape().to_vec()).unwrap_or_default(),
                bbox: sample.meta.bbox,
            }),
        }
    }

    fn rng_for(&self, seq: u64) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ seq.wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }

    fn augment(&self, mut sample: Sample) -> Sample {
        let mut rng = self.rng_for(sample.meta.seq);
        for aug in &self.augmentations {
            sample = aug.apply(sample, &mut rng);
        }
        sample
    }

    /// Validate, augment and stack `samples` into one batch.
    ///
    /// Augmentation runs in parallel across samples; each sample's transforms
    /// run in configured order with an RNG derived from its sequence number.
    ///
    /// # Errors
    /// Returns a [`ShapeError`] if any sample does not match the configured shape.
    pub fn assemble(&self, samples: Vec<Sample>) -> std::result::Result<Batch, ShapeError> {
        for sample in &samples {
            self.validate(sample)?;
        }
        let samples: Vec<Sample> = if self.augmentations.is_empty() {
            samples
        } else {
            samples.into_par_iter().map(|s| self.augment(s)).collect()
        };
        for sample in &samples {
            self.validate(sample)?;
        }

        let n = samples.len();
        let shape_err = |what: &'static str, expected: Vec<usize>, e: ndarray::ShapeError| {
            debug!(error = %e, what, "Stacking failed");
            ShapeError {
                what,
                expected,
                found: vec![n],
                bbox: samples[0].meta.bbox,
            }
        };

        let images = if n == 0 {
            Array4::zeros((0, self.bands, self.shape.0, self.shape.1))
        } else {
            let views: Vec<ArrayView3<'_, f32>> = samples.iter().map(|s| s.image.view()).collect();
            stack(Axis(0), &views).map_err(|e| shape_err("image batch", vec![n, self.bands, self.shape.0, self.shape.1], e))?
        };
        let labels = if !self.with_labels {
            None
        } else if n == 0 {
            Some(Array3::zeros((0, self.shape.0, self.shape.1)))
        } else {
            let views: Vec<ArrayView2<'_, i64>> = samples
                .iter()
                .filter_map(|s| s.label.as_ref().map(|l| l.view()))
                .collect();
            Some(stack(Axis(0), &views).map_err(|e| shape_err("label batch", vec![n, self.shape.0, self.shape.1], e))?)
        };

        let masks = match (&labels, self.one_hot) {
            (Some(labels), Some(classes)) => Some(one_hot(labels, classes)),
            _ => None,
        };

        Ok(Batch {
            images,
            labels,
            masks,
            meta: samples.into_iter().map(|s| s.meta).collect(),
            is_last: false,
        })
    }

    /// Pull samples from `stream` until a batch is full.
    ///
    /// Per-sample failures are dropped and replaced by further draws; fatal
    /// errors are returned. Returns a short batch with `is_last` set when the
    /// stream ends, and `Ok(None)` once nothing is left.
    ///
    /// # Errors
    /// Returns the first fatal error from the stream, or a [`ShapeError`].
    pub fn next_batch<I>(&self, stream: &mut I) -> Result<Option<Batch>>
    where
        I: Iterator<Item = Result<Sample>>,
    {
        let mut samples = Vec::with_capacity(self.batch_size);
        let mut dropped = 0_usize;
        let mut exhausted = false;
        while samples.len() < self.batch_size {
            match stream.next() {
                Some(Ok(sample)) => samples.push(sample),
                Some(Err(e)) if e.is_fatal() => return Err(e),
                Some(Err(_)) => dropped += 1,
                None => {
                    exhausted = true;
                    break;
                }
            }
        }
        if dropped > 0 {
            debug!(dropped, "Replaced failed samples");
        }
        if samples.is_empty() {
            return Ok(None);
        }
        let mut batch = self.assemble(samples).map_err(Error::from)?;
        batch.is_last = exhausted;
        Ok(Some(batch))
    }

    /// Iterator of batches over `stream`.
    pub fn batches<I>(self, stream: I) -> Batches<I>
    where
        I: Iterator<Item = Result<Sample>>,
    {
        Batches {
            assembler: self,
            stream,
            done: false,
        }
    }
}

/// `[n, rows, cols]` class indices to `[n, classes, rows, cols]` indicators.
fn one_hot(labels: &Array3<i64>, classes: usize) -> Array4<f32> {
    let (n, rows, cols) = labels.dim();
    let mut masks = Array4::zeros((n, classes, rows, cols));
    for ((i, r, c), class) in labels.indexed_iter() {
        if let Some(k) = usize::try_from(*class).ok().filter(|k| *k < classes) {
            masks[(i, k, r, c)] = 1.0;
        }
    }
    masks
}

/// Batches drawn from a sample stream until it ends or fails.
pub struct Batches<I> {
    assembler: BatchAssembler,
    stream: I,
    done: bool,
}

impl<I> Batches<I> {
    #[must_use]
    pub fn assembler(&self) -> &BatchAssembler {
        &self.assembler
    }

    #[must_use]
    pub fn stream(&self) -> &I {
        &self.stream
    }
}

impl<I> Iterator for Batches<I>
where
    I: Iterator<Item = Result<Sample>>,
{
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Result<Batch>> {
        if self.done {
            return None;
        }
        match self.assembler.next_batch(&mut self.stream) {
            Ok(Some(batch)) => {
                self.done = batch.is_last;
                Some(Ok(batch))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
