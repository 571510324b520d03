//! Engine and corpus configuration.
//!
//! Everything is deserialized from JSON with defaults for every key, then
//! checked once by [`EngineConfig::validate`]. Invalid configuration is fatal
//! at startup and never surfaces mid-run.
//!
//! ```json
//! {
//!   "engine": { "tile_size": 256, "sampling_policy": "random", "samples_per_epoch": 1000, "seed": 7 },
//!   "splits": {
//!     "train": { "images": ["/data/train/images"], "labels": ["/data/train/masks"] }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::augment::AugmentationConfig;
use crate::error::{ConfigError, Error, Result};
use crate::geometry::{BoundingBox, Crs};
use crate::resample::ResamplingMethod;
use crate::sampler::{cumulative_weights, EdgePolicy, SamplingPolicy};

/// Window extent in pixels: a single number for square tiles or `[rows, cols]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TileShape {
    Square(usize),
    Rect([usize; 2]),
}

impl TileShape {
    /// (rows, cols)
    #[must_use]
    pub fn dims(self) -> (usize, usize) {
        match self {
            Self::Square(n) => (n, n),
            Self::Rect([rows, cols]) => (rows, cols),
        }
    }
}

impl Default for TileShape {
    fn default() -> Self {
        Self::Square(256)
    }
}

/// How image sources with different time ranges combine at one pixel.
///
/// Sources sharing a time range are always mosaicked first-registered-wins;
/// these modes act across the resulting timepoints, earliest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemporalAggregation {
    /// Earliest timepoint with a valid pixel wins.
    #[default]
    First,
    /// Per-pixel median over the valid timepoints.
    Median,
    /// Timepoints stacked along the band axis, `timepoints` of them.
    Concat,
    /// Like `First`, starting from a random timepoint per sample.
    Random,
}

impl TemporalAggregation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::First => "first",
            Self::Median => "median",
            Self::Concat => "concat",
            Self::Random => "random",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub tile_size: TileShape,
    /// Defaults to `tile_size` (no overlap).
    pub stride: Option<TileShape>,
    pub sampling_policy: SamplingPolicy,
    pub edge_policy: EdgePolicy,
    /// Length of one random or stratified epoch; unbounded if unset.
    pub samples_per_epoch: Option<usize>,
    pub resampling_method_image: ResamplingMethod,
    pub resampling_method_label: ResamplingMethod,
    /// Tile cache entries.
    pub cache_capacity: usize,
    pub num_workers: usize,
    /// Queue depth between workers and consumer.
    pub prefetch: Option<usize>,
    pub seed: Option<u64>,
    pub batch_size: usize,
    pub augmentations: Vec<AugmentationConfig>,
    pub class_weights: BTreeMap<String, f64>,
    /// Working CRS as an EPSG code; defaults to the first source's CRS.
    pub crs: Option<i32>,
    /// Working resolution in CRS units; defaults to the finest native resolution.
    pub resolution: Option<f64>,
    pub image_fill: f32,
    pub label_fill: i64,
    pub read_timeout_ms: Option<u64>,
    pub max_consecutive_failures: usize,
    /// Zero-based image bands to keep, in output order; all bands if unset.
    pub bands: Option<Vec<usize>>,
    pub temporal_aggregation: TemporalAggregation,
    /// Timepoints per sample under `concat`; missing ones are filled.
    pub timepoints: Option<usize>,
    /// Deliver labels as one-hot masks with this many class channels.
    pub one_hot_classes: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tile_size: TileShape::default(),
            stride: None,
            sampling_policy: SamplingPolicy::Grid,
            edge_policy: EdgePolicy::Pad,
            samples_per_epoch: None,
            resampling_method_image: ResamplingMethod::Bilinear,
            resampling_method_label: ResamplingMethod::Nearest,
            cache_capacity: 128,
            num_workers: 0,
            prefetch: None,
            seed: None,
            batch_size: 8,
            augmentations: Vec::new(),
            class_weights: BTreeMap::new(),
            crs: None,
            resolution: None,
            image_fill: 0.0,
            label_fill: 0,
            read_timeout_ms: None,
            max_consecutive_failures: 32,
            bands: None,
            temporal_aggregation: TemporalAggregation::First,
            timepoints: None,
            one_hot_classes: None,
        }
    }
}

impl EngineConfig {
    /// Output (rows, cols).
    #[must_use]
    pub fn tile_dims(&self) -> (usize, usize) {
        self.tile_size.dims()
    }

    /// Grid step (rows, cols).
    #[must_use]
    pub fn stride_dims(&self) -> (usize, usize) {
        self.stride.unwrap_or(self.tile_size).dims()
    }

    #[must_use]
    pub fn prefetch_depth(&self) -> usize {
        self.prefetch.unwrap_or(2 * self.num_workers.max(1)).max(1)
    }

    #[must_use]
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub fn working_crs(&self) -> Option<Crs> {
        self.crs.map(Crs)
    }

    /// # Errors
    /// Returns a [`ConfigError`] describing the first invalid setting.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let (rows, cols) = self.tile_dims();
        if rows == 0 || cols == 0 {
            return Err(ConfigError::new("tile_size must be positive"));
        }
        let (srows, scols) = self.stride_dims();
        if srows == 0 || scols == 0 {
            return Err(ConfigError::new("stride must be positive"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::new("batch_size must be positive"));
        }
        if self.resampling_method_label != ResamplingMethod::Nearest {
            return Err(ConfigError::new(format!(
                "label resampling must be nearest, got {}",
                self.resampling_method_label.as_str()
            )));
        }
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::new("max_consecutive_failures must be at least 1"));
        }
        if let Some(res) = self.resolution {
            if !(res.is_finite() && res > 0.0) {
                return Err(ConfigError::new(format!("resolution must be positive, got {res}")));
            }
        }
        if self.samples_per_epoch == Some(0) {
            return Err(ConfigError::new("samples_per_epoch must be positive"));
        }
        if self.sampling_policy == SamplingPolicy::Stratified {
            if self.class_weights.is_empty() {
                return Err(ConfigError::new("stratified sampling requires class_weights"));
            }
            let weights: Vec<f64> = self.class_weights.values().copied().collect();
            cumulative_weights(&weights)?;
        }
        if self.bands.as_ref().is_some_and(Vec::is_empty) {
            return Err(ConfigError::new("bands must name at least one band"));
        }
        match (self.temporal_aggregation, self.timepoints) {
            (TemporalAggregation::Concat, None | Some(0)) => {
                return Err(ConfigError::new("concat aggregation requires timepoints >= 1"));
            }
            (TemporalAggregation::Concat, Some(_)) | (_, None) => {}
            (other, Some(_)) => {
                return Err(ConfigError::new(format!(
                    "timepoints only applies to concat aggregation, not {}",
                    other.as_str()
                )));
            }
        }
        if self.one_hot_classes.is_some_and(|n| n < 2) {
            return Err(ConfigError::new("one_hot_classes must be at least 2"));
        }
        for aug in &self.augmentations {
            aug.validate()?;
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`Error::ConfigFile`] if the file cannot be read or parsed, or a
    /// [`ConfigError`] if it fails validation.
    pub fn from_path(path: &Path) -> Result<Self> {
        let cfg: Self = read_json(path)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Sources and weighting for one split.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SplitConfig {
    /// Image files or directories
    pub images: Vec<PathBuf>,
    /// Label files or directories
    pub labels: Vec<PathBuf>,
    /// Overrides the engine-level weights when non-empty.
    pub class_weights: BTreeMap<String, f64>,
    /// Named `[minx, miny, maxx, maxy]` boxes in the working CRS.
    pub regions: BTreeMap<String, [f64; 4]>,
}

impl SplitConfig {
    /// Regions as boxes in `crs`.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] for an inverted or non-finite box.
    pub fn region_boxes(&self, crs: Crs) -> std::result::Result<BTreeMap<String, BoundingBox>, ConfigError> {
        self.regions
            .iter()
            .map(|(id, [minx, miny, maxx, maxy])| {
                BoundingBox::try_new(*minx, *miny, *maxx, *maxy, crs)
                    .map(|bbox| (id.clone(), bbox))
                    .map_err(|e| ConfigError::new(format!("region {id}: {e}")))
            })
            .collect()
    }
}

/// A full corpus: engine settings plus named splits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorpusConfig {
    pub engine: EngineConfig,
    pub splits: BTreeMap<String, SplitConfig>,
}

impl CorpusConfig {
    /// # Errors
    /// See [`EngineConfig::from_path`].
    pub fn from_path(path: &Path) -> Result<Self> {
        let cfg: Self = read_json(path)?;
        if cfg.splits.is_empty() {
            cfg.engine.validate()?;
        }
        for name in cfg.splits.keys() {
            cfg.engine_for(name)?;
        }
        Ok(cfg)
    }

    /// # Errors
    /// Returns a [`ConfigError`] if the split is not defined.
    pub fn split(&self, name: &str) -> std::result::Result<&SplitConfig, ConfigError> {
        self.splits.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.splits.keys().map(String::as_str).collect();
            ConfigError::new(format!("unknown split '{name}', expected one of {known:?}"))
        })
    }

    /// Engine settings with the split's weights applied.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] for an unknown split or invalid merged weights.
    pub fn engine_for(&self, name: &str) -> std::result::Result<EngineConfig, ConfigError> {
        let split = self.split(name)?;
        let mut engine = self.engine.clone();
        if !split.class_weights.is_empty() {
            engine.class_weights = split.class_weights.clone();
        }
        engine.validate()?;
        Ok(engine)
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let raw = std::fs::read(path).map_err(|e| Error::ConfigFile {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    serde_json::from_slice(&raw).map_err(|e| Error::ConfigFile {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
