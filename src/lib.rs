#![doc = include_str!("../README.md")]
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`index`]: R-tree of source footprints via [`SpatialIndex`]
//! - [`align`]: Working grid and per-source read plans via [`CrsAligner`]
//! - [`resample`]: Nearest, bilinear and cubic warping onto the target grid
//! - [`reader`]: Native window reads with request coalescing via [`TileReader`]
//! - [`tile_cache`]: Bounded LRU cache of decoded windows
//! - [`sampler`]: Grid, random and stratified window samplers
//! - [`dataset`]: The [`SampleEngine`] tying the above together per query
//! - [`pipeline`]: Worker pool and bounded prefetch queue
//! - [`batch`]: [`Sample`], [`Batch`] and the [`BatchAssembler`]
//! - [`augment`]: Alignment-preserving augmentations
//! - [`source`]: Source descriptors, GeoTIFF discovery and readers
//! - [`geometry`]: [`BoundingBox`], [`GeoTransform`] and projections
//! - [`config`]: JSON corpus and engine configuration
//! - [`geotiff_writer`]: Write samples to GeoTIFF files

// ============================================================================
// Public modules
// ============================================================================

pub mod align;
pub mod augment;
pub mod batch;
pub mod casting;
pub mod config;
pub mod dataset;
pub mod error;
pub mod geometry;
pub mod geotiff_writer;
pub mod index;
pub mod pipeline;
pub mod reader;
pub mod resample;
pub mod sampler;
pub mod source;
pub mod tile_cache;

// ============================================================================
// Errors
// ============================================================================

pub use error::{
    ConfigError,
    Error,
    IndexError,
    ReprojectionError,
    Result,
    SampleError,
    SampleFailure,
    ShapeError,
    SourceIoError,
    SourceIoKind,
};

// ============================================================================
// Geometry & Projections
// ============================================================================

pub use geometry::{BoundingBox, Crs, GeoTransform, PixelWindow};
pub use geometry::projection::{
    project_bounds,
    project_point,
    get_proj_string,
    is_geographic_crs,
    CoordTransformer,
};

// ============================================================================
// Sources
// ============================================================================

pub use source::{
    GeoTiffSource,
    LocalScanOptions,
    LocalScanStats,
    MemorySource,
    SourceDescriptor,
    SourceId,
    SourceReader,
    SourceRole,
};

// ============================================================================
// Indexing, Alignment & Reading
// ============================================================================

pub use index::SpatialIndex;
pub use align::{CrsAligner, Query, ReadWindow, TargetGrid};
pub use resample::{warp, ResamplingMethod, WarpedRaster};
pub use reader::{TileReader, MAX_STALLED_READS_PER_SOURCE};
pub use tile_cache::{CacheStats, TileCache};

// ============================================================================
// Sampling
// ============================================================================
// Primary API: SampleEngine::for_split(&corpus, "train")?.sampler()?

pub use sampler::{
    EdgePolicy,
    GridSampler,
    RandomSampler,
    SamplerKind,
    SamplingPolicy,
    StratifiedSampler,
    Stratum,
    WindowSpec,
};
pub use dataset::{EngineBuilder, SampleEngine};

// ============================================================================
// Batching & Pipeline
// ============================================================================
// Primary API: Pipeline::new(engine).batches()?

pub use batch::{Batch, BatchAssembler, Batches, Sample, SampleMeta};
pub use augment::{Augmentation, AugmentationConfig};
pub use pipeline::{Pipeline, PipelineOptions, RunStats, RunStatsSnapshot, SampleStream};

// ============================================================================
// Configuration
// ============================================================================

pub use config::{CorpusConfig, EngineConfig, SplitConfig, TemporalAggregation, TileShape};

// ============================================================================
// GeoTIFF Writing
// ============================================================================

pub use geotiff_writer::{
    GeoTiffCompression,
    GeoTiffWriteError,
    GeoTiffWriter,
};
