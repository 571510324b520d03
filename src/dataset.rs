//! The sample engine: query box in, pixel-aligned image/label sample out.
//!
//! Built once from a corpus and shared read-only between workers. Per query:
//!
//! 1. the [`SpatialIndex`] finds intersecting sources,
//! 2. the [`CrsAligner`] resolves each into a native [`ReadWindow`],
//! 3. the [`TileReader`] fetches it through the tile cache,
//! 4. [`warp`] resamples it onto the shared target grid,
//! 5. sources of one role sharing a time range are mosaicked
//!    first-registered-wins over valid pixels,
//! 6. image timepoints are combined per [`TemporalAggregation`].

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use ndarray::{s, Array2, Array3, Axis, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::align::{CrsAligner, Query, ReadWindow};
use crate::batch::{Sample, SampleMeta};
use crate::config::{CorpusConfig, EngineConfig, TemporalAggregation};
use crate::error::{ConfigError, IndexError, Result, SampleError, SampleFailure};
use crate::geometry::BoundingBox;
use crate::index::SpatialIndex;
use crate::reader::{TileReader, MAX_STALLED_READS_PER_SOURCE};
use crate::resample::warp;
use crate::sampler::{
    EdgePolicy, GridSampler, RandomSampler, SamplerKind, SamplingPolicy, StratifiedSampler, Stratum, WindowSpec,
};
use crate::source::local::{scan_paths, LocalScanOptions};
use crate::source::{SourceDescriptor, SourceId, SourceReader, SourceRole};

/// Collects sources before the working grid is fixed.
pub struct EngineBuilder {
    config: EngineConfig,
    sources: Vec<(SourceDescriptor, Arc<dyn SourceReader>)>,
    regions: BTreeMap<String, BoundingBox>,
}

impl EngineBuilder {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            sources: Vec::new(),
            regions: BTreeMap::new(),
        }
    }

    /// Add a source. Registration order decides mosaic priority and query order.
    #[must_use]
    pub fn source(mut self, descriptor: SourceDescriptor, reader: Arc<dyn SourceReader>) -> Self {
        self.sources.push((descriptor, reader));
        self
    }

    /// Add a named region (working CRS) for stratified or ROI sampling.
    #[must_use]
    pub fn region(mut self, id: impl Into<String>, bbox: BoundingBox) -> Self {
        self.regions.insert(id.into(), bbox);
        self
    }

    /// Scan files or directories for GeoTIFF sources of one role.
    #[must_use]
    pub fn scan(mut self, paths: &[PathBuf], role: SourceRole) -> Self {
        let found = scan_paths(paths, role, &LocalScanOptions::default());
        if found.stats.failed > 0 {
            warn!(role = role.as_str(), failed = found.stats.failed, "Some sources could not be probed");
        }
        for (descriptor, reader) in found.sources {
            self.sources.push((descriptor, Arc::new(reader)));
        }
        self
    }

    /// Fix the working grid and index every source.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] for an invalid configuration, an empty corpus,
    /// inconsistent image band counts or multi-band labels, and an
    /// [`IndexError`] or reprojection error if a footprint cannot be indexed.
    pub fn build(self) -> Result<SampleEngine> {
        self.config.validate()?;
        let Some(first) = self.sources.first() else {
            return Err(ConfigError::new("corpus has no sources").into());
        };
        let crs = self.config.working_crs().unwrap_or(first.0.crs);

        let mut index = SpatialIndex::new(crs);
        let mut reader = TileReader::new(self.config.cache_capacity, self.config.read_timeout())
            .with_read_threads(self.config.num_workers.max(1) + MAX_STALLED_READS_PER_SOURCE);
        let mut bands = None;
        let mut has_labels = false;
        for (descriptor, source) in self.sources {
            match descriptor.role {
                SourceRole::Image => match bands {
                    None => bands = Some(descriptor.bands),
                    Some(b) if b != descriptor.bands => {
                        return Err(ConfigError::new(format!(
                            "image source {} has {} bands, expected {b}",
                            descriptor.name, descriptor.bands
                        ))
                        .into());
                    }
                    Some(_) => {}
                },
                SourceRole::Label => {
                    if descriptor.bands != 1 {
                        return Err(ConfigError::new(format!(
                            "label source {} has {} bands; labels must be single-band",
                            descriptor.name, descriptor.bands
                        ))
                        .into());
                    }
                    has_labels = true;
                }
            }
            let id = index.register(descriptor)?;
            let rid = reader.register(source);
            debug_assert_eq!(id, rid);
        }
        let Some(native_bands) = bands else {
            return Err(ConfigError::new("corpus has no image sources").into());
        };
        if let Some(bad) = self.config.bands.iter().flatten().find(|b| **b >= native_bands) {
            return Err(ConfigError::new(format!("band {bad} out of range for {native_bands}-band images")).into());
        }
        let per_timepoint = self.config.bands.as_ref().map_or(native_bands, Vec::len);
        let bands = match self.config.temporal_aggregation {
            TemporalAggregation::Concat => per_timepoint * self.config.timepoints.unwrap_or(1),
            _ => per_timepoint,
        };

        let aligner = CrsAligner::from_index(&index, self.config.resolution, self.config.resampling_method_image)?;
        info!(
            crs = %crs,
            resolution = ?aligner.resolution(),
            sources = index.len(),
            bands,
            aggregation = self.config.temporal_aggregation.as_str(),
            has_labels,
            "Sample engine ready"
        );
        Ok(SampleEngine {
            config: self.config,
            index,
            aligner,
            reader,
            bands,
            per_timepoint,
            has_labels,
            regions: self.regions,
        })
    }
}

/// Shared, read-only sampling state for one split.
pub struct SampleEngine {
    config: EngineConfig,
    index: SpatialIndex,
    aligner: CrsAligner,
    reader: TileReader,
    /// Output image bands
    bands: usize,
    /// Output bands contributed by one timepoint
    per_timepoint: usize,
    has_labels: bool,
    regions: BTreeMap<String, BoundingBox>,
}

impl SampleEngine {
    #[must_use]
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Build the engine for one split of a corpus.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] for an unknown split or invalid settings, or any
    /// error from [`EngineBuilder::build`].
    pub fn for_split(corpus: &CorpusConfig, split: &str) -> Result<Self> {
        let config = corpus.engine_for(split)?;
        let split_cfg = corpus.split(split)?;
        let mut builder = EngineBuilder::new(config)
            .scan(&split_cfg.images, SourceRole::Image)
            .scan(&split_cfg.labels, SourceRole::Label);

        // regions are expressed in the working CRS, which needs the first source
        if !split_cfg.regions.is_empty() {
            let crs = builder
                .config
                .working_crs()
                .or_else(|| builder.sources.first().map(|(d, _)| d.crs))
                .ok_or_else(|| ConfigError::new(format!("split '{split}' has no sources")))?;
            for (id, bbox) in split_cfg.region_boxes(crs)? {
                builder = builder.region(id, bbox);
            }
        }
        info!(split, "Building sample engine");
        builder.build()
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }

    #[must_use]
    pub fn aligner(&self) -> &CrsAligner {
        &self.aligner
    }

    #[must_use]
    pub fn reader(&self) -> &TileReader {
        &self.reader
    }

    /// Output image band count, after band selection and temporal concatenation.
    #[must_use]
    pub fn bands(&self) -> usize {
        self.bands
    }

    #[must_use]
    pub fn has_labels(&self) -> bool {
        self.has_labels
    }

    /// Output (rows, cols).
    #[must_use]
    pub fn tile_shape(&self) -> (usize, usize) {
        self.config.tile_dims()
    }

    #[must_use]
    pub fn window_spec(&self) -> WindowSpec {
        WindowSpec {
            size: self.config.tile_dims(),
            stride: self.config.stride_dims(),
            resolution: self.aligner.resolution(),
        }
    }

    /// Stratification regions: configured regions first, then source names.
    fn strata(&self) -> std::result::Result<Vec<Stratum>, ConfigError> {
        self.config
            .class_weights
            .iter()
            .map(|(id, weight)| {
                let bbox = self
                    .regions
                    .get(id)
                    .copied()
                    .or_else(|| self.index.find(id).and_then(|sid| self.index.footprint(sid).copied()))
                    .ok_or_else(|| ConfigError::new(format!("class_weights names unknown region '{id}'")))?;
                Ok(Stratum {
                    id: id.clone(),
                    bbox,
                    weight: *weight,
                })
            })
            .collect()
    }

    /// A fresh sampler for one epoch, per the configured policy.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the policy cannot be satisfied by this corpus.
    pub fn sampler(&self) -> Result<SamplerKind> {
        let extent = self.index.extent()?;
        let spec = self.window_spec();
        let seed = self.config.seed;
        let limit = self.config.samples_per_epoch;
        Ok(match self.config.sampling_policy {
            SamplingPolicy::Grid => SamplerKind::Grid(GridSampler::new(extent, spec, self.config.edge_policy)?),
            SamplingPolicy::Random => {
                let rois: Vec<BoundingBox> = self.regions.values().copied().collect();
                SamplerKind::Random(RandomSampler::new(extent, spec, &rois, seed, limit)?)
            }
            SamplingPolicy::Stratified => {
                SamplerKind::Stratified(StratifiedSampler::new(extent, spec, self.strata()?, seed, limit)?)
            }
        })
    }

    /// Grid sampler with an explicit edge policy, regardless of configuration.
    ///
    /// # Errors
    /// Returns an error for an empty index or invalid window geometry.
    pub fn grid(&self, edge: EdgePolicy) -> Result<GridSampler> {
        Ok(GridSampler::new(self.index.extent()?, self.window_spec(), edge)?)
    }

    /// Query on the working grid for `bbox`.
    ///
    /// The grid is anchored at the top-left of `bbox` and always has the
    /// configured tile shape.
    #[must_use]
    pub fn query(&self, bbox: BoundingBox) -> Query {
        self.aligner.query(bbox, self.tile_shape())
    }

    /// Read plans for every source of `role` touching `query`, in registration order.
    ///
    /// # Errors
    /// Returns an [`IndexError`] for an invalid query box, or a reprojection
    /// error if a source cannot be related to the working CRS.
    pub fn read_windows(&self, query: &Query, role: SourceRole) -> std::result::Result<Vec<ReadWindow>, SampleError> {
        let mut plans = Vec::new();
        for id in self.index.query(&query.bbox)? {
            let Some(descriptor) = self.index.get(id) else { continue };
            if descriptor.role != role {
                continue;
            }
            let plan = self.aligner.resolve(query, id, descriptor)?;
            if !plan.window.is_empty() {
                plans.push(plan);
            }
        }
        Ok(plans)
    }

    /// Time range of the source behind `plan`.
    fn time_key(&self, plan: &ReadWindow) -> (f64, f64) {
        self.index
            .get(plan.source)
            .map_or((f64::NEG_INFINITY, f64::INFINITY), |d| (d.bounds.mint, d.bounds.maxt))
    }

    /// Plans grouped by source time range, earliest first; registration order within a group.
    fn timepoints<'p>(&self, plans: &'p [ReadWindow]) -> Vec<Vec<&'p ReadWindow>> {
        let cmp = |a: &ReadWindow, b: &ReadWindow| {
            let ((amin, amax), (bmin, bmax)) = (self.time_key(a), self.time_key(b));
            amin.total_cmp(&bmin).then(amax.total_cmp(&bmax))
        };
        let mut ordered: Vec<&ReadWindow> = plans.iter().collect();
        ordered.sort_by(|a, b| cmp(*a, *b));
        ordered
            .chunk_by(|a, b| cmp(*a, *b) == Ordering::Equal)
            .map(<[&ReadWindow]>::to_vec)
            .collect()
    }

    fn timepoint_rng(&self, bbox: &BoundingBox) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ bbox.minx.to_bits().rotate_left(17) ^ bbox.maxy.to_bits()),
            None => StdRng::from_entropy(),
        }
    }

    /// Resample and composite `plans` onto the query grid, first valid pixel wins.
    fn mosaic<'p>(
        &self,
        query: &Query,
        plans: impl IntoIterator<Item = &'p ReadWindow>,
        bands: usize,
        select: Option<&[usize]>,
        fill: f32,
    ) -> std::result::Result<(Array3<f32>, Array2<bool>), SampleError> {
        let (rows, cols) = query.grid.shape();
        let mut data = Array3::from_elem((bands, rows, cols), fill);
        let mut filled = Array2::from_elem((rows, cols), false);

        for plan in plans {
            let native = self.reader.read(plan)?;
            let warped = match select {
                Some(idx) => warp(&native.select(Axis(0), idx), plan)?,
                None => warp(&native, plan)?,
            };
            let warped_bands = warped.data.dim().0.min(bands);
            Zip::indexed(&mut filled).and(&warped.valid).for_each(|(r, c), done, valid| {
                if *done || !*valid {
                    return;
                }
                for b in 0..warped_bands {
                    data[(b, r, c)] = warped.data[(b, r, c)];
                }
                *done = true;
            });
            if filled.iter().all(|f| *f) {
                break;
            }
        }
        Ok((data, filled))
    }

    /// Combine the image timepoints of one query.
    fn image(&self, query: &Query, plans: &[ReadWindow]) -> std::result::Result<Array3<f32>, SampleError> {
        let bands = self.per_timepoint;
        let select = self.config.bands.as_deref();
        let fill = self.config.image_fill;
        let mut groups = self.timepoints(plans);
        match self.config.temporal_aggregation {
            TemporalAggregation::First => Ok(self.mosaic(query, groups.into_iter().flatten(), bands, select, fill)?.0),
            TemporalAggregation::Random => {
                let start = self.timepoint_rng(&query.bbox).gen_range(0..groups.len().max(1));
                let n = groups.len();
                groups.rotate_left(start.min(n));
                Ok(self.mosaic(query, groups.into_iter().flatten(), bands, select, fill)?.0)
            }
            TemporalAggregation::Median => {
                let layers = groups
                    .into_iter()
                    .map(|group| self.mosaic(query, group, bands, select, fill))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                let (rows, cols) = query.grid.shape();
                Ok(median(&layers, (bands, rows, cols), fill))
            }
            TemporalAggregation::Concat => {
                let (rows, cols) = query.grid.shape();
                let mut out = Array3::from_elem((self.bands, rows, cols), fill);
                let keep = self.config.timepoints.unwrap_or(1);
                if groups.len() > keep {
                    debug!(timepoints = groups.len(), keep, "Dropping later timepoints");
                }
                for (t, group) in groups.into_iter().take(keep).enumerate() {
                    let (layer, _) = self.mosaic(query, group, bands, select, fill)?;
                    out.slice_mut(s![t * bands..(t + 1) * bands, .., ..]).assign(&layer);
                }
                Ok(out)
            }
        }
    }

    /// Produce the aligned sample for `bbox`.
    ///
    /// # Errors
    /// Returns a [`SampleFailure`] carrying the query box when no image source
    /// intersects it, a source cannot be read, or reprojection fails.
    pub fn sample(&self, bbox: BoundingBox) -> std::result::Result<Sample, SampleFailure> {
        self.sample_inner(bbox).map_err(|e| SampleFailure::new(bbox, e))
    }

    fn sample_inner(&self, bbox: BoundingBox) -> std::result::Result<Sample, SampleError> {
        let query = self.query(bbox);
        let image_plans = self.read_windows(&query, SourceRole::Image)?;
        if image_plans.is_empty() {
            return Err(IndexError::NoSources { bbox, role: "image" }.into());
        }
        let image = self.image(&query, &image_plans)?;

        let mut sources: Vec<SourceId> = image_plans.iter().map(|p| p.source).collect();
        let label = if self.has_labels {
            let label_plans = self.read_windows(&query, SourceRole::Label)?;
            sources.extend(label_plans.iter().map(|p| p.source));
            #[allow(clippy::cast_precision_loss)]
            let fill = self.config.label_fill as f32;
            let ordered = self.timepoints(&label_plans).into_iter().flatten();
            let (raw, valid) = self.mosaic(&query, ordered, 1, None, fill)?;
            let label_fill = self.config.label_fill;
            let mut classes = Array2::from_elem(query.grid.shape(), label_fill);
            Zip::from(&mut classes)
                .and(raw.index_axis(ndarray::Axis(0), 0))
                .and(&valid)
                .for_each(|out, v, ok| {
                    if *ok {
                        #[allow(clippy::cast_possible_truncation)]
                        {
                            *out = v.round() as i64;
                        }
                    }
                });
            Some(classes)
        } else {
            None
        };

        let source_names = sources
            .iter()
            .filter_map(|id| self.index.get(*id).map(|d| d.name.clone()))
            .collect();
        debug!(bbox = %bbox, sources = sources.len(), "Sampled window");
        Ok(Sample {
            image,
            label,
            meta: SampleMeta {
                seq: 0,
                bbox,
                crs: query.grid.crs,
                transform: query.grid.transform,
                sources,
                source_names,
                augmentations: Vec::new(),
                reoriented: false,
            },
        })
    }
}

/// Per-pixel median over the layers valid there; an even count averages the middle pair.
fn median(layers: &[(Array3<f32>, Array2<bool>)], shape: (usize, usize, usize), fill: f32) -> Array3<f32> {
    let mut out = Array3::from_elem(shape, fill);
    let mut values = Vec::with_capacity(layers.len());
    for ((b, r, c), px) in out.indexed_iter_mut() {
        values.clear();
        values.extend(layers.iter().filter(|(_, valid)| valid[(r, c)]).map(|(data, _)| data[(b, r, c)]));
        values.sort_by(f32::total_cmp);
        let mid = values.len() / 2;
        *px = match values.len() {
            0 => continue,
            n if n % 2 == 1 => values[mid],
            _ => (values[mid - 1] + values[mid]) / 2.0,
        };
    }
    out
}
