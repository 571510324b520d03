//! CRS alignment: the common working grid and per-source read windows.
//!
//! Every sample is produced on a [`TargetGrid`] in the working CRS. For each
//! source touching a [`Query`], [`CrsAligner::resolve`] computes the native
//! pixel window that covers the reprojected target footprint, grown by one
//! pixel so interpolation kernels have neighbours at the boundary.
//!
//! Image and label reads for one query share the same `TargetGrid`, which is
//! what makes their outputs pixel-aligned regardless of native CRS or resolution.

use crate::casting::{covering_range, dim_to_f64};
use crate::error::{ConfigError, ReprojectionError};
use crate::geometry::projection::{CoordTransformer, DEFAULT_DENSIFY_POINTS};
use crate::geometry::{BoundingBox, Crs, GeoTransform, PixelWindow};
use crate::index::SpatialIndex;
use crate::resample::ResamplingMethod;
use crate::source::{SourceDescriptor, SourceId, SourceRole};

/// Pixels added around the covering window on every side.
pub const READ_MARGIN: usize = 1;

/// Fixed-shape output grid: CRS, affine transform and (rows, cols).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetGrid {
    pub crs: Crs,
    pub transform: GeoTransform,
    pub rows: usize,
    pub cols: usize,
}

impl TargetGrid {
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Full footprint of the grid, which may extend past the query box when padded.
    #[must_use]
    pub fn bounds(&self) -> BoundingBox {
        self.transform.bounds(self.cols, self.rows, self.crs)
    }
}

/// One sample request: where to look and what the output looks like.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Query {
    pub bbox: BoundingBox,
    pub grid: TargetGrid,
}

/// Native read plan for one source under one query.
///
/// `(source, window)` is the tile cache key; the rest describes how to
/// resample the native pixels onto `target`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadWindow {
    pub source: SourceId,
    pub role: SourceRole,
    pub window: PixelWindow,
    pub resampling: ResamplingMethod,
    pub target: TargetGrid,
    pub source_crs: Crs,
    pub source_transform: GeoTransform,
    pub source_width: usize,
    pub source_height: usize,
    pub nodata: Option<f64>,
}

impl ReadWindow {
    #[must_use]
    pub fn cache_key(&self) -> (SourceId, PixelWindow) {
        (self.source, self.window)
    }
}

/// Resolves queries onto a common CRS and resolution.
#[derive(Debug, Clone)]
pub struct CrsAligner {
    crs: Crs,
    resolution: (f64, f64),
    image_method: ResamplingMethod,
}

impl CrsAligner {
    #[must_use]
    pub fn new(crs: Crs, resolution: (f64, f64), image_method: ResamplingMethod) -> Self {
        Self {
            crs,
            resolution,
            image_method,
        }
    }

    /// Working grid for an index: the index CRS, at `resolution` if given,
    /// otherwise the finest native resolution among registered sources
    /// measured in the index CRS.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the resolution is not positive or no source
    /// has a non-degenerate footprint to derive one from.
    pub fn from_index(
        index: &SpatialIndex,
        resolution: Option<f64>,
        image_method: ResamplingMethod,
    ) -> Result<Self, ConfigError> {
        let resolution = match resolution {
            Some(res) if res > 0.0 && res.is_finite() => (res, res),
            Some(res) => return Err(ConfigError::new(format!("resolution must be positive, got {res}"))),
            None => finest_resolution(index)
                .ok_or_else(|| ConfigError::new("cannot derive a working resolution from an empty corpus"))?,
        };
        Ok(Self::new(index.crs(), resolution, image_method))
    }

    #[must_use]
    pub fn crs(&self) -> Crs {
        self.crs
    }

    #[must_use]
    pub fn resolution(&self) -> (f64, f64) {
        self.resolution
    }

    /// Query for `bbox` with a fixed output shape, anchored at the box's top-left corner.
    #[must_use]
    pub fn query(&self, bbox: BoundingBox, shape: (usize, usize)) -> Query {
        Query {
            bbox,
            grid: TargetGrid {
                crs: self.crs,
                transform: GeoTransform::anchored_at(&bbox, self.resolution),
                rows: shape.0,
                cols: shape.1,
            },
        }
    }

    /// Labels are categorical and always use nearest neighbour.
    #[must_use]
    pub fn method_for(&self, role: SourceRole) -> ResamplingMethod {
        match role {
            SourceRole::Image => self.image_method,
            SourceRole::Label => ResamplingMethod::Nearest,
        }
    }

    /// Native window of `source` covering the query grid.
    ///
    /// The window is empty when the reprojected grid misses the raster.
    ///
    /// # Errors
    /// Returns a [`ReprojectionError`] if the working CRS and the source CRS
    /// cannot be related.
    pub fn resolve(&self, query: &Query, id: SourceId, source: &SourceDescriptor) -> Result<ReadWindow, ReprojectionError> {
        let transformer = CoordTransformer::new(query.grid.crs, source.crs)?;
        let native = transformer.transform_bounds(&query.grid.bounds(), DEFAULT_DENSIFY_POINTS)?;

        let (c0, r0) = source.transform.world_to_pixel(native.minx, native.maxy);
        let (c1, r1) = source.transform.world_to_pixel(native.maxx, native.miny);
        let (col_start, col_end) = covering_range(c0.min(c1), c0.max(c1), READ_MARGIN, source.width);
        let (row_start, row_end) = covering_range(r0.min(r1), r0.max(r1), READ_MARGIN, source.height);

        Ok(ReadWindow {
            source: id,
            role: source.role,
            window: PixelWindow::new(col_start, row_start, col_end - col_start, row_end - row_start),
            resampling: self.method_for(source.role),
            target: query.grid,
            source_crs: source.crs,
            source_transform: source.transform,
            source_width: source.width,
            source_height: source.height,
            nodata: source.nodata,
        })
    }
}

fn finest_resolution(index: &SpatialIndex) -> Option<(f64, f64)> {
    let mut best: Option<(f64, f64)> = None;
    for (id, source) in index.iter() {
        let Some(footprint) = index.footprint(id) else { continue };
        if source.width == 0 || source.height == 0 || footprint.is_degenerate() {
            continue;
        }
        let res_x = footprint.width() / dim_to_f64(source.width);
        let res_y = footprint.height() / dim_to_f64(source.height);
        best = Some(match best {
            Some((bx, by)) => (bx.min(res_x), by.min(res_y)),
            None => (res_x, res_y),
        });
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceLocation;

    fn source(role: SourceRole, crs: Crs, transform: GeoTransform, size: usize) -> SourceDescriptor {
        SourceDescriptor::new("s", SourceLocation::Memory("s".into()), role, crs, transform, size, size, 1)
    }

    #[test]
    fn test_query_grid_anchored_top_left() {
        let aligner = CrsAligner::new(Crs(32633), (10.0, 10.0), ResamplingMethod::Bilinear);
        let q = aligner.query(BoundingBox::new(100.0, 200.0, 200.0, 300.0, Crs(32633)), (10, 10));
        assert_eq!(q.grid.transform, GeoTransform::new(100.0, 300.0, 10.0, 10.0));
        assert_eq!(q.grid.bounds(), BoundingBox::new(100.0, 200.0, 200.0, 300.0, Crs(32633)));
    }

    #[test]
    fn test_resolve_same_crs_window_with_margin() {
        let aligner = CrsAligner::new(Crs(32633), (10.0, 10.0), ResamplingMethod::Bilinear);
        let src = source(SourceRole::Image, Crs(32633), GeoTransform::new(0.0, 1000.0, 10.0, 10.0), 100);
        let q = aligner.query(BoundingBox::new(200.0, 700.0, 300.0, 800.0, Crs(32633)), (10, 10));
        let rw = aligner.resolve(&q, SourceId(0), &src).unwrap();
        // covering cols 20..30, rows 20..30, plus one pixel of margin
        assert_eq!(rw.window, PixelWindow::new(19, 19, 12, 12));
        assert_eq!(rw.resampling, ResamplingMethod::Bilinear);
    }

    #[test]
    fn test_resolve_clamps_at_raster_edge() {
        let aligner = CrsAligner::new(Crs(32633), (10.0, 10.0), ResamplingMethod::Nearest);
        let src = source(SourceRole::Image, Crs(32633), GeoTransform::new(0.0, 1000.0, 10.0, 10.0), 100);
        let q = aligner.query(BoundingBox::new(0.0, 900.0, 100.0, 1000.0, Crs(32633)), (10, 10));
        let rw = aligner.resolve(&q, SourceId(0), &src).unwrap();
        assert_eq!(rw.window, PixelWindow::new(0, 0, 11, 11));

        let miss = aligner.query(BoundingBox::new(5000.0, 5000.0, 5100.0, 5100.0, Crs(32633)), (10, 10));
        assert!(aligner.resolve(&miss, SourceId(0), &src).unwrap().window.is_empty());
    }

    #[test]
    fn test_labels_always_nearest() {
        let aligner = CrsAligner::new(Crs(32633), (10.0, 10.0), ResamplingMethod::Cubic);
        let label = source(SourceRole::Label, Crs(32633), GeoTransform::new(0.0, 1000.0, 10.0, 10.0), 100);
        let q = aligner.query(BoundingBox::new(0.0, 900.0, 100.0, 1000.0, Crs(32633)), (10, 10));
        assert_eq!(aligner.resolve(&q, SourceId(0), &label).unwrap().resampling, ResamplingMethod::Nearest);
        assert_eq!(aligner.method_for(SourceRole::Image), ResamplingMethod::Cubic);
    }

    #[test]
    fn test_resolve_foreign_crs() {
        // working grid in WGS84, source in UTM 33N at 10 m
        let aligner = CrsAligner::new(Crs::WGS84, (0.0001, 0.0001), ResamplingMethod::Bilinear);
        let src = source(SourceRole::Image, Crs(32633), GeoTransform::new(495_000.0, 5_765_000.0, 10.0, 10.0), 1000);
        let q = aligner.query(BoundingBox::new(14.99, 52.0, 15.0, 52.01, Crs::WGS84), (100, 100));
        let rw = aligner.resolve(&q, SourceId(0), &src).unwrap();
        assert!(!rw.window.is_empty());
        assert!(rw.window.fits_within(1000, 1000));
        assert_eq!(rw.source_crs, Crs(32633));
    }

    #[test]
    fn test_resolve_unknown_crs_fails() {
        let aligner = CrsAligner::new(Crs(32633), (10.0, 10.0), ResamplingMethod::Nearest);
        let src = source(SourceRole::Image, Crs(999_999), GeoTransform::new(0.0, 1000.0, 10.0, 10.0), 100);
        let q = aligner.query(BoundingBox::new(0.0, 900.0, 100.0, 1000.0, Crs(32633)), (10, 10));
        assert!(aligner.resolve(&q, SourceId(0), &src).is_err());
    }

    #[test]
    fn test_from_index_finest_resolution() {
        let mut index = SpatialIndex::new(Crs(32633));
        index
            .register(source(SourceRole::Image, Crs(32633), GeoTransform::new(0.0, 1000.0, 10.0, 10.0), 100))
            .unwrap();
        index
            .register(source(SourceRole::Label, Crs(32633), GeoTransform::new(0.0, 1000.0, 20.0, 20.0), 50))
            .unwrap();
        let aligner = CrsAligner::from_index(&index, None, ResamplingMethod::Bilinear).unwrap();
        assert_eq!(aligner.resolution(), (10.0, 10.0));

        let fixed = CrsAligner::from_index(&index, Some(5.0), ResamplingMethod::Bilinear).unwrap();
        assert_eq!(fixed.resolution(), (5.0, 5.0));
        assert!(CrsAligner::from_index(&index, Some(-1.0), ResamplingMethod::Bilinear).is_err());
        assert!(CrsAligner::from_index(&SpatialIndex::new(Crs(32633)), None, ResamplingMethod::Bilinear).is_err());
    }
}
