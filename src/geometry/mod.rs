//! Coordinate types: CRS identifiers, bounding boxes, affine geotransforms and pixel windows.

pub mod projection;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::IndexError;

/// Coordinate reference system, identified by EPSG code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Crs(pub i32);

impl Crs {
    pub const WGS84: Crs = Crs(4326);
    pub const WEB_MERCATOR: Crs = Crs(3857);

    #[inline]
    #[must_use]
    pub fn epsg(self) -> i32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub fn is_geographic(self) -> bool {
        projection::is_geographic_crs(self.0)
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.0)
    }
}

/// Spatio-temporal bounding box in a given CRS.
///
/// Immutable value type. `min <= max` on every axis; zero-area boxes are
/// allowed and represent point features.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub minx: f64,
    pub miny: f64,
    pub maxx: f64,
    pub maxy: f64,
    pub mint: f64,
    pub maxt: f64,
    pub crs: Crs,
}

impl BoundingBox {
    /// Create a box with an unbounded time range.
    #[must_use]
    pub fn new(minx: f64, miny: f64, maxx: f64, maxy: f64, crs: Crs) -> Self {
        Self {
            minx,
            miny,
            maxx,
            maxy,
            mint: f64::NEG_INFINITY,
            maxt: f64::INFINITY,
            crs,
        }
    }

    /// Create a box, rejecting inverted or non-finite spatial bounds.
    ///
    /// # Errors
    /// Returns [`IndexError::InvalidBox`] if any min exceeds its max or a coordinate is NaN/infinite.
    pub fn try_new(minx: f64, miny: f64, maxx: f64, maxy: f64, crs: Crs) -> Result<Self, IndexError> {
        let bbox = Self::new(minx, miny, maxx, maxy, crs);
        if bbox.is_valid() {
            Ok(bbox)
        } else {
            Err(IndexError::InvalidBox(bbox))
        }
    }

    #[must_use]
    pub fn with_time(mut self, mint: f64, maxt: f64) -> Self {
        self.mint = mint;
        self.maxt = maxt;
        self
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        [self.minx, self.miny, self.maxx, self.maxy]
            .iter()
            .all(|v| v.is_finite())
            && self.minx <= self.maxx
            && self.miny <= self.maxy
            && !self.mint.is_nan()
            && !self.maxt.is_nan()
            && self.mint <= self.maxt
    }

    #[inline]
    #[must_use]
    pub fn width(&self) -> f64 {
        self.maxx - self.minx
    }

    #[inline]
    #[must_use]
    pub fn height(&self) -> f64 {
        self.maxy - self.miny
    }

    #[inline]
    #[must_use]
    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        self.width() == 0.0 || self.height() == 0.0
    }

    #[must_use]
    pub fn center(&self) -> (f64, f64) {
        (
            (self.minx + self.maxx) / 2.0,
            (self.miny + self.maxy) / 2.0,
        )
    }

    #[must_use]
    pub fn time_overlaps(&self, other: &BoundingBox) -> bool {
        self.mint <= other.maxt && other.mint <= self.maxt
    }

    /// Closed-interval intersection test in x, y and t. CRS is not compared.
    #[must_use]
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        !(self.maxx < other.minx
            || self.minx > other.maxx
            || self.maxy < other.miny
            || self.miny > other.maxy)
            && self.time_overlaps(other)
    }

    #[must_use]
    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        if !self.intersects(other) {
            return None;
        }
        Some(BoundingBox {
            minx: self.minx.max(other.minx),
            miny: self.miny.max(other.miny),
            maxx: self.maxx.min(other.maxx),
            maxy: self.maxy.min(other.maxy),
            mint: self.mint.max(other.mint),
            maxt: self.maxt.min(other.maxt),
            crs: self.crs,
        })
    }

    #[must_use]
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            minx: self.minx.min(other.minx),
            miny: self.miny.min(other.miny),
            maxx: self.maxx.max(other.maxx),
            maxy: self.maxy.max(other.maxy),
            mint: self.mint.min(other.mint),
            maxt: self.maxt.max(other.maxt),
            crs: self.crs,
        }
    }

    /// Spatial containment with an absolute tolerance on every edge.
    #[must_use]
    pub fn contains(&self, other: &BoundingBox, tolerance: f64) -> bool {
        other.minx >= self.minx - tolerance
            && other.miny >= self.miny - tolerance
            && other.maxx <= self.maxx + tolerance
            && other.maxy <= self.maxy + tolerance
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}] {}",
            self.minx, self.miny, self.maxx, self.maxy, self.crs
        )
    }
}

/// North-up affine transform mapping pixel (col, row) to CRS coordinates.
///
/// `pixel_height` is positive; y decreases as row increases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    #[must_use]
    pub fn new(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            pixel_width,
            pixel_height,
        }
    }

    /// Build from GeoTIFF `ModelPixelScale` and `ModelTiepoint` tag values.
    ///
    /// Tiepoint (i, j, k, x, y, z) maps raster point (i, j) to world (x, y).
    #[must_use]
    pub fn from_tiepoint(scale: [f64; 2], tiepoint: [f64; 6]) -> Self {
        let origin_x = tiepoint[3] - tiepoint[0] * scale[0];
        let origin_y = tiepoint[4] + tiepoint[1] * scale[1];
        Self::new(origin_x, origin_y, scale[0], scale[1])
    }

    /// Grid whose top-left corner sits at the top-left of `bbox`.
    #[must_use]
    pub fn anchored_at(bbox: &BoundingBox, resolution: (f64, f64)) -> Self {
        Self::new(bbox.minx, bbox.maxy, resolution.0, resolution.1)
    }

    /// CRS coordinate of a (fractional) pixel position. Integer inputs address pixel corners.
    #[inline]
    #[must_use]
    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + col * self.pixel_width,
            self.origin_y - row * self.pixel_height,
        )
    }

    /// Fractional pixel position of a CRS coordinate.
    #[inline]
    #[must_use]
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin_x) / self.pixel_width,
            (self.origin_y - y) / self.pixel_height,
        )
    }

    /// Footprint of a `cols` x `rows` raster on this grid.
    #[must_use]
    pub fn bounds(&self, cols: usize, rows: usize, crs: Crs) -> BoundingBox {
        #[allow(clippy::cast_precision_loss)]
        let (maxx, miny) = self.pixel_to_world(cols as f64, rows as f64);
        BoundingBox::new(self.origin_x, miny, maxx, self.origin_y, crs)
    }

    /// Transform shifted to start at pixel (`col_off`, `row_off`).
    #[must_use]
    pub fn offset(&self, col_off: usize, row_off: usize) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let (x, y) = self.pixel_to_world(col_off as f64, row_off as f64);
        Self::new(x, y, self.pixel_width, self.pixel_height)
    }

    /// GDAL-ordered coefficients `[x0, dx, 0, y0, 0, -dy]`.
    #[must_use]
    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.origin_x,
            self.pixel_width,
            0.0,
            self.origin_y,
            0.0,
            -self.pixel_height,
        ]
    }
}

/// Rectangular pixel region of a source raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelWindow {
    pub col_off: usize,
    pub row_off: usize,
    pub width: usize,
    pub height: usize,
}

impl PixelWindow {
    #[must_use]
    pub fn new(col_off: usize, row_off: usize, width: usize, height: usize) -> Self {
        Self {
            col_off,
            row_off,
            width,
            height,
        }
    }

    /// Window covering an entire `width` x `height` raster.
    #[must_use]
    pub fn full(width: usize, height: usize) -> Self {
        Self::new(0, 0, width, height)
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    #[inline]
    #[must_use]
    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// Whether the window lies inside a raster of the given size.
    #[must_use]
    pub fn fits_within(&self, width: usize, height: usize) -> bool {
        self.col_off + self.width <= width && self.row_off + self.height <= height
    }
}

impl fmt::Display for PixelWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}+{}+{}",
            self.width, self.height, self.col_off, self.row_off
        )
    }
}
