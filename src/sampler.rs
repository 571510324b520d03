//! Window samplers: where each sample is taken from.
//!
//! All samplers emit bounding boxes in the working CRS that lie inside the
//! indexed extent. Window sizes are given in output pixels and converted to
//! CRS units with the working resolution.
//!
//! - [`GridSampler`]: row-major tiling from the top-left corner, finite and restartable.
//! - [`RandomSampler`]: uniform locations, optionally restricted to regions of interest.
//! - [`StratifiedSampler`]: picks a weighted region first, then a location inside it.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::casting::{dim_to_f64, pixel_span};
use crate::error::ConfigError;
use crate::geometry::BoundingBox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingPolicy {
    #[default]
    Grid,
    Random,
    Stratified,
}

/// What to do with the partial tile at the right and bottom edges of a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgePolicy {
    /// Emit it, clipped to the extent; the output keeps the full tile shape.
    #[default]
    Pad,
    /// Skip it.
    Drop,
}

/// Window geometry shared by all samplers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSpec {
    /// Output (rows, cols)
    pub size: (usize, usize),
    /// Grid step in pixels, (rows, cols)
    pub stride: (usize, usize),
    /// Working (x, y) resolution
    pub resolution: (f64, f64),
}

impl WindowSpec {
    /// Window (width, height) in CRS units.
    #[must_use]
    pub fn extent_size(&self) -> (f64, f64) {
        (
            dim_to_f64(self.size.1) * self.resolution.0,
            dim_to_f64(self.size.0) * self.resolution.1,
        )
    }
}

fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Start offsets along one axis, in pixels.
fn grid_offsets(extent: usize, size: usize, stride: usize, edge: EdgePolicy) -> Vec<usize> {
    let mut offsets = Vec::new();
    let mut offset = 0;
    while offset < extent {
        let end = offset + size;
        if end > extent && edge == EdgePolicy::Drop {
            break;
        }
        offsets.push(offset);
        if end >= extent {
            break;
        }
        offset += stride;
    }
    offsets
}

/// Deterministic row-major tiling of the extent.
#[derive(Debug, Clone)]
pub struct GridSampler {
    extent: BoundingBox,
    spec: WindowSpec,
    rows: Vec<usize>,
    cols: Vec<usize>,
    next: usize,
}

impl GridSampler {
    /// # Errors
    /// Returns a [`ConfigError`] for a zero tile size, stride or resolution.
    pub fn new(extent: BoundingBox, spec: WindowSpec, edge: EdgePolicy) -> Result<Self, ConfigError> {
        if spec.size.0 == 0 || spec.size.1 == 0 {
            return Err(ConfigError::new("tile_size must be positive"));
        }
        if spec.stride.0 == 0 || spec.stride.1 == 0 {
            return Err(ConfigError::new("stride must be positive"));
        }
        if spec.resolution.0 <= 0.0 || spec.resolution.1 <= 0.0 {
            return Err(ConfigError::new("resolution must be positive"));
        }
        let extent_cols = pixel_span(extent.width(), spec.resolution.0);
        let extent_rows = pixel_span(extent.height(), spec.resolution.1);
        Ok(Self {
            extent,
            spec,
            rows: grid_offsets(extent_rows, spec.size.0, spec.stride.0, edge),
            cols: grid_offsets(extent_cols, spec.size.1, spec.stride.1, edge),
            next: 0,
        })
    }

    /// Total number of windows in one pass.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len() * self.cols.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start again from the top-left window.
    pub fn reset(&mut self) {
        self.next = 0;
    }

    fn window(&self, row_off: usize, col_off: usize) -> BoundingBox {
        let (resx, resy) = self.spec.resolution;
        let (w, h) = self.spec.extent_size();
        let minx = self.extent.minx + dim_to_f64(col_off) * resx;
        let maxy = self.extent.maxy - dim_to_f64(row_off) * resy;
        BoundingBox::new(
            minx,
            (maxy - h).max(self.extent.miny),
            (minx + w).min(self.extent.maxx),
            maxy,
            self.extent.crs,
        )
        .with_time(self.extent.mint, self.extent.maxt)
    }
}

impl Iterator for GridSampler {
    type Item = BoundingBox;

    fn next(&mut self) -> Option<BoundingBox> {
        if self.cols.is_empty() || self.next >= self.len() {
            return None;
        }
        let row = self.rows[self.next / self.cols.len()];
        let col = self.cols[self.next % self.cols.len()];
        self.next += 1;
        Some(self.window(row, col))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.len().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

/// Place a `w` x `h` window centred on (`cx`, `cy`), shifted to stay inside `extent`.
fn centred_window(extent: &BoundingBox, cx: f64, cy: f64, w: f64, h: f64) -> BoundingBox {
    let minx = (cx - w / 2.0).min(extent.maxx - w).max(extent.minx);
    let miny = (cy - h / 2.0).min(extent.maxy - h).max(extent.miny);
    BoundingBox::new(minx, miny, minx + w, miny + h, extent.crs).with_time(extent.mint, extent.maxt)
}

fn uniform(rng: &mut StdRng, lo: f64, hi: f64) -> f64 {
    if hi > lo {
        rng.gen_range(lo..=hi)
    } else {
        lo
    }
}

/// Check weights and normalize them into a cumulative distribution.
///
/// # Errors
/// Returns a [`ConfigError`] if any weight is negative or not finite, or all are zero.
pub fn cumulative_weights(weights: &[f64]) -> Result<Vec<f64>, ConfigError> {
    if let Some(bad) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
        return Err(ConfigError::new(format!("weights must be finite and non-negative, got {bad}")));
    }
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return Err(ConfigError::new("weights are all zero"));
    }
    let mut acc = 0.0;
    Ok(weights
        .iter()
        .map(|w| {
            acc += w / total;
            acc
        })
        .collect())
}

fn pick(cumulative: &[f64], rng: &mut StdRng) -> usize {
    let u: f64 = rng.gen();
    cumulative
        .partition_point(|c| *c <= u)
        .min(cumulative.len().saturating_sub(1))
}

fn check_fits(extent: &BoundingBox, spec: &WindowSpec) -> Result<(f64, f64), ConfigError> {
    let (w, h) = spec.extent_size();
    let tol = 1e-9 * w.max(h);
    if !(w > 0.0 && h > 0.0) {
        return Err(ConfigError::new("tile_size and resolution must be positive"));
    }
    if extent.width() + tol < w || extent.height() + tol < h {
        return Err(ConfigError::new(format!(
            "window {w}x{h} does not fit inside extent {extent}"
        )));
    }
    Ok((w, h))
}

/// Uniformly random windows, optionally limited to regions of interest.
#[derive(Debug, Clone)]
pub struct RandomSampler {
    extent: BoundingBox,
    size: (f64, f64),
    rois: Vec<BoundingBox>,
    cumulative: Vec<f64>,
    rng: StdRng,
    remaining: Option<usize>,
}

impl RandomSampler {
    /// ROIs are chosen with probability proportional to their area inside the extent.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the window does not fit inside the extent or
    /// no ROI overlaps it.
    pub fn new(
        extent: BoundingBox,
        spec: WindowSpec,
        rois: &[BoundingBox],
        seed: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Self, ConfigError> {
        let size = check_fits(&extent, &spec)?;
        let requested = rois.len();
        let rois: Vec<BoundingBox> = rois
            .iter()
            .filter_map(|roi| roi.intersection(&extent))
            .filter(|roi| !roi.is_degenerate())
            .collect();
        if requested > 0 && rois.is_empty() {
            return Err(ConfigError::new(format!("none of {requested} regions of interest overlap {extent}")));
        }
        let cumulative = if rois.is_empty() {
            Vec::new()
        } else {
            let areas: Vec<f64> = rois.iter().map(BoundingBox::area).collect();
            cumulative_weights(&areas)?
        };
        Ok(Self {
            extent,
            size,
            rois,
            cumulative,
            rng: rng_from(seed),
            remaining: limit,
        })
    }

    fn draw(&mut self) -> BoundingBox {
        let (w, h) = self.size;
        if self.rois.is_empty() {
            let minx = uniform(&mut self.rng, self.extent.minx, self.extent.maxx - w);
            let miny = uniform(&mut self.rng, self.extent.miny, self.extent.maxy - h);
            return BoundingBox::new(minx, miny, minx + w, miny + h, self.extent.crs)
                .with_time(self.extent.mint, self.extent.maxt);
        }
        let roi = self.rois[pick(&self.cumulative, &mut self.rng)];
        let cx = uniform(&mut self.rng, roi.minx, roi.maxx);
        let cy = uniform(&mut self.rng, roi.miny, roi.maxy);
        centred_window(&self.extent, cx, cy, w, h)
    }
}

impl Iterator for RandomSampler {
    type Item = BoundingBox;

    fn next(&mut self) -> Option<BoundingBox> {
        match &mut self.remaining {
            Some(0) => return None,
            Some(n) => *n -= 1,
            None => {}
        }
        Some(self.draw())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.remaining {
            Some(n) => (n, Some(n)),
            None => (usize::MAX, None),
        }
    }
}

/// A weighted region for stratified sampling.
#[derive(Debug, Clone, PartialEq)]
pub struct Stratum {
    pub id: String,
    pub bbox: BoundingBox,
    pub weight: f64,
}

/// Windows drawn from weighted regions.
#[derive(Debug, Clone)]
pub struct StratifiedSampler {
    extent: BoundingBox,
    size: (f64, f64),
    strata: Vec<Stratum>,
    cumulative: Vec<f64>,
    rng: StdRng,
    remaining: Option<usize>,
}

impl StratifiedSampler {
    /// # Errors
    /// Returns a [`ConfigError`] for invalid weights, an empty stratum list, a
    /// stratum outside the extent, or a window that does not fit the extent.
    pub fn new(
        extent: BoundingBox,
        spec: WindowSpec,
        strata: Vec<Stratum>,
        seed: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Self, ConfigError> {
        let size = check_fits(&extent, &spec)?;
        if strata.is_empty() {
            return Err(ConfigError::new("stratified sampling requires class_weights"));
        }
        if let Some(outside) = strata.iter().find(|s| !s.bbox.intersects(&extent)) {
            return Err(ConfigError::new(format!("region {} lies outside the extent", outside.id)));
        }
        let weights: Vec<f64> = strata.iter().map(|s| s.weight).collect();
        let cumulative = cumulative_weights(&weights)?;
        Ok(Self {
            extent,
            size,
            strata,
            cumulative,
            rng: rng_from(seed),
            remaining: limit,
        })
    }

    #[must_use]
    pub fn strata(&self) -> &[Stratum] {
        &self.strata
    }

    /// Draw a window and report which stratum it came from.
    pub fn draw(&mut self) -> (usize, BoundingBox) {
        let idx = pick(&self.cumulative, &mut self.rng);
        let region = self.strata[idx].bbox.intersection(&self.extent).unwrap_or(self.extent);
        let cx = uniform(&mut self.rng, region.minx, region.maxx);
        let cy = uniform(&mut self.rng, region.miny, region.maxy);
        (idx, centred_window(&self.extent, cx, cy, self.size.0, self.size.1))
    }
}

impl Iterator for StratifiedSampler {
    type Item = BoundingBox;

    fn next(&mut self) -> Option<BoundingBox> {
        match &mut self.remaining {
            Some(0) => return None,
            Some(n) => *n -= 1,
            None => {}
        }
        Some(self.draw().1)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.remaining {
            Some(n) => (n, Some(n)),
            None => (usize::MAX, None),
        }
    }
}

/// Any sampler, selected by [`SamplingPolicy`].
#[derive(Debug, Clone)]
pub enum SamplerKind {
    Grid(GridSampler),
    Random(RandomSampler),
    Stratified(StratifiedSampler),
}

impl SamplerKind {
    /// Whether consumers must see windows in emission order.
    #[must_use]
    pub fn is_ordered(&self) -> bool {
        matches!(self, Self::Grid(_))
    }

    #[must_use]
    pub fn policy(&self) -> SamplingPolicy {
        match self {
            Self::Grid(_) => SamplingPolicy::Grid,
            Self::Random(_) => SamplingPolicy::Random,
            Self::Stratified(_) => SamplingPolicy::Stratified,
        }
    }
}

impl Iterator for SamplerKind {
    type Item = BoundingBox;

    fn next(&mut self) -> Option<BoundingBox> {
        match self {
            Self::Grid(s) => s.next(),
            Self::Random(s) => s.next(),
            Self::Stratified(s) => s.next(),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self {
            Self::Grid(s) => s.size_hint(),
            Self::Random(s) => s.size_hint(),
            Self::Stratified(s) => s.size_hint(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Crs;

    const UTM: Crs = Crs(32633);

    fn spec(size: usize, stride: usize) -> WindowSpec {
        WindowSpec {
            size: (size, size),
            stride: (stride, stride),
            resolution: (1.0, 1.0),
        }
    }

    fn extent(w: f64, h: f64) -> BoundingBox {
        BoundingBox::new(0.0, 0.0, w, h, UTM)
    }

    #[test]
    fn test_grid_offsets() {
        assert_eq!(grid_offsets(100, 10, 10, EdgePolicy::Pad).len(), 10);
        assert_eq!(grid_offsets(25, 10, 10, EdgePolicy::Pad), vec![0, 10, 20]);
        assert_eq!(grid_offsets(25, 10, 10, EdgePolicy::Drop), vec![0, 10]);
        // overlap stops at the first window reaching the edge
        assert_eq!(grid_offsets(20, 10, 5, EdgePolicy::Pad), vec![0, 5, 10]);
        assert_eq!(grid_offsets(5, 10, 10, EdgePolicy::Pad), vec![0]);
        assert!(grid_offsets(5, 10, 10, EdgePolicy::Drop).is_empty());
    }

    #[test]
    fn test_grid_row_major_from_top() {
        let boxes: Vec<_> = GridSampler::new(extent(20.0, 20.0), spec(10, 10), EdgePolicy::Pad)
            .unwrap()
            .collect();
        assert_eq!(boxes.len(), 4);
        assert_eq!((boxes[0].minx, boxes[0].maxy), (0.0, 20.0));
        assert_eq!((boxes[1].minx, boxes[1].maxy), (10.0, 20.0));
        assert_eq!((boxes[2].minx, boxes[2].maxy), (0.0, 10.0));
    }

    #[test]
    fn test_grid_pad_clips_to_extent() {
        let ext = extent(25.0, 25.0);
        let boxes: Vec<_> = GridSampler::new(ext, spec(10, 10), EdgePolicy::Pad).unwrap().collect();
        assert_eq!(boxes.len(), 9);
        assert!(boxes.iter().all(|b| ext.contains(b, 1e-9)));
        let last = boxes[8];
        assert_eq!((last.minx, last.miny, last.maxx, last.maxy), (20.0, 0.0, 25.0, 5.0));
    }

    #[test]
    fn test_grid_restart() {
        let mut grid = GridSampler::new(extent(30.0, 30.0), spec(10, 10), EdgePolicy::Drop).unwrap();
        let first: Vec<_> = grid.by_ref().collect();
        grid.reset();
        let second: Vec<_> = grid.collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_grid_rejects_zero_stride() {
        assert!(GridSampler::new(extent(30.0, 30.0), spec(10, 0), EdgePolicy::Pad).is_err());
    }

    #[test]
    fn test_random_inside_extent_and_seeded() {
        let ext = extent(100.0, 50.0);
        let a: Vec<_> = RandomSampler::new(ext, spec(10, 10), &[], Some(7), Some(500))
            .unwrap()
            .collect();
        let b: Vec<_> = RandomSampler::new(ext, spec(10, 10), &[], Some(7), Some(500))
            .unwrap()
            .collect();
        assert_eq!(a.len(), 500);
        assert_eq!(a, b);
        for w in &a {
            assert!(ext.contains(w, 1e-9), "{w} escapes {ext}");
            assert!((w.width() - 10.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_random_roi_restriction() {
        let ext = extent(1000.0, 1000.0);
        let roi = BoundingBox::new(100.0, 100.0, 200.0, 200.0, UTM);
        for w in RandomSampler::new(ext, spec(10, 10), &[roi], Some(1), Some(200)).unwrap() {
            assert!(w.intersects(&roi));
        }
        let nowhere = BoundingBox::new(5000.0, 5000.0, 6000.0, 6000.0, UTM);
        assert!(RandomSampler::new(ext, spec(10, 10), &[nowhere], Some(1), None).is_err());
    }

    #[test]
    fn test_random_window_larger_than_extent() {
        assert!(RandomSampler::new(extent(5.0, 5.0), spec(10, 10), &[], None, None).is_err());
    }

    #[test]
    fn test_weight_validation() {
        assert!(cumulative_weights(&[1.0, -0.1]).is_err());
        assert!(cumulative_weights(&[0.0, 0.0]).is_err());
        assert!(cumulative_weights(&[f64::NAN]).is_err());
        let c = cumulative_weights(&[3.0, 1.0]).unwrap();
        assert!((c[0] - 0.75).abs() < 1e-12 && (c[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_stratified_frequency() {
        let ext = extent(200.0, 100.0);
        let strata = vec![
            Stratum {
                id: "common".into(),
                bbox: BoundingBox::new(0.0, 0.0, 100.0, 100.0, UTM),
                weight: 0.9,
            },
            Stratum {
                id: "rare".into(),
                bbox: BoundingBox::new(100.0, 0.0, 200.0, 100.0, UTM),
                weight: 0.1,
            },
        ];
        let mut sampler = StratifiedSampler::new(ext, spec(10, 10), strata, Some(42), None).unwrap();
        let n = 10_000;
        let hits = (0..n).filter(|_| sampler.draw().0 == 0).count();
        let freq = dim_to_f64(hits) / dim_to_f64(n);
        // 4 sigma of a binomial(10000, 0.9) is 0.012
        assert!((freq - 0.9).abs() < 0.012, "frequency {freq}");
    }

    #[test]
    fn test_stratified_rejects_bad_config() {
        let ext = extent(100.0, 100.0);
        let stratum = |w| Stratum {
            id: "a".into(),
            bbox: ext,
            weight: w,
        };
        assert!(StratifiedSampler::new(ext, spec(10, 10), vec![], None, None).is_err());
        assert!(StratifiedSampler::new(ext, spec(10, 10), vec![stratum(-1.0)], None, None).is_err());
        assert!(StratifiedSampler::new(ext, spec(10, 10), vec![stratum(0.0)], None, None).is_err());
    }

    #[test]
    fn test_kind_ordering() {
        let grid = SamplerKind::Grid(GridSampler::new(extent(10.0, 10.0), spec(10, 10), EdgePolicy::Pad).unwrap());
        assert!(grid.is_ordered());
        let random =
            SamplerKind::Random(RandomSampler::new(extent(10.0, 10.0), spec(10, 10), &[], Some(0), Some(3)).unwrap());
        assert!(!random.is_ordered());
        assert_eq!(random.count(), 3);
    }
}
