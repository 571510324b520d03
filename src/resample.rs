//! Warping native source pixels onto a target grid.
//!
//! For each output pixel the centre is carried into the source CRS, converted
//! to a fractional pixel position in the source raster and sampled from the
//! native window read by the [`TileReader`](crate::reader::TileReader).
//!
//! Interpolating kernels never blend nodata: if any tap touches a nodata pixel
//! the output falls back to nearest neighbour for that pixel.

use ndarray::{Array2, Array3, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::align::ReadWindow;
use crate::casting::{clamp_index, dim_to_f64, floor_to_isize};
use crate::error::ReprojectionError;
use crate::geometry::projection::CoordTransformer;

/// Kernel used to resample a source onto the target grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResamplingMethod {
    /// Closest source pixel. Required for categorical data.
    #[default]
    Nearest,
    /// 2x2 linear interpolation
    Bilinear,
    /// 4x4 Catmull-Rom interpolation
    Cubic,
}

impl ResamplingMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nearest => "nearest",
            Self::Bilinear => "bilinear",
            Self::Cubic => "cubic",
        }
    }
}

/// One source resampled onto a target grid.
///
/// `valid[(r, c)]` is false where the source has no data: outside its
/// footprint, on nodata pixels, or where the point could not be reprojected.
#[derive(Debug, Clone)]
pub struct WarpedRaster {
    pub data: Array3<f32>,
    pub valid: Array2<bool>,
}

impl WarpedRaster {
    #[must_use]
    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|v| **v).count()
    }
}

/// Resample `native` (the pixels of `read.window`) onto `read.target`.
///
/// # Errors
/// Returns a [`ReprojectionError`] if no transformation exists between the
/// target and source CRSs. Individual points that fail to project are marked
/// invalid instead.
pub fn warp(native: &Array3<f32>, read: &ReadWindow) -> Result<WarpedRaster, ReprojectionError> {
    let transformer = CoordTransformer::new(read.target.crs, read.source_crs)?;
    let (bands, win_rows, win_cols) = native.dim();
    let (rows, cols) = read.target.shape();

    let mut data = Array3::<f32>::zeros((bands, rows, cols));
    let mut valid = Array2::<bool>::from_elem((rows, cols), false);
    if bands == 0 || win_rows == 0 || win_cols == 0 {
        return Ok(WarpedRaster { data, valid });
    }

    let is_nodata = |v: f32| v.is_nan() || read.nodata.is_some_and(|nd| f64::from(v) == nd);
    let src_width = dim_to_f64(read.source_width);
    let src_height = dim_to_f64(read.source_height);
    let col_off = dim_to_f64(read.window.col_off);
    let row_off = dim_to_f64(read.window.row_off);
    let band_views: Vec<ArrayView2<'_, f32>> = native.outer_iter().collect();
    let mut values = vec![0.0_f32; bands];

    for r in 0..rows {
        for c in 0..cols {
            let (x, y) = read
                .target
                .transform
                .pixel_to_world(dim_to_f64(c) + 0.5, dim_to_f64(r) + 0.5);
            let Ok((sx, sy)) = transformer.transform(x, y) else {
                continue;
            };
            let (px, py) = read.source_transform.world_to_pixel(sx, sy);
            if !(px >= 0.0 && py >= 0.0 && px < src_width && py < src_height) {
                continue;
            }
            // window-local position
            let (lx, ly) = (px - col_off, py - row_off);

            let sampled = match read.resampling {
                ResamplingMethod::Nearest => None,
                ResamplingMethod::Bilinear => {
                    fill_bands(&band_views, &mut values, |band| bilinear(band, lx, ly, &is_nodata))
                }
                ResamplingMethod::Cubic => {
                    fill_bands(&band_views, &mut values, |band| cubic(band, lx, ly, &is_nodata))
                }
            };
            if sampled.is_none() {
                let Some((nc, nr)) = nearest_index(lx, ly, win_cols, win_rows) else {
                    continue;
                };
                if band_views.iter().any(|band| is_nodata(band[(nr, nc)])) {
                    continue;
                }
                for (value, band) in values.iter_mut().zip(&band_views) {
                    *value = band[(nr, nc)];
                }
            }

            for (b, value) in values.iter().enumerate() {
                data[(b, r, c)] = *value;
            }
            valid[(r, c)] = true;
        }
    }

    Ok(WarpedRaster { data, valid })
}

/// Apply a per-band kernel; `None` if any band hit nodata.
fn fill_bands<F>(bands: &[ArrayView2<'_, f32>], out: &mut [f32], kernel: F) -> Option<()>
where
    F: Fn(&ArrayView2<'_, f32>) -> Option<f32>,
{
    for (slot, band) in out.iter_mut().zip(bands) {
        *slot = kernel(band)?;
    }
    Some(())
}

fn nearest_index(x: f64, y: f64, cols: usize, rows: usize) -> Option<(usize, usize)> {
    let col = clamp_index(floor_to_isize(x)?, cols)?;
    let row = clamp_index(floor_to_isize(y)?, rows)?;
    Some((col, row))
}

/// Pixel at signed (col, row), clamped to the window edge.
#[inline]
fn tap(band: &ArrayView2<'_, f32>, col: isize, row: isize) -> Option<f32> {
    let (rows, cols) = band.dim();
    Some(band[(clamp_index(row, rows)?, clamp_index(col, cols)?)])
}

fn bilinear(band: &ArrayView2<'_, f32>, x: f64, y: f64, is_nodata: &impl Fn(f32) -> bool) -> Option<f32> {
    // sample positions are pixel centres
    let (fx, fy) = (x - 0.5, y - 0.5);
    let (x0, y0) = (floor_to_isize(fx)?, floor_to_isize(fy)?);
    let (tx, ty) = (fx - fx.floor(), fy - fy.floor());

    let mut acc = 0.0;
    for (dy, wy) in [(0, 1.0 - ty), (1, ty)] {
        for (dx, wx) in [(0, 1.0 - tx), (1, tx)] {
            let v = tap(band, x0 + dx, y0 + dy)?;
            if is_nodata(v) {
                return None;
            }
            acc += f64::from(v) * wx * wy;
        }
    }
    #[allow(clippy::cast_possible_truncation)]
    Some(acc as f32)
}

/// Catmull-Rom weights (a = -0.5) for taps at offsets -1, 0, 1, 2.
fn catmull_rom_weights(t: f64) -> [f64; 4] {
    let t2 = t * t;
    let t3 = t2 * t;
    [
        -0.5 * t3 + t2 - 0.5 * t,
        1.5 * t3 - 2.5 * t2 + 1.0,
        -1.5 * t3 + 2.0 * t2 + 0.5 * t,
        0.5 * t3 - 0.5 * t2,
    ]
}

fn cubic(band: &ArrayView2<'_, f32>, x: f64, y: f64, is_nodata: &impl Fn(f32) -> bool) -> Option<f32> {
    let (fx, fy) = (x - 0.5, y - 0.5);
    let (x0, y0) = (floor_to_isize(fx)?, floor_to_isize(fy)?);
    let wx = catmull_rom_weights(fx - fx.floor());
    let wy = catmull_rom_weights(fy - fy.floor());

    let mut acc = 0.0;
    for (j, wyj) in wy.iter().enumerate() {
        for (i, wxi) in wx.iter().enumerate() {
            #[allow(clippy::cast_possible_wrap)]
            let v = tap(band, x0 - 1 + i as isize, y0 - 1 + j as isize)?;
            if is_nodata(v) {
                return None;
            }
            acc += f64::from(v) * wxi * wyj;
        }
    }
    #[allow(clippy::cast_possible_truncation)]
    Some(acc as f32)
}
