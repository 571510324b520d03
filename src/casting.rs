//! Checked numeric conversions between CRS coordinates and pixel indices.
//!
//! # Assumptions
//!
//! ## Raster dimensions (`usize` -> `f64`)
//! Allowed without checks: `f64` represents every integer up to 2^53 exactly,
//! far beyond any real raster side length.
//!
//! ## Pixel positions (`f64` -> `usize`/`isize`)
//! Always checked. Reprojected coordinates can be negative, NaN, or past the
//! raster edge.
//!
//! ## Extents measured in pixels
//! A CRS extent divided by a resolution rarely lands on an exact integer.
//! [`pixel_span`] absorbs the floating point noise with [`SNAP_EPSILON`] so a
//! 100-pixel raster is not reported as 100.000000001 -> 101 pixels.

/// Fraction of a pixel treated as rounding noise.
pub const SNAP_EPSILON: f64 = 1e-6;

/// Convert a `usize` dimension to `f64`.
#[inline]
#[must_use]
pub fn dim_to_f64(value: usize) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    {
        value as f64
    }
}

/// Floor a fractional pixel position to a signed index, `None` for NaN/infinite.
#[inline]
#[must_use]
pub fn floor_to_isize(value: f64) -> Option<isize> {
    if !value.is_finite() {
        return None;
    }
    let floored = value.floor();
    if floored < isize::MIN as f64 || floored > isize::MAX as f64 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    Some(floored as isize)
}

/// Clamp a signed index into `0..max_value`, or `None` if `max_value` is zero.
#[inline]
#[must_use]
pub fn clamp_index(value: isize, max_value: usize) -> Option<usize> {
    if max_value == 0 {
        return None;
    }
    if value < 0 {
        return Some(0);
    }
    #[allow(clippy::cast_sign_loss)]
    let u = value as usize;
    Some(u.min(max_value - 1))
}

/// Signed index to unsigned, `None` if negative or not below `max_value`.
#[inline]
#[must_use]
pub fn checked_index(value: isize, max_value: usize) -> Option<usize> {
    if value < 0 {
        return None;
    }
    #[allow(clippy::cast_sign_loss)]
    let u = value as usize;
    (u < max_value).then_some(u)
}

/// Number of whole pixels spanned by `extent` at `resolution`, rounding up
/// anything beyond [`SNAP_EPSILON`] of a pixel.
#[inline]
#[must_use]
pub fn pixel_span(extent: f64, resolution: f64) -> usize {
    if !(extent.is_finite() && resolution.is_finite()) || extent <= 0.0 || resolution <= 0.0 {
        return 0;
    }
    let pixels = (extent / resolution - SNAP_EPSILON).ceil().max(0.0);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    {
        pixels as usize
    }
}

/// Integer pixel range covering `[lo, hi)` fractional positions, grown by
/// `margin` pixels on both sides and clamped to `0..max_value`.
///
/// Returns `(start, end)` with `start <= end`; empty when the range misses the raster.
#[must_use]
pub fn covering_range(lo: f64, hi: f64, margin: usize, max_value: usize) -> (usize, usize) {
    let (Some(start), Some(end)) = (
        floor_to_isize(lo + SNAP_EPSILON),
        floor_to_isize(hi - SNAP_EPSILON),
    ) else {
        return (0, 0);
    };
    #[allow(clippy::cast_possible_wrap)]
    let margin = margin as isize;
    let start = start.saturating_sub(margin);
    let end = end.saturating_add(margin).saturating_add(1);

    #[allow(clippy::cast_possible_wrap)]
    let max = max_value as isize;
    let start = start.clamp(0, max);
    let end = end.clamp(0, max);
    if start >= end {
        return (0, 0);
    }
    #[allow(clippy::cast_sign_loss)]
    (start as usize, end as usize)
}
