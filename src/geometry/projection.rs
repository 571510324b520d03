//! Coordinate projection between EPSG codes using pure Rust (proj4rs + crs-definitions).
//!
//! Geographic CRSs are exchanged in degrees at this API boundary; the
//! radian conversion proj4rs needs happens internally.

use proj4rs::proj::Proj;
use proj4rs::transform::transform;

use super::{BoundingBox, Crs};
use crate::error::ReprojectionError;

/// Points sampled along each edge when reprojecting a bounding box.
pub const DEFAULT_DENSIFY_POINTS: usize = 21;

/// Get PROJ4 string for an EPSG code using the crs-definitions database
#[inline]
pub fn get_proj_string(epsg: i32) -> Option<&'static str> {
    u16::try_from(epsg)
        .ok()
        .and_then(crs_definitions::from_code)
        .map(|def| def.proj4)
}

/// Check if an EPSG code represents a geographic (lon/lat) CRS
#[inline]
#[must_use]
pub fn is_geographic_crs(epsg: i32) -> bool {
    if let Some(proj_str) = get_proj_string(epsg) {
        proj_str.contains("+proj=longlat")
    } else {
        epsg == 4326 || (4000..5000).contains(&epsg)
    }
}

/// Whether the code resolves to a usable projection definition.
#[must_use]
pub fn is_supported(crs: Crs) -> bool {
    get_proj_string(crs.0).is_some_and(|s| Proj::from_proj_string(s).is_ok())
}

/// Project a single point from one CRS to another.
///
/// # Errors
/// Returns an error if either EPSG code is unknown or the transformation fails.
pub fn project_point(from: Crs, to: Crs, x: f64, y: f64) -> Result<(f64, f64), ReprojectionError> {
    if from == to {
        return Ok((x, y));
    }
    CoordTransformer::new(from, to)?.transform(x, y)
}

/// Reusable transformer between two CRSs.
///
/// Identity when both CRSs are equal, so callers can hold one unconditionally.
pub struct CoordTransformer {
    from: Crs,
    to: Crs,
    projs: Option<(Proj, Proj)>,
    source_is_geographic: bool,
    target_is_geographic: bool,
}

impl CoordTransformer {
    /// # Errors
    /// Returns an error if either CRS is missing from the definitions database
    /// or its definition cannot be parsed.
    pub fn new(from: Crs, to: Crs) -> Result<Self, ReprojectionError> {
        if from == to {
            return Ok(Self {
                from,
                to,
                projs: None,
                source_is_geographic: false,
                target_is_geographic: false,
            });
        }

        let source_str = get_proj_string(from.0).ok_or_else(|| {
            ReprojectionError::new(from, to, format!("{from} is not in the crs-definitions database"))
        })?;
        let target_str = get_proj_string(to.0).ok_or_else(|| {
            ReprojectionError::new(from, to, format!("{to} is not in the crs-definitions database"))
        })?;

        let source_proj = Proj::from_proj_string(source_str)
            .map_err(|e| ReprojectionError::new(from, to, format!("invalid source projection: {e:?}")))?;
        let target_proj = Proj::from_proj_string(target_str)
            .map_err(|e| ReprojectionError::new(from, to, format!("invalid target projection: {e:?}")))?;

        Ok(Self {
            from,
            to,
            projs: Some((source_proj, target_proj)),
            source_is_geographic: is_geographic_crs(from.0),
            target_is_geographic: is_geographic_crs(to.0),
        })
    }

    #[inline]
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.projs.is_none()
    }

    #[must_use]
    pub fn source(&self) -> Crs {
        self.from
    }

    #[must_use]
    pub fn target(&self) -> Crs {
        self.to
    }

    /// Transform one coordinate pair.
    ///
    /// # Errors
    /// Returns an error if proj4rs rejects the point or produces a non-finite result.
    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64), ReprojectionError> {
        let Some((source_proj, target_proj)) = &self.projs else {
            return Ok((x, y));
        };

        let mut point = if self.source_is_geographic {
            (x.to_radians(), y.to_radians(), 0.0)
        } else {
            (x, y, 0.0)
        };

        transform(source_proj, target_proj, &mut point)
            .map_err(|e| ReprojectionError::new(self.from, self.to, format!("transform failed at ({x}, {y}): {e:?}")))?;

        let (out_x, out_y) = if self.target_is_geographic {
            (point.0.to_degrees(), point.1.to_degrees())
        } else {
            (point.0, point.1)
        };

        if out_x.is_finite() && out_y.is_finite() {
            Ok((out_x, out_y))
        } else {
            Err(ReprojectionError::new(
                self.from,
                self.to,
                format!("non-finite result for ({x}, {y})"),
            ))
        }
    }

    /// Reproject a bounding box by transforming `densify` points along every edge
    /// and taking the envelope. The time range is preserved.
    ///
    /// # Errors
    /// Returns an error if any sampled edge point fails to transform.
    pub fn transform_bounds(&self, bbox: &BoundingBox, densify: usize) -> Result<BoundingBox, ReprojectionError> {
        if self.is_identity() {
            return Ok(BoundingBox { crs: self.to, ..*bbox });
        }

        let steps = densify.max(2) - 1;
        let mut minx = f64::INFINITY;
        let mut miny = f64::INFINITY;
        let mut maxx = f64::NEG_INFINITY;
        let mut maxy = f64::NEG_INFINITY;

        for i in 0..=steps {
            #[allow(clippy::cast_precision_loss)]
            let t = i as f64 / steps as f64;
            let x = bbox.minx + t * bbox.width();
            let y = bbox.miny + t * bbox.height();
            for (px, py) in [(x, bbox.miny), (x, bbox.maxy), (bbox.minx, y), (bbox.maxx, y)] {
                let (tx, ty) = self.transform(px, py)?;
                minx = minx.min(tx);
                miny = miny.min(ty);
                maxx = maxx.max(tx);
                maxy = maxy.max(ty);
            }
        }

        Ok(BoundingBox {
            minx,
            miny,
            maxx,
            maxy,
            mint: bbox.mint,
            maxt: bbox.maxt,
            crs: self.to,
        })
    }
}

/// Reproject a bounding box into `to` with the default edge densification.
///
/// # Errors
/// Returns an error if the CRS pair is unsupported or an edge point fails to transform.
pub fn project_bounds(bbox: &BoundingBox, to: Crs) -> Result<BoundingBox, ReprojectionError> {
    CoordTransformer::new(bbox.crs, to)?.transform_bounds(bbox, DEFAULT_DENSIFY_POINTS)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-6;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < EPS
    }

    #[test]
    fn test_project_point_same_crs() {
        let (x, y) = project_point(Crs::WGS84, Crs::WGS84, 10.0, 51.5).unwrap();
        assert!(approx_eq(x, 10.0));
        assert!(approx_eq(y, 51.5));
    }

    #[test]
    fn test_project_point_origin_to_mercator() {
        let (x, y) = project_point(Crs::WGS84, Crs::WEB_MERCATOR, 0.0, 0.0).unwrap();
        assert!(approx_eq(x, 0.0));
        assert!(approx_eq(y, 0.0));
    }

    #[test]
    fn test_project_point_roundtrip_utm() {
        let utm = Crs(32633);
        let (x, y) = project_point(Crs::WGS84, utm, 15.0, 52.0).unwrap();
        // UTM coordinates are in meters, easting near 500000 at the zone center
        assert!(x > 400_000.0 && x < 600_000.0, "UTM easting: {x}");
        assert!(y > 5_000_000.0 && y < 6_000_000.0, "UTM northing: {y}");

        let (lon, lat) = project_point(utm, Crs::WGS84, x, y).unwrap();
        assert!((lon - 15.0).abs() < 1e-5, "lon roundtrip: {lon}");
        assert!((lat - 52.0).abs() < 1e-5, "lat roundtrip: {lat}");
    }

    #[test]
    fn test_unsupported_epsg_code() {
        let err = project_point(Crs::WGS84, Crs(999_999), 0.0, 0.0).unwrap_err();
        assert!(err.reason.contains("not in the crs-definitions database"));
        assert_eq!(err.to, Crs(999_999));
        assert!(!is_supported(Crs(999_999)));
        assert!(is_supported(Crs::WGS84));
    }

    #[test]
    fn test_is_geographic_crs() {
        assert!(is_geographic_crs(4326), "4326 is geographic");
        assert!(!is_geographic_crs(3857), "3857 is projected");
        assert!(!is_geographic_crs(32633), "UTM is projected");
    }

    #[test]
    fn test_identity_transformer() {
        let t = CoordTransformer::new(Crs(32633), Crs(32633)).unwrap();
        assert!(t.is_identity());
        let bbox = BoundingBox::new(1.0, 2.0, 3.0, 4.0, Crs(32633));
        assert_eq!(t.transform_bounds(&bbox, 5).unwrap(), bbox);
    }

    #[test]
    fn test_project_bounds_contains_corners() {
        let bbox = BoundingBox::new(14.0, 51.0, 16.0, 53.0, Crs::WGS84).with_time(1.0, 2.0);
        let projected = project_bounds(&bbox, Crs(32633)).unwrap();
        assert_eq!(projected.crs, Crs(32633));
        assert_eq!((projected.mint, projected.maxt), (1.0, 2.0));

        for (lon, lat) in [(14.0, 51.0), (16.0, 51.0), (14.0, 53.0), (16.0, 53.0), (15.0, 52.0)] {
            let (x, y) = project_point(Crs::WGS84, Crs(32633), lon, lat).unwrap();
            assert!(x >= projected.minx - EPS && x <= projected.maxx + EPS);
            assert!(y >= projected.miny - EPS && y <= projected.maxy + EPS);
        }
    }
}
