//! Corpus-wide spatial index over source footprints.
//!
//! Built once at startup, read-only afterwards. Footprints are stored in the
//! index CRS; sources registered in another CRS have their bounds reprojected
//! on registration. Queries are never reprojected implicitly: a query in a
//! foreign CRS is rejected by [`SpatialIndex::query`] and must go through
//! [`SpatialIndex::query_projected`].

use rstar::{PointDistance, RTree, RTreeObject, AABB};
use tracing::debug;

use crate::error::{IndexError, Result};
use crate::geometry::projection::project_bounds;
use crate::geometry::{BoundingBox, Crs};
use crate::source::{SourceDescriptor, SourceId};

/// R-tree entry: a source id and its footprint envelope in the index CRS.
#[derive(Debug, Clone)]
struct IndexedSource {
    id: SourceId,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedSource {
    type Envelope = AABB<[f64; 2]>;

    #[inline]
    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

impl PointDistance for IndexedSource {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        self.envelope.distance_2(point)
    }
}

#[inline]
fn envelope_of(bbox: &BoundingBox) -> AABB<[f64; 2]> {
    AABB::from_corners([bbox.minx, bbox.miny], [bbox.maxx, bbox.maxy])
}

pub struct SpatialIndex {
    crs: Crs,
    tree: RTree<IndexedSource>,
    sources: Vec<SourceDescriptor>,
    footprints: Vec<BoundingBox>,
    extent: Option<BoundingBox>,
}

impl SpatialIndex {
    #[must_use]
    pub fn new(crs: Crs) -> Self {
        Self {
            crs,
            tree: RTree::new(),
            sources: Vec::new(),
            footprints: Vec::new(),
            extent: None,
        }
    }

    /// The CRS every footprint and query is expressed in.
    #[must_use]
    pub fn crs(&self) -> Crs {
        self.crs
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Register a source. Ids are assigned in registration order.
    ///
    /// # Errors
    /// Returns an error if the source bounds are invalid or cannot be
    /// reprojected into the index CRS.
    pub fn register(&mut self, source: SourceDescriptor) -> Result<SourceId> {
        if !source.bounds.is_valid() {
            return Err(IndexError::InvalidBox(source.bounds).into());
        }
        let footprint = if source.crs == self.crs {
            source.bounds
        } else {
            project_bounds(&source.bounds, self.crs)?
        };

        let id = SourceId(self.sources.len());
        self.tree.insert(IndexedSource {
            id,
            envelope: envelope_of(&footprint),
        });
        self.extent = Some(match self.extent {
            Some(extent) => extent.union(&footprint),
            None => footprint,
        });
        debug!(id = %id, name = %source.name, footprint = %footprint, "Registered source");

        self.sources.push(source);
        self.footprints.push(footprint);
        Ok(id)
    }

    /// All sources whose footprint intersects `bbox`, in registration order.
    ///
    /// # Errors
    /// Returns [`IndexError::CrsMismatch`] if `bbox` is not in the index CRS and
    /// [`IndexError::InvalidBox`] for inverted bounds.
    pub fn query(&self, bbox: &BoundingBox) -> std::result::Result<Vec<SourceId>, IndexError> {
        if bbox.crs != self.crs {
            return Err(IndexError::CrsMismatch {
                index: self.crs,
                query: bbox.crs,
            });
        }
        if !bbox.is_valid() {
            return Err(IndexError::InvalidBox(*bbox));
        }

        let mut hits: Vec<SourceId> = self
            .tree
            .locate_in_envelope_intersecting(&envelope_of(bbox))
            .map(|entry| entry.id)
            .filter(|id| self.footprints[id.0].time_overlaps(bbox))
            .collect();
        hits.sort_unstable();
        Ok(hits)
    }

    /// Reproject `bbox` into the index CRS, then [`query`](Self::query).
    ///
    /// # Errors
    /// Returns an error if the reprojection fails or the query is invalid.
    pub fn query_projected(&self, bbox: &BoundingBox) -> Result<Vec<SourceId>> {
        let projected = if bbox.crs == self.crs {
            *bbox
        } else {
            project_bounds(bbox, self.crs)?
        };
        Ok(self.query(&projected)?)
    }

    /// Source whose footprint is closest to (`x`, `y`) in the index CRS.
    ///
    /// Distance is zero inside a footprint; ties go to the earliest registered source.
    #[must_use]
    pub fn nearest(&self, x: f64, y: f64) -> Option<SourceId> {
        let point = [x, y];
        let mut iter = self.tree.nearest_neighbor_iter_with_distance_2(&point);
        let (first, best) = iter.next()?;
        let mut winner = first.id;
        for (entry, dist) in iter {
            if dist > best {
                break;
            }
            winner = winner.min(entry.id);
        }
        Some(winner)
    }

    /// Union of all registered footprints.
    ///
    /// # Errors
    /// Returns [`IndexError::Empty`] if nothing has been registered.
    pub fn extent(&self) -> std::result::Result<BoundingBox, IndexError> {
        self.extent.ok_or(IndexError::Empty)
    }

    #[must_use]
    pub fn get(&self, id: SourceId) -> Option<&SourceDescriptor> {
        self.sources.get(id.0)
    }

    /// Footprint of a source in the index CRS.
    #[must_use]
    pub fn footprint(&self, id: SourceId) -> Option<&BoundingBox> {
        self.footprints.get(id.0)
    }

    /// Find a source by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<SourceId> {
        self.sources.iter().position(|s| s.name == name).map(SourceId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SourceId, &SourceDescriptor)> {
        self.sources.iter().enumerate().map(|(i, s)| (SourceId(i), s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeoTransform;
    use crate::source::{SourceLocation, SourceRole};

    fn descriptor(name: &str, crs: Crs, minx: f64, maxy: f64, size: usize, res: f64) -> SourceDescriptor {
        SourceDescriptor::new(
            name,
            SourceLocation::Memory(name.to_string()),
            SourceRole::Image,
            crs,
            GeoTransform::new(minx, maxy, res, res),
            size,
            size,
            1,
        )
    }

    #[test]
    fn test_query_contains_own_footprint() {
        let mut index = SpatialIndex::new(Crs(32633));
        let sources = [
            descriptor("a", Crs(32633), 0.0, 100.0, 10, 10.0),
            descriptor("b", Crs(32633), 50.0, 150.0, 10, 10.0),
            descriptor("c", Crs(32633), 500.0, 600.0, 10, 10.0),
            descriptor("p", Crs(32633), 20.0, 20.0, 0, 10.0),
        ];
        let ids: Vec<SourceId> = sources
            .iter()
            .map(|s| index.register(s.clone()).unwrap())
            .collect();

        for id in &ids {
            let footprint = *index.footprint(*id).unwrap();
            assert!(index.query(&footprint).unwrap().contains(id), "{id} missing");
        }
    }

    #[test]
    fn test_query_registration_order() {
        let mut index = SpatialIndex::new(Crs(32633));
        // register in reverse spatial order so tree order differs from id order
        for i in (0..20).rev() {
            index
                .register(descriptor(&format!("s{i}"), Crs(32633), f64::from(i) * 5.0, 100.0, 10, 1.0))
                .unwrap();
        }
        let hits = index
            .query(&BoundingBox::new(0.0, 90.0, 200.0, 100.0, Crs(32633)))
            .unwrap();
        assert_eq!(hits.len(), 20);
        assert!(hits.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_query_crs_mismatch_rejected() {
        let mut index = SpatialIndex::new(Crs(32633));
        index
            .register(descriptor("a", Crs(32633), 500_000.0, 5_800_000.0, 100, 10.0))
            .unwrap();
        let bbox = BoundingBox::new(14.9, 52.3, 15.1, 52.4, Crs::WGS84);
        assert!(matches!(index.query(&bbox), Err(IndexError::CrsMismatch { .. })));
        // explicit reprojection is allowed
        assert!(index.query_projected(&bbox).is_ok());
    }

    #[test]
    fn test_extent_is_union() {
        let mut index = SpatialIndex::new(Crs(32633));
        assert!(matches!(index.extent(), Err(IndexError::Empty)));
        index.register(descriptor("a", Crs(32633), 0.0, 100.0, 10, 10.0)).unwrap();
        index.register(descriptor("b", Crs(32633), 200.0, 300.0, 10, 10.0)).unwrap();
        let e = index.extent().unwrap();
        assert_eq!((e.minx, e.miny, e.maxx, e.maxy), (0.0, 0.0, 300.0, 300.0));
    }

    #[test]
    fn test_foreign_crs_source_is_reprojected() {
        let mut index = SpatialIndex::new(Crs::WGS84);
        let id = index
            .register(descriptor("utm", Crs(32633), 500_000.0, 5_800_000.0, 100, 10.0))
            .unwrap();
        let footprint = index.footprint(id).unwrap();
        assert_eq!(footprint.crs, Crs::WGS84);
        assert!(footprint.minx > 14.0 && footprint.maxx < 16.0);
        assert!(footprint.miny > 52.0 && footprint.maxy < 53.0);
    }

    #[test]
    fn test_time_filter() {
        let mut index = SpatialIndex::new(Crs(32633));
        index
            .register(descriptor("old", Crs(32633), 0.0, 100.0, 10, 10.0).with_time(0.0, 10.0))
            .unwrap();
        let recent = index
            .register(descriptor("new", Crs(32633), 0.0, 100.0, 10, 10.0).with_time(100.0, 110.0))
            .unwrap();
        let q = BoundingBox::new(0.0, 0.0, 100.0, 100.0, Crs(32633)).with_time(105.0, 106.0);
        assert_eq!(index.query(&q).unwrap(), vec![recent]);
    }

    #[test]
    fn test_nearest_ties_by_registration() {
        let mut index = SpatialIndex::new(Crs(32633));
        let first = index.register(descriptor("a", Crs(32633), 0.0, 100.0, 10, 10.0)).unwrap();
        let _dup = index.register(descriptor("b", Crs(32633), 0.0, 100.0, 10, 10.0)).unwrap();
        let far = index.register(descriptor("c", Crs(32633), 1000.0, 100.0, 10, 10.0)).unwrap();

        assert_eq!(index.nearest(50.0, 50.0), Some(first));
        assert_eq!(index.nearest(-10.0, 50.0), Some(first));
        assert_eq!(index.nearest(1200.0, 50.0), Some(far));
        assert_eq!(SpatialIndex::new(Crs(32633)).nearest(0.0, 0.0), None);
    }

    #[test]
    fn test_find_by_name() {
        let mut index = SpatialIndex::new(Crs(32633));
        index.register(descriptor("a", Crs(32633), 0.0, 100.0, 10, 10.0)).unwrap();
        let b = index.register(descriptor("b", Crs(32633), 0.0, 100.0, 10, 10.0)).unwrap();
        assert_eq!(index.find("b"), Some(b));
        assert_eq!(index.find("z"), None);
    }
}
