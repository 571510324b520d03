//! Raster source descriptors and native readers.
//!
//! A source is one georeferenced raster registered with the
//! [`SpatialIndex`](crate::index::SpatialIndex). Its [`SourceDescriptor`] carries
//! everything the aligner needs (CRS, geotransform, size); the pixel data is
//! fetched through a [`SourceReader`], which is the only component that touches I/O.
//!
//! # Example
//!
//! ```rust,no_run
//! use geosample::source::{SourceRole, local::{scan_paths, LocalScanOptions}};
//!
//! let found = scan_paths(&["/data/train/images"], SourceRole::Image, &LocalScanOptions::default());
//! for (descriptor, _reader) in &found.sources {
//!     println!("{} {} {}x{}", descriptor.name, descriptor.crs, descriptor.width, descriptor.height);
//! }
//! ```

pub mod local;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use ndarray::{s, Array3};

use crate::error::{SourceIoError, SourceIoKind};
use crate::geometry::{BoundingBox, Crs, GeoTransform, PixelWindow};

pub use local::{GeoTiffSource, LocalScanOptions, LocalScanStats};

/// Registration-order identifier of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub usize);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a source contributes to a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceRole {
    /// Continuous imagery, any number of bands.
    Image,
    /// Single-band categorical class indices.
    Label,
}

impl SourceRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Label => "label",
        }
    }
}

/// Where the pixels of a source live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    /// Local filesystem path
    File(PathBuf),
    /// In-process array, identified by name
    Memory(String),
}

impl SourceLocation {
    /// Get a display string for the location
    #[must_use]
    pub fn display(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Memory(name) => format!("memory://{name}"),
        }
    }
}

/// Native sample type of a raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

/// Metadata for one registered raster.
///
/// Lightweight and cloneable; no pixel data is held.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    /// Unique name (usually the file stem)
    pub name: String,
    pub location: SourceLocation,
    pub role: SourceRole,
    /// Native CRS
    pub crs: Crs,
    /// Native pixel-to-CRS mapping
    pub transform: GeoTransform,
    pub width: usize,
    pub height: usize,
    pub bands: usize,
    pub dtype: PixelType,
    pub band_names: Vec<String>,
    pub nodata: Option<f64>,
    /// Footprint in the native CRS, including the time range
    pub bounds: BoundingBox,
}

impl SourceDescriptor {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        location: SourceLocation,
        role: SourceRole,
        crs: Crs,
        transform: GeoTransform,
        width: usize,
        height: usize,
        bands: usize,
    ) -> Self {
        let band_names = (1..=bands).map(|b| format!("B{b}")).collect();
        Self {
            name: name.into(),
            location,
            role,
            crs,
            transform,
            width,
            height,
            bands,
            dtype: PixelType::F32,
            band_names,
            nodata: None,
            bounds: transform.bounds(width, height, crs),
        }
    }

    #[must_use]
    pub fn with_nodata(mut self, nodata: Option<f64>) -> Self {
        self.nodata = nodata;
        self
    }

    #[must_use]
    pub fn with_dtype(mut self, dtype: PixelType) -> Self {
        self.dtype = dtype;
        self
    }

    #[must_use]
    pub fn with_time(mut self, mint: f64, maxt: f64) -> Self {
        self.bounds = self.bounds.with_time(mint, maxt);
        self
    }

    #[must_use]
    pub fn with_band_names(mut self, names: Vec<String>) -> Self {
        self.band_names = names;
        self
    }

    /// Native (x, y) resolution in CRS units per pixel.
    #[must_use]
    pub fn resolution(&self) -> (f64, f64) {
        (self.transform.pixel_width, self.transform.pixel_height)
    }

    /// Whether `value` is this source's nodata marker.
    #[inline]
    #[must_use]
    pub fn is_nodata(&self, value: f32) -> bool {
        if value.is_nan() {
            return true;
        }
        #[allow(clippy::float_cmp)]
        self.nodata.is_some_and(|nd| f64::from(value) == nd)
    }
}

/// Physical access to a source's pixels.
///
/// Implementations perform blocking I/O; callers run them on worker threads.
pub trait SourceReader: Send + Sync {
    /// Read a native-resolution window as `[bands, rows, cols]`.
    ///
    /// # Errors
    /// Returns a [`SourceIoError`] if the data cannot be read or decoded, or the
    /// window lies outside the raster.
    fn read_window(&self, window: &PixelWindow) -> Result<Array3<f32>, SourceIoError>;

    /// Display string identifying the backing data, for error context.
    fn location(&self) -> String;
}

/// Source backed by an in-memory `[bands, rows, cols]` array.
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    data: Arc<Array3<f32>>,
}

impl MemorySource {
    #[must_use]
    pub fn new(name: impl Into<String>, data: Array3<f32>) -> Self {
        Self {
            name: name.into(),
            data: Arc::new(data),
        }
    }

    /// Descriptor matching this array's shape on the given grid.
    #[must_use]
    pub fn descriptor(&self, role: SourceRole, crs: Crs, transform: GeoTransform) -> SourceDescriptor {
        let (bands, rows, cols) = self.data.dim();
        SourceDescriptor::new(
            self.name.clone(),
            SourceLocation::Memory(self.name.clone()),
            role,
            crs,
            transform,
            cols,
            rows,
            bands,
        )
    }
}

impl SourceReader for MemorySource {
    fn read_window(&self, window: &PixelWindow) -> Result<Array3<f32>, SourceIoError> {
        let (_, rows, cols) = self.data.dim();
        if !window.fits_within(cols, rows) {
            return Err(SourceIoError::new(
                SourceIoKind::OutOfBounds,
                self.location(),
                format!("window {window} outside {cols}x{rows} raster"),
            ));
        }
        Ok(self
            .data
            .slice(s![
                ..,
                window.row_off..window.row_off + window.height,
                window.col_off..window.col_off + window.width
            ])
            .to_owned())
    }

    fn location(&self) -> String {
        format!("memory://{}", self.name)
    }
}
