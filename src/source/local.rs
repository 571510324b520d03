//! Local filesystem GeoTIFF sources.
//!
//! Scans directories for `GeoTIFF` files, probes their georeferencing, and reads
//! native pixel windows with the `tiff` decoder.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use ndarray::Array3;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::tags::Tag;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{PixelType, SourceDescriptor, SourceLocation, SourceReader, SourceRole};
use crate::error::{SourceIoError, SourceIoKind};
use crate::geometry::{Crs, GeoTransform, PixelWindow};

// GeoTIFF tag and key ids (not in the standard tiff crate)
pub(crate) const GEOTIFF_MODELPIXELSCALE: u16 = 33550;
pub(crate) const GEOTIFF_MODELTIEPOINT: u16 = 33922;
pub(crate) const GEOTIFF_GEOKEYDIRECTORY: u16 = 34735;
pub(crate) const GDAL_NODATA: u16 = 42113;

pub(crate) const GEOGRAPHIC_TYPE_GEO_KEY: u16 = 2048;
pub(crate) const PROJECTED_CS_TYPE_GEO_KEY: u16 = 3072;
const USER_DEFINED_KEY_VALUE: u32 = 32767;

/// Options for scanning local directories.
#[derive(Debug, Clone)]
pub struct LocalScanOptions {
    /// Maximum directory depth to scan (None = unlimited)
    pub max_depth: Option<usize>,
    /// File extensions to consider as `GeoTIFFs` (case-insensitive)
    pub extensions: Vec<String>,
    /// Whether to follow symbolic links
    pub follow_links: bool,
}

impl Default for LocalScanOptions {
    fn default() -> Self {
        Self {
            max_depth: None,
            extensions: vec![
                "tif".to_string(),
                "tiff".to_string(),
                "geotiff".to_string(),
                "geotif".to_string(),
            ],
            follow_links: false,
        }
    }
}

impl LocalScanOptions {
    /// Set maximum depth
    #[must_use]
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    fn matches(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|s| s.to_str())
            .is_some_and(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
    }
}

/// Counts from a scan.
#[derive(Debug, Clone, Default)]
pub struct LocalScanStats {
    /// GeoTIFFs successfully probed
    pub file_count: usize,
    /// Candidate files whose metadata could not be read
    pub failed: usize,
    /// Total size of all probed files in bytes
    pub total_size_bytes: u64,
}

/// Result of scanning one or more paths.
#[derive(Default)]
pub struct LocalScan {
    pub sources: Vec<(SourceDescriptor, GeoTiffSource)>,
    pub stats: LocalScanStats,
}

/// Discover GeoTIFF sources under the given files or directories.
///
/// Files are probed in sorted path order so registration order, and hence
/// query tie-breaking, is stable across runs. Unreadable candidates are logged
/// and counted, not fatal.
pub fn scan_paths<P: AsRef<Path>>(paths: &[P], role: SourceRole, options: &LocalScanOptions) -> LocalScan {
    let mut candidates: Vec<PathBuf> = Vec::new();

    for root in paths {
        let root = root.as_ref();
        if root.is_file() {
            candidates.push(root.to_path_buf());
            continue;
        }
        if !root.exists() {
            warn!(path = %root.display(), "Scan path does not exist");
            continue;
        }

        let mut walker = WalkDir::new(root).follow_links(options.follow_links);
        if let Some(max) = options.max_depth {
            walker = walker.max_depth(max);
        }
        for entry in walker.into_iter().filter_map(std::result::Result::ok) {
            if entry.file_type().is_file() && options.matches(entry.path()) {
                candidates.push(entry.path().to_path_buf());
            }
        }
    }

    candidates.sort();
    candidates.dedup();

    let mut scan = LocalScan::default();
    for path in candidates {
        match GeoTiffSource::probe(&path, role) {
            Ok((descriptor, reader)) => {
                scan.stats.file_count += 1;
                scan.stats.total_size_bytes += std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                debug!(path = %path.display(), crs = %descriptor.crs, role = role.as_str(), "Discovered GeoTIFF");
                scan.sources.push((descriptor, reader));
            }
            Err(e) => {
                scan.stats.failed += 1;
                warn!(path = %path.display(), error = %e, "Failed to read GeoTIFF metadata");
            }
        }
    }
    scan
}

/// GeoTIFF file on local disk.
///
/// Opening is lazy: every window read opens and decodes the file, so a file
/// that disappears or is corrupted after discovery surfaces as a
/// [`SourceIoError`] on each read rather than at construction.
#[derive(Debug, Clone)]
pub struct GeoTiffSource {
    path: PathBuf,
}

impl GeoTiffSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read georeferencing metadata and build a descriptor.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or decoded, uses planar band
    /// layout, or lacks pixel scale, tiepoint, or an EPSG code.
    pub fn probe(path: &Path, role: SourceRole) -> Result<(SourceDescriptor, Self), SourceIoError> {
        let mut decoder = open_decoder(path)?;
        let tiff_err = |e: tiff::TiffError| SourceIoError::tiff(path, &e);
        let unsupported = |msg: &str| SourceIoError::new(SourceIoKind::Unsupported, path.display().to_string(), msg);

        let (width, height) = decoder.dimensions().map_err(tiff_err)?;
        let bands = decoder
            .find_tag(Tag::SamplesPerPixel)
            .map_err(tiff_err)?
            .map(tiff::decoder::ifd::Value::into_u32)
            .transpose()
            .map_err(tiff_err)?
            .unwrap_or(1);

        let planar = decoder
            .find_tag(Tag::PlanarConfiguration)
            .map_err(tiff_err)?
            .map(tiff::decoder::ifd::Value::into_u32)
            .transpose()
            .map_err(tiff_err)?
            .unwrap_or(1);
        if planar != 1 {
            return Err(unsupported("planar band layout is not supported"));
        }

        let dtype = pixel_type(&mut decoder).map_err(tiff_err)?.ok_or_else(|| unsupported("unsupported sample format"))?;

        let scale = decoder
            .find_tag(Tag::Unknown(GEOTIFF_MODELPIXELSCALE))
            .map_err(tiff_err)?
            .map(tiff::decoder::ifd::Value::into_f64_vec)
            .transpose()
            .map_err(tiff_err)?
            .filter(|v| v.len() >= 2)
            .ok_or_else(|| unsupported("missing ModelPixelScale"))?;
        let tiepoint = decoder
            .find_tag(Tag::Unknown(GEOTIFF_MODELTIEPOINT))
            .map_err(tiff_err)?
            .map(tiff::decoder::ifd::Value::into_f64_vec)
            .transpose()
            .map_err(tiff_err)?
            .filter(|v| v.len() >= 6)
            .ok_or_else(|| unsupported("missing ModelTiepoint"))?;
        let geokeys = decoder
            .find_tag(Tag::Unknown(GEOTIFF_GEOKEYDIRECTORY))
            .map_err(tiff_err)?
            .map(tiff::decoder::ifd::Value::into_u32_vec)
            .transpose()
            .map_err(tiff_err)?
            .unwrap_or_default();
        let epsg = epsg_from_geokeys(&geokeys).ok_or_else(|| unsupported("no EPSG code in GeoKeyDirectory"))?;

        let nodata = decoder
            .find_tag(Tag::Unknown(GDAL_NODATA))
            .map_err(tiff_err)?
            .map(tiff::decoder::ifd::Value::into_string)
            .transpose()
            .map_err(tiff_err)?
            .and_then(|s| s.trim_matches(char::from(0)).trim().parse::<f64>().ok());

        let transform = GeoTransform::from_tiepoint(
            [scale[0], scale[1]],
            [tiepoint[0], tiepoint[1], tiepoint[2], tiepoint[3], tiepoint[4], tiepoint[5]],
        );
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        let descriptor = SourceDescriptor::new(
            name,
            SourceLocation::File(path.to_path_buf()),
            role,
            Crs(epsg),
            transform,
            width as usize,
            height as usize,
            bands as usize,
        )
        .with_dtype(dtype)
        .with_nodata(nodata);

        Ok((descriptor, Self::new(path)))
    }
}

impl SourceReader for GeoTiffSource {
    /// Decodes only the strips or tiles that intersect `window`.
    fn read_window(&self, window: &PixelWindow) -> Result<Array3<f32>, SourceIoError> {
        let path = self.path.as_path();
        let mut decoder = open_decoder(path)?;
        let tiff_err = |e: tiff::TiffError| SourceIoError::tiff(path, &e);

        let (width, height) = decoder.dimensions().map_err(tiff_err)?;
        let (width, height) = (width as usize, height as usize);
        if window.is_empty() || !window.fits_within(width, height) {
            return Err(SourceIoError::new(
                SourceIoKind::OutOfBounds,
                self.location(),
                format!("window {window} outside {width}x{height} raster"),
            ));
        }

        let samples = tag_u32(&mut decoder, Tag::SamplesPerPixel).map_err(tiff_err)?.unwrap_or(1) as usize;
        let planar = tag_u32(&mut decoder, Tag::PlanarConfiguration).map_err(tiff_err)?.unwrap_or(1);
        // planar configuration 2 stores one band per chunk, band-major
        let (planes, per_chunk) = if planar == 2 { (samples, 1) } else { (1, samples) };

        let (cw, ch) = decoder.chunk_dimensions();
        let (cw, ch) = (cw as usize, ch as usize);
        if cw == 0 || ch == 0 {
            return Err(SourceIoError::new(SourceIoKind::Decode, self.location(), "zero-sized chunks"));
        }
        let across = width.div_ceil(cw);
        let per_plane = across * height.div_ceil(ch);

        let (col_end, row_end) = (window.col_off + window.width, window.row_off + window.height);
        let mut out = Array3::<f32>::zeros((samples, window.height, window.width));
        for plane in 0..planes {
            for cr in window.row_off / ch..=(row_end - 1) / ch {
                for cc in window.col_off / cw..=(col_end - 1) / cw {
                    let index = plane * per_plane + cr * across + cc;
                    let index = u32::try_from(index).map_err(|_| {
                        SourceIoError::new(SourceIoKind::Decode, self.location(), format!("chunk {index} out of range"))
                    })?;
                    let chunk = decoding_result_to_f32(decoder.read_chunk(index).map_err(tiff_err)?).ok_or_else(|| {
                        SourceIoError::new(SourceIoKind::Unsupported, self.location(), "unsupported sample type")
                    })?;

                    let (x0, y0) = (cc * cw, cr * ch);
                    let (dw, dh) = (cw.min(width - x0), ch.min(height - y0));
                    // edge chunks come back either cropped or padded to full size
                    let stride = if chunk.len() == dw * dh * per_chunk {
                        dw
                    } else if chunk.len() == cw * ch * per_chunk {
                        cw
                    } else {
                        return Err(SourceIoError::new(
                            SourceIoKind::Decode,
                            self.location(),
                            format!("chunk {index} decoded {} samples for {dw}x{dh}x{per_chunk}", chunk.len()),
                        ));
                    };

                    for y in window.row_off.max(y0)..row_end.min(y0 + dh) {
                        for x in window.col_off.max(x0)..col_end.min(x0 + dw) {
                            let base = ((y - y0) * stride + (x - x0)) * per_chunk;
                            for s in 0..per_chunk {
                                out[(plane + s, y - window.row_off, x - window.col_off)] = chunk[base + s];
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

fn open_decoder(path: &Path) -> Result<Decoder<BufReader<File>>, SourceIoError> {
    let file = File::open(path).map_err(|e| SourceIoError::io(path, &e))?;
    Decoder::new(BufReader::new(file))
        .map(|d| d.with_limits(Limits::unlimited()))
        .map_err(|e| SourceIoError::tiff(path, &e))
}

fn tag_u32<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>, tag: Tag) -> tiff::TiffResult<Option<u32>> {
    decoder.find_tag(tag)?.map(tiff::decoder::ifd::Value::into_u32).transpose()
}

fn pixel_type<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>) -> tiff::TiffResult<Option<PixelType>> {
    let bits = decoder
        .find_tag(Tag::BitsPerSample)?
        .map(tiff::decoder::ifd::Value::into_u32_vec)
        .transpose()?
        .and_then(|v| v.first().copied())
        .unwrap_or(8);
    let format = decoder
        .find_tag(Tag::SampleFormat)?
        .map(tiff::decoder::ifd::Value::into_u32_vec)
        .transpose()?
        .and_then(|v| v.first().copied())
        .unwrap_or(1);

    Ok(match (format, bits) {
        (1, 8) => Some(PixelType::U8),
        (1, 16) => Some(PixelType::U16),
        (1, 32) => Some(PixelType::U32),
        (1, 64) => Some(PixelType::U64),
        (2, 8) => Some(PixelType::I8),
        (2, 16) => Some(PixelType::I16),
        (2, 32) => Some(PixelType::I32),
        (2, 64) => Some(PixelType::I64),
        (3, 32) => Some(PixelType::F32),
        (3, 64) => Some(PixelType::F64),
        _ => None,
    })
}

/// EPSG code from a GeoKeyDirectory, preferring the projected CRS key.
///
/// Layout: `[version, revision, minor, count, (key, location, count, value) * count]`.
pub(crate) fn epsg_from_geokeys(keys: &[u32]) -> Option<i32> {
    let count = *keys.get(3)? as usize;
    let entries = keys.get(4..4 + count * 4)?;

    let lookup = |wanted: u16| {
        entries.chunks_exact(4).find_map(|e| {
            (e[0] == u32::from(wanted) && e[1] == 0 && e[3] != USER_DEFINED_KEY_VALUE)
                .then(|| i32::try_from(e[3]).ok())
                .flatten()
        })
    };

    lookup(PROJECTED_CS_TYPE_GEO_KEY).or_else(|| lookup(GEOGRAPHIC_TYPE_GEO_KEY))
}

// Integer samples above 2^24 lose precision in f32; accepted for imagery and class indices.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn decoding_result_to_f32(result: DecodingResult) -> Option<Vec<f32>> {
    #[allow(unreachable_patterns)]
    Some(match result {
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
        _ => return None,
    })
}
