//! GeoTIFF output for samples and arbitrary `[bands, rows, cols]` rasters.
//!
//! Pure Rust (no GDAL). Writes ModelPixelScale, ModelTiepoint and a
//! GeoKeyDirectory carrying the EPSG code, plus GDAL_NODATA when set, which is
//! exactly what [`GeoTiffSource::probe`](crate::source::GeoTiffSource::probe)
//! reads back.
//!
//! ```rust,no_run
//! # fn demo(sample: &geosample::Sample) -> Result<(), geosample::geotiff_writer::GeoTiffWriteError> {
//! sample.write_image_geotiff("tile_0001.tif")?;
//! sample.write_label_geotiff("tile_0001_label.tif")?;
//! # Ok(())
//! # }
//! ```

use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::Path;

use ndarray::{ArrayView3, Axis};
use thiserror::Error;
use tiff::encoder::colortype::{Gray32Float, RGB32Float, RGBA32Float};
use tiff::encoder::{Compression, DeflateLevel, DirectoryEncoder, TiffEncoder, TiffKind};
use tiff::tags::Tag;
use tracing::debug;

use crate::batch::Sample;
use crate::geometry::projection::is_geographic_crs;
use crate::geometry::{Crs, GeoTransform};
use crate::source::local::{
    GDAL_NODATA, GEOGRAPHIC_TYPE_GEO_KEY, GEOTIFF_GEOKEYDIRECTORY, GEOTIFF_MODELPIXELSCALE, GEOTIFF_MODELTIEPOINT,
    PROJECTED_CS_TYPE_GEO_KEY,
};

const GT_MODEL_TYPE_GEO_KEY: u16 = 1024;
const GT_RASTER_TYPE_GEO_KEY: u16 = 1025;

const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;

/// Compression method for GeoTIFF output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GeoTiffCompression {
    #[default]
    None,
    Lzw,
    Deflate,
}

impl GeoTiffCompression {
    fn to_tiff(self) -> Compression {
        match self {
            Self::None => Compression::Uncompressed,
            Self::Lzw => Compression::Lzw,
            Self::Deflate => Compression::Deflate(DeflateLevel::Fast),
        }
    }
}

#[derive(Debug, Error)]
pub enum GeoTiffWriteError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TIFF encoding error: {0}")]
    TiffEncode(#[from] tiff::TiffError),
    #[error("invalid raster: {0}")]
    InvalidData(String),
}

/// Builder for one GeoTIFF image.
pub struct GeoTiffWriter<'a> {
    data: ArrayView3<'a, f32>,
    transform: GeoTransform,
    crs: Crs,
    nodata: Option<f64>,
    compression: GeoTiffCompression,
}

impl<'a> GeoTiffWriter<'a> {
    /// `data` is `[bands, rows, cols]` on the grid described by `transform`.
    #[must_use]
    pub fn new(data: ArrayView3<'a, f32>, transform: GeoTransform, crs: Crs) -> Self {
        Self {
            data,
            transform,
            crs,
            nodata: None,
            compression: GeoTiffCompression::default(),
        }
    }

    #[must_use]
    pub fn nodata(mut self, nodata: Option<f64>) -> Self {
        self.nodata = nodata;
        self
    }

    /// Applies to 1, 3 and 4 band images; other band counts are written uncompressed.
    #[must_use]
    pub fn compression(mut self, compression: GeoTiffCompression) -> Self {
        self.compression = compression;
        self
    }

    /// # Errors
    /// Returns an error if the file cannot be created or encoding fails.
    pub fn write<P: AsRef<Path>>(self, path: P) -> Result<(), GeoTiffWriteError> {
        let path = path.as_ref();
        let writer = BufWriter::new(File::create(path)?);
        self.write_to(writer)?;
        debug!(path = %path.display(), "Wrote GeoTIFF");
        Ok(())
    }

    /// # Errors
    /// Returns [`GeoTiffWriteError::InvalidData`] for an empty raster, an
    /// unrepresentable EPSG code or oversized dimensions.
    pub fn write_to<W: Write + Seek>(self, writer: W) -> Result<(), GeoTiffWriteError> {
        let (bands, rows, cols) = self.data.dim();
        if bands == 0 || rows == 0 || cols == 0 {
            return Err(GeoTiffWriteError::InvalidData(format!("empty raster {bands}x{rows}x{cols}")));
        }
        let too_large = |_| GeoTiffWriteError::InvalidData(format!("raster {cols}x{rows} too large"));
        let width = u32::try_from(cols).map_err(too_large)?;
        let height = u32::try_from(rows).map_err(too_large)?;

        // chunky layout: bands interleaved per pixel
        let pixels: Vec<f32> = self.data.view().permuted_axes([1, 2, 0]).iter().copied().collect();

        let mut encoder = TiffEncoder::new(writer)?.with_compression(self.compression.to_tiff());
        match bands {
            1 => {
                let mut image = encoder.new_image::<Gray32Float>(width, height)?;
                self.write_geo_tags(image.encoder())?;
                image.write_data(&pixels)?;
            }
            3 => {
                let mut image = encoder.new_image::<RGB32Float>(width, height)?;
                self.write_geo_tags(image.encoder())?;
                image.write_data(&pixels)?;
            }
            4 => {
                let mut image = encoder.new_image::<RGBA32Float>(width, height)?;
                self.write_geo_tags(image.encoder())?;
                image.write_data(&pixels)?;
            }
            _ => self.write_multiband(&mut encoder, width, height, bands, &pixels)?,
        }
        Ok(())
    }

    /// Arbitrary band counts via the low-level directory API, one strip.
    fn write_multiband<W: Write + Seek>(
        &self,
        encoder: &mut TiffEncoder<W>,
        width: u32,
        height: u32,
        bands: usize,
        pixels: &[f32],
    ) -> Result<(), GeoTiffWriteError> {
        let samples = u16::try_from(bands).map_err(|_| GeoTiffWriteError::InvalidData(format!("{bands} bands")))?;
        let mut dir = encoder.image_directory()?;
        dir.write_tag(Tag::ImageWidth, width)?;
        dir.write_tag(Tag::ImageLength, height)?;
        dir.write_tag(Tag::BitsPerSample, vec![32_u16; bands].as_slice())?;
        dir.write_tag(Tag::Compression, 1_u16)?;
        dir.write_tag(Tag::PhotometricInterpretation, 1_u16)?;
        dir.write_tag(Tag::SamplesPerPixel, samples)?;
        dir.write_tag(Tag::SampleFormat, vec![3_u16; bands].as_slice())?;
        dir.write_tag(Tag::PlanarConfiguration, 1_u16)?;
        dir.write_tag(Tag::RowsPerStrip, height)?;
        dir.write_tag(Tag::ExtraSamples, vec![0_u16; bands - 1].as_slice())?;
        self.write_geo_tags(&mut dir)?;

        let bytes: Vec<u8> = pixels.iter().flat_map(|v| v.to_le_bytes()).collect();
        let byte_count = u32::try_from(bytes.len())
            .map_err(|_| GeoTiffWriteError::InvalidData("strip exceeds 4 GiB".to_string()))?;
        let offset = dir.write_data(bytes.as_slice())?;
        let offset = u32::try_from(offset)
            .map_err(|_| GeoTiffWriteError::InvalidData("strip offset exceeds 4 GiB".to_string()))?;
        dir.write_tag(Tag::StripOffsets, offset)?;
        dir.write_tag(Tag::StripByteCounts, byte_count)?;
        dir.finish()?;
        Ok(())
    }

    fn write_geo_tags<W: Write + Seek, K: TiffKind>(
        &self,
        dir: &mut DirectoryEncoder<'_, W, K>,
    ) -> Result<(), GeoTiffWriteError> {
        let t = &self.transform;
        let scale = [t.pixel_width, t.pixel_height.abs(), 0.0];
        dir.write_tag(Tag::Unknown(GEOTIFF_MODELPIXELSCALE), scale.as_slice())?;
        let tiepoint = [0.0, 0.0, 0.0, t.origin_x, t.origin_y, 0.0];
        dir.write_tag(Tag::Unknown(GEOTIFF_MODELTIEPOINT), tiepoint.as_slice())?;
        let geokeys = geokey_directory(self.crs)?;
        dir.write_tag(Tag::Unknown(GEOTIFF_GEOKEYDIRECTORY), geokeys.as_slice())?;
        if let Some(nodata) = self.nodata {
            dir.write_tag(Tag::Unknown(GDAL_NODATA), format!("{nodata}").as_str())?;
        }
        Ok(())
    }
}

/// `[version, revision, minor, count, (key, location, count, value)*]`
fn geokey_directory(crs: Crs) -> Result<Vec<u16>, GeoTiffWriteError> {
    let code = u16::try_from(crs.0)
        .map_err(|_| GeoTiffWriteError::InvalidData(format!("{crs} does not fit a GeoKey")))?;
    let geographic = is_geographic_crs(crs.0);
    let (model, cs_key) = if geographic {
        (MODEL_TYPE_GEOGRAPHIC, GEOGRAPHIC_TYPE_GEO_KEY)
    } else {
        (MODEL_TYPE_PROJECTED, PROJECTED_CS_TYPE_GEO_KEY)
    };
    let mut keys = vec![1, 1, 0, 3];
    keys.extend_from_slice(&[GT_MODEL_TYPE_GEO_KEY, 0, 1, model]);
    keys.extend_from_slice(&[GT_RASTER_TYPE_GEO_KEY, 0, 1, RASTER_PIXEL_IS_AREA]);
    keys.extend_from_slice(&[cs_key, 0, 1, code]);
    Ok(keys)
}

impl Sample {
    /// Flipped or rotated pixels cannot be georeferenced by the sample's transform.
    fn check_georeferenced(&self) -> Result<(), GeoTiffWriteError> {
        if self.meta.reoriented {
            return Err(GeoTiffWriteError::InvalidData(format!(
                "sample {} was reoriented by {:?}; its transform no longer matches the pixels",
                self.meta.seq, self.meta.augmentations
            )));
        }
        Ok(())
    }

    /// Write the image bands with the sample's grid and CRS.
    ///
    /// # Errors
    /// Returns [`GeoTiffWriteError::InvalidData`] for a reoriented sample, or
    /// see [`GeoTiffWriter::write`].
    pub fn write_image_geotiff<P: AsRef<Path>>(&self, path: P) -> Result<(), GeoTiffWriteError> {
        self.check_georeferenced()?;
        GeoTiffWriter::new(self.image.view(), self.meta.transform, self.meta.crs).write(path)
    }

    /// Write the label as a single float band.
    ///
    /// # Errors
    /// Returns [`GeoTiffWriteError::InvalidData`] if the sample has no label or
    /// was reoriented.
    pub fn write_label_geotiff<P: AsRef<Path>>(&self, path: P) -> Result<(), GeoTiffWriteError> {
        self.check_georeferenced()?;
        let label = self
            .label
            .as_ref()
            .ok_or_else(|| GeoTiffWriteError::InvalidData("sample has no label".to_string()))?;
        #[allow(clippy::cast_precision_loss)]
        let band = label.mapv(|v| v as f32).insert_axis(Axis(0));
        GeoTiffWriter::new(band.view(), self.meta.transform, self.meta.crs).write(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augment::{Augmentation, HorizontalFlip};
    use crate::batch::SampleMeta;
    use crate::geometry::BoundingBox;
    use crate::source::{GeoTiffSource, SourceReader, SourceRole};
    use crate::geometry::PixelWindow;
    use ndarray::{Array2, Array3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const UTM: Crs = Crs(32633);

    fn raster(bands: usize, rows: usize, cols: usize) -> Array3<f32> {
        Array3::from_shape_fn((bands, rows, cols), |(b, r, c)| (b * 100 + r * cols + c) as f32)
    }

    fn transform() -> GeoTransform {
        GeoTransform::new(500_000.0, 4_010_000.0, 10.0, 10.0)
    }

    #[test]
    fn test_geokey_directory() {
        let keys = geokey_directory(UTM).unwrap();
        assert_eq!(&keys[..4], &[1, 1, 0, 3]);
        assert_eq!(keys[7], MODEL_TYPE_PROJECTED);
        assert_eq!(keys[12], PROJECTED_CS_TYPE_GEO_KEY);
        assert_eq!(keys[15], 32633);

        let keys = geokey_directory(Crs::WGS84).unwrap();
        assert_eq!(keys[7], MODEL_TYPE_GEOGRAPHIC);
        assert_eq!(keys[12], GEOGRAPHIC_TYPE_GEO_KEY);
        assert_eq!(keys[15], 4326);
    }

    #[test]
    fn test_empty_raster_rejected() {
        let empty = Array3::<f32>::zeros((1, 0, 4));
        let mut buf = std::io::Cursor::new(Vec::new());
        let err = GeoTiffWriter::new(empty.view(), transform(), UTM).write_to(&mut buf).unwrap_err();
        assert!(matches!(err, GeoTiffWriteError::InvalidData(_)));
    }

    #[test]
    fn test_multiband_encodes() {
        let data = raster(5, 8, 8);
        let mut buf = std::io::Cursor::new(Vec::new());
        GeoTiffWriter::new(data.view(), transform(), UTM).write_to(&mut buf).unwrap();
        let bytes = buf.into_inner();
        assert!(bytes.len() > 5 * 8 * 8 * 4);
        assert!(bytes.starts_with(b"II") || bytes.starts_with(b"MM"));
    }

    #[test]
    fn test_round_trip_through_probe() {
        let dir = tempfile::tempdir().unwrap();
        for (bands, compression) in [(1, GeoTiffCompression::None), (3, GeoTiffCompression::Lzw)] {
            let path = dir.path().join(format!("r{bands}.tif"));
            let data = raster(bands, 6, 9);
            GeoTiffWriter::new(data.view(), transform(), UTM)
                .nodata(Some(-9999.0))
                .compression(compression)
                .write(&path)
                .unwrap();

            let (desc, source) = GeoTiffSource::probe(&path, SourceRole::Image).unwrap();
            assert_eq!(desc.crs, UTM);
            assert_eq!((desc.width, desc.height, desc.bands), (9, 6, bands));
            assert_eq!(desc.transform, transform());
            assert_eq!(desc.nodata, Some(-9999.0));

            let read = source.read_window(&PixelWindow::full(9, 6)).unwrap();
            assert_eq!(read, data);
        }
    }

    #[test]
    fn test_sample_label_written_as_float_band() {
        let dir = tempfile::tempdir().unwrap();
        let bbox = BoundingBox::new(0.0, 0.0, 4.0, 4.0, UTM);
        let sample = Sample {
            image: raster(2, 4, 4),
            label: Some(Array2::from_shape_fn((4, 4), |(r, c)| (r + c) as i64)),
            meta: SampleMeta {
                seq: 0,
                bbox,
                crs: UTM,
                transform: GeoTransform::anchored_at(&bbox, (1.0, 1.0)),
                sources: Vec::new(),
                source_names: Vec::new(),
                augmentations: Vec::new(),
                reoriented: false,
            },
        };
        let path = dir.path().join("label.tif");
        sample.write_label_geotiff(&path).unwrap();
        let (desc, source) = GeoTiffSource::probe(&path, SourceRole::Label).unwrap();
        assert_eq!(desc.bands, 1);
        let read = source.read_window(&PixelWindow::full(4, 4)).unwrap();
        assert_eq!(read[(0, 3, 2)], 5.0);

        let unlabeled = Sample { label: None, ..sample.clone() };
        assert!(unlabeled.write_label_geotiff(dir.path().join("none.tif")).is_err());

        let mut rng = StdRng::seed_from_u64(0);
        let flipped = HorizontalFlip { p: 1.0 }.apply(sample, &mut rng);
        for result in [
            flipped.write_image_geotiff(dir.path().join("flipped.tif")),
            flipped.write_label_geotiff(dir.path().join("flipped_label.tif")),
        ] {
            assert!(matches!(result, Err(GeoTiffWriteError::InvalidData(_))));
        }
        assert!(!dir.path().join("flipped.tif").exists());
    }
}
