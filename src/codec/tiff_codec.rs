//! TIFF implementation of the plane codec.
//!
//! Planes are stored one per IFD as LZW-compressed grayscale strips. The
//! OME-XML record goes into the first IFD's ImageDescription.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use log::warn;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::colortype::{self, ColorType};
use tiff::encoder::compression::Lzw;
use tiff::encoder::{TiffEncoder, TiffValue};
use tiff::tags::Tag;
use tiff::{ColorType as SampleLayout, TiffResult};

use super::ifd::TiffLayout;
use super::{PlaneCodec, PlaneGeometry, PlaneWriter};
use crate::error::{Result, StitchError};
use crate::metadata::{self, AcquisitionMetadata, PixelType};

/// TIFF reader/writer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TiffCodec;

impl TiffCodec {
    pub fn new() -> Self {
        TiffCodec
    }
}

impl PlaneCodec for TiffCodec {
    fn plane_count(&self, path: &Path) -> Result<usize> {
        let file = File::open(path).map_err(|e| StitchError::codec(path, e))?;
        TiffLayout::open(BufReader::new(file))
            .and_then(|mut layout| layout.directory_offsets())
            .map(|offsets| offsets.len())
            .map_err(|e| StitchError::codec(path, e))
    }

    fn geometry(&self, path: &Path) -> Result<PlaneGeometry> {
        let mut decoder = open_decoder(path)?;
        let (size_x, size_y) = decoder
            .dimensions()
            .map_err(|e| StitchError::codec(path, e))?;
        let layout = decoder
            .colortype()
            .map_err(|e| StitchError::codec(path, e))?;
        // absent means unsigned integer samples
        let format = decoder
            .find_tag_unsigned::<u16>(Tag::SampleFormat)
            .map_err(|e| StitchError::codec(path, e))?
            .unwrap_or(SAMPLE_FORMAT_UINT);

        let pixel_type = match layout {
            SampleLayout::Gray(bits) => gray_pixel_type(bits, format),
            _ => None,
        }
        .ok_or_else(|| {
            StitchError::codec(
                path,
                format!("unsupported sample layout {:?} (format {})", layout, format),
            )
        })?;

        Ok(PlaneGeometry {
            size_x,
            size_y,
            pixel_type,
        })
    }

    fn read_plane(&self, path: &Path, index: usize) -> Result<Vec<u8>> {
        let mut decoder = open_decoder(path)?;

        for _ in 0..index {
            decoder
                .next_image()
                .map_err(|e| StitchError::codec(path, format!("no plane {}: {}", index, e)))?;
        }

        let data = decoder
            .read_image()
            .map_err(|e| StitchError::codec(path, e))?;

        sample_bytes(data).ok_or_else(|| StitchError::codec(path, "unsupported sample format"))
    }

    fn create(
        &self,
        path: &Path,
        metadata: &AcquisitionMetadata,
    ) -> Result<Box<dyn PlaneWriter>> {
        Ok(Box::new(TiffPlaneWriter::create(path, metadata)?))
    }
}

const SAMPLE_FORMAT_UINT: u16 = 1;
const SAMPLE_FORMAT_INT: u16 = 2;
const SAMPLE_FORMAT_FLOAT: u16 = 3;

fn open_decoder(path: &Path) -> Result<Decoder<BufReader<File>>> {
    let file = File::open(path).map_err(|e| StitchError::codec(path, e))?;
    Ok(Decoder::new(BufReader::new(file))
        .map_err(|e| StitchError::codec(path, e))?
        .with_limits(Limits::unlimited()))
}

/// Pixel type of single-sample grayscale data.
fn gray_pixel_type(bits: u8, format: u16) -> Option<PixelType> {
    match (format, bits) {
        (SAMPLE_FORMAT_UINT, 8) => Some(PixelType::Uint8),
        (SAMPLE_FORMAT_UINT, 16) => Some(PixelType::Uint16),
        (SAMPLE_FORMAT_UINT, 32) => Some(PixelType::Uint32),
        (SAMPLE_FORMAT_INT, 8) => Some(PixelType::Int8),
        (SAMPLE_FORMAT_INT, 16) => Some(PixelType::Int16),
        (SAMPLE_FORMAT_INT, 32) => Some(PixelType::Int32),
        (SAMPLE_FORMAT_FLOAT, 32) => Some(PixelType::Float),
        (SAMPLE_FORMAT_FLOAT, 64) => Some(PixelType::Double),
        _ => None,
    }
}

/// Flatten decoded samples to little-endian bytes.
#[allow(unreachable_patterns)]
fn sample_bytes(data: DecodingResult) -> Option<Vec<u8>> {
    let bytes = match data {
        DecodingResult::U8(v) => v,
        DecodingResult::I8(v) => v.iter().flat_map(|s| s.to_le_bytes()).collect(),
        DecodingResult::U16(v) => v.iter().flat_map(|s| s.to_le_bytes()).collect(),
        DecodingResult::I16(v) => v.iter().flat_map(|s| s.to_le_bytes()).collect(),
        DecodingResult::U32(v) => v.iter().flat_map(|s| s.to_le_bytes()).collect(),
        DecodingResult::I32(v) => v.iter().flat_map(|s| s.to_le_bytes()).collect(),
        DecodingResult::U64(v) => v.iter().flat_map(|s| s.to_le_bytes()).collect(),
        DecodingResult::I64(v) => v.iter().flat_map(|s| s.to_le_bytes()).collect(),
        DecodingResult::F32(v) => v.iter().flat_map(|s| s.to_le_bytes()).collect(),
        DecodingResult::F64(v) => v.iter().flat_map(|s| s.to_le_bytes()).collect(),
        _ => return None,
    };
    Some(bytes)
}

fn write_image<C>(
    encoder: &mut TiffEncoder<File>,
    width: u32,
    height: u32,
    description: Option<&str>,
    data: &[C::Inner],
) -> TiffResult<()>
where
    C: ColorType,
    [C::Inner]: TiffValue,
{
    let mut image =
        encoder.new_image_with_compression::<C, Lzw>(width, height, Lzw::default())?;
    if let Some(description) = description {
        image.encoder().write_tag(Tag::ImageDescription, description)?;
    }
    image.write_data(data)
}

/// Writer for one multi-plane TIFF file.
pub struct TiffPlaneWriter {
    path: PathBuf,
    encoder: Option<TiffEncoder<File>>,
    width: u32,
    height: u32,
    pixel_type: PixelType,
    plane_bytes: usize,
    description: Option<String>,
    planes_written: usize,
    finished: bool,
}

impl TiffPlaneWriter {
    pub fn create(path: &Path, metadata: &AcquisitionMetadata) -> Result<Self> {
        let description = metadata::dump(metadata)?;
        let file = File::create(path).map_err(|e| StitchError::codec(path, e))?;
        let encoder = TiffEncoder::new(file).map_err(|e| StitchError::codec(path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            encoder: Some(encoder),
            width: metadata.size_x,
            height: metadata.size_y,
            pixel_type: metadata.pixel_type,
            plane_bytes: metadata.plane_bytes(),
            description: Some(description),
            planes_written: 0,
            finished: false,
        })
    }

    fn encode(&mut self, bytes: &[u8]) -> Result<()> {
        let (width, height) = (self.width, self.height);
        let description = self.description.take();
        let description = description.as_deref();
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(StitchError::codec(&self.path, "writer already finished"));
        };

        let written = match self.pixel_type {
            PixelType::Uint8 => {
                write_image::<colortype::Gray8>(encoder, width, height, description, bytes)
            }
            PixelType::Uint16 => {
                let samples: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect();
                write_image::<colortype::Gray16>(encoder, width, height, description, &samples)
            }
            PixelType::Uint32 => {
                let samples: Vec<u32> = bytes
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                write_image::<colortype::Gray32>(encoder, width, height, description, &samples)
            }
            PixelType::Float => {
                let samples: Vec<f32> = bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                write_image::<colortype::Gray32Float>(
                    encoder,
                    width,
                    height,
                    description,
                    &samples,
                )
            }
            PixelType::Double => {
                let samples: Vec<f64> = bytes
                    .chunks_exact(8)
                    .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect();
                write_image::<colortype::Gray64Float>(
                    encoder,
                    width,
                    height,
                    description,
                    &samples,
                )
            }
            PixelType::Int8 | PixelType::Int16 | PixelType::Int32 => {
                return Err(StitchError::codec(
                    &self.path,
                    format!("writing {} planes is not supported", self.pixel_type.as_str()),
                ));
            }
        };

        written.map_err(|e| StitchError::codec(&self.path, e))
    }
}

impl PlaneWriter for TiffPlaneWriter {
    fn path(&self) -> &Path {
        &self.path
    }

    fn write_plane(&mut self, index: usize, bytes: &[u8]) -> Result<()> {
        if index != self.planes_written {
            return Err(StitchError::codec(
                &self.path,
                format!(
                    "planes must be written in order: expected {}, got {}",
                    self.planes_written, index
                ),
            ));
        }
        if bytes.len() != self.plane_bytes {
            return Err(StitchError::codec(
                &self.path,
                format!(
                    "plane {} has {} bytes, expected {}",
                    index,
                    bytes.len(),
                    self.plane_bytes
                ),
            ));
        }

        self.encode(bytes)?;
        self.planes_written += 1;
        Ok(())
    }

    fn planes_written(&self) -> usize {
        self.planes_written
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        if self.planes_written == 0 {
            return Err(StitchError::codec(&self.path, "no planes were written"));
        }
        self.encoder.take();
        self.finished = true;
        Ok(())
    }
}

impl Drop for TiffPlaneWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.encoder.take();
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(
                "Could not remove incomplete output {}: {}",
                self.path.display(),
                e
            );
        } else {
            warn!("Removed incomplete output {}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Calibration, Length};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn plane(value: u16, len: usize) -> Vec<u8> {
        (0..len as u16)
            .flat_map(|i| (value.wrapping_mul(100).wrapping_add(i)).to_le_bytes())
            .collect()
    }

    fn stack_metadata() -> AcquisitionMetadata {
        let mut meta = AcquisitionMetadata::new(6, 4, PixelType::Uint16);
        meta.size_z = 3;
        meta.uuid = Some(AcquisitionMetadata::new_file_uuid());
        meta.calibration = Calibration {
            x: Some(Length::microns(0.65)),
            y: Some(Length::microns(0.65)),
            z: Some(Length::microns(2.0)),
        };
        meta
    }

    #[test]
    fn test_write_and_read_planes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stack.ome.tif");
        let meta = stack_metadata();
        let codec = TiffCodec::new();

        let mut writer = codec.create(&path, &meta).unwrap();
        for z in 0..3 {
            writer.write_plane(z, &plane(z as u16, 24)).unwrap();
        }
        writer.finish().unwrap();

        assert_eq!(codec.plane_count(&path).unwrap(), 3);
        assert_eq!(codec.read_plane(&path, 0).unwrap(), plane(0, 24));
        assert_eq!(codec.read_plane(&path, 2).unwrap(), plane(2, 24));
        assert_eq!(metadata::load(&path).unwrap(), meta);
    }

    #[test]
    fn test_out_of_order_plane_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stack.ome.tif");
        let mut writer = TiffCodec::new().create(&path, &stack_metadata()).unwrap();

        let err = writer.write_plane(1, &plane(1, 24)).unwrap_err();
        assert_eq!(err.error_code(), "CODEC_ERROR");
    }

    #[test]
    fn test_wrong_plane_size_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stack.ome.tif");
        let mut writer = TiffCodec::new().create(&path, &stack_metadata()).unwrap();

        assert!(writer.write_plane(0, &[0u8; 10]).is_err());
    }

    #[test]
    fn test_unfinished_writer_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.ome.tif");
        {
            let mut writer = TiffCodec::new().create(&path, &stack_metadata()).unwrap();
            writer.write_plane(0, &plane(0, 24)).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_geometry_ignores_description() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("imagej.tif");
        let mut encoder = TiffEncoder::new(File::create(&path).unwrap()).unwrap();
        let mut image = encoder.new_image::<colortype::Gray16>(5, 3).unwrap();
        image
            .encoder()
            .write_tag(Tag::ImageDescription, "ImageJ=1.54f\nimages=1\n")
            .unwrap();
        image.write_data(&[9u16; 15]).unwrap();

        let geometry = TiffCodec::new().geometry(&path).unwrap();
        assert_eq!(
            geometry,
            PlaneGeometry {
                size_x: 5,
                size_y: 3,
                pixel_type: PixelType::Uint16,
            }
        );
    }

    #[test]
    fn test_geometry_of_float_planes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f32.tif");
        let meta = AcquisitionMetadata::new(2, 1, PixelType::Float);
        let mut writer = TiffCodec::new().create(&path, &meta).unwrap();
        writer.write_plane(0, &[0u8; 8]).unwrap();
        writer.finish().unwrap();

        assert_eq!(
            TiffCodec::new().geometry(&path).unwrap().pixel_type,
            PixelType::Float
        );
    }

    #[test]
    fn test_uint8_and_float_planes() {
        let dir = tempdir().unwrap();
        let codec = TiffCodec::new();

        let bytes_path = dir.path().join("u8.tif");
        let meta = AcquisitionMetadata::new(3, 2, PixelType::Uint8);
        let mut writer = codec.create(&bytes_path, &meta).unwrap();
        writer.write_plane(0, &[1, 2, 3, 4, 5, 6]).unwrap();
        writer.finish().unwrap();
        assert_eq!(codec.read_plane(&bytes_path, 0).unwrap(), vec![1, 2, 3, 4, 5, 6]);

        let float_path = dir.path().join("f32.tif");
        let meta = AcquisitionMetadata::new(2, 1, PixelType::Float);
        let samples: Vec<u8> = [0.5f32, -1.25]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let mut writer = codec.create(&float_path, &meta).unwrap();
        writer.write_plane(0, &samples).unwrap();
        writer.finish().unwrap();
        assert_eq!(codec.read_plane(&float_path, 0).unwrap(), samples);
    }
}
