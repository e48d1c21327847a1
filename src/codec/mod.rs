//! Plane codec
//!
//! The pipeline treats pixel I/O as a black box keyed by file path and plane
//! index: read the raw bytes of one plane, or write planes one after the
//! other into a new file that carries a metadata record. Raw plane bytes are
//! little-endian samples in row-major order.

pub(crate) mod ifd;
mod tiff_codec;

use std::path::Path;

use crate::error::Result;
use crate::metadata::{AcquisitionMetadata, PixelType};

pub use tiff_codec::{TiffCodec, TiffPlaneWriter};

/// Size and sample type of the planes of a file, as its pixel data
/// describes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneGeometry {
    pub size_x: u32,
    pub size_y: u32,
    pub pixel_type: PixelType,
}

/// Pixel reader/writer for one image file format.
pub trait PlaneCodec {
    /// Number of planes stored in `path`.
    fn plane_count(&self, path: &Path) -> Result<usize>;

    /// Geometry of the first plane of `path`, read from the image itself
    /// rather than from any embedded metadata record.
    fn geometry(&self, path: &Path) -> Result<PlaneGeometry>;

    /// Raw bytes of plane `index` of `path`.
    fn read_plane(&self, path: &Path, index: usize) -> Result<Vec<u8>>;

    /// Start a new file at `path` whose embedded metadata is `metadata`.
    fn create(&self, path: &Path, metadata: &AcquisitionMetadata)
        -> Result<Box<dyn PlaneWriter>>;
}

/// Sequential plane writer returned by [`PlaneCodec::create`].
///
/// Planes must be written with indices 0, 1, 2, ... in order. A writer that
/// is dropped without [`PlaneWriter::finish`] removes its partial file.
pub trait PlaneWriter {
    fn path(&self) -> &Path;

    fn write_plane(&mut self, index: usize, bytes: &[u8]) -> Result<()>;

    fn planes_written(&self) -> usize;

    fn finish(self: Box<Self>) -> Result<()>;
}
