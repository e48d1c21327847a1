//! Tile metadata rewriter
//!
//! The stitcher expects each tile to describe a single channel and a single
//! timepoint. Acquisition tiles describe the whole acquisition, so each one
//! gets a reduced record for the duration of the run.

use std::path::Path;

use log::debug;

use crate::error::Result;
use crate::metadata::{self, AcquisitionMetadata, ChannelInfo};

/// Derive the record a tile carries while it is being stitched.
///
/// Geometry, pixel type and calibration come from `source`; the record holds
/// one channel (`channel`, copied verbatim), one timepoint and `planes`
/// Z-planes, in XYCZT order and little-endian.
pub fn derive_tile_record(
    source: &AcquisitionMetadata,
    channel: &ChannelInfo,
    planes: u32,
) -> AcquisitionMetadata {
    let mut record = AcquisitionMetadata::new(source.size_x, source.size_y, source.pixel_type);
    record.size_z = planes;
    record.calibration = source.calibration.clone();
    record.set_single_channel(channel);
    record
}

/// Replace the embedded metadata of the tile at `path` with `record`.
pub fn rewrite_tile(path: &Path, record: &AcquisitionMetadata) -> Result<()> {
    debug!("Transforming metadata in image {}", path.display());
    metadata::overwrite_embedded(path, &metadata::dump(record)?)
}
