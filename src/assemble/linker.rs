//! Z-slice linking
//!
//! When every Z-slice is stitched on its own, each slice ends up in its own
//! fused file. Linking turns them into one logical series: the first file's
//! record becomes canonical and gets one frame descriptor per slice pointing
//! at the file that holds it.

use std::path::PathBuf;

use log::{debug, info};

use crate::error::{Result, StitchError};
use crate::metadata::{self, AcquisitionMetadata, Calibration, ChannelInfo, TiffData};

/// Link the per-Z files `slices` (index = Z) into one series.
///
/// Calibration and channel identity are written into every slice; slices
/// after the first are rewritten as they are visited and the canonical record
/// is written into the first file last. Returns the canonical record.
pub fn link_slices(
    slices: &[PathBuf],
    channel: &ChannelInfo,
    calibration: &Calibration,
) -> Result<AcquisitionMetadata> {
    let first = slices
        .first()
        .ok_or_else(|| StitchError::config("no Z-slice files to link"))?;
    info!("Linking {} Z slices", slices.len());

    let mut canonical = metadata::load(first)?;
    canonical.size_z = slices.len() as u32;
    canonical.tiff_data = Vec::with_capacity(slices.len());

    for (z, path) in slices.iter().enumerate() {
        let mut slice = metadata::load(path)?;
        canonical.tiff_data.push(TiffData {
            ifd: 0,
            plane_count: 1,
            first_c: 0,
            first_t: 0,
            first_z: z as u32,
            uuid: slice.uuid_ref(),
        });

        slice.calibration = calibration.clone();
        slice.set_single_channel(channel);

        if z > 0 {
            debug!("Writing metadata to slice {}", path.display());
            metadata::overwrite_embedded(path, &metadata::dump(&slice)?)?;
        }
    }

    canonical.calibration = calibration.clone();
    canonical.set_single_channel(channel);
    metadata::overwrite_embedded(first, &metadata::dump(&canonical)?)?;
    Ok(canonical)
}
