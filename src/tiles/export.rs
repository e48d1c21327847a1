//! Splitting a multi-position acquisition into tile files.
//!
//! Some acquisitions store every grid position as a timepoint of one file.
//! Each timepoint is written out as `tile_{T}.ome.tif` with all of its Z and
//! C planes, ready for stitching.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::Serialize;

use crate::codec::PlaneCodec;
use crate::error::Result;
use crate::metadata::{self, AcquisitionMetadata, DimensionOrder};
use crate::wait::{wait_for_file, CancellationToken, WaitPolicy};

/// Outcome of [`split_acquisition`].
#[derive(Debug, Clone, Serialize)]
pub struct SplitReport {
    pub tiles_dir: PathBuf,
    pub tiles: Vec<PathBuf>,
    /// The tile directory already existed and was left alone.
    pub skipped: bool,
}

/// File name of the tile holding position `t`.
pub fn tile_file_name(t: u32) -> String {
    format!("tile_{}.ome.tif", t)
}

/// Record each split tile carries: the source record reduced to one
/// timepoint in XYCZT order.
pub fn tile_record(source: &AcquisitionMetadata, file_name: &str) -> AcquisitionMetadata {
    let mut record = AcquisitionMetadata::new(source.size_x, source.size_y, source.pixel_type);
    record.uuid = Some(AcquisitionMetadata::new_file_uuid());
    record.image_name = Some(file_name.to_string());
    record.size_z = source.size_z;
    record.size_c = source.size_c;
    record.size_t = 1;
    record.dimension_order = DimensionOrder::Xyczt;
    record.calibration = source.calibration.clone();
    record.channels = source.channel_table();
    record
}

/// Write one tile file per timepoint of `source` into `tiles_dir`.
///
/// Nothing is written when `tiles_dir` already exists.
pub fn split_acquisition(
    codec: &dyn PlaneCodec,
    source: &Path,
    tiles_dir: &Path,
    policy: &WaitPolicy,
    cancel: &CancellationToken,
) -> Result<SplitReport> {
    let acquisition = metadata::load(source)?;
    let tiles: Vec<PathBuf> = (0..acquisition.size_t)
        .map(|t| tiles_dir.join(tile_file_name(t)))
        .collect();

    if tiles_dir.exists() {
        info!(
            "{} already exists, not splitting {}",
            tiles_dir.display(),
            source.display()
        );
        return Ok(SplitReport {
            tiles_dir: tiles_dir.to_path_buf(),
            tiles,
            skipped: true,
        });
    }
    fs::create_dir_all(tiles_dir)?;

    for (t, path) in tiles.iter().enumerate() {
        let t = t as u32;
        let file_name = tile_file_name(t);
        let record = tile_record(&acquisition, &file_name);
        info!("Writing {}", file_name);

        let mut writer = codec.create(path, &record)?;
        let mut plane = 0;
        for z in 0..acquisition.size_z {
            for c in 0..acquisition.size_c {
                let bytes = codec.read_plane(source, acquisition.plane_index(z, c, t))?;
                writer.write_plane(plane, &bytes)?;
                plane += 1;
            }
        }
        writer.finish()?;
    }

    if let Some(last) = tiles.last() {
        wait_for_file(last, policy, cancel)?;
    }

    Ok(SplitReport {
        tiles_dir: tiles_dir.to_path_buf(),
        tiles,
        skipped: false,
    })
}
