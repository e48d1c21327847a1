//! Fused output assembly
//!
//! The stitcher leaves one file per fused plane. The assembler gathers them in
//! Z order into final OME-TIFF outputs, splitting long series across several
//! files, and re-attaches the calibration and channel identity the stitcher
//! drops.

mod linker;

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::Serialize;

use crate::address::{self, DigitWidth};
use crate::codec::PlaneCodec;
use crate::error::{Result, StitchError};
use crate::metadata::{self, AcquisitionMetadata, Calibration, ChannelInfo, TiffData, UuidRef};
use crate::wait::{wait_for_file, CancellationToken, WaitPolicy};

pub use linker::link_slices;

/// One output file and the inclusive Z range it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputSubset {
    pub path: PathBuf,
    pub first_z: u32,
    pub last_z: u32,
}

impl OutputSubset {
    pub fn plane_count(&self) -> u32 {
        self.last_z - self.first_z + 1
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

pub fn fused_file_name(channel: u32) -> String {
    format!("fused_C{}.ome.tif", channel)
}

pub fn subset_file_name(channel: u32, subset: usize) -> String {
    format!("fused_C{}_subset{}.ome.tif", channel, subset)
}

pub fn slice_file_name(channel: u32, z: u32) -> String {
    format!("fused_C{}_Z{}.ome.tif", channel, z)
}

/// Split `[0, size_z)` into output files of at most `threshold` planes.
///
/// Below the threshold there is one `fused_C{c}.ome.tif`. From the threshold
/// up, every file is a numbered subset, including when there is only one.
pub fn partition(directory: &Path, channel: u32, size_z: u32, threshold: u32) -> Vec<OutputSubset> {
    let threshold = threshold.max(1);
    if size_z == 0 {
        return Vec::new();
    }
    if size_z < threshold {
        return vec![OutputSubset {
            path: directory.join(fused_file_name(channel)),
            first_z: 0,
            last_z: size_z - 1,
        }];
    }

    (0..size_z)
        .step_by(threshold as usize)
        .enumerate()
        .map(|(n, first_z)| OutputSubset {
            path: directory.join(subset_file_name(channel, n)),
            first_z,
            last_z: (first_z + threshold).min(size_z) - 1,
        })
        .collect()
}

/// Writes fused outputs from the stitcher's per-plane files.
pub struct FusedAssembler<'a> {
    codec: &'a dyn PlaneCodec,
    directory: &'a Path,
    policy: WaitPolicy,
    cancel: CancellationToken,
}

impl<'a> FusedAssembler<'a> {
    pub fn new(
        codec: &'a dyn PlaneCodec,
        directory: &'a Path,
        policy: WaitPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            codec,
            directory,
            policy,
            cancel,
        }
    }

    fn plane_path(&self, plane_number: usize, width: DigitWidth) -> PathBuf {
        self.directory
            .join(address::fused_plane_name(plane_number, width))
    }

    /// Base record of a fused output: geometry and pixel type of the first
    /// plane file, with calibration, channel and plane counts replaced.
    ///
    /// Geometry comes from the pixel data. An OME-XML record in the plane
    /// file is used as the starting point when there is one; stitchers that
    /// save plain TIFFs leave none.
    fn base_record(
        &self,
        first_plane: &Path,
        channel: &ChannelInfo,
        calibration: &Calibration,
        size_z: u32,
    ) -> Result<AcquisitionMetadata> {
        wait_for_file(first_plane, &self.policy, &self.cancel)?;
        let geometry = self.codec.geometry(first_plane)?;
        let mut record = match metadata::load(first_plane) {
            Ok(record) => record,
            Err(e) => {
                debug!("{}; using the plane's own geometry", e);
                AcquisitionMetadata::new(geometry.size_x, geometry.size_y, geometry.pixel_type)
            }
        };
        record.size_x = geometry.size_x;
        record.size_y = geometry.size_y;
        record.pixel_type = geometry.pixel_type;
        record.calibration = calibration.clone();
        record.size_z = size_z;
        record.size_t = 1;
        record.set_single_channel(channel);
        record.big_endian = false;
        record.tiff_data.clear();
        Ok(record)
    }

    /// Read one plane file and check it matches the output geometry.
    fn read_plane(&self, path: &Path, record: &AcquisitionMetadata) -> Result<Vec<u8>> {
        wait_for_file(path, &self.policy, &self.cancel)?;
        let bytes = self.codec.read_plane(path, 0)?;
        if bytes.len() != record.plane_bytes() {
            return Err(StitchError::codec(
                path,
                format!(
                    "plane has {} bytes but the fused image needs {} ({}x{} {})",
                    bytes.len(),
                    record.plane_bytes(),
                    record.size_x,
                    record.size_y,
                    record.pixel_type.as_str()
                ),
            ));
        }
        Ok(bytes)
    }

    /// Assemble the `size_z` planes of one channel into subset files.
    ///
    /// On failure every output already written for the channel is removed.
    pub fn assemble(
        &self,
        channel: &ChannelInfo,
        calibration: &Calibration,
        size_z: u32,
        subset_planes: u32,
    ) -> Result<Vec<OutputSubset>> {
        let subsets = partition(self.directory, channel.index, size_z, subset_planes);
        let mut written = Vec::new();

        match self.write_subsets(channel, calibration, size_z, &subsets, &mut written) {
            Ok(()) => Ok(subsets),
            Err(e) => {
                remove_outputs(&written);
                Err(e)
            }
        }
    }

    fn write_subsets(
        &self,
        channel: &ChannelInfo,
        calibration: &Calibration,
        size_z: u32,
        subsets: &[OutputSubset],
        written: &mut Vec<PathBuf>,
    ) -> Result<()> {
        let width = DigitWidth::for_size(size_z as usize);
        let mut record =
            self.base_record(&self.plane_path(1, width), channel, calibration, size_z)?;

        // every file lists every plane, pointing at the file that holds it
        let uuids: Vec<UuidRef> = subsets
            .iter()
            .map(|subset| UuidRef {
                file_name: Some(subset.file_name()),
                value: AcquisitionMetadata::new_file_uuid(),
            })
            .collect();
        record.tiff_data = subsets
            .iter()
            .zip(&uuids)
            .flat_map(|(subset, uuid)| {
                (subset.first_z..=subset.last_z).map(move |z| {
                    TiffData::single_plane(z - subset.first_z, z, Some(uuid.clone()))
                })
            })
            .collect();

        let mut next_z = 0;
        for (subset, uuid) in subsets.iter().zip(&uuids) {
            record.image_name = uuid.file_name.clone();
            record.uuid = Some(uuid.value.clone());

            info!(
                "Writing {} (Z {}..={})",
                subset.file_name(),
                subset.first_z,
                subset.last_z
            );
            written.push(subset.path.clone());
            let mut writer = self.codec.create(&subset.path, &record)?;

            for (ifd, z) in (subset.first_z..=subset.last_z).enumerate() {
                debug_assert_eq!(z, next_z);
                let bytes = self.read_plane(&self.plane_path(z as usize + 1, width), &record)?;
                writer.write_plane(ifd, &bytes)?;
                next_z = z + 1;
            }
            writer.finish()?;
        }

        if next_z != size_z {
            return Err(StitchError::codec(
                self.directory,
                format!("wrote {} of {} planes", next_z, size_z),
            ));
        }
        Ok(())
    }

    /// Write the single fused plane of slice `z` to `fused_C{c}_Z{z}.ome.tif`
    /// (each Z-slice stitched on its own).
    pub fn write_slice(
        &self,
        channel: &ChannelInfo,
        calibration: &Calibration,
        z: u32,
    ) -> Result<PathBuf> {
        let width = DigitWidth::for_size(1);
        let plane = self.plane_path(1, width);
        let path = self.directory.join(slice_file_name(channel.index, z));

        let mut record = self.base_record(&plane, channel, calibration, 1)?;
        record.image_name = Some(slice_file_name(channel.index, z));
        record.uuid = Some(AcquisitionMetadata::new_file_uuid());
        record.tiff_data = vec![TiffData::single_plane(0, 0, record.uuid_ref())];

        let bytes = self.read_plane(&plane, &record)?;
        info!("Writing {}", record.image_name.as_deref().unwrap_or_default());
        let mut writer = self.codec.create(&path, &record)?;
        writer.write_plane(0, &bytes)?;
        writer.finish()?;
        Ok(path)
    }
}

/// Delete the outputs of a failed channel. Failures are only logged.
pub fn remove_outputs(paths: &[PathBuf]) {
    for path in paths {
        if path.exists() {
            match fs::remove_file(path) {
                Ok(()) => warn!("Removed partial output {}", path.display()),
                Err(e) => warn!("Could not remove partial output {}: {}", path.display(), e),
            }
        }
    }
}
