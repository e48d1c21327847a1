//! Reading and replacing the metadata block embedded in an image file.

use std::fs::{self, File, OpenOptions};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use log::debug;

use super::{ome_xml, AcquisitionMetadata};
use crate::codec::ifd::{Placement, TiffLayout};
use crate::error::{Result, StitchError};

/// Read the raw embedded metadata text of `path`.
pub fn read_embedded(path: &Path) -> Result<String> {
    let read_error = |reason: String| StitchError::MetadataRead {
        path: path.to_path_buf(),
        reason,
    };

    let file = File::open(path).map_err(|e| read_error(e.to_string()))?;
    let mut layout = TiffLayout::open(BufReader::new(file)).map_err(|e| read_error(e.to_string()))?;

    layout
        .read_description()
        .map_err(|e| read_error(e.to_string()))?
        .ok_or_else(|| read_error("file has no embedded metadata block".to_string()))
}

/// Load the acquisition metadata embedded in `path`. Pixel data is not decoded.
pub fn load(path: &Path) -> Result<AcquisitionMetadata> {
    let xml = read_embedded(path)?;
    ome_xml::parse(&xml).map_err(|e| StitchError::MetadataRead {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Write the embedded metadata of `path` to `<stem>.xml` beside it.
pub fn export_xml(path: &Path) -> Result<PathBuf> {
    let xml = read_embedded(path)?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "metadata".to_string());
    let target = path.with_file_name(format!("{}.xml", stem));
    fs::write(&target, xml)?;
    Ok(target)
}

/// Replace the embedded metadata block of `path` with `serialized`.
///
/// Only the block and its directory entry change; the pixel payload is left
/// as it was.
pub fn overwrite_embedded(path: &Path, serialized: &str) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| StitchError::MetadataWrite {
            path: path.to_path_buf(),
            reason: "file is locked or not writable".to_string(),
            source: Some(e),
        })?;

    let placement = TiffLayout::open(file)
        .and_then(|mut layout| layout.write_description(serialized))
        .map_err(|e| StitchError::MetadataWrite {
            path: path.to_path_buf(),
            reason: e.to_string(),
            source: Some(e),
        })?;

    match placement {
        Some(Placement::InPlace) => {
            debug!("Rewrote metadata of {} in place", path.display());
            Ok(())
        }
        Some(Placement::Appended { offset }) => {
            debug!(
                "Metadata of {} outgrew its block, moved to offset {}",
                path.display(),
                offset
            );
            Ok(())
        }
        None => Err(StitchError::MetadataWrite {
            path: path.to_path_buf(),
            reason: "no embedded metadata block to overwrite".to_string(),
            source: None,
        }),
    }
}
