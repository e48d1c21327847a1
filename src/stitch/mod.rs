//! Stitching
//!
//! This module provides:
//! - `Stitcher` trait for the external stitching step
//! - `FijiStitcher`, which runs Fiji's Grid/Collection stitching headless
//! - `MosaicStitcher`, a registration-free mosaic for testing and for data
//!   without overlap
//! - `Pipeline`, which drives a whole run from inventory to restoration

mod fiji;
mod mosaic;
mod orchestrator;

use std::path::PathBuf;

use serde::Serialize;

use crate::config::{StitchConfig, StitcherKind};
use crate::error::Result;
use crate::tiles::GridLayout;

pub use fiji::FijiStitcher;
pub use mosaic::MosaicStitcher;
pub use orchestrator::{ChannelOutcome, Pipeline, PipelineReport, RunPlan};

/// Index of the first tile handed to the stitcher.
pub const FIRST_FILE_INDEX: u32 = 0;

/// One stitcher invocation: a grid of tiles matched by `template` in
/// `source_dir`, fused into per-plane files in `output_dir`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StitchRequest {
    pub channel: u32,
    /// Z-slice being stitched when slices are separate files.
    pub z: Option<u32>,
    pub grid: GridLayout,
    /// Overlap between neighbouring tiles in percent.
    pub tile_overlap: u32,
    pub first_file_index: u32,
    pub source_dir: PathBuf,
    /// Tile file name with `{i}` in place of the tile index.
    pub template: String,
    pub output_dir: PathBuf,
}

impl StitchRequest {
    /// File name of tile `index` under this request's template.
    pub fn tile_name(&self, index: u32) -> String {
        self.template
            .replace(crate::address::TILE_INDEX_PLACEHOLDER, &index.to_string())
    }
}

/// External stitching step.
///
/// `stitch` returns once the stitcher has finished or has been handed the
/// job; the caller waits for the per-plane output files itself.
pub trait Stitcher {
    fn name(&self) -> &str;

    fn stitch(&self, request: &StitchRequest) -> Result<()>;
}

/// Build the stitcher selected by `config`.
pub fn from_config(config: &StitchConfig) -> Box<dyn Stitcher> {
    match config.stitcher.kind {
        StitcherKind::Fiji => Box::new(FijiStitcher::new(&config.stitcher)),
        StitcherKind::Mosaic => Box::new(MosaicStitcher::tiff()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_name() {
        let request = StitchRequest {
            channel: 1,
            z: None,
            grid: GridLayout::new(2, 2),
            tile_overlap: 20,
            first_file_index: FIRST_FILE_INDEX,
            source_dir: PathBuf::from("/data"),
            template: "Z00_T{i}_C1.tiff".to_string(),
            output_dir: PathBuf::from("/data"),
        };
        assert_eq!(request.tile_name(3), "Z00_T3_C1.tiff");
    }

    #[test]
    fn test_from_config() {
        let mut config = StitchConfig::new("/data", 2, 2);
        assert_eq!(from_config(&config).name(), "fiji");
        config.stitcher.kind = StitcherKind::Mosaic;
        assert_eq!(from_config(&config).name(), "mosaic");
    }
}
