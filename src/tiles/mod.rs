//! Tiles
//!
//! Everything that touches the per-tile input files: finding them, checking
//! them against the grid, rewriting their metadata for the stitcher, and
//! putting them back the way they were found.

pub mod export;
pub mod inventory;
pub mod journal;
pub mod rewriter;
pub mod session;

use serde::{Deserialize, Serialize};

pub use export::{split_acquisition, SplitReport};
pub use inventory::{TileEntry, TileInventory};
pub use journal::{Journal, JOURNAL_FILE};
pub use rewriter::{derive_tile_record, rewrite_tile};
pub use session::{recover, CleanupWarning, RestoreReport, TileSession};

/// Size of the tile grid of one acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridLayout {
    pub grid_x: u32,
    pub grid_y: u32,
}

impl GridLayout {
    pub fn new(grid_x: u32, grid_y: u32) -> Self {
        Self { grid_x, grid_y }
    }

    /// Number of grid positions.
    pub fn positions(&self) -> usize {
        self.grid_x as usize * self.grid_y as usize
    }

    /// Number of tile files an acquisition with `channel_count` channels
    /// must have. `z_files` is the number of Z-slice files per tile (1 unless
    /// each slice is its own file).
    pub fn expected_files(&self, channel_count: u32, z_files: u32) -> usize {
        self.positions() * channel_count as usize * z_files as usize
    }
}
