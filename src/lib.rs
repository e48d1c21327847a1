//! mosaic-stitch - Microscopy Tile Stitching
//!
//! Turns a directory of tiles (one file per grid position, channel and
//! Z-slice) into fused multi-channel images with consistent OME metadata.
//!
//! # Pipeline
//!
//! - `address`: tile file names and the Z/T/C indices they carry
//! - `metadata`: OME-XML records embedded in TIFF files
//! - `tiles`: inventory, per-tile metadata rewriting and restoration
//! - `stitch`: the external stitcher and the run orchestrator
//! - `assemble`: fused output files and Z-slice linking
//!
//! Tiles are always put back the way they were found, whether the run
//! succeeds, fails, or is interrupted (see `mosaic-stitch recover`).

pub mod address;
pub mod assemble;
pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod metadata;
pub mod stitch;
pub mod tiles;
pub mod wait;

pub use error::{Result, StitchError};
