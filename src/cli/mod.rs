//! CLI Module
//!
//! Command-line interface for mosaic-stitch.

pub mod commands;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{StitchConfig, StitcherKind};
use crate::error::Result;

/// Stitch microscopy tile grids into fused multi-channel images
#[derive(Parser, Debug)]
#[command(name = "mosaic-stitch")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Stitch every channel of a tile directory
    #[command(name = "stitch")]
    Stitch(StitchArgs),

    /// Restore tiles left modified by an interrupted run
    ///
    /// A run stopped by Ctrl-C or killed outright can not put the tiles back
    /// itself. Its journal stays in the tile directory, and further stitch
    /// runs there refuse to start until this command has restored the tiles.
    #[command(name = "recover")]
    Recover {
        /// Tile directory holding the run journal
        directory: PathBuf,
    },

    /// Split a multi-position acquisition into one file per tile
    #[command(name = "split")]
    Split {
        /// Acquisition file whose T axis is the tile index
        input: PathBuf,

        /// Output directory (default: `tiles` beside the input)
        #[arg(short, long)]
        tiles_dir: Option<PathBuf>,
    },

    /// Write the embedded OME-XML of each file to `<stem>.xml`
    #[command(name = "extract-xml")]
    ExtractXml {
        /// Image files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Print the parsed metadata of a file as JSON
    #[command(name = "inspect")]
    Inspect {
        /// Image file
        file: PathBuf,
    },
}

/// Options of `mosaic-stitch stitch`. Flags override the config file.
#[derive(Args, Debug)]
pub struct StitchArgs {
    /// Tile directory
    pub directory: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Tiles per grid row
    #[arg(long)]
    pub grid_x: Option<u32>,

    /// Tiles per grid column
    #[arg(long)]
    pub grid_y: Option<u32>,

    /// Stitch only this channel
    #[arg(long)]
    pub channel: Option<u32>,

    /// Each Z-slice of a tile is a separate file
    #[arg(long)]
    pub separate_z: bool,

    /// Tile overlap in percent
    #[arg(long)]
    pub overlap: Option<u32>,

    /// Planes per output file before splitting into subsets
    #[arg(long)]
    pub subset_planes: Option<u32>,

    /// Stitcher backend
    #[arg(long, value_enum)]
    pub stitcher: Option<StitcherKind>,

    /// Seconds to wait for stitcher output
    #[arg(long, conflicts_with = "no_timeout")]
    pub timeout: Option<f64>,

    /// Wait for stitcher output without a time limit
    #[arg(long)]
    pub no_timeout: bool,

    /// Check the tiles and print the plan without modifying anything
    #[arg(long)]
    pub dry_run: bool,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,
}

impl StitchArgs {
    /// Build the run configuration: config file first, then flags.
    pub fn to_config(&self) -> Result<StitchConfig> {
        let mut config = match &self.config {
            Some(path) => StitchConfig::load(path)?,
            None => StitchConfig::default(),
        };

        if let Some(directory) = &self.directory {
            config.directory = directory.clone();
        }
        if let Some(grid_x) = self.grid_x {
            config.grid_x = grid_x;
        }
        if let Some(grid_y) = self.grid_y {
            config.grid_y = grid_y;
        }
        if let Some(channel) = self.channel {
            config = config.with_channel(channel);
        }
        if self.separate_z {
            config.separate_z = true;
        }
        if let Some(overlap) = self.overlap {
            config.tile_overlap = overlap;
        }
        if let Some(subset_planes) = self.subset_planes {
            config.subset_planes = subset_planes;
        }
        if let Some(kind) = self.stitcher {
            config.stitcher.kind = kind;
        }
        if self.no_timeout {
            config.wait.timeout_secs = None;
        } else if let Some(timeout) = self.timeout {
            config.wait.timeout_secs = Some(timeout);
        }

        config.validate()?;
        Ok(config)
    }
}
