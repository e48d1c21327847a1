//! Run configuration
//!
//! Everything a stitch run needs to know, loadable from a JSON file and
//! overridable from the command line.

use std::fs;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::address::TILE_SUFFIX;
use crate::error::{Result, StitchError};

/// Planes per output file before the fused series is split into subsets.
pub const DEFAULT_SUBSET_PLANES: u32 = 200;

/// Tile overlap percentage handed to the stitcher.
pub const DEFAULT_TILE_OVERLAP: u32 = 20;

/// Configuration of one stitch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StitchConfig {
    /// Directory holding the tiles. Stitcher output is written here too.
    pub directory: PathBuf,
    pub grid_x: u32,
    pub grid_y: u32,
    /// Stitch only `channel` instead of every channel.
    pub select_channel: bool,
    pub channel: Option<u32>,
    /// Each Z-slice of a tile is its own file.
    pub separate_z: bool,
    pub tile_overlap: u32,
    pub tile_suffix: String,
    pub subset_planes: u32,
    pub wait: WaitSettings,
    pub stitcher: StitcherSettings,
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::new(),
            grid_x: 0,
            grid_y: 0,
            select_channel: false,
            channel: None,
            separate_z: false,
            tile_overlap: DEFAULT_TILE_OVERLAP,
            tile_suffix: TILE_SUFFIX.to_string(),
            subset_planes: DEFAULT_SUBSET_PLANES,
            wait: WaitSettings::default(),
            stitcher: StitcherSettings::default(),
        }
    }
}

/// How long to wait for files produced by other processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitSettings {
    pub poll_interval_ms: u64,
    /// `None` waits forever.
    pub timeout_secs: Option<f64>,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            timeout_secs: Some(3600.0),
        }
    }
}

/// Which stitcher backend runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StitcherKind {
    /// Fiji's Grid/Collection stitching plugin, run headless.
    #[default]
    Fiji,
    /// Built-in abutting mosaic without registration.
    Mosaic,
}

/// Stitcher backend settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StitcherSettings {
    pub kind: StitcherKind,
    pub program: String,
    pub args: Vec<String>,
    pub fusion_method: String,
    pub regression_threshold: f64,
    pub max_avg_displacement: f64,
    pub absolute_displacement: f64,
}

impl Default for StitcherSettings {
    fn default() -> Self {
        Self {
            kind: StitcherKind::Fiji,
            program: "ImageJ-linux64".to_string(),
            args: vec![
                "--headless".to_string(),
                "--console".to_string(),
                "-eval".to_string(),
            ],
            fusion_method: "Linear Blending".to_string(),
            regression_threshold: 0.30,
            max_avg_displacement: 2.50,
            absolute_displacement: 3.50,
        }
    }
}

impl StitchConfig {
    pub fn new(directory: impl Into<PathBuf>, grid_x: u32, grid_y: u32) -> Self {
        Self {
            directory: directory.into(),
            grid_x,
            grid_y,
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            StitchError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Restrict the run to one channel.
    pub fn with_channel(mut self, channel: u32) -> Self {
        self.select_channel = true;
        self.channel = Some(channel);
        self
    }

    /// The channel to stitch, or `None` for all of them.
    pub fn selected_channel(&self) -> Option<u32> {
        if self.select_channel {
            self.channel
        } else {
            None
        }
    }

    /// Number of tiles in one grid.
    pub fn tiles_per_grid(&self) -> usize {
        self.grid_x as usize * self.grid_y as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.directory.as_os_str().is_empty() {
            return Err(StitchError::config("no tile directory given"));
        }
        if !self.directory.is_dir() {
            return Err(StitchError::config(format!(
                "tile directory {} does not exist",
                self.directory.display()
            )));
        }
        if self.grid_x == 0 || self.grid_y == 0 {
            return Err(StitchError::config(format!(
                "grid must be at least 1x1, got {}x{}",
                self.grid_x, self.grid_y
            )));
        }
        if self.select_channel && self.channel.is_none() {
            return Err(StitchError::config(
                "select_channel is set but no channel index was given",
            ));
        }
        if self.tile_overlap > 100 {
            return Err(StitchError::config(format!(
                "tile_overlap is a percentage, got {}",
                self.tile_overlap
            )));
        }
        if self.subset_planes == 0 {
            return Err(StitchError::config("subset_planes must be positive"));
        }
        if self.wait.poll_interval_ms == 0 {
            return Err(StitchError::config("wait.poll_interval_ms must be positive"));
        }
        if matches!(self.wait.timeout_secs, Some(t) if !(t > 0.0)) {
            return Err(StitchError::config("wait.timeout_secs must be positive or null"));
        }
        if self.stitcher.kind == StitcherKind::Fiji && self.stitcher.program.trim().is_empty() {
            return Err(StitchError::config("stitcher.program is empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_minimal_json_uses_defaults() {
        let config: StitchConfig =
            serde_json::from_str(r#"{"directory": "/data/tiles", "grid_x": 3, "grid_y": 2}"#)
                .unwrap();

        assert_eq!(config.directory, PathBuf::from("/data/tiles"));
        assert_eq!(config.tiles_per_grid(), 6);
        assert_eq!(config.tile_overlap, 20);
        assert_eq!(config.subset_planes, 200);
        assert_eq!(config.tile_suffix, ".tiff");
        assert_eq!(config.wait, WaitSettings::default());
        assert_eq!(config.stitcher.kind, StitcherKind::Fiji);
        assert_eq!(config.selected_channel(), None);
    }

    #[test]
    fn test_null_timeout_waits_forever() {
        let config: StitchConfig = serde_json::from_str(
            r#"{"grid_x": 1, "grid_y": 1, "wait": {"timeout_secs": null}, "stitcher": {"kind": "mosaic"}}"#,
        )
        .unwrap();

        assert_eq!(config.wait.timeout_secs, None);
        assert_eq!(config.wait.poll_interval_ms, 1000);
        assert_eq!(config.stitcher.kind, StitcherKind::Mosaic);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stitch.json");
        let config = StitchConfig::new(dir.path(), 2, 2).with_channel(1);
        fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = StitchConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.selected_channel(), Some(1));
    }

    #[test]
    fn test_validate() {
        let dir = tempdir().unwrap();
        assert!(StitchConfig::new(dir.path(), 2, 2).validate().is_ok());

        let zero_grid = StitchConfig::new(dir.path(), 0, 2);
        assert_eq!(
            zero_grid.validate().unwrap_err().error_code(),
            "CONFIGURATION_ERROR"
        );

        let missing = StitchConfig::new(dir.path().join("nope"), 2, 2);
        assert!(missing.validate().is_err());

        let mut no_channel = StitchConfig::new(dir.path(), 2, 2);
        no_channel.select_channel = true;
        assert!(no_channel.validate().is_err());

        let mut bad_wait = StitchConfig::new(dir.path(), 2, 2);
        bad_wait.wait.timeout_secs = Some(0.0);
        assert!(bad_wait.validate().is_err());
    }
}
