//! Run journal
//!
//! Written before the first tile is touched and removed once every tile is
//! back in its original state. A journal left in a tile directory means a
//! run was interrupted and holds what is needed to undo it.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StitchError};

/// Journal file name inside the tile directory.
pub const JOURNAL_FILE: &str = ".mosaic-stitch.journal.json";

/// Original state of one tile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedTile {
    pub original_path: PathBuf,
    /// Name the tile is given while the stitcher runs.
    pub working_path: PathBuf,
    /// Embedded metadata text exactly as found.
    pub original_xml: String,
}

/// Journal of one stitch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journal {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub pid: u32,
    pub directory: PathBuf,
    pub tiles: Vec<CapturedTile>,
}

impl Journal {
    pub fn new(directory: &Path, tiles: Vec<CapturedTile>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            pid: std::process::id(),
            directory: directory.to_path_buf(),
            tiles,
        }
    }

    pub fn path(directory: &Path) -> PathBuf {
        directory.join(JOURNAL_FILE)
    }

    /// Write the journal, replacing any previous one.
    pub fn save(&self) -> Result<()> {
        let path = Self::path(&self.directory);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Load the journal of `directory`, if one was left behind.
    pub fn load(directory: &Path) -> Result<Option<Self>> {
        let path = Self::path(directory);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let journal = serde_json::from_str(&content).map_err(|e| {
            StitchError::config(format!("journal {} is unreadable: {}", path.display(), e))
        })?;
        Ok(Some(journal))
    }

    pub fn remove(directory: &Path) -> Result<()> {
        let path = Self::path(directory);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| StitchError::Cleanup {
                path,
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}
