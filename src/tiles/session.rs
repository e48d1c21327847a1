//! Tile session: capture, mutate, and always restore the tiles of a run.
//!
//! A [`TileSession`] is created from an inventory before anything is
//! modified. It records every tile's original name and embedded metadata in
//! memory and in the run journal. While it lives, tiles can be rewritten and
//! renamed to their stitcher-facing names. [`TileSession::restore`] puts
//! everything back; if the session is dropped without it, `Drop` does the
//! same.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::Serialize;
use walkdir::WalkDir;

use super::inventory::TileInventory;
use super::journal::{CapturedTile, Journal};
use super::rewriter::rewrite_tile;
use crate::address::{self, TileAddress};
use crate::error::{Result, StitchError};
use crate::metadata::{self, AcquisitionMetadata};

/// A restoration or cleanup step that failed. Reported, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupWarning {
    pub path: PathBuf,
    pub reason: String,
}

impl CleanupWarning {
    fn new(path: &Path, reason: impl ToString) -> Self {
        Self {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.reason)
    }
}

impl From<CleanupWarning> for StitchError {
    fn from(warning: CleanupWarning) -> Self {
        StitchError::Cleanup {
            path: warning.path,
            reason: warning.reason,
        }
    }
}

/// Outcome of a restoration pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    /// Tiles whose metadata or name had to be put back.
    pub restored: usize,
    /// Intermediate files deleted.
    pub artifacts_removed: usize,
    pub warnings: Vec<CleanupWarning>,
}

impl RestoreReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Scoped ownership of the tiles of one run.
#[derive(Debug)]
pub struct TileSession {
    directory: PathBuf,
    tiles: Vec<CapturedTile>,
    index: BTreeMap<TileAddress, usize>,
    finished: bool,
}

impl TileSession {
    /// Capture the original state of every tile in `inventory` and write the
    /// run journal. Nothing is modified.
    pub fn capture(inventory: &TileInventory) -> Result<Self> {
        let directory = inventory.directory();
        if let Some(journal) = Journal::load(directory)? {
            return Err(StitchError::config(format!(
                "a run started {} (pid {}) was interrupted; run 'mosaic-stitch recover {}' first",
                journal.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
                journal.pid,
                directory.display()
            )));
        }

        let width = inventory.digit_width();
        let mut tiles = Vec::with_capacity(inventory.len());
        let mut index = BTreeMap::new();
        for entry in inventory.iter() {
            let working_name = address::working_name(&entry.address, width, inventory.suffix());
            index.insert(entry.address, tiles.len());
            tiles.push(CapturedTile {
                original_path: entry.path.clone(),
                working_path: directory.join(working_name),
                original_xml: metadata::read_embedded(&entry.path)?,
            });
        }

        Journal::new(directory, tiles.clone()).save()?;
        info!("Captured original metadata of {} tiles", tiles.len());

        Ok(Self {
            directory: directory.to_path_buf(),
            tiles,
            index,
            finished: false,
        })
    }

    /// Rebuild a session from a journal left by an interrupted run.
    /// Paths are re-anchored on `directory` in case it was moved.
    fn from_journal(directory: &Path, journal: Journal) -> Self {
        let rebase = |path: &Path| match path.file_name() {
            Some(name) => directory.join(name),
            None => path.to_path_buf(),
        };
        let tiles = journal
            .tiles
            .into_iter()
            .map(|tile| CapturedTile {
                original_path: rebase(&tile.original_path),
                working_path: rebase(&tile.working_path),
                original_xml: tile.original_xml,
            })
            .collect();

        Self {
            directory: directory.to_path_buf(),
            tiles,
            index: BTreeMap::new(),
            finished: false,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn tiles(&self) -> &[CapturedTile] {
        &self.tiles
    }

    fn captured(&self, address: &TileAddress) -> Result<&CapturedTile> {
        self.index
            .get(address)
            .and_then(|&i| self.tiles.get(i))
            .ok_or_else(|| StitchError::config(format!("tile {} was not captured", address)))
    }

    /// Embedded metadata of the tile at `address` as it was found.
    pub fn original_xml(&self, address: &TileAddress) -> Result<&str> {
        Ok(&self.captured(address)?.original_xml)
    }

    /// Stitcher-facing path of the tile at `address`.
    pub fn working_path(&self, address: &TileAddress) -> Result<&Path> {
        Ok(&self.captured(address)?.working_path)
    }

    /// Write `record` into the tile at `address`, wherever it currently is.
    pub fn rewrite(&mut self, address: &TileAddress, record: &AcquisitionMetadata) -> Result<()> {
        let tile = self.captured(address)?;
        rewrite_tile(&current_path(tile), record)
    }

    /// Rename every tile to its working name (the prefix before the address
    /// fragment is dropped). Returns the path of the last tile renamed.
    pub fn rename_to_working(&mut self) -> Result<Option<PathBuf>> {
        let mut last = None;
        for tile in &self.tiles {
            if tile.original_path != tile.working_path && tile.original_path.exists() {
                fs::rename(&tile.original_path, &tile.working_path).map_err(|e| {
                    StitchError::MetadataWrite {
                        path: tile.original_path.clone(),
                        reason: format!("cannot rename to {}", tile.working_path.display()),
                        source: Some(e),
                    }
                })?;
            }
            last = Some(tile.working_path.clone());
        }
        Ok(last)
    }

    /// Put every tile back under its original name with its original
    /// embedded metadata, then delete intermediate stitcher files.
    ///
    /// Best effort: failures become warnings and the remaining tiles are
    /// still restored. Running it again is harmless. The journal is removed
    /// only when every tile was restored.
    pub fn restore(&mut self) -> RestoreReport {
        let mut report = RestoreReport::default();

        for tile in &self.tiles {
            match restore_tile(tile) {
                Ok(true) => report.restored += 1,
                Ok(false) => {}
                Err(warning) => report.warnings.push(warning),
            }
        }

        let (removed, warnings) = remove_plane_artifacts(&self.directory);
        report.artifacts_removed = removed;
        report.warnings.extend(warnings);

        if report.warnings.iter().all(|w| !self.is_tile_path(&w.path)) {
            if let Err(e) = Journal::remove(&self.directory) {
                report
                    .warnings
                    .push(CleanupWarning::new(&Journal::path(&self.directory), e));
            }
        } else {
            warn!(
                "Keeping {} so the remaining tiles can be recovered",
                Journal::path(&self.directory).display()
            );
        }

        for warning in &report.warnings {
            warn!("Cleanup: {}", warning);
        }
        if report.restored > 0 {
            info!("Restored original metadata of {} tiles", report.restored);
        }

        self.finished = true;
        report
    }

    fn is_tile_path(&self, path: &Path) -> bool {
        self.tiles
            .iter()
            .any(|t| t.original_path == path || t.working_path == path)
    }
}

impl Drop for TileSession {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Tile session ended early, restoring tiles");
            self.restore();
        }
    }
}

/// Where the tile is right now: its original name, or its working name if
/// only that exists.
fn current_path(tile: &CapturedTile) -> PathBuf {
    if !tile.original_path.exists() && tile.working_path.exists() {
        tile.working_path.clone()
    } else {
        tile.original_path.clone()
    }
}

/// Restore one tile. Returns whether anything had to change.
fn restore_tile(tile: &CapturedTile) -> std::result::Result<bool, CleanupWarning> {
    let current = current_path(tile);
    if !current.exists() {
        return Err(CleanupWarning::new(
            &tile.original_path,
            "tile is missing under both its original and working name",
        ));
    }

    let mut changed = false;

    let unchanged = metadata::read_embedded(&current)
        .map(|xml| xml == tile.original_xml)
        .unwrap_or(false);
    if !unchanged {
        debug!("Rewriting original metadata in {}", current.display());
        metadata::overwrite_embedded(&current, &tile.original_xml)
            .map_err(|e| CleanupWarning::new(&current, e))?;
        changed = true;
    }

    if current != tile.original_path {
        fs::rename(&current, &tile.original_path).map_err(|e| {
            CleanupWarning::new(
                &current,
                format!("cannot rename back to {}: {}", tile.original_path.display(), e),
            )
        })?;
        changed = true;
    }

    Ok(changed)
}

/// Delete the stitcher's per-plane `img_t*_z*_c*` files in `directory`.
/// Returns how many were removed and any failures.
pub fn remove_plane_artifacts(directory: &Path) -> (usize, Vec<CleanupWarning>) {
    let mut removed = 0;
    let mut warnings = Vec::new();

    for entry in WalkDir::new(directory).min_depth(1).max_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warnings.push(CleanupWarning::new(directory, e));
                continue;
            }
        };
        let is_artifact = entry
            .file_name()
            .to_str()
            .map(address::is_plane_artifact)
            .unwrap_or(false);
        if !is_artifact || !entry.file_type().is_file() {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warnings.push(CleanupWarning::new(entry.path(), e)),
        }
    }

    if removed > 0 {
        debug!(
            "Removed {} intermediate plane files from {}",
            removed,
            directory.display()
        );
    }
    (removed, warnings)
}

/// Undo an interrupted run using the journal it left in `directory`.
///
/// Returns `None` when there is nothing to recover.
pub fn recover(directory: &Path) -> Result<Option<RestoreReport>> {
    let Some(journal) = Journal::load(directory)? else {
        return Ok(None);
    };
    info!(
        "Recovering {} tiles from run {} started {} (pid {})",
        journal.tiles.len(),
        journal.run_id,
        journal.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        journal.pid
    );
    let mut session = TileSession::from_journal(directory, journal);
    Ok(Some(session.restore()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{PlaneCodec, TiffCodec};
    use crate::metadata::{ChannelInfo, Length, PixelType};
    use crate::tiles::rewriter::derive_tile_record;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn acquisition() -> AcquisitionMetadata {
        let mut meta = AcquisitionMetadata::new(4, 3, PixelType::Uint16);
        meta.uuid = Some(AcquisitionMetadata::new_file_uuid());
        meta.image_name = Some("example stitch".to_string());
        meta.size_c = 2;
        meta.size_t = 2;
        meta.calibration.x = Some(Length::microns(0.5));
        meta.channels = vec![
            ChannelInfo {
                name: Some("DAPI".to_string()),
                ..ChannelInfo::new(0)
            },
            ChannelInfo {
                name: Some("GFP".to_string()),
                ..ChannelInfo::new(1)
            },
        ];
        meta
    }

    fn write_tiles(dir: &Path) -> Vec<PathBuf> {
        let meta = acquisition();
        let codec = TiffCodec::new();
        let mut paths = Vec::new();
        for t in 0..2 {
            for c in 0..2 {
                let path = dir.join(format!("example stitch_Z0_T{}_C{}.tiff", t, c));
                let mut writer = codec.create(&path, &meta).unwrap();
                writer.write_plane(0, &[(t * 2 + c) as u8; 24]).unwrap();
                writer.finish().unwrap();
                paths.push(path);
            }
        }
        paths
    }

    fn snapshot(paths: &[PathBuf]) -> Vec<Vec<u8>> {
        paths.iter().map(|p| fs::read(p).unwrap()).collect()
    }

    fn mutate(session: &mut TileSession, inventory: &TileInventory) {
        let source = acquisition();
        for entry in inventory.iter() {
            let channel = &source.channels[entry.address.c as usize];
            let record = derive_tile_record(&source, channel, 1);
            session.rewrite(&entry.address, &record).unwrap();
        }
        session.rename_to_working().unwrap();
    }

    #[test]
    fn test_restore_is_byte_identical() {
        let dir = tempdir().unwrap();
        let paths = write_tiles(dir.path());
        let before = snapshot(&paths);

        let inventory = TileInventory::scan(dir.path(), ".tiff").unwrap();
        let mut session = TileSession::capture(&inventory).unwrap();
        assert!(Journal::path(dir.path()).exists());

        mutate(&mut session, &inventory);
        assert!(dir.path().join("Z0_T1_C0.tiff").exists());
        assert!(!paths[0].exists());
        let derived = metadata::load(&dir.path().join("Z0_T0_C1.tiff")).unwrap();
        assert_eq!(derived.size_c, 1);
        assert_eq!(derived.channels[0].name.as_deref(), Some("GFP"));

        fs::write(dir.path().join("img_t1_z1_c1"), b"plane").unwrap();

        let report = session.restore();
        assert!(report.is_clean());
        assert_eq!(report.restored, 4);
        assert_eq!(report.artifacts_removed, 1);
        assert_eq!(snapshot(&paths), before);
        assert!(!dir.path().join("img_t1_z1_c1").exists());
        assert!(!Journal::path(dir.path()).exists());
    }

    #[test]
    fn test_restore_is_idempotent() {
        let dir = tempdir().unwrap();
        let paths = write_tiles(dir.path());
        let before = snapshot(&paths);

        let inventory = TileInventory::scan(dir.path(), ".tiff").unwrap();
        let mut session = TileSession::capture(&inventory).unwrap();
        mutate(&mut session, &inventory);

        session.restore();
        let again = session.restore();
        assert_eq!(again.restored, 0);
        assert!(again.is_clean());
        assert_eq!(snapshot(&paths), before);
    }

    #[test]
    fn test_drop_restores() {
        let dir = tempdir().unwrap();
        let paths = write_tiles(dir.path());
        let before = snapshot(&paths);

        let inventory = TileInventory::scan(dir.path(), ".tiff").unwrap();
        {
            let mut session = TileSession::capture(&inventory).unwrap();
            mutate(&mut session, &inventory);
        }

        assert_eq!(snapshot(&paths), before);
        assert!(!Journal::path(dir.path()).exists());
    }

    #[test]
    fn test_recover_from_journal() {
        let dir = tempdir().unwrap();
        let paths = write_tiles(dir.path());
        let before = snapshot(&paths);

        let inventory = TileInventory::scan(dir.path(), ".tiff").unwrap();
        let mut session = TileSession::capture(&inventory).unwrap();
        mutate(&mut session, &inventory);
        // simulate a crash: nothing runs on the way out
        std::mem::forget(session);

        let err = TileSession::capture(&inventory).unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");

        let report = recover(dir.path()).unwrap().unwrap();
        assert_eq!(report.restored, 4);
        assert_eq!(snapshot(&paths), before);
        assert!(recover(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_missing_tile_is_a_warning() {
        let dir = tempdir().unwrap();
        let paths = write_tiles(dir.path());

        let inventory = TileInventory::scan(dir.path(), ".tiff").unwrap();
        let mut session = TileSession::capture(&inventory).unwrap();
        fs::remove_file(&paths[3]).unwrap();

        let report = session.restore();
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].path, paths[3]);
        assert!(Journal::path(dir.path()).exists());
    }
}
