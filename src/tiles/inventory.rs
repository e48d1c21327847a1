//! Tile inventory: which tile files exist and which grid address each holds.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use log::debug;
use walkdir::WalkDir;

use super::journal::JOURNAL_FILE;
use super::GridLayout;
use crate::address::{self, DigitWidth, TileAddress};
use crate::error::{Result, StitchError};

/// One tile file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileEntry {
    pub address: TileAddress,
    pub path: PathBuf,
    /// File name text preceding the address fragment.
    pub prefix: String,
}

impl TileEntry {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// All tiles of one directory, keyed by address.
#[derive(Debug, Clone)]
pub struct TileInventory {
    directory: PathBuf,
    suffix: String,
    width: DigitWidth,
    tiles: BTreeMap<TileAddress, TileEntry>,
}

impl TileInventory {
    /// Scan `directory` (not recursively) for files ending in `suffix`.
    ///
    /// The digit width is inferred from the Z=0 tiles, then every tile name
    /// is decoded with it. Fused outputs of earlier runs and hidden files are
    /// ignored.
    pub fn scan(directory: &Path, suffix: &str) -> Result<Self> {
        let mut files = Vec::new();
        for entry in WalkDir::new(directory)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| {
                StitchError::config(format!("cannot list {}: {}", directory.display(), e))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                debug!("Skipping non UTF-8 file name {:?}", entry.file_name());
                continue;
            };
            if name.starts_with('.')
                || name == JOURNAL_FILE
                || !name.ends_with(suffix)
                || address::is_fused_output(&name)
            {
                continue;
            }
            files.push((name, entry.into_path()));
        }

        if files.is_empty() {
            return Err(StitchError::config(format!(
                "no *{} tiles found in {}",
                suffix,
                directory.display()
            )));
        }

        let width = infer_width(files.iter().map(|(name, _)| name.as_str()))?;

        let mut tiles = BTreeMap::new();
        for (name, path) in files {
            let address = address::decode(&name, width)?;
            let start = address::find_fragment(&name)
                .map(|fragment| fragment.start)
                .unwrap_or(0);

            if name[start..] != address::working_name(&address, width, suffix) {
                return Err(StitchError::MalformedAddress {
                    file: name,
                    reason: format!("unexpected text between the address and '{}'", suffix),
                });
            }

            let entry = TileEntry {
                address,
                prefix: name[..start].to_string(),
                path,
            };
            if let Some(previous) = tiles.insert(address, entry) {
                return Err(StitchError::config(format!(
                    "{} and {} both hold tile {}",
                    previous.path.display(),
                    name,
                    address
                )));
            }
        }

        debug!(
            "Found {} tiles in {} (digit width {})",
            tiles.len(),
            directory.display(),
            width.get()
        );

        Ok(Self {
            directory: directory.to_path_buf(),
            suffix: suffix.to_string(),
            width,
            tiles,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn digit_width(&self) -> DigitWidth {
        self.width
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn get(&self, address: &TileAddress) -> Option<&TileEntry> {
        self.tiles.get(address)
    }

    /// Tiles in address order (Z, then T, then C).
    pub fn iter(&self) -> impl Iterator<Item = &TileEntry> {
        self.tiles.values()
    }

    /// The tile with the lowest address, used as the acquisition reference.
    pub fn first(&self) -> Option<&TileEntry> {
        self.tiles.values().next()
    }

    /// Check the inventory against the grid before anything is modified.
    ///
    /// The file count must equal positions × `channel_count` × `z_files`, and
    /// every (Z, T, C) needed for `channels` must be present.
    pub fn check_complete(
        &self,
        grid: GridLayout,
        channel_count: u32,
        z_files: u32,
        channels: &[u32],
    ) -> Result<()> {
        let expected = grid.expected_files(channel_count, z_files);
        if self.tiles.len() != expected {
            return Err(StitchError::config(format!(
                "found {} tile files but a {}x{} grid with {} channel(s) and {} Z file(s) needs {}; \
                 check grid_x and grid_y",
                self.tiles.len(),
                grid.grid_x,
                grid.grid_y,
                channel_count,
                z_files,
                expected
            )));
        }

        for z in 0..z_files {
            for t in 0..grid.positions() as u32 {
                for &c in channels {
                    let address = TileAddress::new(z, t, c);
                    if !self.tiles.contains_key(&address) {
                        return Err(StitchError::config(format!(
                            "tile {} is missing from {}",
                            address::encode(&address, self.width),
                            self.directory.display()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Infer the digit width from the all-zero Z runs of the Z=0 tiles.
fn infer_width<'a>(names: impl Iterator<Item = &'a str>) -> Result<DigitWidth> {
    let widths: BTreeSet<DigitWidth> = names
        .filter_map(address::find_fragment)
        .filter(|fragment| fragment.z_digits.bytes().all(|b| b == b'0'))
        .filter_map(|fragment| DigitWidth::infer(fragment.z_digits))
        .collect();

    let mut widths = widths.into_iter();
    match (widths.next(), widths.next()) {
        (Some(width), None) => Ok(width),
        (None, _) => Err(StitchError::config(
            "no Z=0 tile found to infer the Z index padding from",
        )),
        (Some(_), Some(_)) => Err(StitchError::config(
            "tiles disagree on the Z index padding",
        )),
    }
}
