//! Filename Address Codec
//!
//! Tiles carry their position only in their file name, as a fragment of the
//! form `Z{pad}{z}_T{t}_C{c}`. `{pad}` is a run of literal zeros whose length
//! (the digit width) is fixed for a whole acquisition and derived from its
//! Z-slice count. All pattern matching on tile and stitcher file names lives
//! in this module.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StitchError};

/// Suffix of tile files produced by the acquisition software.
pub const TILE_SUFFIX: &str = ".tiff";

/// Placeholder the stitcher substitutes with the tile index.
pub const TILE_INDEX_PLACEHOLDER: &str = "{i}";

static ADDRESS_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Z(\d+)_T(\d+)_C(\d+)").expect("valid tile address regex"));

static PLANE_ARTIFACT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^img_t\d+_z\d+_c\d+$").expect("valid plane artifact regex"));

static FUSED_OUTPUT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^fused_C\d+(_subset\d+|_Z\d+)?\.ome\.tif$").expect("valid fused output regex")
});

/// Number of zero characters prepended to the Z index (0, 1 or 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DigitWidth(u8);

impl DigitWidth {
    pub const MAX: u8 = 2;

    pub fn new(width: u8) -> Option<Self> {
        (width <= Self::MAX).then_some(DigitWidth(width))
    }

    /// Width used by an acquisition with `size_z` slices.
    ///
    /// Boundaries are at 10 and 100 slices.
    pub fn for_size(size_z: usize) -> Self {
        if size_z < 10 {
            DigitWidth(0)
        } else if size_z < 100 {
            DigitWidth(1)
        } else {
            DigitWidth(2)
        }
    }

    /// Recover the width from the Z digit run of a Z=0 tile (`"0"`, `"00"`, `"000"`).
    pub fn infer(zero_digits: &str) -> Option<Self> {
        if zero_digits.is_empty() || !zero_digits.bytes().all(|b| b == b'0') {
            return None;
        }
        u8::try_from(zero_digits.len() - 1).ok().and_then(Self::new)
    }

    pub fn get(&self) -> u8 {
        self.0
    }

    /// The literal padding string.
    pub fn zeros(&self) -> &'static str {
        match self.0 {
            0 => "",
            1 => "0",
            _ => "00",
        }
    }
}

/// Typed grid address of a tile file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileAddress {
    pub z: u32,
    pub t: u32,
    pub c: u32,
}

impl TileAddress {
    pub fn new(z: u32, t: u32, c: u32) -> Self {
        Self { z, t, c }
    }
}

impl fmt::Display for TileAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "z={} t={} c={}", self.z, self.t, self.c)
    }
}

/// Raw location of an address fragment inside a file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment<'a> {
    /// Byte offset where `Z...` starts.
    pub start: usize,
    pub z_digits: &'a str,
    pub t_digits: &'a str,
    pub c_digits: &'a str,
}

/// Find the last address fragment in `filename`, if any.
pub fn find_fragment(filename: &str) -> Option<Fragment<'_>> {
    let caps = ADDRESS_PATTERN.captures_iter(filename).last()?;
    let whole = caps.get(0)?;
    Some(Fragment {
        start: whole.start(),
        z_digits: caps.get(1)?.as_str(),
        t_digits: caps.get(2)?.as_str(),
        c_digits: caps.get(3)?.as_str(),
    })
}

/// Parse the address fragment of `filename` under a fixed digit width.
pub fn decode(filename: &str, width: DigitWidth) -> Result<TileAddress> {
    let malformed = |reason: &str| StitchError::MalformedAddress {
        file: filename.to_string(),
        reason: reason.to_string(),
    };

    let fragment =
        find_fragment(filename).ok_or_else(|| malformed("no Z<pad><z>_T<t>_C<c> fragment"))?;

    let z_digits = fragment
        .z_digits
        .strip_prefix(width.zeros())
        .ok_or_else(|| malformed("Z index is missing its zero padding"))?;
    if z_digits.is_empty() {
        return Err(malformed("Z index is empty after padding"));
    }
    if z_digits.len() > 1 && z_digits.starts_with('0') {
        return Err(malformed("Z index carries more padding than the acquisition uses"));
    }

    let number = |digits: &str, axis: &str| {
        digits
            .parse::<u32>()
            .map_err(|_| malformed(&format!("{} index '{}' is not a valid number", axis, digits)))
    };

    Ok(TileAddress {
        z: number(z_digits, "Z")?,
        t: number(fragment.t_digits, "T")?,
        c: number(fragment.c_digits, "C")?,
    })
}

/// Build the address fragment for `address`.
pub fn encode(address: &TileAddress, width: DigitWidth) -> String {
    format!(
        "Z{}{}_T{}_C{}",
        width.zeros(),
        address.z,
        address.t,
        address.c
    )
}

/// Stitcher-facing file name of a tile (fragment plus suffix, no prefix).
pub fn working_name(address: &TileAddress, width: DigitWidth, suffix: &str) -> String {
    format!("{}{}", encode(address, width), suffix)
}

/// File name template handed to the stitcher for one Z slice of one channel.
pub fn template(z: u32, c: u32, width: DigitWidth, suffix: &str) -> String {
    format!(
        "Z{}{}_T{}_C{}{}",
        width.zeros(),
        z,
        TILE_INDEX_PLACEHOLDER,
        c,
        suffix
    )
}

/// Name of the per-plane file the stitcher writes for 1-based `plane_number`.
///
/// The stitcher does not simply pad to a fixed width: past 9 (and past 99)
/// the padding collapses. The exact names are reproduced here.
pub fn fused_plane_name(plane_number: usize, width: DigitWidth) -> String {
    let n = plane_number;
    let index = match width.get() {
        1 if n > 9 => n.to_string(),
        2 if n > 99 => n.to_string(),
        2 if n > 9 => format!("0{}", n),
        _ => format!("{}{}", width.zeros(), n),
    };
    format!("img_t1_z{}_c1", index)
}

/// Whether `name` is an intermediate per-plane stitcher artifact.
pub fn is_plane_artifact(name: &str) -> bool {
    PLANE_ARTIFACT_PATTERN.is_match(name)
}

/// Whether `name` is a fused output written by a previous run.
pub fn is_fused_output(name: &str) -> bool {
    FUSED_OUTPUT_PATTERN.is_match(name)
}
