//! Registration-free mosaic stitcher.
//!
//! Tiles are placed edge to edge in the same snake-by-rows order Fiji uses
//! (row 0 left to right, row 1 right to left, ...) and written out as the
//! same per-plane files. There is no overlap handling or blending.

use std::path::PathBuf;

use log::info;

use super::{StitchRequest, Stitcher};
use crate::address::{self, DigitWidth};
use crate::codec::{PlaneCodec, TiffCodec};
use crate::error::{Result, StitchError};
use crate::metadata::{self, AcquisitionMetadata};

/// Abutting mosaic built with a plane codec.
#[derive(Debug, Clone)]
pub struct MosaicStitcher<C = TiffCodec> {
    codec: C,
}

impl MosaicStitcher<TiffCodec> {
    pub fn tiff() -> Self {
        Self { codec: TiffCodec }
    }
}

impl<C: PlaneCodec> MosaicStitcher<C> {
    pub fn new(codec: C) -> Self {
        Self { codec }
    }

    /// Grid cell (column, row) of tile `index` in snake-by-rows order.
    pub fn cell(index: u32, grid_x: u32) -> (u32, u32) {
        let row = index / grid_x;
        let step = index % grid_x;
        let column = if row % 2 == 0 { step } else { grid_x - 1 - step };
        (column, row)
    }

    fn fuse(&self, request: &StitchRequest) -> Result<usize> {
        let grid = request.grid;
        let tiles: Vec<PathBuf> = (0..grid.positions() as u32)
            .map(|i| {
                request
                    .source_dir
                    .join(request.tile_name(request.first_file_index + i))
            })
            .collect();

        let first = tiles
            .first()
            .ok_or_else(|| StitchError::config("stitch request has an empty grid"))?;
        let reference = metadata::load(first)?;
        let planes = self.codec.plane_count(first)?;
        let tile_row_bytes = reference.size_x as usize * reference.pixel_type.bytes_per_pixel();
        let tile_rows = reference.size_y as usize;

        let mut fused = AcquisitionMetadata::new(
            reference.size_x * grid.grid_x,
            reference.size_y * grid.grid_y,
            reference.pixel_type,
        );
        fused.calibration = reference.calibration.clone();
        fused.channels = reference.channels.iter().take(1).cloned().collect();
        if fused.channels.is_empty() {
            fused.channels = reference.channel_table().into_iter().take(1).collect();
        }
        let fused_row_bytes = tile_row_bytes * grid.grid_x as usize;
        let width = DigitWidth::for_size(planes);

        for plane in 0..planes {
            let mut buffer = vec![0u8; fused.plane_bytes()];
            for (i, tile) in tiles.iter().enumerate() {
                let bytes = self.codec.read_plane(tile, plane)?;
                if bytes.len() != tile_row_bytes * tile_rows {
                    return Err(StitchError::codec(
                        tile,
                        format!(
                            "tile plane has {} bytes, expected {}",
                            bytes.len(),
                            tile_row_bytes * tile_rows
                        ),
                    ));
                }
                let (column, row) = Self::cell(i as u32, grid.grid_x);
                for y in 0..tile_rows {
                    let dst = (row as usize * tile_rows + y) * fused_row_bytes
                        + column as usize * tile_row_bytes;
                    let src = y * tile_row_bytes;
                    buffer[dst..dst + tile_row_bytes]
                        .copy_from_slice(&bytes[src..src + tile_row_bytes]);
                }
            }

            let path = request
                .output_dir
                .join(address::fused_plane_name(plane + 1, width));
            let mut writer = self.codec.create(&path, &fused)?;
            writer.write_plane(0, &buffer)?;
            writer.finish()?;
        }

        Ok(planes)
    }
}

impl<C: PlaneCodec> Stitcher for MosaicStitcher<C> {
    fn name(&self) -> &str {
        "mosaic"
    }

    fn stitch(&self, request: &StitchRequest) -> Result<()> {
        info!(
            "Placing {}x{} tiles of {}",
            request.grid.grid_x, request.grid.grid_y, request.template
        );
        self.fuse(request)
            .map(|_| ())
            .map_err(|e| StitchError::StitchFailure {
                channel: request.channel as usize,
                reason: e.to_string(),
            })
    }
}
