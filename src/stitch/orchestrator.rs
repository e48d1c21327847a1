//! Stitch orchestration
//!
//! One run: inventory and validate the tiles, capture them, rewrite their
//! metadata, stitch each channel, assemble the outputs, and restore the
//! tiles. Nothing is modified until the inventory checks out. A failure in
//! one channel does not stop the others.

use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{error, info, warn};
use serde::Serialize;

use super::{StitchRequest, Stitcher, FIRST_FILE_INDEX};
use crate::address::{self, DigitWidth};
use crate::assemble::{link_slices, remove_outputs, FusedAssembler};
use crate::codec::{PlaneCodec, TiffCodec};
use crate::config::StitchConfig;
use crate::error::{Result, StitchError};
use crate::metadata::{self, AcquisitionMetadata, ChannelInfo};
use crate::tiles::session::remove_plane_artifacts;
use crate::tiles::{derive_tile_record, GridLayout, RestoreReport, TileInventory, TileSession};
use crate::wait::{wait_for_file, CancellationToken, WaitPolicy};

/// What a run would do, worked out without touching any file.
#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub directory: PathBuf,
    pub tile_count: usize,
    pub digit_width: u8,
    pub channel_count: u32,
    pub channels: Vec<u32>,
    pub size_z: u32,
    pub separate_z: bool,
    /// Stitcher file name templates in the order they will run.
    pub templates: Vec<String>,
}

/// Result of one channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelOutcome {
    pub channel: u32,
    pub outputs: Vec<PathBuf>,
    pub error: Option<String>,
}

impl ChannelOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub channels: Vec<ChannelOutcome>,
    pub restore: RestoreReport,
    pub elapsed_secs: f64,
}

impl PipelineReport {
    pub fn is_success(&self) -> bool {
        self.channels.iter().all(ChannelOutcome::succeeded)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Path> {
        self.channels
            .iter()
            .flat_map(|c| c.outputs.iter().map(PathBuf::as_path))
    }
}

/// Everything learned from the tiles before any of them is touched.
struct Prepared {
    inventory: TileInventory,
    acquisition: AcquisitionMetadata,
    channels: Vec<ChannelInfo>,
    z_files: u32,
}

/// A configured stitch run.
pub struct Pipeline {
    config: StitchConfig,
    codec: Box<dyn PlaneCodec>,
    stitcher: Box<dyn Stitcher>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        config: StitchConfig,
        codec: Box<dyn PlaneCodec>,
        stitcher: Box<dyn Stitcher>,
    ) -> Self {
        Self {
            config,
            codec,
            stitcher,
            cancel: CancellationToken::new(),
        }
    }

    /// Pipeline with the TIFF codec and the stitcher named in `config`.
    pub fn from_config(config: StitchConfig) -> Self {
        let stitcher = super::from_config(&config);
        Self::new(config, Box::new(TiffCodec::new()), stitcher)
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &StitchConfig {
        &self.config
    }

    fn grid(&self) -> GridLayout {
        GridLayout::new(self.config.grid_x, self.config.grid_y)
    }

    fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy::from(&self.config.wait)
    }

    fn prepare(&self) -> Result<Prepared> {
        self.config.validate()?;
        let directory = &self.config.directory;

        let inventory = TileInventory::scan(directory, &self.config.tile_suffix)?;
        let reference = inventory
            .first()
            .ok_or_else(|| StitchError::config("no tiles found"))?;
        let acquisition = metadata::load(&reference.path)?;

        let table = acquisition.channel_table();
        let channels = match self.config.selected_channel() {
            Some(selected) => {
                let channel = table
                    .iter()
                    .find(|channel| channel.index == selected)
                    .cloned()
                    .ok_or_else(|| {
                        StitchError::config(format!(
                            "channel {} was selected but the acquisition has {} channel(s)",
                            selected,
                            table.len()
                        ))
                    })?;
                vec![channel]
            }
            None => table,
        };

        let z_files = if self.config.separate_z {
            acquisition.size_z
        } else {
            1
        };
        let indices: Vec<u32> = channels.iter().map(|c| c.index).collect();
        inventory.check_complete(self.grid(), acquisition.size_c, z_files, &indices)?;

        if acquisition.size_t as usize != self.grid().positions() {
            warn!(
                "Acquisition declares {} positions but the grid has {}",
                acquisition.size_t,
                self.grid().positions()
            );
        }

        Ok(Prepared {
            inventory,
            acquisition,
            channels,
            z_files,
        })
    }

    fn template(&self, prepared: &Prepared, z: u32, channel: u32) -> String {
        address::template(
            z,
            channel,
            prepared.inventory.digit_width(),
            &self.config.tile_suffix,
        )
    }

    /// Work out the run without modifying anything.
    pub fn plan(&self) -> Result<RunPlan> {
        let prepared = self.prepare()?;
        let mut templates = Vec::new();
        for channel in &prepared.channels {
            for z in 0..prepared.z_files {
                templates.push(self.template(&prepared, z, channel.index));
            }
        }

        Ok(RunPlan {
            directory: self.config.directory.clone(),
            tile_count: prepared.inventory.len(),
            digit_width: prepared.inventory.digit_width().get(),
            channel_count: prepared.acquisition.size_c,
            channels: prepared.channels.iter().map(|c| c.index).collect(),
            size_z: prepared.acquisition.size_z,
            separate_z: self.config.separate_z,
            templates,
        })
    }

    /// Run the whole pipeline.
    ///
    /// Configuration and inventory problems, and any failure while the tiles
    /// are being prepared, abort the run (after restoring whatever was
    /// touched). Stitching and assembly failures only fail their channel.
    pub fn run(&self) -> Result<PipelineReport> {
        let started = Instant::now();
        let prepared = self.prepare()?;
        info!(
            "Stitching {} tiles of {} channel(s) on a {}x{} grid",
            prepared.inventory.len(),
            prepared.channels.len(),
            self.config.grid_x,
            self.config.grid_y
        );

        let mut session = TileSession::capture(&prepared.inventory)?;
        if let Err(e) = self.prepare_tiles(&mut session, &prepared) {
            error!("Preparing tiles failed: {}", e);
            session.restore();
            return Err(e);
        }

        let mut outcomes = Vec::with_capacity(prepared.channels.len());
        for channel in &prepared.channels {
            if self.cancel.is_cancelled() {
                session.restore();
                return Err(StitchError::Cancelled {
                    what: format!("channel {}", channel.index),
                });
            }

            let result = if self.config.separate_z {
                self.stitch_slices(&prepared, channel)
            } else {
                self.stitch_stack(&prepared, channel)
            };

            match result {
                Ok(outputs) => {
                    info!("Channel {} done", channel.index);
                    outcomes.push(ChannelOutcome {
                        channel: channel.index,
                        outputs,
                        error: None,
                    });
                }
                Err(e) if e.is_channel_scoped() => {
                    error!("Channel {} failed: {}", channel.index, e);
                    outcomes.push(ChannelOutcome {
                        channel: channel.index,
                        outputs: Vec::new(),
                        error: Some(e.to_string()),
                    });
                }
                Err(e) => {
                    session.restore();
                    return Err(e);
                }
            }
        }

        let restore = session.restore();
        Ok(PipelineReport {
            channels: outcomes,
            restore,
            elapsed_secs: started.elapsed().as_secs_f64(),
        })
    }

    /// Rewrite the metadata of every tile of the selected channels, then move
    /// all tiles to their working names.
    fn prepare_tiles(&self, session: &mut TileSession, prepared: &Prepared) -> Result<()> {
        let planes = if self.config.separate_z {
            1
        } else {
            prepared.acquisition.size_z
        };

        for z in 0..prepared.z_files {
            for t in 0..self.grid().positions() as u32 {
                for channel in &prepared.channels {
                    let record = derive_tile_record(&prepared.acquisition, channel, planes);
                    session.rewrite(&address::TileAddress::new(z, t, channel.index), &record)?;
                }
            }
        }

        if let Some(last) = session.rename_to_working()? {
            wait_for_file(&last, &self.wait_policy(), &self.cancel)?;
        }
        Ok(())
    }

    fn request(&self, channel: u32, z: Option<u32>, template: String) -> StitchRequest {
        StitchRequest {
            channel,
            z,
            grid: self.grid(),
            tile_overlap: self.config.tile_overlap,
            first_file_index: FIRST_FILE_INDEX,
            source_dir: self.config.directory.clone(),
            template,
            output_dir: self.config.directory.clone(),
        }
    }

    fn assembler(&self) -> FusedAssembler<'_> {
        FusedAssembler::new(
            self.codec.as_ref(),
            &self.config.directory,
            self.wait_policy(),
            self.cancel.clone(),
        )
    }

    /// Remove per-plane files left by a previous stitch so they can not be
    /// mistaken for this one's output.
    fn clear_stale_planes(&self) {
        let (_, warnings) = remove_plane_artifacts(&self.config.directory);
        for warning in warnings {
            warn!("Cleanup: {}", warning);
        }
    }

    /// Stitch one plane of `channel` and wait for its first output plane.
    fn stitch_once(&self, request: &StitchRequest, planes: u32) -> Result<()> {
        self.clear_stale_planes();
        self.stitcher.stitch(request)?;

        let first_plane = self
            .config
            .directory
            .join(address::fused_plane_name(1, DigitWidth::for_size(planes as usize)));
        wait_for_file(&first_plane, &self.wait_policy(), &self.cancel)?;
        Ok(())
    }

    /// Tiles hold whole Z stacks: one stitch, then assembly into subsets.
    fn stitch_stack(&self, prepared: &Prepared, channel: &ChannelInfo) -> Result<Vec<PathBuf>> {
        let acquisition = &prepared.acquisition;
        let request = self.request(channel.index, None, self.template(prepared, 0, channel.index));
        self.stitch_once(&request, acquisition.size_z)?;

        let subsets = self.assembler().assemble(
            channel,
            &acquisition.calibration,
            acquisition.size_z,
            self.config.subset_planes,
        )?;
        Ok(subsets.into_iter().map(|s| s.path).collect())
    }

    /// Each Z-slice is its own tile file: one stitch and one output per
    /// slice, then the slices are linked.
    fn stitch_slices(&self, prepared: &Prepared, channel: &ChannelInfo) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        match self.write_slices(prepared, channel, &mut written) {
            Ok(()) => Ok(written),
            Err(e) => {
                remove_outputs(&written);
                Err(e)
            }
        }
    }

    fn write_slices(
        &self,
        prepared: &Prepared,
        channel: &ChannelInfo,
        written: &mut Vec<PathBuf>,
    ) -> Result<()> {
        let calibration = &prepared.acquisition.calibration;
        let assembler = self.assembler();

        for z in 0..prepared.z_files {
            let request =
                self.request(channel.index, Some(z), self.template(prepared, z, channel.index));
            self.stitch_once(&request, 1)?;
            written.push(assembler.write_slice(channel, calibration, z)?);
        }

        link_slices(written, channel, calibration)?;
        Ok(())
    }
}
