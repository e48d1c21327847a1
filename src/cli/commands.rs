//! CLI Command Implementations
//!
//! Implements the actual logic for each CLI command.

use std::path::{Path, PathBuf};

use log::{info, warn};

use super::StitchArgs;
use crate::codec::TiffCodec;
use crate::error::{Result, StitchError};
use crate::metadata;
use crate::stitch::{Pipeline, PipelineReport};
use crate::tiles::{self, RestoreReport};
use crate::wait::{CancellationToken, WaitPolicy};

/// Stitch a tile directory, or print the plan with `--dry-run`.
pub fn stitch(args: &StitchArgs) -> Result<()> {
    let config = args.to_config()?;
    info!("Stitching tiles in: {}", config.directory.display());
    let pipeline = Pipeline::from_config(config);

    if args.dry_run {
        let plan = pipeline.plan()?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&plan)?);
        } else {
            println!("Directory: {}", plan.directory.display());
            println!("Tiles: {} (index width {})", plan.tile_count, plan.digit_width);
            println!("Channels: {:?} of {}", plan.channels, plan.channel_count);
            println!("Z planes: {} (separate files: {})", plan.size_z, plan.separate_z);
            for template in &plan.templates {
                println!("  {}", template);
            }
        }
        return Ok(());
    }

    let report = pipeline.run()?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    match report.channels.iter().find(|c| !c.succeeded()) {
        Some(failed) => Err(StitchError::StitchFailure {
            channel: failed.channel as usize,
            reason: failed.error.clone().unwrap_or_default(),
        }),
        None => Ok(()),
    }
}

fn print_report(report: &PipelineReport) {
    for outcome in &report.channels {
        match &outcome.error {
            None => {
                println!("Channel {}: {} file(s)", outcome.channel, outcome.outputs.len());
                for output in &outcome.outputs {
                    println!("  {}", output.display());
                }
            }
            Some(reason) => println!("Channel {}: FAILED ({})", outcome.channel, reason),
        }
    }
    print_restore(&report.restore);
    println!("Finished in {:.1}s", report.elapsed_secs);
}

fn print_restore(report: &RestoreReport) {
    println!(
        "Restored {} tile(s), removed {} intermediate file(s)",
        report.restored, report.artifacts_removed
    );
    for warning in &report.warnings {
        warn!("{}", warning);
    }
}

/// Restore tiles left behind by an interrupted run.
pub fn recover(directory: &Path) -> Result<()> {
    info!("Checking for an interrupted run in: {}", directory.display());

    match tiles::recover(directory)? {
        Some(report) => {
            print_restore(&report);
            if !report.is_clean() {
                println!("Some tiles could not be restored; the journal was kept");
            }
        }
        None => println!("Nothing to recover in {}", directory.display()),
    }

    Ok(())
}

/// Split a multi-position acquisition into per-tile files.
pub fn split(input: &Path, tiles_dir: Option<&Path>) -> Result<()> {
    let tiles_dir = match tiles_dir {
        Some(dir) => dir.to_path_buf(),
        None => input
            .parent()
            .map(|parent| parent.join("tiles"))
            .unwrap_or_else(|| PathBuf::from("tiles")),
    };
    info!("Splitting {} into {}", input.display(), tiles_dir.display());

    let report = tiles::split_acquisition(
        &TiffCodec::new(),
        input,
        &tiles_dir,
        &WaitPolicy::default(),
        &CancellationToken::new(),
    )?;

    if report.skipped {
        println!("{} already exists, nothing written", report.tiles_dir.display());
    } else {
        println!("Wrote {} tile(s) to {}", report.tiles.len(), report.tiles_dir.display());
    }
    Ok(())
}

/// Write the embedded metadata of each file beside it.
pub fn extract_xml(files: &[PathBuf]) -> Result<()> {
    for file in files {
        info!("Extracting metadata from: {}", file.display());
        let target = metadata::export_xml(file)?;
        println!("{}", target.display());
    }
    Ok(())
}

/// Print the parsed metadata of a file.
pub fn inspect(file: &Path) -> Result<()> {
    let meta = metadata::load(file)?;
    println!("{}", serde_json::to_string_pretty(&meta)?);
    Ok(())
}
