//! Pipeline Tests
//!
//! End-to-end runs over real TIFF tiles with the built-in mosaic stitcher.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use approx::assert_relative_eq;
use pretty_assertions::assert_eq;
use tempfile::{tempdir, TempDir};

use mosaic_stitch::codec::{PlaneCodec, TiffCodec};
use mosaic_stitch::config::{StitchConfig, StitcherKind};
use mosaic_stitch::metadata::{
    self, AcquisitionMetadata, Calibration, ChannelInfo, Length, PixelType, TiffData,
};
use mosaic_stitch::stitch::{Pipeline, StitchRequest, Stitcher};
use mosaic_stitch::tiles::JOURNAL_FILE;
use mosaic_stitch::wait::CancellationToken;
use mosaic_stitch::Result;

const GRID: u32 = 2;
const POSITIONS: u32 = GRID * GRID;

/// Distinct sample value for every (tile, channel, slice).
fn sample(t: u32, c: u32, z: u32) -> u16 {
    (t * 100 + c * 10 + z) as u16
}

fn plane(t: u32, c: u32, z: u32) -> Vec<u8> {
    sample(t, c, z).to_le_bytes().repeat(3 * 2)
}

fn acquisition(channels: u32, size_z: u32) -> AcquisitionMetadata {
    let mut meta = AcquisitionMetadata::new(3, 2, PixelType::Uint16);
    meta.uuid = Some(AcquisitionMetadata::new_file_uuid());
    meta.image_name = Some("sample acquisition".to_string());
    meta.size_c = channels;
    meta.size_z = size_z;
    meta.size_t = POSITIONS;
    meta.calibration = Calibration {
        x: Some(Length::microns(0.65)),
        y: Some(Length::microns(0.65)),
        z: Some(Length::microns(2.0)),
    };
    meta.channels = (0..channels)
        .map(|c| ChannelInfo {
            name: Some(format!("channel {}", c)),
            ..ChannelInfo::new(c)
        })
        .collect();
    meta.tiff_data = (0..size_z)
        .map(|z| TiffData::single_plane(z, z, meta.uuid_ref()))
        .collect();
    meta
}

/// Tiles holding whole Z stacks: `sample_Z0_T{t}_C{c}.tiff`.
fn write_stack_tiles(dir: &Path, meta: &AcquisitionMetadata) -> Vec<PathBuf> {
    let codec = TiffCodec::new();
    let mut paths = Vec::new();
    for t in 0..POSITIONS {
        for c in 0..meta.size_c {
            let path = dir.join(format!("sample_Z0_T{}_C{}.tiff", t, c));
            let mut writer = codec.create(&path, meta).unwrap();
            for z in 0..meta.size_z {
                writer.write_plane(z as usize, &plane(t, c, z)).unwrap();
            }
            writer.finish().unwrap();
            paths.push(path);
        }
    }
    paths
}

/// One file per Z-slice: `sample_Z{z}_T{t}_C{c}.tiff`.
fn write_slice_tiles(dir: &Path, meta: &AcquisitionMetadata) -> Vec<PathBuf> {
    let codec = TiffCodec::new();
    let mut paths = Vec::new();
    for z in 0..meta.size_z {
        for t in 0..POSITIONS {
            for c in 0..meta.size_c {
                let path = dir.join(format!("sample_Z{}_T{}_C{}.tiff", z, t, c));
                let mut writer = codec.create(&path, meta).unwrap();
                writer.write_plane(0, &plane(t, c, z)).unwrap();
                writer.finish().unwrap();
                paths.push(path);
            }
        }
    }
    paths
}

fn config(dir: &Path) -> StitchConfig {
    let mut config = StitchConfig::new(dir, GRID, GRID);
    config.stitcher.kind = StitcherKind::Mosaic;
    config.wait.poll_interval_ms = 1;
    config.wait.timeout_secs = Some(2.0);
    config
}

/// Embedded metadata text and pixels of every tile.
fn snapshot(paths: &[PathBuf]) -> Vec<(String, Vec<u8>)> {
    let codec = TiffCodec::new();
    paths
        .iter()
        .map(|p| {
            (
                metadata::read_embedded(p).unwrap(),
                codec.read_plane(p, 0).unwrap(),
            )
        })
        .collect()
}

fn file_names(dir: &TempDir) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn pixel(bytes: &[u8], width: usize, x: usize, y: usize) -> u16 {
    let i = (y * width + x) * 2;
    u16::from_le_bytes([bytes[i], bytes[i + 1]])
}

fn assert_tiles_untouched(dir: &TempDir, paths: &[PathBuf], before: &[(String, Vec<u8>)]) {
    assert_eq!(snapshot(paths), before);
    let names = file_names(dir);
    assert!(!names.iter().any(|n| n.starts_with("img_t")), "{:?}", names);
    assert!(!names.iter().any(|n| n == JOURNAL_FILE));
}

#[test]
fn test_single_channel_single_plane() {
    let dir = tempdir().unwrap();
    let meta = acquisition(1, 1);
    let tiles = write_stack_tiles(dir.path(), &meta);
    let before = snapshot(&tiles);

    let report = Pipeline::from_config(config(dir.path())).run().unwrap();

    assert!(report.is_success());
    assert!(report.restore.is_clean());
    let output = dir.path().join("fused_C0.ome.tif");
    assert_eq!(report.outputs().collect::<Vec<_>>(), vec![output.as_path()]);

    let fused = metadata::load(&output).unwrap();
    assert_eq!((fused.size_x, fused.size_y), (6, 4));
    assert_eq!((fused.size_c, fused.size_z, fused.size_t), (1, 1, 1));
    assert_eq!(fused.calibration, meta.calibration);
    assert_eq!(fused.channels.len(), 1);
    assert_eq!(fused.channels[0].name.as_deref(), Some("channel 0"));
    assert_eq!(fused.tiff_data.len(), 1);

    // snake by rows: T0 T1 on top, T3 T2 below
    let bytes = TiffCodec::new().read_plane(&output, 0).unwrap();
    assert_eq!(pixel(&bytes, 6, 0, 0), sample(0, 0, 0));
    assert_eq!(pixel(&bytes, 6, 3, 1), sample(1, 0, 0));
    assert_eq!(pixel(&bytes, 6, 0, 2), sample(3, 0, 0));
    assert_eq!(pixel(&bytes, 6, 5, 3), sample(2, 0, 0));

    assert_tiles_untouched(&dir, &tiles, &before);
    assert_eq!(file_names(&dir).len(), tiles.len() + 1);
}

#[test]
fn test_every_channel_is_stitched() {
    let dir = tempdir().unwrap();
    let meta = acquisition(2, 3);
    let tiles = write_stack_tiles(dir.path(), &meta);
    let before = snapshot(&tiles);

    let report = Pipeline::from_config(config(dir.path())).run().unwrap();
    assert!(report.is_success());
    assert_eq!(report.channels.len(), 2);

    let codec = TiffCodec::new();
    for c in 0..2 {
        let output = dir.path().join(format!("fused_C{}.ome.tif", c));
        let fused = metadata::load(&output).unwrap();
        assert_eq!((fused.size_c, fused.size_z), (1, 3));
        assert_eq!(fused.channels[0].name, Some(format!("channel {}", c)));
        assert_eq!(codec.plane_count(&output).unwrap(), 3);

        for z in 0..3 {
            let bytes = codec.read_plane(&output, z as usize).unwrap();
            assert_eq!(pixel(&bytes, 6, 0, 0), sample(0, c, z));
            assert_eq!(fused.tiff_data[z as usize].first_z, z);
        }
    }

    assert_tiles_untouched(&dir, &tiles, &before);
}

#[test]
fn test_selected_channel_only() {
    let dir = tempdir().unwrap();
    write_stack_tiles(dir.path(), &acquisition(3, 1));

    let report = Pipeline::from_config(config(dir.path()).with_channel(2))
        .run()
        .unwrap();
    assert_eq!(report.channels.len(), 1);
    assert_eq!(report.channels[0].channel, 2);
    assert!(dir.path().join("fused_C2.ome.tif").exists());
    assert!(!dir.path().join("fused_C0.ome.tif").exists());
}

#[test]
fn test_long_series_is_split_into_subsets() {
    let dir = tempdir().unwrap();
    let tiles = write_stack_tiles(dir.path(), &acquisition(1, 5));
    let before = snapshot(&tiles);

    let mut config = config(dir.path());
    config.subset_planes = 2;
    let report = Pipeline::from_config(config).run().unwrap();
    assert!(report.is_success());

    let subsets: Vec<PathBuf> = (0..3)
        .map(|n| dir.path().join(format!("fused_C0_subset{}.ome.tif", n)))
        .collect();
    assert_eq!(report.channels[0].outputs, subsets);
    assert!(!dir.path().join("fused_C0.ome.tif").exists());

    let codec = TiffCodec::new();
    let planes: Vec<usize> = subsets
        .iter()
        .map(|p| codec.plane_count(p).unwrap())
        .collect();
    assert_eq!(planes, vec![2, 2, 1]);

    let records: Vec<AcquisitionMetadata> =
        subsets.iter().map(|p| metadata::load(p).unwrap()).collect();
    for record in &records {
        assert_eq!(record.size_z, 5);
        assert_eq!(record.tiff_data.len(), 5);
    }

    // Z=3 is the second plane of the second subset
    let descriptor = &records[0].tiff_data[3];
    assert_eq!(descriptor.ifd, 1);
    let uuid = descriptor.uuid.as_ref().unwrap();
    assert_eq!(uuid.file_name.as_deref(), Some("fused_C0_subset1.ome.tif"));
    assert_eq!(Some(uuid.value.clone()), records[1].uuid);

    let bytes = codec.read_plane(&subsets[1], 1).unwrap();
    assert_eq!(pixel(&bytes, 6, 0, 0), sample(0, 0, 3));

    assert_tiles_untouched(&dir, &tiles, &before);
}

#[test]
fn test_separate_z_slices_are_linked() {
    let dir = tempdir().unwrap();
    let meta = acquisition(1, 3);
    let tiles = write_slice_tiles(dir.path(), &meta);
    let before = snapshot(&tiles);

    let mut config = config(dir.path());
    config.separate_z = true;
    let report = Pipeline::from_config(config).run().unwrap();
    assert!(report.is_success());

    let slices: Vec<PathBuf> = (0..3)
        .map(|z| dir.path().join(format!("fused_C0_Z{}.ome.tif", z)))
        .collect();
    assert_eq!(report.channels[0].outputs, slices);

    let canonical = metadata::load(&slices[0]).unwrap();
    assert_eq!(canonical.size_z, 3);
    assert_eq!(canonical.calibration, meta.calibration);
    let z_step = canonical.calibration.z.as_ref().unwrap();
    assert_relative_eq!(z_step.value, 2.0);
    assert_eq!(z_step.unit.as_deref(), Some("µm"));
    for (z, path) in slices.iter().enumerate() {
        let slice = metadata::load(path).unwrap();
        let descriptor = &canonical.tiff_data[z];
        assert_eq!(descriptor.first_z, z as u32);
        assert_eq!(descriptor.uuid.as_ref().map(|u| u.value.clone()), slice.uuid);

        let bytes = TiffCodec::new().read_plane(path, 0).unwrap();
        assert_eq!(pixel(&bytes, 6, 0, 0), sample(0, 0, z as u32));
    }

    assert_tiles_untouched(&dir, &tiles, &before);
}

#[test]
fn test_missing_tile_changes_nothing() {
    let dir = tempdir().unwrap();
    let mut tiles = write_stack_tiles(dir.path(), &acquisition(2, 1));
    let gone = tiles.remove(5);
    fs::remove_file(&gone).unwrap();
    let before = snapshot(&tiles);
    let names = file_names(&dir);

    let err = Pipeline::from_config(config(dir.path())).run().unwrap_err();

    assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
    assert_eq!(snapshot(&tiles), before);
    assert_eq!(file_names(&dir), names);
}

/// Counts the jobs it is handed and never produces output.
struct RecordingStitcher {
    calls: Arc<AtomicUsize>,
}

impl Stitcher for RecordingStitcher {
    fn name(&self) -> &str {
        "recording"
    }

    fn stitch(&self, _request: &StitchRequest) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_failed_preparation_never_stitches() {
    let dir = tempdir().unwrap();
    let tiles = write_stack_tiles(dir.path(), &acquisition(1, 1));
    let before = snapshot(&tiles);
    // the last tile can not be moved to its working name
    let blocker = dir.path().join("Z0_T3_C0.tiff");
    fs::create_dir(&blocker).unwrap();
    fs::write(blocker.join("keep"), b"").unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = Pipeline::new(
        config(dir.path()),
        Box::new(TiffCodec::new()),
        Box::new(RecordingStitcher {
            calls: calls.clone(),
        }),
    );

    let err = pipeline.run().unwrap_err();
    assert_eq!(err.error_code(), "METADATA_WRITE_ERROR");
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // the three tiles that were renamed and all four rewrites are undone
    assert_tiles_untouched(&dir, &tiles, &before);
    let mut expected: Vec<String> = tiles
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    expected.push("Z0_T3_C0.tiff".to_string());
    expected.sort();
    assert_eq!(file_names(&dir), expected);
    assert!(!dir.path().join("Z0_T0_C0.tiff").exists());
}

#[test]
fn test_rerun_ignores_previous_outputs() {
    let dir = tempdir().unwrap();
    let tiles = write_stack_tiles(dir.path(), &acquisition(1, 2));
    let before = snapshot(&tiles);

    Pipeline::from_config(config(dir.path())).run().unwrap();
    let report = Pipeline::from_config(config(dir.path())).run().unwrap();

    assert!(report.is_success());
    assert_eq!(
        metadata::load(&dir.path().join("fused_C0.ome.tif"))
            .unwrap()
            .size_z,
        2
    );
    assert_tiles_untouched(&dir, &tiles, &before);
}

/// Cancels the run as soon as the stitcher is handed its first job.
struct CancelOnStitch {
    cancel: CancellationToken,
}

impl Stitcher for CancelOnStitch {
    fn name(&self) -> &str {
        "cancel"
    }

    fn stitch(&self, _request: &StitchRequest) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

#[test]
fn test_cancelled_run_restores_tiles() {
    let dir = tempdir().unwrap();
    let tiles = write_stack_tiles(dir.path(), &acquisition(2, 1));
    let before = snapshot(&tiles);

    let cancel = CancellationToken::new();
    let pipeline = Pipeline::new(
        config(dir.path()),
        Box::new(TiffCodec::new()),
        Box::new(CancelOnStitch {
            cancel: cancel.clone(),
        }),
    )
    .with_cancellation(cancel);

    let err = pipeline.run().unwrap_err();
    assert_eq!(err.error_code(), "CANCELLED");
    assert_tiles_untouched(&dir, &tiles, &before);
    assert!(!dir.path().join("fused_C0.ome.tif").exists());
}

/// Writes nothing, so every wait for output runs into the timeout.
struct SilentStitcher;

impl Stitcher for SilentStitcher {
    fn name(&self) -> &str {
        "silent"
    }

    fn stitch(&self, _request: &StitchRequest) -> Result<()> {
        Ok(())
    }
}

#[test]
fn test_stitcher_timeout_fails_channels_not_run() {
    let dir = tempdir().unwrap();
    let tiles = write_stack_tiles(dir.path(), &acquisition(2, 1));
    let before = snapshot(&tiles);

    let mut config = config(dir.path());
    config.wait.timeout_secs = Some(0.05);
    let pipeline = Pipeline::new(config, Box::new(TiffCodec::new()), Box::new(SilentStitcher));

    let report = pipeline.run().unwrap();
    assert!(!report.is_success());
    assert_eq!(report.channels.len(), 2);
    assert!(report.channels.iter().all(|c| c.outputs.is_empty()));
    assert_tiles_untouched(&dir, &tiles, &before);
}
