//! Fiji Grid/Collection stitching, run as an external headless process.

use std::process::Command;

use log::{debug, info};

use super::{StitchRequest, Stitcher};
use crate::config::StitcherSettings;
use crate::error::{Result, StitchError};

/// Lines of stderr kept in a failure report.
const STDERR_TAIL_LINES: usize = 20;

/// Runs `program args... <macro>` once per request.
pub struct FijiStitcher {
    program: String,
    args: Vec<String>,
    fusion_method: String,
    regression_threshold: f64,
    max_avg_displacement: f64,
    absolute_displacement: f64,
}

impl FijiStitcher {
    pub fn new(settings: &StitcherSettings) -> Self {
        Self {
            program: settings.program.clone(),
            args: settings.args.clone(),
            fusion_method: settings.fusion_method.clone(),
            regression_threshold: settings.regression_threshold,
            max_avg_displacement: settings.max_avg_displacement,
            absolute_displacement: settings.absolute_displacement,
        }
    }

    /// Option string for the Grid/Collection stitching plugin.
    pub fn options(&self, request: &StitchRequest) -> String {
        format!(
            "type=[Grid: snake by rows] order=[Right & Down                ] \
             grid_size_x={} grid_size_y={} tile_overlap={} first_file_index_i={} \
             directory=[{}] file_names=[{}] \
             output_textfile_name=TileConfiguration.txt fusion_method=[{}] \
             regression_threshold={:.2} max/avg_displacement_threshold={:.2} \
             absolute_displacement_threshold={:.2} compute_overlap \
             computation_parameters=[Save memory (but be slower)] \
             image_output=[Write to disk] output_directory=[{}]",
            request.grid.grid_x,
            request.grid.grid_y,
            request.tile_overlap,
            request.first_file_index,
            request.source_dir.display(),
            request.template,
            self.fusion_method,
            self.regression_threshold,
            self.max_avg_displacement,
            self.absolute_displacement,
            request.output_dir.display(),
        )
    }

    /// ImageJ macro that runs the plugin with [`FijiStitcher::options`].
    pub fn macro_source(&self, request: &StitchRequest) -> String {
        format!(
            "run(\"Grid/Collection stitching\", \"{}\");",
            escape_macro_string(&self.options(request))
        )
    }
}

fn escape_macro_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

impl Stitcher for FijiStitcher {
    fn name(&self) -> &str {
        "fiji"
    }

    fn stitch(&self, request: &StitchRequest) -> Result<()> {
        let failure = |reason: String| StitchError::StitchFailure {
            channel: request.channel as usize,
            reason,
        };

        info!(
            "Running Grid/Collection stitching on {} in {}",
            request.template,
            request.source_dir.display()
        );
        let macro_source = self.macro_source(request);
        debug!("{} {} {}", self.program, self.args.join(" "), macro_source);

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&macro_source)
            .output()
            .map_err(|e| failure(format!("cannot start {}: {}", self.program, e)))?;

        if !output.status.success() {
            let tail = stderr_tail(&output.stderr);
            return Err(failure(if tail.is_empty() {
                format!("{} exited with {}", self.program, output.status)
            } else {
                format!("{} exited with {}:\n{}", self.program, output.status, tail)
            }));
        }
        Ok(())
    }
}
