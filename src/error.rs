//! Error handling for mosaic-stitch
//!
//! One error type covers the whole pipeline. Variants carry the file or
//! channel that failed so the CLI can report the stage that was reached.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for mosaic-stitch operations
pub type Result<T> = std::result::Result<T, StitchError>;

/// Pipeline stage an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Configuration,
    Inventory,
    Rewrite,
    Stitch,
    Assembly,
    Restoration,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Configuration => "configuration",
            Stage::Inventory => "inventory",
            Stage::Rewrite => "metadata rewrite",
            Stage::Stitch => "stitching",
            Stage::Assembly => "assembly",
            Stage::Restoration => "restoration",
        }
    }
}

/// Main error type for mosaic-stitch operations
#[derive(Error, Debug)]
pub enum StitchError {
    // Configuration Errors
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Malformed tile address in '{file}': {reason}")]
    MalformedAddress { file: String, reason: String },

    // Metadata Errors
    #[error("Failed to read metadata from {path}: {reason}")]
    MetadataRead { path: PathBuf, reason: String },

    #[error("Failed to write metadata to {path}: {reason}")]
    MetadataWrite {
        path: PathBuf,
        reason: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Invalid embedded metadata: {reason}")]
    InvalidXml { reason: String },

    // Pixel I/O Errors
    #[error("Plane I/O failed for {path}: {reason}")]
    Codec { path: PathBuf, reason: String },

    // Stitching Errors
    #[error("Stitching failed for channel {channel}: {reason}")]
    StitchFailure { channel: usize, reason: String },

    #[error("Timed out after {waited_secs:.1}s waiting for {what}")]
    StitchTimeout { what: String, waited_secs: f64 },

    #[error("Operation cancelled while waiting for {what}")]
    Cancelled { what: String },

    // Cleanup Errors (reported as warnings)
    #[error("Cleanup of {path} failed: {reason}")]
    Cleanup { path: PathBuf, reason: String },

    // I/O Errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization Errors
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StitchError {
    /// Get the error code for this error type
    pub fn error_code(&self) -> &'static str {
        match self {
            StitchError::Configuration { .. } => "CONFIGURATION_ERROR",
            StitchError::MalformedAddress { .. } => "MALFORMED_ADDRESS",
            StitchError::MetadataRead { .. } => "METADATA_READ_ERROR",
            StitchError::MetadataWrite { .. } => "METADATA_WRITE_ERROR",
            StitchError::InvalidXml { .. } => "INVALID_XML",
            StitchError::Codec { .. } => "CODEC_ERROR",
            StitchError::StitchFailure { .. } => "STITCH_FAILURE",
            StitchError::StitchTimeout { .. } => "STITCH_TIMEOUT",
            StitchError::Cancelled { .. } => "CANCELLED",
            StitchError::Cleanup { .. } => "CLEANUP_WARNING",
            StitchError::Io(_) => "IO_ERROR",
            StitchError::Json(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Stage at which this kind of error is raised
    pub fn stage(&self) -> Stage {
        match self {
            StitchError::Configuration { .. } | StitchError::Json(_) => Stage::Configuration,
            StitchError::MalformedAddress { .. } | StitchError::MetadataRead { .. } => {
                Stage::Inventory
            }
            StitchError::MetadataWrite { .. } | StitchError::InvalidXml { .. } => Stage::Rewrite,
            StitchError::StitchFailure { .. }
            | StitchError::StitchTimeout { .. }
            | StitchError::Cancelled { .. } => Stage::Stitch,
            StitchError::Codec { .. } | StitchError::Io(_) => Stage::Assembly,
            StitchError::Cleanup { .. } => Stage::Restoration,
        }
    }

    /// One-line report for the user: code, stage reached, message.
    pub fn report_line(&self) -> String {
        format!("[{}] {} failed: {}", self.error_code(), self.stage().as_str(), self)
    }

    /// Errors that only affect the channel being processed. Other channels
    /// continue after one of these.
    pub fn is_channel_scoped(&self) -> bool {
        matches!(
            self,
            StitchError::StitchFailure { .. }
                | StitchError::StitchTimeout { .. }
                | StitchError::MetadataRead { .. }
                | StitchError::MetadataWrite { .. }
                | StitchError::InvalidXml { .. }
                | StitchError::Codec { .. }
                | StitchError::Io(_)
        )
    }

    /// Returns a user-friendly recovery suggestion.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StitchError::Configuration { .. } => {
                Some("Check grid_x/grid_y and the channel selection against the tile files.")
            }
            StitchError::MalformedAddress { .. } => Some(
                "Tile names must end in Z<pad><z>_T<t>_C<c>.tiff; move unrelated files out of the directory.",
            ),
            StitchError::MetadataWrite { .. } => {
                Some("Make sure no other program has the tile files open.")
            }
            StitchError::StitchTimeout { .. } => {
                Some("Increase wait.timeout_secs or check the stitcher log.")
            }
            StitchError::Cancelled { .. } | StitchError::Cleanup { .. } => {
                Some("Run 'mosaic-stitch recover <directory>' to restore the tiles.")
            }
            _ => None,
        }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        StitchError::Configuration {
            reason: reason.into(),
        }
    }

    pub(crate) fn codec(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        StitchError::Codec {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
