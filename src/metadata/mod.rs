//! Metadata Store
//!
//! In-memory acquisition metadata for one image file (pixel geometry,
//! physical calibration, channel table and per-plane frame descriptors),
//! its OME-XML serialization, and in-place replacement of the embedded copy
//! inside a file.
//!
//! Records are plain values: deriving a tile record from an acquisition
//! record clones what it needs and never aliases the source.

mod ome_xml;
mod store;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use ome_xml::{dump, parse};
pub use store::{export_xml, load, overwrite_embedded, read_embedded};

/// Pixel storage type of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float,
    Double,
}

impl PixelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::Uint8 => "uint8",
            Self::Int16 => "int16",
            Self::Uint16 => "uint16",
            Self::Int32 => "int32",
            Self::Uint32 => "uint32",
            Self::Float => "float",
            Self::Double => "double",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "int8" => Some(Self::Int8),
            "uint8" => Some(Self::Uint8),
            "int16" => Some(Self::Int16),
            "uint16" => Some(Self::Uint16),
            "int32" => Some(Self::Int32),
            "uint32" => Some(Self::Uint32),
            "float" => Some(Self::Float),
            "double" => Some(Self::Double),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float => 4,
            Self::Double => 8,
        }
    }
}

/// Rasterization order of the non-spatial axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DimensionOrder {
    Xyzct,
    Xyztc,
    #[default]
    Xyczt,
    Xyctz,
    Xytzc,
    Xytcz,
}

impl DimensionOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Xyzct => "XYZCT",
            Self::Xyztc => "XYZTC",
            Self::Xyczt => "XYCZT",
            Self::Xyctz => "XYCTZ",
            Self::Xytzc => "XYTZC",
            Self::Xytcz => "XYTCZ",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "XYZCT" => Some(Self::Xyzct),
            "XYZTC" => Some(Self::Xyztc),
            "XYCZT" => Some(Self::Xyczt),
            "XYCTZ" => Some(Self::Xyctz),
            "XYTZC" => Some(Self::Xytzc),
            "XYTCZ" => Some(Self::Xytcz),
            _ => None,
        }
    }
}

/// A physical length with its unit symbol (micrometres when absent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Length {
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Length {
    pub fn microns(value: f64) -> Self {
        Self {
            value,
            unit: Some("µm".to_string()),
        }
    }
}

/// Physical pixel calibration along X, Y and Z.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub x: Option<Length>,
    pub y: Option<Length>,
    pub z: Option<Length>,
}

/// Packed signed RGBA display color, kept opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Color(pub i32);

impl Color {
    pub fn from_rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Color(i32::from_be_bytes([r, g, b, a]))
    }

    pub fn rgba(&self) -> (u8, u8, u8, u8) {
        let [r, g, b, a] = self.0.to_be_bytes();
        (r, g, b, a)
    }
}

/// One entry of the channel table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Channel index within the source acquisition.
    pub index: u32,
    pub samples_per_pixel: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<Color>,
}

impl ChannelInfo {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            samples_per_pixel: 1,
            name: None,
            color: None,
        }
    }
}

/// Reference from a frame descriptor to the file holding its planes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UuidRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub value: String,
}

/// Per-plane frame descriptor (which IFD of which file holds which planes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TiffData {
    pub ifd: u32,
    pub plane_count: u32,
    pub first_c: u32,
    pub first_t: u32,
    pub first_z: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<UuidRef>,
}

impl TiffData {
    /// Descriptor for a single plane at `first_z`, stored in IFD `ifd`.
    pub fn single_plane(ifd: u32, first_z: u32, uuid: Option<UuidRef>) -> Self {
        Self {
            ifd,
            plane_count: 1,
            first_c: 0,
            first_t: 0,
            first_z,
            uuid,
        }
    }
}

/// Acquisition metadata of one image file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionMetadata {
    /// The file's own UUID (`urn:uuid:...`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    pub size_x: u32,
    pub size_y: u32,
    pub size_z: u32,
    pub size_c: u32,
    pub size_t: u32,
    pub calibration: Calibration,
    pub pixel_type: PixelType,
    pub dimension_order: DimensionOrder,
    pub big_endian: bool,
    pub channels: Vec<ChannelInfo>,
    pub tiff_data: Vec<TiffData>,
}

impl AcquisitionMetadata {
    /// A single-plane, single-channel record of the given geometry.
    pub fn new(size_x: u32, size_y: u32, pixel_type: PixelType) -> Self {
        Self {
            uuid: None,
            image_name: None,
            size_x,
            size_y,
            size_z: 1,
            size_c: 1,
            size_t: 1,
            calibration: Calibration::default(),
            pixel_type,
            dimension_order: DimensionOrder::Xyczt,
            big_endian: false,
            channels: vec![ChannelInfo::new(0)],
            tiff_data: Vec::new(),
        }
    }

    /// Generate a fresh file UUID in URN form.
    pub fn new_file_uuid() -> String {
        format!("urn:uuid:{}", Uuid::new_v4())
    }

    /// Channel table padded to `size_c` entries.
    ///
    /// Files that declare more channels than they describe get default
    /// entries for the missing indices.
    pub fn channel_table(&self) -> Vec<ChannelInfo> {
        let mut table = self.channels.clone();
        for index in table.len() as u32..self.size_c {
            table.push(ChannelInfo::new(index));
        }
        table
    }

    /// Replace the channel table with one channel.
    pub fn set_single_channel(&mut self, channel: &ChannelInfo) {
        self.size_c = 1;
        self.channels = vec![channel.clone()];
    }

    /// Total number of planes described (Z × C × T).
    pub fn plane_count(&self) -> usize {
        self.size_z as usize * self.size_c as usize * self.size_t as usize
    }

    /// Raw byte length of one plane.
    pub fn plane_bytes(&self) -> usize {
        self.size_x as usize * self.size_y as usize * self.pixel_type.bytes_per_pixel()
    }

    /// Linear plane index of (z, c, t) under this record's dimension order.
    pub fn plane_index(&self, z: u32, c: u32, t: u32) -> usize {
        let (z, c, t) = (z as usize, c as usize, t as usize);
        let (sz, sc, st) = (
            self.size_z as usize,
            self.size_c as usize,
            self.size_t as usize,
        );
        // innermost axis first
        let axes = match self.dimension_order {
            DimensionOrder::Xyzct => [(z, sz), (c, sc), (t, st)],
            DimensionOrder::Xyztc => [(z, sz), (t, st), (c, sc)],
            DimensionOrder::Xyczt => [(c, sc), (z, sz), (t, st)],
            DimensionOrder::Xyctz => [(c, sc), (t, st), (z, sz)],
            DimensionOrder::Xytzc => [(t, st), (z, sz), (c, sc)],
            DimensionOrder::Xytcz => [(t, st), (c, sc), (z, sz)],
        };
        axes[0].0 + axes[0].1 * (axes[1].0 + axes[1].1 * axes[2].0)
    }

    /// Frame descriptor reference to this file.
    pub fn uuid_ref(&self) -> Option<UuidRef> {
        self.uuid.as_ref().map(|value| UuidRef {
            file_name: self.image_name.clone(),
            value: value.clone(),
        })
    }
}
