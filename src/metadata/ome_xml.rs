//! OME-XML serialization of [`AcquisitionMetadata`].
//!
//! Only the first `Image` of a document is read. Elements the model does not
//! cover (instruments, annotations, ...) are skipped on parse and are not
//! written back.

use std::borrow::Cow;

use quick_xml::events::attributes::Attributes;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use super::{
    AcquisitionMetadata, Calibration, ChannelInfo, Color, DimensionOrder, Length, PixelType,
    TiffData, UuidRef,
};
use crate::error::{Result, StitchError};

const OME_NAMESPACE: &str = "http://www.openmicroscopy.org/Schemas/OME/2016-06";

fn xml_error(reason: impl ToString) -> StitchError {
    StitchError::InvalidXml {
        reason: reason.to_string(),
    }
}

/// Serialize `meta` to the OME-XML text embedded in image files.
pub fn dump(meta: &AcquisitionMetadata) -> Result<String> {
    let mut writer = Writer::new(Vec::new());

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_error)?;

    let mut ome = BytesStart::new("OME");
    ome.push_attribute(("xmlns", OME_NAMESPACE));
    if let Some(uuid) = &meta.uuid {
        ome.push_attribute(("UUID", uuid.as_str()));
    }
    writer.write_event(Event::Start(ome)).map_err(xml_error)?;

    let mut image = BytesStart::new("Image");
    image.push_attribute(("ID", "Image:0"));
    if let Some(name) = &meta.image_name {
        image.push_attribute(("Name", name.as_str()));
    }
    writer.write_event(Event::Start(image)).map_err(xml_error)?;

    writer
        .write_event(Event::Start(pixels_element(meta)))
        .map_err(xml_error)?;

    for channel in &meta.channels {
        let mut element = BytesStart::new("Channel");
        element.push_attribute(("ID", format!("Channel:0:{}", channel.index).as_str()));
        if let Some(name) = &channel.name {
            element.push_attribute(("Name", name.as_str()));
        }
        element.push_attribute((
            "SamplesPerPixel",
            channel.samples_per_pixel.to_string().as_str(),
        ));
        if let Some(color) = channel.color {
            element.push_attribute(("Color", color.0.to_string().as_str()));
        }
        writer.write_event(Event::Empty(element)).map_err(xml_error)?;
    }

    for data in &meta.tiff_data {
        let mut element = BytesStart::new("TiffData");
        element.push_attribute(("FirstC", data.first_c.to_string().as_str()));
        element.push_attribute(("FirstT", data.first_t.to_string().as_str()));
        element.push_attribute(("FirstZ", data.first_z.to_string().as_str()));
        element.push_attribute(("IFD", data.ifd.to_string().as_str()));
        element.push_attribute(("PlaneCount", data.plane_count.to_string().as_str()));

        match &data.uuid {
            Some(uuid) => {
                writer.write_event(Event::Start(element)).map_err(xml_error)?;
                let mut uuid_element = BytesStart::new("UUID");
                if let Some(file_name) = &uuid.file_name {
                    uuid_element.push_attribute(("FileName", file_name.as_str()));
                }
                writer
                    .write_event(Event::Start(uuid_element))
                    .map_err(xml_error)?;
                writer
                    .write_event(Event::Text(BytesText::new(&uuid.value)))
                    .map_err(xml_error)?;
                writer
                    .write_event(Event::End(BytesEnd::new("UUID")))
                    .map_err(xml_error)?;
                writer
                    .write_event(Event::End(BytesEnd::new("TiffData")))
                    .map_err(xml_error)?;
            }
            None => writer.write_event(Event::Empty(element)).map_err(xml_error)?,
        }
    }

    for name in ["Pixels", "Image", "OME"] {
        writer
            .write_event(Event::End(BytesEnd::new(name)))
            .map_err(xml_error)?;
    }

    let xml = String::from_utf8(writer.into_inner()).map_err(xml_error)?;
    Ok(escape_non_ascii(xml))
}

/// TIFF ASCII fields are 7-bit: emit anything else as character references.
fn escape_non_ascii(xml: String) -> String {
    if xml.is_ascii() {
        return xml;
    }
    let mut escaped = String::with_capacity(xml.len() + 16);
    for ch in xml.chars() {
        if ch.is_ascii() {
            escaped.push(ch);
        } else {
            escaped.push_str(&format!("&#{};", ch as u32));
        }
    }
    escaped
}

fn pixels_element(meta: &AcquisitionMetadata) -> BytesStart<'static> {
    let mut pixels = BytesStart::new("Pixels");
    pixels.push_attribute(("ID", "Pixels:0"));
    pixels.push_attribute(("DimensionOrder", meta.dimension_order.as_str()));
    pixels.push_attribute(("Type", meta.pixel_type.as_str()));
    pixels.push_attribute(("BigEndian", if meta.big_endian { "true" } else { "false" }));
    pixels.push_attribute(("SizeX", meta.size_x.to_string().as_str()));
    pixels.push_attribute(("SizeY", meta.size_y.to_string().as_str()));
    pixels.push_attribute(("SizeZ", meta.size_z.to_string().as_str()));
    pixels.push_attribute(("SizeC", meta.size_c.to_string().as_str()));
    pixels.push_attribute(("SizeT", meta.size_t.to_string().as_str()));

    let axes = [
        ("PhysicalSizeX", &meta.calibration.x),
        ("PhysicalSizeY", &meta.calibration.y),
        ("PhysicalSizeZ", &meta.calibration.z),
    ];
    for (attribute, length) in axes {
        if let Some(length) = length {
            pixels.push_attribute((attribute, length.value.to_string().as_str()));
            if let Some(unit) = &length.unit {
                let unit_attribute = format!("{}Unit", attribute);
                pixels.push_attribute((unit_attribute.as_str(), unit.as_str()));
            }
        }
    }
    pixels
}

/// Attribute map of one element, keyed by local name.
struct AttributeMap(Vec<(String, String)>);

impl AttributeMap {
    fn read(attributes: Attributes<'_>) -> Result<Self> {
        let mut pairs = Vec::new();
        for attribute in attributes {
            let attribute = attribute.map_err(xml_error)?;
            let key = String::from_utf8_lossy(attribute.key.local_name().as_ref()).to_string();
            let value = attribute.unescape_value().map_err(xml_error)?.to_string();
            pairs.push((key, value));
        }
        Ok(Self(pairs))
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn number<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| xml_error(format!("attribute {}='{}' is not a number", key, raw))),
        }
    }

    fn required<T: std::str::FromStr>(&self, element: &str, key: &str) -> Result<T> {
        self.number(key)?
            .ok_or_else(|| xml_error(format!("{} is missing {}", element, key)))
    }

    fn length(&self, key: &str) -> Result<Option<Length>> {
        Ok(self.number::<f64>(key)?.map(|value| Length {
            value,
            unit: self.get(&format!("{}Unit", key)).map(str::to_string),
        }))
    }
}

/// Which element of interest the parser is currently inside.
#[derive(Default)]
struct ParseState {
    images_seen: usize,
    in_first_image: bool,
    pending_tiff_data: Option<TiffData>,
    pending_uuid: Option<(Option<String>, String)>,
}

/// Parse embedded OME-XML text.
pub fn parse(xml: &str) -> Result<AcquisitionMetadata> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut state = ParseState::default();
    let mut file_uuid: Option<String> = None;
    let mut image_name: Option<String> = None;
    let mut meta: Option<AcquisitionMetadata> = None;

    loop {
        let event = reader.read_event().map_err(xml_error)?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                let local = e.local_name();
                match local.as_ref() {
                    b"OME" => {
                        file_uuid = AttributeMap::read(e.attributes())?
                            .get("UUID")
                            .map(str::to_string);
                    }
                    b"Image" => {
                        state.images_seen += 1;
                        state.in_first_image = state.images_seen == 1 && !is_empty;
                        if state.images_seen == 1 {
                            image_name = AttributeMap::read(e.attributes())?
                                .get("Name")
                                .map(str::to_string);
                        }
                    }
                    b"Pixels" if state.in_first_image => {
                        let attributes = AttributeMap::read(e.attributes())?;
                        meta = Some(parse_pixels(&attributes)?);
                    }
                    b"Channel" if state.in_first_image => {
                        let attributes = AttributeMap::read(e.attributes())?;
                        if let Some(meta) = meta.as_mut() {
                            let position = meta.channels.len() as u32;
                            meta.channels.push(parse_channel(&attributes, position)?);
                        }
                    }
                    b"TiffData" if state.in_first_image => {
                        let attributes = AttributeMap::read(e.attributes())?;
                        let data = parse_tiff_data(&attributes)?;
                        if is_empty {
                            if let Some(meta) = meta.as_mut() {
                                meta.tiff_data.push(data);
                            }
                        } else {
                            state.pending_tiff_data = Some(data);
                        }
                    }
                    b"UUID" if state.pending_tiff_data.is_some() && !is_empty => {
                        let attributes = AttributeMap::read(e.attributes())?;
                        state.pending_uuid =
                            Some((attributes.get("FileName").map(str::to_string), String::new()));
                    }
                    _ => {}
                }
            }
            Event::Text(e) => {
                if let Some((_, value)) = state.pending_uuid.as_mut() {
                    let text: Cow<'_, str> = e.unescape().map_err(xml_error)?;
                    value.push_str(text.trim());
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"UUID" => {
                    if let (Some((file_name, value)), Some(data)) = (
                        state.pending_uuid.take(),
                        state.pending_tiff_data.as_mut(),
                    ) {
                        data.uuid = Some(UuidRef { file_name, value });
                    }
                }
                b"TiffData" => {
                    if let (Some(data), Some(meta)) =
                        (state.pending_tiff_data.take(), meta.as_mut())
                    {
                        meta.tiff_data.push(data);
                    }
                }
                b"Image" => state.in_first_image = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    let mut meta = meta.ok_or_else(|| xml_error("document has no Pixels element"))?;
    meta.uuid = file_uuid;
    meta.image_name = image_name;
    Ok(meta)
}

fn parse_pixels(attributes: &AttributeMap) -> Result<AcquisitionMetadata> {
    let pixel_type = attributes
        .get("Type")
        .ok_or_else(|| xml_error("Pixels is missing Type"))?;
    let pixel_type = PixelType::from_str(pixel_type)
        .ok_or_else(|| xml_error(format!("unsupported pixel type '{}'", pixel_type)))?;

    let order = attributes
        .get("DimensionOrder")
        .ok_or_else(|| xml_error("Pixels is missing DimensionOrder"))?;
    let dimension_order = DimensionOrder::from_str(order)
        .ok_or_else(|| xml_error(format!("unknown dimension order '{}'", order)))?;

    Ok(AcquisitionMetadata {
        uuid: None,
        image_name: None,
        size_x: attributes.required("Pixels", "SizeX")?,
        size_y: attributes.required("Pixels", "SizeY")?,
        size_z: attributes.required("Pixels", "SizeZ")?,
        size_c: attributes.required("Pixels", "SizeC")?,
        size_t: attributes.required("Pixels", "SizeT")?,
        calibration: Calibration {
            x: attributes.length("PhysicalSizeX")?,
            y: attributes.length("PhysicalSizeY")?,
            z: attributes.length("PhysicalSizeZ")?,
        },
        pixel_type,
        dimension_order,
        big_endian: attributes
            .get("BigEndian")
            .is_some_and(|v| v.eq_ignore_ascii_case("true")),
        channels: Vec::new(),
        tiff_data: Vec::new(),
    })
}

fn parse_channel(attributes: &AttributeMap, position: u32) -> Result<ChannelInfo> {
    // IDs look like "Channel:<image>:<channel>"
    let index = attributes
        .get("ID")
        .and_then(|id| id.rsplit(':').next())
        .and_then(|last| last.parse::<u32>().ok())
        .unwrap_or(position);

    Ok(ChannelInfo {
        index,
        samples_per_pixel: attributes.number("SamplesPerPixel")?.unwrap_or(1),
        name: attributes.get("Name").map(str::to_string),
        color: attributes.number::<i32>("Color")?.map(Color),
    })
}

fn parse_tiff_data(attributes: &AttributeMap) -> Result<TiffData> {
    Ok(TiffData {
        ifd: attributes.number("IFD")?.unwrap_or(0),
        plane_count: attributes.number("PlaneCount")?.unwrap_or(1),
        first_c: attributes.number("FirstC")?.unwrap_or(0),
        first_t: attributes.number("FirstT")?.unwrap_or(0),
        first_z: attributes.number("FirstZ")?.unwrap_or(0),
        uuid: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> AcquisitionMetadata {
        let mut meta = AcquisitionMetadata::new(512, 256, PixelType::Uint16);
        meta.uuid = Some("urn:uuid:6b1d0a5e-3a1f-4f55-9d7e-2f0c8f2b7a11".to_string());
        meta.image_name = Some("example stitch <Z0> & more".to_string());
        meta.size_z = 12;
        meta.size_c = 2;
        meta.size_t = 9;
        meta.calibration = Calibration {
            x: Some(Length::microns(0.1625)),
            y: Some(Length::microns(0.1625)),
            z: Some(Length {
                value: 1.5,
                unit: None,
            }),
        };
        meta.channels = vec![
            ChannelInfo {
                index: 0,
                samples_per_pixel: 1,
                name: Some("DAPI".to_string()),
                color: Some(Color::from_rgba(0, 0, 255, 255)),
            },
            ChannelInfo {
                index: 1,
                samples_per_pixel: 1,
                name: Some("GFP".to_string()),
                color: Some(Color(-16711681)),
            },
        ];
        meta.tiff_data = vec![
            TiffData::single_plane(
                0,
                0,
                Some(UuidRef {
                    file_name: Some("a.ome.tif".to_string()),
                    value: "urn:uuid:0000".to_string(),
                }),
            ),
            TiffData::single_plane(1, 1, None),
        ];
        meta
    }

    #[test]
    fn test_dump_parse_round_trip() {
        let meta = sample();
        let xml = dump(&meta).unwrap();
        let parsed = parse(&xml).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn test_dump_is_stable() {
        let meta = sample();
        let first = dump(&meta).unwrap();
        let second = dump(&parse(&first).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_dump_is_ascii() {
        let meta = sample();
        let xml = dump(&meta).unwrap();
        assert!(xml.is_ascii());
        assert!(xml.contains("PhysicalSizeXUnit=\"&#181;m\""));
    }

    #[test]
    fn test_parse_prefixed_document() {
        let xml = r#"<?xml version="1.0"?>
            <ome:OME xmlns:ome="http://www.openmicroscopy.org/Schemas/OME/2016-06">
              <ome:Image ID="Image:0">
                <ome:Pixels ID="Pixels:0" DimensionOrder="XYZCT" Type="uint8"
                    SizeX="8" SizeY="4" SizeZ="1" SizeC="2" SizeT="1">
                  <ome:Channel ID="Channel:0:1" Name="RFP"/>
                </ome:Pixels>
              </ome:Image>
              <ome:Image ID="Image:1">
                <ome:Pixels ID="Pixels:1" DimensionOrder="XYCZT" Type="uint16"
                    SizeX="1" SizeY="1" SizeZ="1" SizeC="1" SizeT="1"/>
              </ome:Image>
            </ome:OME>"#;

        let meta = parse(xml).unwrap();
        assert_eq!(meta.size_x, 8);
        assert_eq!(meta.pixel_type, PixelType::Uint8);
        assert_eq!(meta.dimension_order, DimensionOrder::Xyzct);
        assert_eq!(meta.channels.len(), 1);
        assert_eq!(meta.channels[0].index, 1);
        assert_eq!(meta.channels[0].samples_per_pixel, 1);
        assert_eq!(meta.calibration, Calibration::default());
    }

    #[test]
    fn test_parse_missing_pixels() {
        let err = parse(r#"<OME><Image ID="Image:0"/></OME>"#).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_XML");
    }

    #[test]
    fn test_parse_bad_size() {
        let xml = r#"<OME><Image><Pixels DimensionOrder="XYCZT" Type="uint8"
            SizeX="wide" SizeY="1" SizeZ="1" SizeC="1" SizeT="1"/></Image></OME>"#;
        assert!(parse(xml).is_err());
    }
}
