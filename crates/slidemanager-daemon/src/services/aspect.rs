//! Presentation aspect-ratio detection from `ppt/presentation.xml`.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader;

const PRESENTATION_ENTRY: &str = "ppt/presentation.xml";
const EPSILON_4_3: f64 = 0.08;
const EPSILON_16_9: f64 = 0.12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aspect {
    FourThree,
    SixteenNine,
    Unknown,
}

impl Aspect {
    pub fn as_str(self) -> &'static str {
        match self {
            Aspect::FourThree => "4:3",
            Aspect::SixteenNine => "16:9",
            Aspect::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "4:3" => Aspect::FourThree,
            "16:9" => Aspect::SixteenNine,
            _ => Aspect::Unknown,
        }
    }
}

/// Decode the slide aspect from the package. Infallible: malformed packages,
/// missing elements, and zero dimensions all report `unknown` so indexing
/// can proceed.
pub fn detect_aspect_from_pptx(pptx_path: &Path) -> Aspect {
    match read_presentation_xml(pptx_path) {
        Some(xml) => detect_aspect_from_xml(&xml),
        None => Aspect::Unknown,
    }
}

fn read_presentation_xml(pptx_path: &Path) -> Option<Vec<u8>> {
    let file = File::open(pptx_path).ok()?;
    let mut archive = zip::ZipArchive::new(file).ok()?;
    let mut entry = archive.by_name(PRESENTATION_ENTRY).ok()?;
    let mut xml = Vec::new();
    entry.read_to_end(&mut xml).ok()?;
    Some(xml)
}

fn detect_aspect_from_xml(xml: &[u8]) -> Aspect {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(XmlEvent::Start(ref e)) | Ok(XmlEvent::Empty(ref e))
                if e.name().as_ref() == b"p:sldSz" =>
            {
                let mut cx = 0.0f64;
                let mut cy = 0.0f64;
                for attr in e.attributes().flatten() {
                    let value = String::from_utf8_lossy(attr.value.as_ref());
                    match attr.key.as_ref() {
                        b"cx" => cx = value.parse().unwrap_or(0.0),
                        b"cy" => cy = value.parse().unwrap_or(0.0),
                        _ => {}
                    }
                }
                return classify(cx, cy);
            }
            Ok(XmlEvent::Eof) | Err(_) => return Aspect::Unknown,
            Ok(_) => {}
        }
        buf.clear();
    }
}

fn classify(cx: f64, cy: f64) -> Aspect {
    if cx <= 0.0 || cy <= 0.0 {
        return Aspect::Unknown;
    }
    let ratio = cx / cy;
    if (ratio - 4.0 / 3.0).abs() < EPSILON_4_3 {
        return Aspect::FourThree;
    }
    if (ratio - 16.0 / 9.0).abs() < EPSILON_16_9 {
        return Aspect::SixteenNine;
    }
    Aspect::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presentation_xml(cx: &str, cy: &str) -> String {
        format!(
            r#"<?xml version="1.0"?><p:presentation xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main"><p:sldSz cx="{cx}" cy="{cy}"/></p:presentation>"#
        )
    }

    #[test]
    fn classic_sizes() {
        assert_eq!(
            detect_aspect_from_xml(presentation_xml("9144000", "6858000").as_bytes()),
            Aspect::FourThree
        );
        assert_eq!(
            detect_aspect_from_xml(presentation_xml("12192000", "6858000").as_bytes()),
            Aspect::SixteenNine
        );
    }

    #[test]
    fn odd_ratio_is_unknown() {
        assert_eq!(
            detect_aspect_from_xml(presentation_xml("10000", "10000").as_bytes()),
            Aspect::Unknown
        );
    }

    #[test]
    fn zero_or_missing_dimensions_are_unknown() {
        assert_eq!(
            detect_aspect_from_xml(presentation_xml("0", "6858000").as_bytes()),
            Aspect::Unknown
        );
        assert_eq!(
            detect_aspect_from_xml(b"<p:presentation></p:presentation>"),
            Aspect::Unknown
        );
        assert_eq!(detect_aspect_from_xml(b"not xml at all"), Aspect::Unknown);
    }

    #[test]
    fn missing_file_is_unknown() {
        assert_eq!(
            detect_aspect_from_pptx(Path::new("/no/such/file.pptx")),
            Aspect::Unknown
        );
    }
}
