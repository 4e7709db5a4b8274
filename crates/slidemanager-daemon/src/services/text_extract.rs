//! Slide text extraction: zip entry → `<a:t>` runs → normalized text → sig.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader;
use sha2::{Digest, Sha256};
use thiserror::Error;

const ZERO_WIDTH_SPACE: char = '\u{200b}';
const TEXT_SIG_BYTES: usize = 8;

#[derive(Debug, Clone)]
pub struct PageText {
    pub raw: String,
    pub norm: String,
    /// Empty string when the normalized text is empty; downstream uses this
    /// sentinel to skip embedding entirely.
    pub sig: String,
}

#[derive(Debug, Error)]
pub enum TextExtractError {
    #[error("failed to open {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is not a readable pptx archive: {source}")]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("slide {page_no} missing from {path}")]
    SlideMissing { path: PathBuf, page_no: u32 },
    #[error("slide {page_no} xml malformed: {source}")]
    Xml {
        page_no: u32,
        #[source]
        source: quick_xml::Error,
    },
}

/// Extract raw, normalized, and signed text for one slide (1-based page_no).
pub fn extract_page_text(pptx_path: &Path, page_no: u32) -> Result<PageText, TextExtractError> {
    debug_assert!(page_no >= 1);

    let file = File::open(pptx_path).map_err(|source| TextExtractError::Archive {
        path: pptx_path.to_path_buf(),
        source,
    })?;
    let mut archive = zip::ZipArchive::new(file).map_err(|source| TextExtractError::Zip {
        path: pptx_path.to_path_buf(),
        source,
    })?;

    let entry_name = format!("ppt/slides/slide{page_no}.xml");
    let mut xml = Vec::new();
    {
        let mut entry = match archive.by_name(&entry_name) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(TextExtractError::SlideMissing {
                    path: pptx_path.to_path_buf(),
                    page_no,
                });
            }
            Err(source) => {
                return Err(TextExtractError::Zip {
                    path: pptx_path.to_path_buf(),
                    source,
                });
            }
        };
        entry
            .read_to_end(&mut xml)
            .map_err(|source| TextExtractError::Archive {
                path: pptx_path.to_path_buf(),
                source,
            })?;
    }

    let raw = extract_text_from_slide_xml(&xml)
        .map_err(|source| TextExtractError::Xml { page_no, source })?;
    let norm = normalize_text(&raw);
    let sig = fast_text_sig(&norm);
    Ok(PageText { raw, norm, sig })
}

/// Collect the leaf `<a:t>` text nodes in document order, one line per run.
pub fn extract_text_from_slide_xml(xml: &[u8]) -> Result<String, quick_xml::Error> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut depth_in_text = 0usize;
    let mut parts: Vec<String> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            XmlEvent::Start(ref e) if e.name().as_ref() == b"a:t" => depth_in_text += 1,
            XmlEvent::End(ref e) if e.name().as_ref() == b"a:t" => {
                depth_in_text = depth_in_text.saturating_sub(1);
            }
            XmlEvent::Text(ref t) if depth_in_text > 0 => {
                parts.push(t.unescape()?.into_owned());
            }
            XmlEvent::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(parts.join("\n"))
}

/// Canonical text form: zero-width characters stripped, CRLF/CR folded to
/// LF, whitespace runs collapsed per line, empty lines dropped. Idempotent.
pub fn normalize_text(s: &str) -> String {
    let stripped: String = s.chars().filter(|c| *c != ZERO_WIDTH_SPACE).collect();
    let unified = stripped.replace("\r\n", "\n").replace('\r', "\n");
    let lines: Vec<String> = unified
        .split('\n')
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect();
    lines.join("\n")
}

/// Stable content signature: lowercase hex of the first 8 bytes of SHA-256
/// over the normalized text. Empty input returns the empty string.
pub fn fast_text_sig(norm_text: &str) -> String {
    if norm_text.is_empty() {
        return String::new();
    }
    let digest = Sha256::digest(norm_text.as_bytes());
    digest[..TEXT_SIG_BYTES]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
