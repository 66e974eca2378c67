//! Read-only listing of the images inside an HWPX file, for a preview of what
//! a run would touch.

use crate::bindata::is_image_file;
use crate::contents::{decode_inline, INLINE_IMAGE_KEY};
use crate::pipeline::validate_input;
use crate::{CompressError, BINDATA_DIR, CONTENTS_DIR};
use log::warn;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;
use zip::ZipArchive;

/// Where an image lives in the archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageLocation {
    /// Standalone entry, e.g. `BinData/image1.png`
    BinData { path: String },
    /// `index`-th inline image (0-based) of an XML document
    Inline { document: String, index: usize },
}

/// Information about a single image in the archive
#[derive(Debug, Clone, Serialize)]
pub struct ImageInfo {
    pub location: ImageLocation,
    /// Size in bytes (decoded size for inline images)
    pub size_bytes: u64,
    /// Detected format, e.g. "png", or "unknown"
    pub format: String,
    /// Width in pixels, 0 if the header could not be read
    pub width: u32,
    /// Height in pixels, 0 if the header could not be read
    pub height: u32,
}

impl ImageInfo {
    /// Whether a run with this budget would try to compress the image
    pub fn exceeds(&self, target_bytes: u64) -> bool {
        self.size_bytes > target_bytes
    }
}

fn describe(location: ImageLocation, data: &[u8]) -> ImageInfo {
    let format = image::guess_format(data)
        .ok()
        .and_then(|f| f.extensions_str().first().copied())
        .unwrap_or("unknown")
        .to_string();
    let (width, height) = image::ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .ok()
        .and_then(|reader| reader.into_dimensions().ok())
        .unwrap_or((0, 0));

    ImageInfo {
        location,
        size_bytes: data.len() as u64,
        format,
        width,
        height,
    }
}

fn is_direct_child<'a>(name: &'a str, dir: &str) -> Option<&'a str> {
    name.strip_prefix(dir)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|rest| !rest.is_empty() && !rest.contains('/'))
}

/// Collect the inline images of one XML document. Stops quietly at the first
/// parse error, keeping what was found so far.
fn collect_inline(document: &str, data: &[u8], images: &mut Vec<ImageInfo>) {
    let Ok(text) = std::str::from_utf8(data) else {
        warn!("[Inspect] {} is not UTF-8", document);
        return;
    };

    let mut reader = Reader::from_str(text);
    let mut index = 0;
    loop {
        match reader.read_event() {
            Ok(Event::Eof) => break,
            Ok(Event::Start(start)) | Ok(Event::Empty(start)) => {
                for attr in start.attributes().flatten() {
                    if attr.key.as_ref() != INLINE_IMAGE_KEY {
                        continue;
                    }
                    let Ok(value) = attr.unescape_value() else {
                        continue;
                    };
                    if let Some(decoded) = decode_inline(&value) {
                        let location = ImageLocation::Inline {
                            document: document.to_string(),
                            index,
                        };
                        images.push(describe(location, &decoded));
                        index += 1;
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("[Inspect] Stopped reading {}: {}", document, e);
                break;
            }
        }
    }
}

/// List every BinData image and every inline XML image in `path`, in archive
/// order.
pub fn inspect_hwpx(path: &Path) -> Result<Vec<ImageInfo>, CompressError> {
    validate_input(path)?;
    let file = File::open(path).map_err(CompressError::io(path))?;
    let mut archive = ZipArchive::new(file)?;

    let mut images = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let is_asset = is_direct_child(&name, BINDATA_DIR).is_some_and(is_image_file);
        let is_document =
            is_direct_child(&name, CONTENTS_DIR).is_some_and(|rest| rest.ends_with(".xml"));
        if !is_asset && !is_document {
            continue;
        }

        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(CompressError::io(Path::new(&name)))?;
        if is_asset {
            images.push(describe(ImageLocation::BinData { path: name }, &data));
        } else {
            collect_inline(&name, &data, &mut images);
        }
    }

    Ok(images)
}
