//! Inline image pass: shrinks base64 images stored in the section XML under
//! `Contents/`.
//!
//! Picture objects can embed their image data directly in a `bin` attribute.
//! Those payloads are decoded, re-encoded through the codec and written back
//! as base64. A `fillImagePath` attribute, on the other hand, only points at
//! an entry in `BinData/`; the binary pass already handled that file, so it is
//! recognized here and left alone.

use crate::codec::{compress_image, CompressionOutcome};
use crate::{CompressError, Reporter, RunStatistics, Stage, CONTENTS_DIR};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::{debug, info, trace, warn};
use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};

/// Attribute holding an inline base64 image
pub const INLINE_IMAGE_KEY: &[u8] = b"bin";
/// Attribute holding a path to an image in `BinData/`
pub const IMAGE_REFERENCE_KEY: &[u8] = b"fillImagePath";
/// Inline values this short are incidental strings, not images
pub const MIN_INLINE_LEN: usize = 100;

const BOM: char = '\u{feff}';

/// Where this pass starts and how much of the progress bar it covers
pub(crate) const PROGRESS_START: usize = 80;
pub(crate) const PROGRESS_SPAN: usize = 15;

/// An XML document inside the unpacked archive
#[derive(Debug, Clone)]
pub struct ContentDocument {
    /// Path relative to the archive root, e.g. `Contents/section0.xml`
    pub archive_path: String,
    pub disk_path: PathBuf,
}

/// Result of scanning one document
#[derive(Debug, Clone)]
pub struct DocumentScan<'a> {
    /// Borrowed (byte-identical) unless an image was replaced
    pub text: Cow<'a, str>,
    pub compressed: usize,
    /// Inline images left as they were (within budget or not re-encodable)
    pub skipped: usize,
    /// Decoded size of the replaced images before compression
    pub original_bytes: u64,
    /// Decoded size of the replaced images after compression
    pub compressed_bytes: u64,
    /// False when the document did not parse and was passed through
    pub parsed: bool,
}

impl<'a> DocumentScan<'a> {
    fn untouched(text: &'a str, parsed: bool) -> Self {
        Self {
            text: Cow::Borrowed(text),
            compressed: 0,
            skipped: 0,
            original_bytes: 0,
            compressed_bytes: 0,
            parsed,
        }
    }

    pub fn is_modified(&self) -> bool {
        matches!(self.text, Cow::Owned(_))
    }
}

enum AttrKind {
    InlineImage,
    ImageReference,
    Other,
}

fn classify(key: &[u8]) -> AttrKind {
    match key {
        INLINE_IMAGE_KEY => AttrKind::InlineImage,
        IMAGE_REFERENCE_KEY => AttrKind::ImageReference,
        _ => AttrKind::Other,
    }
}

/// A replaced inline image: new base64 value plus decoded sizes
struct Shrunk {
    value: String,
    original_bytes: u64,
    compressed_bytes: u64,
}

/// Decode an inline image value. Short values and anything that isn't
/// base64 (line breaks allowed) give `None`.
pub(crate) fn decode_inline(value: &str) -> Option<Vec<u8>> {
    if value.len() <= MIN_INLINE_LEN {
        return None;
    }

    let compact: String = value.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    match STANDARD.decode(compact.as_bytes()) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            debug!("[XML] Inline value is not base64, leaving it: {}", e);
            None
        }
    }
}

/// Compress a decoded inline image when it is over budget.
///
/// Returns `None` whenever the value should stay as it is.
fn shrink_inline(decoded: &[u8], target_bytes: u64) -> Option<Shrunk> {
    if decoded.len() as u64 <= target_bytes {
        return None;
    }

    match compress_image(decoded, target_bytes) {
        (bytes, CompressionOutcome::Compressed { .. }) => Some(Shrunk {
            value: STANDARD.encode(&bytes),
            original_bytes: decoded.len() as u64,
            compressed_bytes: bytes.len() as u64,
        }),
        (_, CompressionOutcome::Unchanged) => None,
    }
}

/// Copy `start` with the inline image value swapped for `replacement`
fn rebuild_start(
    start: &BytesStart<'_>,
    attrs: &[Attribute<'_>],
    replacement: &str,
) -> Result<BytesStart<'static>, quick_xml::Error> {
    let mut rebuilt = start.clone().into_owned();
    rebuilt.clear_attributes();
    for attr in attrs {
        if attr.key.as_ref() == INLINE_IMAGE_KEY {
            rebuilt.push_attribute((INLINE_IMAGE_KEY, replacement.as_bytes()));
        } else if attr.value.contains(&b'"') {
            // Raw value came from a single-quoted attribute; the writer uses
            // double quotes, so escape it again
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            rebuilt.push_attribute((key.as_str(), value.as_str()));
        } else {
            rebuilt.push_attribute(attr.clone());
        }
    }
    Ok(rebuilt)
}

/// Parse `text`, replacing oversized inline images.
///
/// Any reader error, unbalanced tag or malformed attribute aborts with `Err`;
/// the caller then keeps the document as it was.
fn rewrite(text: &str, target_bytes: u64) -> Result<DocumentScan<'_>, String> {
    let mut reader = Reader::from_str(text);
    reader.check_end_names(true);

    let mut events: Vec<Event<'_>> = Vec::new();
    let mut depth = 0usize;
    let mut compressed = 0;
    let mut skipped = 0;
    let mut original_bytes = 0;
    let mut compressed_bytes = 0;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| format!("at byte {}: {}", reader.buffer_position(), e))?;
        match event {
            Event::Eof => break,
            Event::End(_) => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| "closing tag without an opening tag".to_string())?;
                events.push(event);
            }
            Event::Start(ref start) | Event::Empty(ref start) => {
                let is_start = matches!(event, Event::Start(_));
                let attrs = start
                    .attributes()
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| e.to_string())?;

                let mut replacement = None;
                for attr in &attrs {
                    match classify(attr.key.as_ref()) {
                        AttrKind::InlineImage => {
                            let value = attr.unescape_value().map_err(|e| e.to_string())?;
                            let Some(decoded) = decode_inline(&value) else {
                                continue;
                            };
                            match shrink_inline(&decoded, target_bytes) {
                                Some(shrunk) => {
                                    compressed += 1;
                                    original_bytes += shrunk.original_bytes;
                                    compressed_bytes += shrunk.compressed_bytes;
                                    replacement = Some(shrunk.value);
                                }
                                None => skipped += 1,
                            }
                        }
                        AttrKind::ImageReference => {
                            // Points at a BinData entry, which the binary pass
                            // has already compressed
                            trace!(
                                "[XML] Leaving image reference {}",
                                String::from_utf8_lossy(&attr.value)
                            );
                        }
                        AttrKind::Other => {}
                    }
                }

                if is_start {
                    depth += 1;
                }
                match replacement {
                    Some(value) => {
                        let rebuilt =
                            rebuild_start(start, &attrs, &value).map_err(|e| e.to_string())?;
                        events.push(if is_start {
                            Event::Start(rebuilt)
                        } else {
                            Event::Empty(rebuilt)
                        });
                    }
                    None => events.push(event.clone()),
                }
            }
            other => events.push(other),
        }
    }

    if depth != 0 {
        return Err(format!("{} element(s) left unclosed", depth));
    }
    if compressed == 0 {
        return Ok(DocumentScan {
            skipped,
            ..DocumentScan::untouched(text, true)
        });
    }

    let mut writer = Writer::new(Vec::with_capacity(text.len()));
    for event in &events {
        writer.write_event(event).map_err(|e| e.to_string())?;
    }
    let serialized = String::from_utf8(writer.into_inner()).map_err(|e| e.to_string())?;

    Ok(DocumentScan {
        text: Cow::Owned(serialized),
        compressed,
        skipped,
        original_bytes,
        compressed_bytes,
        parsed: true,
    })
}

/// Scan one XML document and shrink its inline images.
///
/// A document that fails to parse comes back unchanged with zero images and
/// `parsed == false`. An unmodified document is returned byte-identical.
pub fn scan_document(text: &str, target_bytes: u64) -> DocumentScan<'_> {
    let body = text.strip_prefix(BOM).unwrap_or(text);
    match rewrite(body, target_bytes) {
        Ok(scan) if scan.is_modified() => {
            if body.len() == text.len() {
                scan
            } else {
                DocumentScan {
                    text: Cow::Owned(format!("{}{}", BOM, scan.text)),
                    ..scan
                }
            }
        }
        Ok(scan) => DocumentScan {
            text: Cow::Borrowed(text),
            ..scan
        },
        Err(e) => {
            warn!("[XML] Could not parse document, leaving it unchanged: {}", e);
            DocumentScan::untouched(text, false)
        }
    }
}

/// List the `.xml` files directly under `<root>/Contents`, sorted by name
pub fn collect_documents(root: &Path) -> Result<Vec<ContentDocument>, CompressError> {
    let dir = root.join(CONTENTS_DIR);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut documents = Vec::new();
    for entry in fs::read_dir(&dir).map_err(CompressError::io(&dir))? {
        let entry = entry.map_err(CompressError::io(&dir))?;
        let disk_path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.ends_with(".xml") || !disk_path.is_file() {
            continue;
        }
        documents.push(ContentDocument {
            archive_path: format!("{}/{}", CONTENTS_DIR, name),
            disk_path,
        });
    }
    documents.sort_by(|a, b| a.archive_path.cmp(&b.archive_path));
    Ok(documents)
}

/// Shrink inline images in every document under `Contents/`, in place
pub(crate) fn process_contents(
    root: &Path,
    target_bytes: u64,
    stats: &mut RunStatistics,
    reporter: &mut Reporter<'_>,
) -> Result<(), CompressError> {
    let documents = collect_documents(root)?;
    let total = documents.len();
    info!("[XML] Scanning {} documents", total);

    for (idx, document) in documents.iter().enumerate() {
        reporter.emit(
            Stage::ProcessingXmlDocuments,
            (PROGRESS_START + idx * PROGRESS_SPAN / total) as u8,
            format!("XML images: {}", document.archive_path),
            idx + 1,
            total,
        );
        stats.xml_documents += 1;

        let raw = fs::read(&document.disk_path).map_err(CompressError::io(&document.disk_path))?;
        let text = match String::from_utf8(raw) {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    "[XML {}/{}] {} is not UTF-8, leaving it unchanged: {}",
                    idx + 1,
                    total,
                    document.archive_path,
                    e
                );
                stats.xml_unparsable += 1;
                continue;
            }
        };

        let scan = scan_document(&text, target_bytes);
        if !scan.parsed {
            stats.xml_unparsable += 1;
        }
        stats.xml_skipped += scan.skipped;
        if scan.is_modified() {
            fs::write(&document.disk_path, scan.text.as_bytes())
                .map_err(CompressError::io(&document.disk_path))?;
            debug!(
                "[XML {}/{}] {}: {} inline images compressed, {} skipped",
                idx + 1,
                total,
                document.archive_path,
                scan.compressed,
                scan.skipped
            );
            stats.xml_compressed += scan.compressed;
            stats.xml_original_bytes += scan.original_bytes;
            stats.xml_final_bytes += scan.compressed_bytes;
        } else {
            debug!(
                "[XML {}/{}] {}: nothing to do ({} skipped)",
                idx + 1,
                total,
                document.archive_path,
                scan.skipped
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn noise_png(width: u32, height: u32) -> Vec<u8> {
        let mut state: u32 = 0x9e37_79b9;
        let img = RgbImage::from_fn(width, height, |_, _| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            Rgb([state as u8, (state >> 8) as u8, (state >> 16) as u8])
        });
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn section_with_picture(payload: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes" ?>
<hs:sec xmlns:hs="http://www.hancom.co.kr/hwpml/2011/section" xmlns:hp="http://www.hancom.co.kr/hwpml/2011/paragraph">
  <!-- first paragraph -->
  <hp:p id="0" paraPrIDRef='0'>
    <hp:pic id="1"><hp:img bin="{}" bright="0"/></hp:pic>
    <hp:t>Text &amp; more</hp:t>
  </hp:p>
</hs:sec>"#,
            payload
        )
    }

    #[test]
    fn test_unmodified_document_is_byte_identical() {
        let xml = section_with_picture("short");
        let scan = scan_document(&xml, 1024);
        assert!(scan.parsed);
        assert!(!scan.is_modified());
        assert_eq!(scan.text, xml);
        assert_eq!(scan.compressed, 0);
    }

    #[test]
    fn test_inline_image_under_budget_left_alone() {
        let png = noise_png(16, 16);
        let payload = STANDARD.encode(&png);
        assert!(payload.len() > MIN_INLINE_LEN);
        let xml = section_with_picture(&payload);
        let scan = scan_document(&xml, png.len() as u64);
        assert!(!scan.is_modified());
        assert_eq!(scan.text, xml);
        assert_eq!(scan.skipped, 1);
    }

    #[test]
    fn test_undecodable_inline_image_counts_as_skipped() {
        let payload = STANDARD.encode(vec![0xAB; 400]);
        let xml = section_with_picture(&payload);
        let scan = scan_document(&xml, 100);
        assert!(scan.parsed);
        assert!(!scan.is_modified());
        assert_eq!((scan.compressed, scan.skipped), (0, 1));
    }

    #[test]
    fn test_mixed_document_counts_both() {
        let big = STANDARD.encode(noise_png(120, 100));
        let small = STANDARD.encode(noise_png(16, 16));
        let xml = format!(
            r#"<root><img bin="{}"/><img bin="{}"/></root>"#,
            big, small
        );
        let scan = scan_document(&xml, 8 * 1024);
        assert!(scan.is_modified());
        assert_eq!((scan.compressed, scan.skipped), (1, 1));
    }

    #[test]
    fn test_inline_image_over_budget_is_replaced() {
        let png = noise_png(120, 100);
        let target = 8 * 1024;
        assert!(png.len() as u64 > target);
        let xml = section_with_picture(&STANDARD.encode(&png));

        let scan = scan_document(&xml, target);
        assert!(scan.parsed);
        assert_eq!(scan.compressed, 1);
        assert_eq!(scan.skipped, 0);
        assert_eq!(scan.original_bytes, png.len() as u64);
        assert!(scan.compressed_bytes < scan.original_bytes);

        // Everything around the rewritten element survives
        assert!(scan.text.starts_with("<?xml version=\"1.0\""));
        assert!(scan.text.contains("<!-- first paragraph -->"));
        assert!(scan.text.contains("<hp:t>Text &amp; more</hp:t>"));
        assert!(scan.text.contains("xmlns:hp="));

        let start = scan.text.find("bin=\"").unwrap() + 5;
        let end = start + scan.text[start..].find('"').unwrap();
        let decoded = STANDARD.decode(&scan.text[start..end]).unwrap();
        assert_eq!(decoded.len() as u64, scan.compressed_bytes);
        assert!(image::load_from_memory(&decoded).is_ok());
        assert!(scan.text.contains("bright=\"0\""));
    }

    #[test]
    fn test_wrapped_base64_is_accepted() {
        let png = noise_png(120, 100);
        let encoded = STANDARD.encode(&png);
        let wrapped: Vec<String> = encoded
            .as_bytes()
            .chunks(76)
            .map(|c| String::from_utf8(c.to_vec()).unwrap())
            .collect();
        let xml = section_with_picture(&wrapped.join("\n"));
        let scan = scan_document(&xml, 8 * 1024);
        assert_eq!(scan.compressed, 1);
    }

    #[test]
    fn test_image_reference_is_not_touched() {
        let png = noise_png(120, 100);
        let payload = STANDARD.encode(&png);
        let xml = format!(
            r#"<root><fill fillImagePath="{}"/><ref fillImagePath="BinData/image1.png"/></root>"#,
            payload
        );
        let scan = scan_document(&xml, 1024);
        assert!(scan.parsed);
        assert!(!scan.is_modified());
        assert_eq!((scan.compressed, scan.skipped), (0, 0));
    }

    #[test]
    fn test_non_base64_value_is_ignored() {
        let junk = "!".repeat(MIN_INLINE_LEN + 10);
        let xml = format!(r#"<root><img bin="{}"/></root>"#, junk);
        let scan = scan_document(&xml, 10);
        assert!(scan.parsed);
        assert!(!scan.is_modified());
        assert_eq!(scan.skipped, 0);
    }

    #[test]
    fn test_malformed_documents_pass_through() {
        for xml in [
            "<root><a></b></root>",
            "<root><unclosed>",
            "</stray>",
            r#"<root a="1" a="2"/>"#,
        ] {
            let scan = scan_document(xml, 10);
            assert!(!scan.parsed, "should reject {}", xml);
            assert_eq!(scan.text, xml);
            assert_eq!(scan.compressed, 0);
        }
    }

    #[test]
    fn test_bom_is_preserved() {
        let png = noise_png(120, 100);
        let xml = format!(
            "{}<root><img bin=\"{}\"/></root>",
            BOM,
            STANDARD.encode(&png)
        );
        let scan = scan_document(&xml, 8 * 1024);
        assert_eq!(scan.compressed, 1);
        assert!(scan.text.starts_with(BOM));
    }
}
