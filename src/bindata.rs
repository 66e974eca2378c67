//! Binary asset pass: re-encodes the standalone images under `BinData/`.

use crate::codec::{compress_image, CompressionOutcome};
use crate::{CompressError, Reporter, RunStatistics, Stage, BINDATA_DIR};
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};

/// File extensions treated as images, compared case-insensitively
pub const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "gif"];

/// Share of the overall progress bar covered by this pass
pub(crate) const PROGRESS_SPAN: usize = 80;

/// A standalone image inside the unpacked archive
#[derive(Debug, Clone)]
pub struct ImageAsset {
    /// Path relative to the archive root, e.g. `BinData/image1.png`
    pub archive_path: String,
    /// Location on disk inside the scratch area
    pub disk_path: PathBuf,
    pub original_len: u64,
}

impl ImageAsset {
    pub fn file_name(&self) -> &str {
        self.archive_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.archive_path)
    }
}

/// Check whether a file name carries one of [`IMAGE_EXTENSIONS`]
pub fn is_image_file(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

/// List the images directly under `<root>/BinData`, largest first.
///
/// A missing `BinData` directory yields an empty list.
pub fn collect_assets(root: &Path) -> Result<Vec<ImageAsset>, CompressError> {
    let dir = root.join(BINDATA_DIR);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut assets = Vec::new();
    for entry in fs::read_dir(&dir).map_err(CompressError::io(&dir))? {
        let entry = entry.map_err(CompressError::io(&dir))?;
        let disk_path = entry.path();
        let metadata = entry.metadata().map_err(CompressError::io(&disk_path))?;
        if !metadata.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_image_file(&name) {
            continue;
        }
        assets.push(ImageAsset {
            archive_path: format!("{}/{}", BINDATA_DIR, name),
            disk_path,
            original_len: metadata.len(),
        });
    }

    // Largest first so the slow work shows up early in the progress bar
    assets.sort_by(|a, b| {
        b.original_len
            .cmp(&a.original_len)
            .then_with(|| a.archive_path.cmp(&b.archive_path))
    });
    Ok(assets)
}

/// Compress every BinData image larger than `target_bytes`, in place.
///
/// Images at or below the budget, and images the codec can't decode, are
/// counted as skipped and left byte-for-byte as they were.
pub(crate) fn process_bindata(
    root: &Path,
    target_bytes: u64,
    stats: &mut RunStatistics,
    reporter: &mut Reporter<'_>,
) -> Result<(), CompressError> {
    let assets = collect_assets(root)?;
    let total = assets.len();
    info!("[BinData] Found {} images", total);

    for (idx, asset) in assets.iter().enumerate() {
        let size_mb = asset.original_len as f64 / (1024.0 * 1024.0);
        reporter.emit(
            Stage::ProcessingBinaryAssets,
            (idx * PROGRESS_SPAN / total) as u8,
            format!("BinData image: {} ({:.2}MB)", asset.file_name(), size_mb),
            idx + 1,
            total,
        );

        let data = fs::read(&asset.disk_path).map_err(CompressError::io(&asset.disk_path))?;
        let original_len = data.len() as u64;
        stats.bindata_original_bytes += original_len;

        if original_len <= target_bytes {
            debug!(
                "[BinData {}/{}] {}: skipped ({:.1}KB)",
                idx + 1,
                total,
                asset.archive_path,
                original_len as f64 / 1024.0
            );
            stats.bindata_final_bytes += original_len;
            stats.bindata_skipped += 1;
            continue;
        }

        let (compressed, outcome) = compress_image(&data, target_bytes);
        match outcome {
            CompressionOutcome::Compressed {
                compressed_bytes,
                strategy,
                ..
            } => {
                fs::write(&asset.disk_path, &compressed)
                    .map_err(CompressError::io(&asset.disk_path))?;
                let reduction =
                    (original_len as f64 - compressed_bytes as f64) / original_len as f64 * 100.0;
                debug!(
                    "[BinData {}/{}] {}: {:.1}KB -> {:.1}KB (-{:.1}%, {:?})",
                    idx + 1,
                    total,
                    asset.archive_path,
                    original_len as f64 / 1024.0,
                    compressed_bytes as f64 / 1024.0,
                    reduction,
                    strategy
                );
                stats.bindata_final_bytes += compressed_bytes;
                stats.bindata_compressed += 1;
            }
            CompressionOutcome::Unchanged => {
                debug!(
                    "[BinData {}/{}] {}: could not re-encode, left as-is",
                    idx + 1,
                    total,
                    asset.archive_path
                );
                stats.bindata_final_bytes += original_len;
                stats.bindata_skipped += 1;
            }
        }
    }

    Ok(())
}
