//! Run orchestration: unpack the HWPX archive into a scratch area, run the
//! binary and inline passes, pack the result into a new archive.
//!
//! A run is strictly sequential. It either finishes with [`RunStatistics`] or
//! fails with a [`CompressError`]; in both cases the scratch area is removed.
//! After a failure while writing the output archive, the partial output file
//! is deleted as well.

use crate::{bindata, contents};
use crate::{
    CompressError, CompressionConfig, Progress, Reporter, RunStatistics, Stage, HWPX_EXTENSION,
};
use log::{debug, error, info, warn};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Seek, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Entry that must come first in the archive, stored uncompressed
pub const MIMETYPE_ENTRY: &str = "mimetype";

/// Written into every scratch directory this crate creates. A directory
/// without it is never deleted.
const SCRATCH_MARKER: &str = ".hwpx-image-compress";
/// Subdirectory of the scratch area that holds the unpacked archive
const PACKAGE_DIR: &str = "package";

/// `report.hwpx` -> `report_compressed.hwpx`, next to the input
pub fn derive_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    input.with_file_name(format!("{}_compressed.{}", stem, HWPX_EXTENSION))
}

/// Reject anything that doesn't carry the `.hwpx` extension
pub fn validate_input(input: &Path) -> Result<(), CompressError> {
    let is_hwpx = input
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(HWPX_EXTENSION))
        .unwrap_or(false);
    if is_hwpx {
        Ok(())
    } else {
        Err(CompressError::InvalidInput(input.to_path_buf()))
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Run-exclusive scratch directory, removed again when dropped
pub struct ScratchArea {
    dir: PathBuf,
    root: PathBuf,
}

impl ScratchArea {
    /// Create the scratch area at `dir`, destroying what a previous run left
    /// there. Only an empty directory or one carrying this tool's marker is
    /// destroyed; any other occupant fails with
    /// [`CompressError::ScratchOccupied`].
    pub fn create(dir: &Path) -> Result<Self, CompressError> {
        if dir.exists() {
            let is_ours = dir.join(SCRATCH_MARKER).is_file();
            let is_empty = dir.is_dir()
                && fs::read_dir(dir)
                    .map_err(CompressError::io(dir))?
                    .next()
                    .is_none();
            if !is_ours && !is_empty {
                return Err(CompressError::ScratchOccupied(dir.to_path_buf()));
            }
            debug!("[Scratch] Removing previous scratch area {:?}", dir);
            fs::remove_dir_all(dir).map_err(CompressError::io(dir))?;
        }

        let root = dir.join(PACKAGE_DIR);
        fs::create_dir_all(&root).map_err(CompressError::io(&root))?;
        let marker = dir.join(SCRATCH_MARKER);
        fs::write(&marker, b"").map_err(CompressError::io(&marker))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            root,
        })
    }

    /// Directory the archive is unpacked into
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for ScratchArea {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!("[Scratch] Removed {:?}", self.dir),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("[Scratch] Could not remove {:?}: {}", self.dir, e),
        }
    }
}

/// Unpack `archive` into `root`. Returns the directory entries the archive
/// listed explicitly, without their trailing slash.
fn extract(archive: &mut ZipArchive<File>, root: &Path) -> Result<BTreeSet<String>, CompressError> {
    let explicit_dirs = archive
        .file_names()
        .filter(|name| name.ends_with('/'))
        .map(|name| name.trim_end_matches('/').to_string())
        .collect();
    archive.extract(root)?;
    Ok(explicit_dirs)
}

#[derive(Debug, PartialEq, Eq)]
enum TreeEntry {
    File(String),
    Dir { name: String, empty: bool },
}

impl TreeEntry {
    fn name(&self) -> &str {
        match self {
            TreeEntry::File(name) | TreeEntry::Dir { name, .. } => name,
        }
    }
}

/// Recursively list `dir`, with `/`-separated paths relative to the root
fn walk(dir: &Path, prefix: &str, out: &mut Vec<TreeEntry>) -> Result<(), CompressError> {
    let mut entries = fs::read_dir(dir)
        .map_err(CompressError::io(dir))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(CompressError::io(dir))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let name = format!("{}{}", prefix, entry.file_name().to_string_lossy());
        let file_type = entry.file_type().map_err(CompressError::io(&path))?;
        if file_type.is_dir() {
            let index = out.len();
            out.push(TreeEntry::Dir {
                name: name.clone(),
                empty: true,
            });
            walk(&path, &format!("{}/", name), out)?;
            let has_children = out.len() > index + 1;
            if let TreeEntry::Dir { empty, .. } = &mut out[index] {
                *empty = !has_children;
            }
        } else if file_type.is_file() {
            out.push(TreeEntry::File(name));
        } else {
            warn!("[Repack] Skipping {:?}: not a regular file", path);
        }
    }
    Ok(())
}

/// List everything under `root` in archive order: `mimetype` first, then
/// the rest sorted by path
fn package_tree(root: &Path) -> Result<Vec<TreeEntry>, CompressError> {
    let mut tree = Vec::new();
    walk(root, "", &mut tree)?;
    // Stable sort: mimetype to the front, everything else keeps walk order
    tree.sort_by_key(|entry| entry.name() != MIMETYPE_ENTRY);
    Ok(tree)
}

/// Pack everything under `root` into a new archive at `output`. Returns the
/// number of entries written.
fn repack(
    root: &Path,
    explicit_dirs: &BTreeSet<String>,
    output: &Path,
) -> Result<usize, CompressError> {
    let tree = package_tree(root)?;
    write_package(root, &tree, explicit_dirs, output)
}

/// Create `output` and write `tree` into it. A half-written file is removed
/// before the error is returned.
fn write_package(
    root: &Path,
    tree: &[TreeEntry],
    explicit_dirs: &BTreeSet<String>,
    output: &Path,
) -> Result<usize, CompressError> {
    let file = File::create(output).map_err(CompressError::io(output))?;
    match write_entries(root, tree, explicit_dirs, ZipWriter::new(file)) {
        Ok(written) => Ok(written),
        Err(e) => {
            match fs::remove_file(output) {
                Ok(()) => debug!("[Repack] Removed partial output {:?}", output),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!("[Repack] Could not remove {:?}: {}", output, err),
            }
            Err(e)
        }
    }
}

/// Relative paths are kept as they are. `mimetype` is stored and every other
/// file is deflated. Directory entries are written for directories the source
/// archive listed or that would otherwise vanish because they are empty.
fn write_entries<W: Write + Seek>(
    root: &Path,
    tree: &[TreeEntry],
    explicit_dirs: &BTreeSet<String>,
    mut zip: ZipWriter<W>,
) -> Result<usize, CompressError> {
    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    let mut written = 0;
    for entry in tree {
        match entry {
            TreeEntry::Dir { name, empty } => {
                if *empty || explicit_dirs.contains(name) {
                    zip.add_directory(format!("{}/", name), deflated)?;
                    written += 1;
                }
            }
            TreeEntry::File(name) => {
                let options = if name == MIMETYPE_ENTRY {
                    stored
                } else {
                    deflated
                };
                zip.start_file(name.clone(), options)?;
                let disk_path = root.join(name);
                let mut source = File::open(&disk_path).map_err(CompressError::io(&disk_path))?;
                io::copy(&mut source, &mut zip).map_err(CompressError::io(&disk_path))?;
                written += 1;
            }
        }
    }

    zip.finish()?;
    Ok(written)
}

fn run(
    input: &Path,
    output: &Path,
    config: &CompressionConfig,
    reporter: &mut Reporter<'_>,
    stage: &mut Stage,
) -> Result<RunStatistics, CompressError> {
    *stage = Stage::Extracting;
    reporter.emit(Stage::Extracting, 0, "Extracting HWPX archive", 0, 0);

    // Open before touching the scratch area, so an unreadable input leaves
    // nothing behind
    let file = File::open(input).map_err(CompressError::io(input))?;
    let mut archive = ZipArchive::new(file)?;
    let scratch = ScratchArea::create(&config.scratch_dir)?;
    let explicit_dirs = extract(&mut archive, scratch.root())?;
    info!("[Extract] {} entries from {:?}", archive.len(), input);
    drop(archive);

    let mut stats = RunStatistics::default();

    *stage = Stage::ProcessingBinaryAssets;
    bindata::process_bindata(scratch.root(), config.target_bytes, &mut stats, reporter)?;

    *stage = Stage::ProcessingXmlDocuments;
    contents::process_contents(scratch.root(), config.target_bytes, &mut stats, reporter)?;

    *stage = Stage::Repackaging;
    reporter.emit(Stage::Repackaging, 95, "Writing compressed HWPX", 0, 0);
    let entries = repack(scratch.root(), &explicit_dirs, output)?;
    info!("[Repack] Wrote {} entries to {:?}", entries, output);

    drop(scratch);
    stats.elapsed = reporter.elapsed();
    stats.output_path = output.to_path_buf();
    Ok(stats)
}

/// Compress every image in the HWPX file at `input`.
///
/// The result is written to `output`, or to `<stem>_compressed.hwpx` next to
/// the input when `output` is `None`. `progress` is called synchronously
/// after every image/document and at each stage change.
pub fn compress_hwpx_file(
    input: &Path,
    output: Option<&Path>,
    config: &CompressionConfig,
    progress: &mut dyn FnMut(&Progress),
) -> Result<RunStatistics, CompressError> {
    validate_input(input)?;
    if config.target_bytes == 0 {
        return Err(CompressError::InvalidTarget);
    }
    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| derive_output_path(input));
    if same_file(input, &output) {
        return Err(CompressError::OutputIsInput(output));
    }

    info!(
        "[Start] {:?} -> {:?} (target {}KB per image)",
        input,
        output,
        config.target_kilobytes()
    );

    let mut reporter = Reporter::new(progress);
    let mut stage = Stage::Idle;
    match run(input, &output, config, &mut reporter, &mut stage) {
        Ok(stats) => {
            reporter.emit(Stage::Done, 100, "Done", 0, 0);
            info!(
                "[Done] {} images compressed, {:.1}% smaller, {:.1}s",
                stats.total_compressed(),
                stats.reduction_percent(),
                stats.elapsed.as_secs_f64()
            );
            Ok(stats)
        }
        Err(e) => {
            error!("[Failed] {:?} while {}: {}", input, stage, e);
            reporter.emit(Stage::Failed, 0, e.to_string(), 0, 0);
            Err(e)
        }
    }
}

/// Compress several files one after another with the same config.
///
/// Each input gets its derived output path. A failure only affects its own
/// entry in the returned list.
pub fn compress_many(
    inputs: &[PathBuf],
    config: &CompressionConfig,
    progress: &mut dyn FnMut(&Progress),
) -> Vec<(PathBuf, Result<RunStatistics, CompressError>)> {
    inputs
        .iter()
        .map(|input| {
            let result = compress_hwpx_file(input, None, config, &mut *progress);
            (input.clone(), result)
        })
        .collect()
}
