//! HWPX Image Compressor Library
//!
//! Core logic for shrinking the images embedded in HWPX documents. Shared
//! between the CLI and any other front end.
//!
//! An HWPX file is a ZIP container. Standalone images live under `BinData/`,
//! and the section XML under `Contents/` may carry base64 images inline. Both
//! kinds are re-encoded as JPEG until each one fits a per-image byte budget,
//! then the container is packed again with the same entry layout.

pub mod bindata;
pub mod codec;
pub mod contents;
pub mod inspect;
pub mod pipeline;

pub use codec::{compress_image, CompressionOutcome, CompressionStrategy};
pub use pipeline::{compress_hwpx_file, compress_many, derive_output_path};

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Directory holding standalone image entries
pub const BINDATA_DIR: &str = "BinData";
/// Directory holding the section XML documents
pub const CONTENTS_DIR: &str = "Contents";
/// File extension every input must carry
pub const HWPX_EXTENSION: &str = "hwpx";

/// Options for a compression run
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Per-image byte ceiling, applied to binary and inline images alike
    pub target_bytes: u64,
    /// Where the archive is unpacked while it is processed. Only one run may
    /// use a given path at a time.
    pub scratch_dir: PathBuf,
}

impl CompressionConfig {
    /// Build a config from a target size in kilobytes (1 KB = 1024 bytes)
    pub fn from_kilobytes(kilobytes: u64) -> Result<Self, CompressError> {
        if kilobytes == 0 {
            return Err(CompressError::InvalidTarget);
        }
        Ok(Self {
            target_bytes: kilobytes * 1024,
            ..Self::default()
        })
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn target_kilobytes(&self) -> u64 {
        self.target_bytes / 1024
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            target_bytes: SizePreset::Medium.kilobytes() * 1024,
            scratch_dir: std::env::temp_dir().join("hwpx_image_compress"),
        }
    }
}

/// Target sizes offered to users who don't want to pick a number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizePreset {
    Tiny,
    Small,
    Medium,
    Large,
    Huge,
}

impl SizePreset {
    pub const ALL: [SizePreset; 5] = [
        SizePreset::Tiny,
        SizePreset::Small,
        SizePreset::Medium,
        SizePreset::Large,
        SizePreset::Huge,
    ];

    pub fn kilobytes(self) -> u64 {
        match self {
            SizePreset::Tiny => 50,
            SizePreset::Small => 100,
            SizePreset::Medium => 200,
            SizePreset::Large => 500,
            SizePreset::Huge => 1000,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SizePreset::Tiny => "tiny",
            SizePreset::Small => "small",
            SizePreset::Medium => "medium",
            SizePreset::Large => "large",
            SizePreset::Huge => "huge",
        }
    }
}

impl FromStr for SizePreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SizePreset::ALL
            .into_iter()
            .find(|preset| preset.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                let names: Vec<_> = SizePreset::ALL.iter().map(|p| p.name()).collect();
                format!("unknown preset '{}' (expected one of: {})", s, names.join(", "))
            })
    }
}

/// Error type for compression runs
#[derive(Debug, Error)]
pub enum CompressError {
    #[error("Not an HWPX file: {}", .0.display())]
    InvalidInput(PathBuf),
    #[error("Target size must be greater than zero")]
    InvalidTarget,
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("Output would overwrite the input file: {}", .0.display())]
    OutputIsInput(PathBuf),
    #[error("Scratch directory {} holds files this tool did not create", .0.display())]
    ScratchOccupied(PathBuf),
}

impl CompressError {
    /// Adapter for `map_err` that attaches the path being worked on
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> CompressError + '_ {
        move |source| CompressError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Pipeline states, in the order a run moves through them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Idle,
    Extracting,
    ProcessingBinaryAssets,
    ProcessingXmlDocuments,
    Repackaging,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Extracting => "extracting",
            Stage::ProcessingBinaryAssets => "processing binary assets",
            Stage::ProcessingXmlDocuments => "processing XML documents",
            Stage::Repackaging => "repackaging",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A progress event, emitted after every asset/document and at stage changes
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub stage: Stage,
    /// 0-100. Monotonic within a stage.
    pub percent: u8,
    pub label: String,
    /// 1-based index of the item just started, 0 at milestones
    pub current: usize,
    pub total: usize,
    pub elapsed_secs: u64,
}

/// Wraps the caller's progress callback together with the run's start time
pub(crate) struct Reporter<'a> {
    started: Instant,
    sink: &'a mut dyn FnMut(&Progress),
}

impl<'a> Reporter<'a> {
    pub(crate) fn new(sink: &'a mut dyn FnMut(&Progress)) -> Self {
        Self {
            started: Instant::now(),
            sink,
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn emit(
        &mut self,
        stage: Stage,
        percent: u8,
        label: impl Into<String>,
        current: usize,
        total: usize,
    ) {
        let event = Progress {
            stage,
            percent: percent.min(100),
            label: label.into(),
            current,
            total,
            elapsed_secs: self.started.elapsed().as_secs(),
        };
        (self.sink)(&event);
    }
}

/// Counts and byte totals accumulated over one run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStatistics {
    /// BinData images that were re-encoded
    pub bindata_compressed: usize,
    /// BinData images left as they were (already small or undecodable)
    pub bindata_skipped: usize,
    /// Size of every BinData image before the run
    pub bindata_original_bytes: u64,
    /// Size of every BinData image after the run
    pub bindata_final_bytes: u64,
    /// XML documents looked at
    pub xml_documents: usize,
    /// XML documents left untouched because they did not parse
    pub xml_unparsable: usize,
    /// Inline images that were re-encoded
    pub xml_compressed: usize,
    /// Inline images left as they were (already small or undecodable)
    pub xml_skipped: usize,
    /// Decoded size of the re-encoded inline images before the run
    pub xml_original_bytes: u64,
    /// Decoded size of the re-encoded inline images after the run
    pub xml_final_bytes: u64,
    pub elapsed: Duration,
    pub output_path: PathBuf,
}

impl RunStatistics {
    pub fn total_compressed(&self) -> usize {
        self.bindata_compressed + self.xml_compressed
    }

    pub fn original_bytes(&self) -> u64 {
        self.bindata_original_bytes + self.xml_original_bytes
    }

    pub fn final_bytes(&self) -> u64 {
        self.bindata_final_bytes + self.xml_final_bytes
    }

    /// Overall image size reduction in percent, 0 when nothing was measured
    pub fn reduction_percent(&self) -> f64 {
        let original = self.original_bytes();
        if original == 0 {
            return 0.0;
        }
        (original as f64 - self.final_bytes() as f64) / original as f64 * 100.0
    }
}

impl fmt::Display for RunStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "BinData images:")?;
        writeln!(f, "  compressed: {}", self.bindata_compressed)?;
        writeln!(f, "  skipped:    {}", self.bindata_skipped)?;
        writeln!(f, "Inline XML images:")?;
        writeln!(f, "  compressed: {}", self.xml_compressed)?;
        writeln!(f, "  skipped:    {}", self.xml_skipped)?;
        if self.xml_unparsable > 0 {
            writeln!(
                f,
                "  unparsable documents left as-is: {}",
                self.xml_unparsable
            )?;
        }
        writeln!(f, "Total:")?;
        writeln!(f, "  images compressed: {}", self.total_compressed())?;
        writeln!(f, "  size reduction:    {:.1}%", self.reduction_percent())?;
        writeln!(f, "  elapsed:           {}s", self.elapsed.as_secs())?;
        write!(f, "Saved to: {}", self.output_path.display())
    }
}
