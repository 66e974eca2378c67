//! HWPX Image Compressor CLI
//!
//! Command-line interface for shrinking the images in HWPX documents.

use anyhow::{bail, Context};
use clap::Parser;
use hwpx_image_compress::inspect::inspect_hwpx;
use hwpx_image_compress::{
    compress_hwpx_file, compress_many, CompressionConfig, Progress, SizePreset,
};
use std::path::PathBuf;

/// Compress every image in HWPX files down to a target size
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input HWPX file(s)
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Output file path (single input only; default: <name>_compressed.hwpx)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Target size per image in KB
    #[arg(short, long, default_value = "200", conflicts_with = "preset")]
    size_kb: u64,

    /// Named target size: tiny (50KB), small (100KB), medium (200KB), large (500KB), huge (1MB)
    #[arg(short, long)]
    preset: Option<SizePreset>,

    /// Scratch directory for the unpacked archive (default: system temp dir)
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// List the images in each input instead of compressing
    #[arg(long)]
    inspect: bool,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn print_progress(progress: &Progress) {
    if progress.total > 0 {
        eprintln!(
            "[{:>3}%] {} ({}/{}, {}s)",
            progress.percent, progress.label, progress.current, progress.total, progress.elapsed_secs
        );
    } else {
        eprintln!("[{:>3}%] {}", progress.percent, progress.label);
    }
}

fn inspect(args: &Args, config: &CompressionConfig) -> anyhow::Result<()> {
    for input in &args.inputs {
        let images =
            inspect_hwpx(input).with_context(|| format!("Failed to inspect {:?}", input))?;

        if args.json {
            println!("{}", serde_json::to_string_pretty(&images)?);
            continue;
        }

        println!("{}: {} images", input.display(), images.len());
        for info in &images {
            let marker = if info.exceeds(config.target_bytes) { "*" } else { " " };
            println!(
                " {} {:?}: {} {}x{}, {:.1}KB",
                marker,
                info.location,
                info.format,
                info.width,
                info.height,
                info.size_bytes as f64 / 1024.0
            );
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let size_kb = args.preset.map(SizePreset::kilobytes).unwrap_or(args.size_kb);
    let mut config = CompressionConfig::from_kilobytes(size_kb)?;
    if let Some(dir) = &args.scratch_dir {
        config = config.with_scratch_dir(dir);
    }

    if args.inspect {
        return inspect(&args, &config);
    }

    if args.output.is_some() && args.inputs.len() > 1 {
        bail!("--output can only be used with a single input file");
    }

    let mut on_progress = |progress: &Progress| {
        if !args.json {
            print_progress(progress)
        }
    };

    let results = match &args.output {
        Some(output) => {
            let input = args.inputs[0].clone();
            let result = compress_hwpx_file(&input, Some(output.as_path()), &config, &mut on_progress);
            vec![(input, result)]
        }
        None => compress_many(&args.inputs, &config, &mut on_progress),
    };

    let total = results.len();
    let mut succeeded = 0;
    for (input, result) in &results {
        match result {
            Ok(stats) => {
                succeeded += 1;
                if args.json {
                    println!("{}", serde_json::to_string_pretty(stats)?);
                } else {
                    println!("\n{}\n{}", input.display(), stats);
                }
            }
            Err(e) => eprintln!("\nFailed: {}: {}", input.display(), e),
        }
    }

    if total > 1 {
        eprintln!("\nDone: {}/{} files succeeded", succeeded, total);
    }
    if succeeded < total {
        bail!("{} of {} files failed", total - succeeded, total);
    }

    Ok(())
}
