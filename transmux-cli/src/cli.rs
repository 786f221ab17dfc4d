use std::path::PathBuf;

use clap::Parser;

/// Remux an MPEG-TS file into fragmented MP4 segments.
#[derive(Debug, Parser)]
#[command(name = "transmux", version, about)]
pub struct Args {
    /// Input transport-stream file
    pub input: PathBuf,

    /// Directory receiving init.mp4 and segment-N.m4s files
    #[arg(short, long, default_value = "out")]
    pub out_dir: PathBuf,

    /// Emit one segment per track instead of combined segments
    #[arg(long)]
    pub no_remux: bool,

    /// Keep source timestamps instead of re-basing to the timeline start
    #[arg(long)]
    pub keep_original_timestamps: bool,

    /// Accept any video/audio-family stream type from the PMT
    #[arg(long)]
    pub broad_stream_detection: bool,

    /// Validate CRC-32/MPEG-2 on PAT/PMT sections
    #[arg(long)]
    pub validate_psi_crc: bool,

    /// Print track info, timing and cues as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Read size per push, exercising arbitrary chunk boundaries
    #[arg(long, default_value_t = 64 * 1024)]
    pub chunk_size: usize,
}
