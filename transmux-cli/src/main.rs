mod cli;
mod error;
mod output;

use std::fs::File;
use std::io::Read;
use std::process;

use bytes::Bytes;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use transmux::{TransmuxConfig, Transmuxer};

use crate::cli::Args;
use crate::error::Result;
use crate::output::SegmentWriter;

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(args) {
        error!("transmux failed: {e}");
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = TransmuxConfig::builder()
        .remux(!args.no_remux)
        .keep_original_timestamps(args.keep_original_timestamps)
        .broad_stream_detection(args.broad_stream_detection)
        .validate_psi_crc(args.validate_psi_crc)
        .build();
    let mut muxer = Transmuxer::new(config);
    let mut writer = SegmentWriter::new(&args.out_dir, args.json)?;

    let mut input = File::open(&args.input)?;
    let mut buffer = vec![0u8; args.chunk_size];
    loop {
        let read = input.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        let events = muxer.push(Bytes::copy_from_slice(&buffer[..read]))?;
        writer.handle(events)?;
    }
    let events = muxer.end_timeline()?;
    writer.handle(events)?;

    let stats = writer.finish();
    info!(
        segments = stats.segments_written,
        bytes = stats.bytes_written,
        captions = stats.captions,
        id3_frames = stats.id3_frames,
        "remux complete"
    );
    Ok(())
}
