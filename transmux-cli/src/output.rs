//! Segment file writing and event reporting.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;
use transmux::TransmuxEvent;

use crate::error::Result;

#[derive(Debug, Default)]
pub struct WriterStats {
    pub segments_written: u64,
    pub bytes_written: u64,
    pub captions: u64,
    pub id3_frames: u64,
}

/// Writes init/media segments to disk and reports side events.
pub struct SegmentWriter {
    out_dir: PathBuf,
    json: bool,
    segment_index: u64,
    stats: WriterStats,
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
enum JsonEvent<'a> {
    TrackInfo {
        video_pid: Option<u16>,
        audio_pids: Vec<u16>,
    },
    Timing {
        start: u64,
        end: u64,
    },
    Caption {
        start_time: f64,
        end_time: f64,
        text: &'a str,
    },
    Id3 {
        cue_time: Option<f64>,
        frames: Vec<&'a str>,
    },
}

impl SegmentWriter {
    pub fn new(out_dir: &Path, json: bool) -> Result<Self> {
        fs::create_dir_all(out_dir)?;
        Ok(Self {
            out_dir: out_dir.to_path_buf(),
            json,
            segment_index: 0,
            stats: WriterStats::default(),
        })
    }

    pub fn handle(&mut self, events: Vec<TransmuxEvent>) -> Result<()> {
        for event in events {
            match event {
                TransmuxEvent::TrackInfo(info) => {
                    if self.json {
                        self.print(&JsonEvent::TrackInfo {
                            video_pid: info.video.as_ref().map(|v| v.pid),
                            audio_pids: info.audio.iter().map(|a| a.pid).collect(),
                        })?;
                    } else {
                        info!(
                            video = ?info.video.as_ref().map(|v| v.pid),
                            audio = ?info.audio.iter().map(|a| a.pid).collect::<Vec<_>>(),
                            subtitles = info.subtitles.len(),
                            "program tracks"
                        );
                    }
                }
                TransmuxEvent::Data(segment) => {
                    if let Some(init) = &segment.init_segment {
                        let path = self.out_dir.join("init.mp4");
                        File::create(&path)?.write_all(init)?;
                        self.stats.bytes_written += init.len() as u64;
                        info!(path = %path.display(), codecs = ?segment.codecs, "wrote init segment");
                    }
                    let path = self
                        .out_dir
                        .join(format!("segment-{}.m4s", self.segment_index));
                    File::create(&path)?.write_all(&segment.data)?;
                    self.segment_index += 1;
                    self.stats.segments_written += 1;
                    self.stats.bytes_written += segment.data.len() as u64;
                }
                TransmuxEvent::TimingInfo(timing) => {
                    if self.json {
                        self.print(&JsonEvent::Timing {
                            start: timing.start,
                            end: timing.end,
                        })?;
                    }
                }
                TransmuxEvent::Caption(cue) => {
                    self.stats.captions += 1;
                    if self.json {
                        self.print(&JsonEvent::Caption {
                            start_time: cue.start_time,
                            end_time: cue.end_time,
                            text: &cue.text,
                        })?;
                    } else {
                        info!(start = cue.start_time, end = cue.end_time, text = %cue.text, "caption");
                    }
                }
                TransmuxEvent::Id3Frame(tag) => {
                    self.stats.id3_frames += 1;
                    if self.json {
                        self.print(&JsonEvent::Id3 {
                            cue_time: tag.cue_time,
                            frames: tag.frames.iter().map(|f| f.id.as_str()).collect(),
                        })?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn print<T: Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string(value)?);
        Ok(())
    }

    pub fn finish(self) -> WriterStats {
        self.stats
    }
}
