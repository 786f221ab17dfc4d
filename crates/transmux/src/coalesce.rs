//! The coalescer: a barrier across tracks
//!
//! Collects each registered track's fragment (or its "no data this round"
//! signal) and emits either a single combined segment (remux mode) or one
//! segment per track. Caption and ID3 cues are held until the barrier's
//! first data emission so their times can be fixed to the media timeline.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use codecs::{Caption, Id3Tag};
use pipeline_common::{PipelineError, StreamerContext};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::clock::metadata_ts_to_seconds;
use crate::events::{
    CaptionCue, MediaInfo, SegmentData, SegmentTimingInfo, SegmentType, TimestampPair, TimingInfo,
    TransmuxEvent, TrackType,
};

/// One track's contribution to a barrier round.
#[derive(Debug, Clone)]
pub struct TrackSegment {
    pub track_type: TrackType,
    pub pid: u16,
    /// RFC 6381 codec string, derived from the track configuration.
    pub codec: String,
    pub init: mp4::InitTrack,
    /// `moof` + `mdat`.
    pub boxes: Bytes,
    pub timing: TimingInfo,
    pub timeline_start_pts: Option<u64>,
    pub media_info: MediaInfo,
}

/// Records the segmenters hand to the façade on flush.
#[derive(Debug)]
pub enum SegmenterEvent {
    Segment(Box<TrackSegment>),
    /// The track finished this round without producing a segment.
    NoData { track_type: TrackType, pid: u16 },
    SegmentTiming {
        track_type: TrackType,
        info: SegmentTimingInfo,
    },
    Timing {
        track_type: TrackType,
        info: TimingInfo,
    },
    GopInfo(Vec<crate::events::GopInfo>),
    /// The video fragment's decode time, wired into the audio side.
    BaseMediaDecodeTime(u64),
    /// The video timeline start, wired into the audio side.
    TimelineStartInfo { dts: Option<u64>, pts: Option<u64> },
}

/// Shared shape of `segmentTimingInfo` payloads for both media kinds.
pub(crate) fn segment_timing_info(
    base_media_decode_time: u64,
    first_dts: u64,
    first_pts: u64,
    last_dts: u64,
    last_pts: u64,
    prepended_content_duration: u64,
) -> SegmentTimingInfo {
    SegmentTimingInfo {
        start: TimestampPair {
            dts: base_media_decode_time,
            pts: base_media_decode_time + first_pts.saturating_sub(first_dts),
        },
        end: TimestampPair {
            dts: base_media_decode_time + last_dts.saturating_sub(first_dts),
            pts: base_media_decode_time + last_pts.saturating_sub(first_pts),
        },
        base_media_decode_time,
        prepended_content_duration,
    }
}

/// Barrier stage joining per-track fragments into host segments.
pub struct Coalescer {
    context: Arc<StreamerContext>,
    remux: bool,
    keep_original_timestamps: bool,
    expected: Vec<(TrackType, u16)>,
    segments: Vec<TrackSegment>,
    no_data_pids: Vec<u16>,
    pending_captions: Vec<Caption>,
    pending_metadata: Vec<Id3Tag>,
    /// Audio PID joining the combined segment; lowest advertised by default.
    current_audio_pid: Option<u16>,
    /// Last init segment emitted for the combined stream.
    last_combined_init: Option<Bytes>,
    /// Last init segment emitted per PID (non-remux mode).
    last_init_by_pid: FxHashMap<u16, Bytes>,
}

impl Coalescer {
    pub fn new(context: Arc<StreamerContext>, remux: bool, keep_original_timestamps: bool) -> Self {
        Self {
            context,
            remux,
            keep_original_timestamps,
            expected: Vec::new(),
            segments: Vec::new(),
            no_data_pids: Vec::new(),
            pending_captions: Vec::new(),
            pending_metadata: Vec::new(),
            current_audio_pid: None,
            last_combined_init: None,
            last_init_by_pid: FxHashMap::default(),
        }
    }

    /// Register a track the barrier must wait for.
    pub fn add_track(&mut self, track_type: TrackType, pid: u16) {
        if !self.expected.contains(&(track_type, pid)) {
            self.expected.push((track_type, pid));
        }
        if track_type == TrackType::Audio {
            let current = self.current_audio_pid.get_or_insert(pid);
            *current = (*current).min(pid);
        }
    }

    pub fn set_remux(&mut self, remux: bool) {
        self.remux = remux;
    }

    /// Select which audio PID joins the combined segment.
    pub fn set_audio_pid(&mut self, pid: u16) {
        self.current_audio_pid = Some(pid);
    }

    pub fn push_segment(&mut self, segment: TrackSegment) {
        self.segments.push(segment);
    }

    pub fn push_no_data(&mut self, pid: u16) {
        self.no_data_pids.push(pid);
    }

    pub fn push_caption(&mut self, caption: Caption) {
        self.pending_captions.push(caption);
    }

    pub fn push_metadata(&mut self, tag: Id3Tag) {
        self.pending_metadata.push(tag);
    }

    /// Restart caption/metadata holding (caption discontinuity).
    pub fn reset_cues(&mut self) {
        self.pending_captions.clear();
        self.pending_metadata.clear();
    }

    /// True once every registered track has either contributed a segment or
    /// signalled "no data this round".
    fn barrier_satisfied(&self) -> bool {
        self.expected.iter().all(|&(_, pid)| {
            self.segments.iter().any(|s| s.pid == pid) || self.no_data_pids.contains(&pid)
        })
    }

    pub fn flush(&mut self, out: &mut Vec<TransmuxEvent>) -> Result<(), PipelineError> {
        if !self.segments.is_empty() && self.expected.is_empty() {
            return Err(PipelineError::Invariant(
                "coalescer holds segment data but no tracks are registered".into(),
            ));
        }
        if !self.barrier_satisfied() {
            debug!("{} barrier not satisfied, gating done", self.context.name);
            return Ok(());
        }

        self.no_data_pids.clear();
        let segments = std::mem::take(&mut self.segments);
        if segments.is_empty() {
            return Ok(());
        }

        if self.remux {
            self.emit_combined(segments, out);
        } else {
            self.emit_per_track(segments, out);
        }
        Ok(())
    }

    fn emit_combined(&mut self, segments: Vec<TrackSegment>, out: &mut Vec<TransmuxEvent>) {
        let video = segments.iter().find(|s| s.track_type == TrackType::Video);
        let audio = segments.iter().find(|s| {
            s.track_type == TrackType::Audio && Some(s.pid) == self.current_audio_pid
        });
        // Deterministic order: video before the selected audio PID.
        let chosen: Vec<&TrackSegment> = [video, audio].into_iter().flatten().collect();
        if chosen.is_empty() {
            return;
        }

        let init_tracks: Vec<mp4::InitTrack> = chosen.iter().map(|s| s.init.clone()).collect();
        let init = mp4::init_segment(&init_tracks);
        let init_segment = if self.last_combined_init.as_ref() != Some(&init) {
            self.last_combined_init = Some(init.clone());
            Some(init)
        } else {
            None
        };

        let mut data = BytesMut::new();
        let mut info = MediaInfo::default();
        for segment in &chosen {
            data.extend_from_slice(&segment.boxes);
            match segment.track_type {
                TrackType::Video => {
                    info.width = segment.media_info.width;
                    info.height = segment.media_info.height;
                }
                TrackType::Audio => {
                    info.samplerate = segment.media_info.samplerate;
                    info.channelcount = segment.media_info.channelcount;
                }
            }
        }

        let segment_type = if chosen.len() > 1 {
            SegmentType::Combined
        } else if chosen[0].track_type == TrackType::Video {
            SegmentType::Video
        } else {
            SegmentType::Audio
        };

        let timing = TimingInfo {
            start: chosen.iter().map(|s| s.timing.start).min().unwrap_or(0),
            end: chosen.iter().map(|s| s.timing.end).max().unwrap_or(0),
        };

        out.push(TransmuxEvent::Data(SegmentData {
            segment_type,
            init_segment,
            data: data.freeze(),
            codecs: chosen.iter().map(|s| s.codec.clone()).collect(),
            pid: if chosen.len() == 1 {
                Some(chosen[0].pid)
            } else {
                None
            },
            info,
        }));
        out.push(TransmuxEvent::TimingInfo(timing));

        let timeline_start_pts = video
            .and_then(|s| s.timeline_start_pts)
            .or_else(|| segments.iter().find_map(|s| s.timeline_start_pts));
        self.emit_cues(timeline_start_pts.unwrap_or(0), out);
    }

    fn emit_per_track(&mut self, mut segments: Vec<TrackSegment>, out: &mut Vec<TransmuxEvent>) {
        segments.sort_by_key(|s| {
            let rank = match s.track_type {
                TrackType::Video => 0,
                TrackType::Audio => 1,
            };
            (rank, s.pid)
        });

        let timeline_start_pts = segments
            .iter()
            .find(|s| s.track_type == TrackType::Video)
            .and_then(|s| s.timeline_start_pts)
            .or_else(|| segments.iter().find_map(|s| s.timeline_start_pts));

        for segment in segments {
            let init = mp4::init_segment(std::slice::from_ref(&segment.init));
            let init_segment = if self.last_init_by_pid.get(&segment.pid) != Some(&init) {
                self.last_init_by_pid.insert(segment.pid, init.clone());
                Some(init)
            } else {
                None
            };

            out.push(TransmuxEvent::Data(SegmentData {
                segment_type: match segment.track_type {
                    TrackType::Video => SegmentType::Video,
                    TrackType::Audio => SegmentType::Audio,
                },
                init_segment,
                data: segment.boxes,
                codecs: vec![segment.codec],
                pid: Some(segment.pid),
                info: segment.media_info,
            }));
            out.push(TransmuxEvent::TimingInfo(segment.timing));
        }

        self.emit_cues(timeline_start_pts.unwrap_or(0), out);
    }

    /// Release held caption and ID3 cues with times fixed to the timeline.
    fn emit_cues(&mut self, timeline_start_pts: u64, out: &mut Vec<TransmuxEvent>) {
        for caption in std::mem::take(&mut self.pending_captions) {
            out.push(TransmuxEvent::Caption(CaptionCue {
                start_time: metadata_ts_to_seconds(
                    caption.start_pts,
                    timeline_start_pts,
                    self.keep_original_timestamps,
                ),
                end_time: metadata_ts_to_seconds(
                    caption.end_pts,
                    timeline_start_pts,
                    self.keep_original_timestamps,
                ),
                text: caption.text,
            }));
        }
        for mut tag in std::mem::take(&mut self.pending_metadata) {
            tag.cue_time = Some(metadata_ts_to_seconds(
                tag.pts,
                timeline_start_pts,
                self.keep_original_timestamps,
            ));
            out.push(TransmuxEvent::Id3Frame(tag));
        }
    }
}
