//! The transmuxer façade
//!
//! Owns every pipeline stage, routes records between them on the calling
//! thread, and exposes the public push/flush surface. Stage wiring for the
//! segmenters happens on the first PMT, when the track layout is known.

use std::sync::Arc;

use bytes::Bytes;
use codecs::{AdtsStream, CaptionStream, H264Stream, MetadataStream};
use pipeline_common::{PipelineError, Stage, StreamerContext};
use tracing::{debug, warn};
use ts::psi::{PidRole, ProgramMap, STREAM_TYPE_ADTS, STREAM_TYPE_H264};
use ts::{ElementaryStream, PacketParser, PacketSplitter, PesPacket, TimestampRollover, TsDemuxEvent};

use crate::audio::AudioSegmenter;
use crate::coalesce::{Coalescer, SegmenterEvent};
use crate::events::{
    AudioTrackInfo, SubtitleTrackInfo, TimestampPair, TrackInfo, TrackType, TransmuxEvent,
    VideoTrackInfo,
};
use crate::video::VideoSegmenter;

/// Build-time options for a [`Transmuxer`].
#[derive(Debug, Clone)]
pub struct TransmuxConfig {
    /// Emit one combined segment covering all tracks (default) instead of
    /// one segment per track.
    pub remux: bool,
    /// Keep source timestamps instead of re-basing onto the timeline start.
    pub keep_original_timestamps: bool,
    /// Accept any video/audio-family stream type from the PMT, not just
    /// H.264/ADTS.
    pub broad_stream_detection: bool,
    /// Align segment starts against the trailing GOP of the alignment list
    /// instead of the leading one.
    pub align_gops_at_end: bool,
    /// Validate CRC-32/MPEG-2 on PAT/PMT sections.
    pub validate_psi_crc: bool,
}

impl Default for TransmuxConfig {
    fn default() -> Self {
        Self {
            remux: true,
            keep_original_timestamps: false,
            broad_stream_detection: false,
            align_gops_at_end: false,
            validate_psi_crc: false,
        }
    }
}

impl TransmuxConfig {
    pub fn builder() -> TransmuxConfigBuilder {
        TransmuxConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct TransmuxConfigBuilder {
    config: TransmuxConfig,
}

impl TransmuxConfigBuilder {
    pub fn remux(mut self, remux: bool) -> Self {
        self.config.remux = remux;
        self
    }

    pub fn keep_original_timestamps(mut self, keep: bool) -> Self {
        self.config.keep_original_timestamps = keep;
        self
    }

    pub fn broad_stream_detection(mut self, broad: bool) -> Self {
        self.config.broad_stream_detection = broad;
        self
    }

    pub fn align_gops_at_end(mut self, at_end: bool) -> Self {
        self.config.align_gops_at_end = at_end;
        self
    }

    pub fn validate_psi_crc(mut self, validate: bool) -> Self {
        self.config.validate_psi_crc = validate;
        self
    }

    pub fn build(self) -> TransmuxConfig {
        self.config
    }
}

/// Streaming MPEG-TS → fragmented MP4 transmuxer.
///
/// Strictly single-threaded and synchronous: `push` returns after the input
/// has propagated through every stage, `flush` drains the pipeline and
/// completes the current segment. Independent instances share nothing.
pub struct Transmuxer {
    context: Arc<StreamerContext>,
    config: TransmuxConfig,

    splitter: PacketSplitter,
    parser: PacketParser,
    elementary: ElementaryStream,
    rollover: TimestampRollover,
    h264: H264Stream,
    adts: AdtsStream,
    metadata: MetadataStream,
    captions: CaptionStream,

    video: Option<VideoSegmenter>,
    audio: Option<AudioSegmenter>,
    coalescer: Coalescer,

    /// Timeline offset applied via `set_base_media_decode_time`.
    base_media_decode_time: u64,
    /// Alignment list retained across segmenter (re)creation.
    gops_to_align_with: Vec<TimestampPair>,
    /// Explicit audio PID selection retained across PMTs.
    selected_audio_pid: Option<u16>,
    track_info: Option<TrackInfo>,
}

impl Transmuxer {
    pub fn new(config: TransmuxConfig) -> Self {
        Self::with_context(StreamerContext::arc_new("Transmuxer"), config)
    }

    pub fn with_context(context: Arc<StreamerContext>, config: TransmuxConfig) -> Self {
        let parser = PacketParser::new(context.clone())
            .with_broad_stream_detection(config.broad_stream_detection)
            .with_crc_validation(config.validate_psi_crc);
        Self {
            splitter: PacketSplitter::new(),
            parser,
            elementary: ElementaryStream::new(context.clone()),
            rollover: TimestampRollover::new(),
            h264: H264Stream::new(context.clone()),
            adts: AdtsStream::new(context.clone()),
            metadata: MetadataStream::new(context.clone()),
            captions: CaptionStream::new(context.clone()),
            video: None,
            audio: None,
            coalescer: Coalescer::new(context.clone(), config.remux, config.keep_original_timestamps),
            base_media_decode_time: 0,
            gops_to_align_with: Vec::new(),
            selected_audio_pid: None,
            track_info: None,
            context,
            config,
        }
    }

    /// The track listing from the most recent PMT, if one has been seen.
    pub fn track_info(&self) -> Option<&TrackInfo> {
        self.track_info.as_ref()
    }

    /// Feed a chunk of TS bytes. Chunk boundaries are arbitrary.
    pub fn push(&mut self, chunk: Bytes) -> Result<Vec<TransmuxEvent>, PipelineError> {
        let mut events = Vec::new();
        let mut packets = Vec::new();
        self.splitter.push(chunk, &mut packets)?;
        self.route_packets(packets, &mut events)?;
        Ok(events)
    }

    /// Drain the pipeline and complete the current segment.
    pub fn flush(&mut self) -> Result<Vec<TransmuxEvent>, PipelineError> {
        let mut events = Vec::new();

        // Drain the byte-level stages first so every completed unit reaches
        // its segmenter before the segmenters cut the fragment.
        let mut packets = Vec::new();
        self.splitter.flush(&mut packets)?;
        self.route_packets(packets, &mut events)?;

        let mut demux_events = Vec::new();
        self.parser.flush(&mut demux_events)?;

        let mut pes_packets = Vec::new();
        self.elementary.flush(&mut pes_packets)?;
        self.route_pes(pes_packets, &mut events)?;

        let mut trailing_nals = Vec::new();
        self.h264.flush(&mut trailing_nals)?;
        for nal in trailing_nals {
            let mut none = Vec::new();
            self.captions.push(nal.clone(), &mut none)?;
            if let Some(video) = &mut self.video {
                video.push(nal);
            }
        }

        let mut cues = Vec::new();
        self.captions.flush(&mut cues)?;
        for cue in cues {
            self.coalescer.push_caption(cue);
        }

        let mut segmenter_events = Vec::new();
        if let Some(video) = &mut self.video {
            video.flush(&mut segmenter_events);
        }
        self.apply_video_events(&segmenter_events);
        if let Some(audio) = &mut self.audio {
            audio.flush(&mut segmenter_events);
        }
        self.route_segmenter_events(segmenter_events, &mut events);

        self.coalescer.flush(&mut events)?;
        events.push(TransmuxEvent::Done);
        Ok(events)
    }

    /// Flush, then mark the timeline as ended.
    pub fn end_timeline(&mut self) -> Result<Vec<TransmuxEvent>, PipelineError> {
        let mut events = self.flush()?;
        events.push(TransmuxEvent::EndedTimeline);
        Ok(events)
    }

    /// Return to the initial state, as if no input had ever been pushed.
    pub fn reset(&mut self) -> Vec<TransmuxEvent> {
        *self = Self::with_context(self.context.clone(), self.config.clone());
        vec![TransmuxEvent::Reset]
    }

    /// Drop caption decoder state and pending cues.
    pub fn reset_captions(&mut self) {
        self.captions.reset();
        self.coalescer.reset_cues();
    }

    /// Position subsequent segments at `time` (90 kHz) on the timeline.
    ///
    /// Clears each track's timeline start, signals a discontinuity to the
    /// rollover stage, drops the GOP fusion cache, and resets captions.
    pub fn set_base_media_decode_time(&mut self, time: u64) {
        self.base_media_decode_time = time;
        if let Some(video) = &mut self.video {
            let track = video.track_mut();
            track.timeline_start_info.dts = None;
            track.timeline_start_info.pts = None;
            track.timeline_start_info.base_media_decode_time = time;
            track.clear_dts_info();
            video.clear_gop_cache();
            video.discontinuity();
        }
        if let Some(audio) = &mut self.audio {
            for track in audio.tracks_mut() {
                track.timeline_start_info.dts = None;
                track.timeline_start_info.pts = None;
                track.timeline_start_info.base_media_decode_time = time;
                track.clear_dts_info();
            }
        }
        self.rollover.discontinuity();
        self.reset_captions();
    }

    /// Where the previous audio append ended, in 90 kHz ticks.
    pub fn set_audio_append_start(&mut self, ts: u64) {
        if let Some(audio) = &mut self.audio {
            audio.set_audio_append_start(ts);
        }
    }

    pub fn set_remux(&mut self, remux: bool) {
        self.config.remux = remux;
        self.coalescer.set_remux(remux);
    }

    /// PTS values the next video segments must align with.
    pub fn align_gops_with(&mut self, gops: Vec<TimestampPair>) {
        self.gops_to_align_with = gops.clone();
        if let Some(video) = &mut self.video {
            video.align_gops_with(gops);
        }
    }

    /// Select the audio PID carried in combined segments.
    ///
    /// Selecting an advertised stream whose codec has no segmenter is an
    /// error; selecting an unadvertised PID is accepted and takes effect if
    /// a later PMT advertises it.
    pub fn set_audio_track_from_pid(&mut self, pid: u16) -> Result<(), PipelineError> {
        if let Some(map) = self.parser.program_map() {
            match map.audio.iter().find(|entry| entry.pid == pid) {
                Some(entry) if entry.stream_type != STREAM_TYPE_ADTS => {
                    return Err(PipelineError::UnsupportedCodec(entry.stream_type));
                }
                None => {
                    warn!("{} audio PID {pid:#06x} is not advertised", self.context.name);
                }
                _ => {}
            }
        }
        self.selected_audio_pid = Some(pid);
        self.coalescer.set_audio_pid(pid);
        Ok(())
    }

    fn route_packets(
        &mut self,
        packets: Vec<Bytes>,
        events: &mut Vec<TransmuxEvent>,
    ) -> Result<(), PipelineError> {
        let mut demux_events = Vec::new();
        for packet in packets {
            self.parser.push(packet, &mut demux_events)?;
        }

        let mut pes_packets = Vec::new();
        for event in demux_events {
            match event {
                TsDemuxEvent::ProgramMetadata(map) => {
                    self.handle_program_metadata(map, events);
                }
                TsDemuxEvent::Pes(fragment) => {
                    self.elementary.push(fragment, &mut pes_packets)?;
                }
            }
        }
        self.route_pes(pes_packets, events)
    }

    fn route_pes(
        &mut self,
        pes_packets: Vec<PesPacket>,
        _events: &mut Vec<TransmuxEvent>,
    ) -> Result<(), PipelineError> {
        let mut adjusted = Vec::new();
        for pes in pes_packets {
            self.rollover.push(pes, &mut adjusted)?;
        }

        for pes in adjusted {
            match pes.role {
                PidRole::Video => {
                    let mut nals = Vec::new();
                    self.h264.push(pes, &mut nals)?;
                    for nal in nals {
                        let mut none = Vec::new();
                        self.captions.push(nal.clone(), &mut none)?;
                        if let Some(video) = &mut self.video {
                            video.push(nal);
                        }
                    }
                }
                PidRole::Audio => {
                    let mut frames = Vec::new();
                    self.adts.push(pes, &mut frames)?;
                    if let Some(audio) = &mut self.audio {
                        for frame in frames {
                            audio.push(frame);
                        }
                    }
                }
                PidRole::TimedMetadata => {
                    let mut tags = Vec::new();
                    self.metadata.push(pes, &mut tags)?;
                    for tag in tags {
                        self.coalescer.push_metadata(tag);
                    }
                }
                // Subtitle tracks are advertised only; no segmenter exists.
                PidRole::PrivateData => {}
            }
        }
        Ok(())
    }

    fn handle_program_metadata(&mut self, map: ProgramMap, events: &mut Vec<TransmuxEvent>) {
        let info = TrackInfo {
            video: map.video_pid.map(|pid| VideoTrackInfo {
                pid,
                codec: "avc".into(),
            }),
            audio: map
                .audio
                .iter()
                .map(|entry| AudioTrackInfo {
                    pid: entry.pid,
                    codec: if entry.stream_type == STREAM_TYPE_ADTS {
                        "adts".into()
                    } else {
                        format!("unsupported-{:#04x}", entry.stream_type)
                    },
                    languages: entry.languages.clone(),
                })
                .collect(),
            subtitles: map
                .private_data
                .iter()
                .map(|entry| SubtitleTrackInfo {
                    pid: entry.pid,
                    kind: entry.kind,
                    language: entry.language.clone(),
                })
                .collect(),
        };

        if self.track_info.is_some() {
            // Re-wiring mid-timeline is undefined; callers must reset.
            if self.track_info.as_ref() != Some(&info) {
                warn!(
                    "{} PMT changed the track layout; segmenters keep their wiring until reset",
                    self.context.name
                );
            }
            self.track_info = Some(info.clone());
            events.push(TransmuxEvent::TrackInfo(info));
            return;
        }

        // First PMT: wire the segmenters into the coalescer.
        if let Some(pid) = map.video_pid {
            if map.video_stream_type == STREAM_TYPE_H264 {
                let mut video = VideoSegmenter::new(
                    self.context.clone(),
                    pid,
                    self.config.keep_original_timestamps,
                    self.config.align_gops_at_end,
                );
                video.track_mut().timeline_start_info.base_media_decode_time =
                    self.base_media_decode_time;
                video.align_gops_with(self.gops_to_align_with.clone());
                self.video = Some(video);
                self.coalescer.add_track(TrackType::Video, pid);
            } else {
                warn!(
                    "{} video stream_type {:#04x} has no segmenter; track advertised only",
                    self.context.name, map.video_stream_type
                );
            }
        }

        let adts_pids: Vec<u16> = map
            .audio
            .iter()
            .filter(|entry| entry.stream_type == STREAM_TYPE_ADTS)
            .map(|entry| entry.pid)
            .collect();
        if !adts_pids.is_empty() {
            let mut audio =
                AudioSegmenter::new(self.context.clone(), self.config.keep_original_timestamps);
            for pid in &adts_pids {
                audio.add_pid(*pid);
                self.coalescer.add_track(TrackType::Audio, *pid);
            }
            for track in audio.tracks_mut() {
                track.timeline_start_info.base_media_decode_time = self.base_media_decode_time;
            }
            self.audio = Some(audio);
        }
        if let Some(pid) = self.selected_audio_pid {
            self.coalescer.set_audio_pid(pid);
        }

        debug!(
            "{} wired segmenters: video={:?} audio={:?}",
            self.context.name, map.video_pid, adts_pids
        );
        self.track_info = Some(info.clone());
        events.push(TransmuxEvent::TrackInfo(info));
    }

    /// Wire the video side's flush results into the audio segmenter before
    /// the audio side flushes.
    fn apply_video_events(&mut self, segmenter_events: &[SegmenterEvent]) {
        let Some(audio) = &mut self.audio else {
            return;
        };
        for event in segmenter_events {
            match event {
                SegmenterEvent::TimelineStartInfo { dts: Some(dts), .. } => {
                    audio.set_earliest_dts(dts.saturating_sub(self.base_media_decode_time));
                }
                SegmenterEvent::BaseMediaDecodeTime(value) => {
                    audio.set_video_base_media_decode_time(*value);
                }
                _ => {}
            }
        }
    }

    fn route_segmenter_events(
        &mut self,
        segmenter_events: Vec<SegmenterEvent>,
        events: &mut Vec<TransmuxEvent>,
    ) {
        for event in segmenter_events {
            match event {
                SegmenterEvent::Segment(segment) => self.coalescer.push_segment(*segment),
                SegmenterEvent::NoData { pid, .. } => self.coalescer.push_no_data(pid),
                SegmenterEvent::SegmentTiming { track_type, info } => {
                    events.push(match track_type {
                        TrackType::Video => TransmuxEvent::VideoSegmentTimingInfo(info),
                        TrackType::Audio => TransmuxEvent::AudioSegmentTimingInfo(info),
                    });
                }
                SegmenterEvent::Timing { track_type, info } => {
                    events.push(match track_type {
                        TrackType::Video => TransmuxEvent::VideoTimingInfo(info),
                        TrackType::Audio => TransmuxEvent::AudioTimingInfo(info),
                    });
                }
                SegmenterEvent::GopInfo(gops) => events.push(TransmuxEvent::GopInfo(gops)),
                SegmenterEvent::BaseMediaDecodeTime(_)
                | SegmenterEvent::TimelineStartInfo { .. } => {}
            }
        }
    }
}
