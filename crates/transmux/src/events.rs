//! Host-facing event types
//!
//! The pipeline communicates with its consumer exclusively through these
//! records. Emitted byte buffers are transferred to the consumer and are
//! never mutated afterwards.

use bytes::Bytes;
use codecs::Id3Tag;
use ts::psi::SubtitleKind;

/// Track discriminator used across segmenters and the coalescer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackType {
    Audio,
    Video,
}

/// One advertised audio track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTrackInfo {
    pub pid: u16,
    /// Codec family name: "adts".
    pub codec: String,
    pub languages: Vec<String>,
}

/// The advertised video track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoTrackInfo {
    pub pid: u16,
    /// Codec family name: "avc".
    pub codec: String,
}

/// An advertised (but never segmented) subtitle track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleTrackInfo {
    pub pid: u16,
    pub kind: SubtitleKind,
    pub language: Option<String>,
}

/// The track listing derived from the PMT.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackInfo {
    pub audio: Vec<AudioTrackInfo>,
    pub video: Option<VideoTrackInfo>,
    pub subtitles: Vec<SubtitleTrackInfo>,
}

/// Start/end presentation times of a segment, in 90 kHz ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingInfo {
    pub start: u64,
    pub end: u64,
}

/// A decode/presentation timestamp pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampPair {
    pub dts: u64,
    pub pts: u64,
}

/// Placement of one emitted segment on the media timeline, in 90 kHz ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentTimingInfo {
    pub start: TimestampPair,
    pub end: TimestampPair,
    pub base_media_decode_time: u64,
    /// Content prepended for a clean decode start (GOP fusion, silence fill).
    pub prepended_content_duration: u64,
}

/// Summary of one emitted GOP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GopInfo {
    pub pts: u64,
    pub dts: u64,
    pub byte_length: usize,
}

/// What a `data` event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentType {
    Audio,
    Video,
    Combined,
}

/// Media parameters of the segment's tracks, for host display/bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaInfo {
    pub width: u16,
    pub height: u16,
    pub samplerate: u32,
    pub channelcount: u8,
}

/// One emitted media segment.
#[derive(Debug, Clone)]
pub struct SegmentData {
    pub segment_type: SegmentType,
    /// `ftyp` + `moov`, present on the barrier's first emission and after a
    /// covered-track change.
    pub init_segment: Option<Bytes>,
    /// Concatenated `moof` + `mdat` pairs, video track first.
    pub data: Bytes,
    /// RFC 6381 codec strings of the contained tracks, video first.
    pub codecs: Vec<String>,
    /// PID of the single contained track; `None` for combined segments.
    pub pid: Option<u16>,
    pub info: MediaInfo,
}

/// A caption cue with times on the media timeline, in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionCue {
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
}

/// Everything the transmuxer reports to its host.
#[derive(Debug, Clone)]
pub enum TransmuxEvent {
    /// Track listing from the PMT ("trackinfo").
    TrackInfo(TrackInfo),
    /// A finished media segment ("data").
    Data(SegmentData),
    /// Combined segment timing ("timingInfo").
    TimingInfo(TimingInfo),
    AudioTimingInfo(TimingInfo),
    VideoTimingInfo(TimingInfo),
    AudioSegmentTimingInfo(SegmentTimingInfo),
    VideoSegmentTimingInfo(SegmentTimingInfo),
    /// Per-GOP summaries for the just-emitted video segment ("gopInfo").
    GopInfo(Vec<GopInfo>),
    Caption(CaptionCue),
    Id3Frame(Id3Tag),
    Done,
    Reset,
    EndedTimeline,
}
