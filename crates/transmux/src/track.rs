//! Per-track timeline bookkeeping
//!
//! Each output track carries its decoder configuration plus the state that
//! positions every emitted fragment on the media timeline: the timeline
//! start info captured on the first data-producing flush, and the observed
//! DTS range of the current segment.

use bytes::Bytes;
use tracing::warn;

use crate::clock::ONE_SECOND_IN_TS;
use crate::events::TrackType;

/// Where this track's timeline began.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimelineStartInfo {
    /// Earliest DTS seen on the first data-producing flush.
    pub dts: Option<u64>,
    pub pts: Option<u64>,
    /// Offset applied by `set_base_media_decode_time`.
    pub base_media_decode_time: u64,
}

/// Durable per-output-track state. Created on PMT, mutated by the
/// segmenters, never destroyed until reset.
#[derive(Debug, Clone)]
pub struct Track {
    pub track_type: TrackType,
    pub pid: u16,
    /// MP4 track_ID; the elementary PID, which is unique and stable.
    pub id: u32,
    pub timescale: u32,

    // Video configuration, filled from the active SPS/PPS.
    pub width: u16,
    pub height: u16,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
    pub profile_idc: u8,
    pub profile_compatibility: u8,
    pub level_idc: u8,
    pub sar_ratio: (u16, u16),

    // Audio configuration, filled from the first ADTS frame.
    pub samplerate: u32,
    pub channelcount: u8,
    pub samplesize: u16,
    pub audioobjecttype: u8,

    pub timeline_start_info: TimelineStartInfo,
    pub base_media_decode_time: u64,
    /// Set when a negative decode time had to be clamped to zero.
    pub clamped_to_zero: bool,

    // Observed DTS/PTS range of the segment being assembled.
    pub min_segment_dts: Option<u64>,
    pub min_segment_pts: Option<u64>,
    pub max_segment_dts: Option<u64>,
    pub max_segment_pts: Option<u64>,
}

impl Track {
    pub fn new(track_type: TrackType, pid: u16, timescale: u32) -> Self {
        Self {
            track_type,
            pid,
            id: pid as u32,
            timescale,
            width: 0,
            height: 0,
            sps: Vec::new(),
            pps: Vec::new(),
            profile_idc: 0,
            profile_compatibility: 0,
            level_idc: 0,
            sar_ratio: (1, 1),
            samplerate: 0,
            channelcount: 0,
            samplesize: 16,
            audioobjecttype: 2,
            timeline_start_info: TimelineStartInfo::default(),
            base_media_decode_time: 0,
            clamped_to_zero: false,
            min_segment_dts: None,
            min_segment_pts: None,
            max_segment_dts: None,
            max_segment_pts: None,
        }
    }

    /// Fold one observed (pts, dts) pair into the segment's range.
    pub fn collect_dts_info(&mut self, pts: u64, dts: u64) {
        self.min_segment_pts = Some(self.min_segment_pts.map_or(pts, |v| v.min(pts)));
        self.max_segment_pts = Some(self.max_segment_pts.map_or(pts, |v| v.max(pts)));
        self.min_segment_dts = Some(self.min_segment_dts.map_or(dts, |v| v.min(dts)));
        self.max_segment_dts = Some(self.max_segment_dts.map_or(dts, |v| v.max(dts)));
    }

    /// Forget the observed range; called after each flush.
    pub fn clear_dts_info(&mut self) {
        self.min_segment_dts = None;
        self.min_segment_pts = None;
        self.max_segment_dts = None;
        self.max_segment_pts = None;
    }

    /// Capture the timeline start on the first flush that produces data.
    pub fn establish_timeline_start(&mut self) {
        if self.timeline_start_info.dts.is_none() {
            self.timeline_start_info.dts = self.min_segment_dts;
            self.timeline_start_info.pts = self.min_segment_pts;
        }
    }

    /// Derive the fragment's `tfdt` value from the observed DTS range.
    ///
    /// With `keep_original_timestamps` the decode time is the observed DTS
    /// less the configured timeline offset; otherwise it is re-based onto
    /// the timeline start. Audio values are rescaled from 90 kHz to the
    /// track timescale. Never negative: clamps to zero and records it.
    pub fn calculate_base_media_decode_time(&mut self, keep_original_timestamps: bool) -> u64 {
        let min_segment_dts = self.min_segment_dts.unwrap_or(0) as i64;
        let start = &self.timeline_start_info;

        let mut base_media_decode_time = if keep_original_timestamps {
            min_segment_dts - start.base_media_decode_time as i64
        } else {
            min_segment_dts - start.dts.unwrap_or(0) as i64 + start.base_media_decode_time as i64
        };

        if base_media_decode_time < 0 {
            warn!(
                pid = self.pid,
                value = base_media_decode_time,
                "negative base media decode time clamped to zero"
            );
            base_media_decode_time = 0;
            self.clamped_to_zero = true;
        }

        let mut value = base_media_decode_time as u64;
        if self.track_type == TrackType::Audio {
            value = value * self.samplerate as u64 / ONE_SECOND_IN_TS;
        }
        self.base_media_decode_time = value;
        value
    }
}
