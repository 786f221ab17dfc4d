//! 33-bit timestamp rollover extension
//!
//! PTS/DTS are 33-bit fields in a 90 kHz clock and wrap every ~26.5 hours.
//! This stage extends them to monotonic 64-bit values by tracking, per
//! logical stream, the last raw timestamp and a cumulative wrap offset.

use pipeline_common::{PipelineError, Stage};

use crate::pes::PesPacket;
use crate::psi::PidRole;

/// 2^32, the wrap-detection threshold in 2^33 timestamp space.
const WRAP_THRESHOLD: u64 = 1 << 32;

/// 2^33, the timestamp period.
const WRAP_PERIOD: u64 = 1 << 33;

/// Logical stream kinds that get independent rollover state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalStreamType {
    Video,
    Audio,
    TimedMetadata,
}

impl LogicalStreamType {
    fn from_role(role: PidRole) -> Self {
        match role {
            PidRole::Video => LogicalStreamType::Video,
            PidRole::Audio => LogicalStreamType::Audio,
            PidRole::TimedMetadata | PidRole::PrivateData => LogicalStreamType::TimedMetadata,
        }
    }
}

/// Per-stream rollover state: last raw DTS and accumulated wrap offset.
#[derive(Debug, Default, Clone, Copy)]
struct RolloverState {
    last_raw_dts: Option<u64>,
    offset: u64,
}

impl RolloverState {
    /// Extend a raw (pts, dts) pair. Wrap detection runs on the DTS; the PTS
    /// is corrected independently against the extended DTS so a PTS that has
    /// already wrapped while its DTS has not still comes out ahead of it.
    fn extend(&mut self, raw_pts: u64, raw_dts: u64) -> (u64, u64) {
        if let Some(last) = self.last_raw_dts
            && raw_dts + WRAP_THRESHOLD < last
        {
            self.offset += WRAP_PERIOD;
        }
        self.last_raw_dts = Some(raw_dts);

        let dts = raw_dts + self.offset;
        let mut pts = raw_pts + self.offset;
        if pts + WRAP_THRESHOLD < dts {
            pts += WRAP_PERIOD;
        }
        (pts, dts)
    }

    fn discontinuity(&mut self) {
        // The next timestamp is accepted verbatim; the offset survives so the
        // extended timeline keeps its position.
        self.last_raw_dts = None;
    }
}

/// Extends 33-bit PTS/DTS to monotonic 64-bit values.
#[derive(Debug, Default)]
pub struct TimestampRollover {
    video: RolloverState,
    audio: RolloverState,
    timed_metadata: RolloverState,
}

impl TimestampRollover {
    pub fn new() -> Self {
        Self::default()
    }

    fn state_mut(&mut self, kind: LogicalStreamType) -> &mut RolloverState {
        match kind {
            LogicalStreamType::Video => &mut self.video,
            LogicalStreamType::Audio => &mut self.audio,
            LogicalStreamType::TimedMetadata => &mut self.timed_metadata,
        }
    }

    /// Forget last-seen timestamps across an announced discontinuity.
    pub fn discontinuity(&mut self) {
        self.video.discontinuity();
        self.audio.discontinuity();
        self.timed_metadata.discontinuity();
    }

    /// Full reset, dropping accumulated wrap offsets too.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl Stage for TimestampRollover {
    type In = PesPacket;
    type Out = PesPacket;

    fn push(&mut self, mut input: PesPacket, out: &mut Vec<PesPacket>) -> Result<(), PipelineError> {
        if let (Some(raw_pts), Some(raw_dts)) = (input.pts, input.dts) {
            let kind = LogicalStreamType::from_role(input.role);
            let (pts, dts) = self.state_mut(kind).extend(raw_pts, raw_dts);
            input.pts = Some(pts);
            input.dts = Some(dts);
        }
        out.push(input);
        Ok(())
    }

    fn flush(&mut self, _out: &mut Vec<PesPacket>) -> Result<(), PipelineError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "TimestampRollover"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_wrap_passthrough() {
        let mut state = RolloverState::default();
        assert_eq!(state.extend(100, 90), (100, 90));
        assert_eq!(state.extend(200, 190), (200, 190));
    }

    #[test]
    fn test_wrap_adds_period() {
        let mut state = RolloverState::default();
        let near_end = WRAP_PERIOD - 90_000;
        state.extend(near_end, near_end);
        // The raw clock wrapped back to a small value.
        let (pts, dts) = state.extend(100, 50);
        assert_eq!(dts, WRAP_PERIOD + 50);
        assert_eq!(pts, WRAP_PERIOD + 100);
    }

    #[test]
    fn test_pts_wraps_ahead_of_dts() {
        let mut state = RolloverState::default();
        let dts = WRAP_PERIOD - 3000;
        // Presentation time crossed the wrap while decode time has not.
        let (pts, ext_dts) = state.extend(1500, dts);
        assert_eq!(ext_dts, dts);
        assert_eq!(pts, WRAP_PERIOD + 1500);
    }

    #[test]
    fn test_monotonic_across_multiple_wraps() {
        let mut state = RolloverState::default();
        let mut last_dts = 0;
        let mut raw: u64 = WRAP_PERIOD - 10_000;
        for _ in 0..5 {
            for _ in 0..10 {
                let (_, dts) = state.extend(raw, raw);
                assert!(dts >= last_dts);
                last_dts = dts;
                raw = (raw + 3003) % WRAP_PERIOD;
            }
        }
    }

    #[test]
    fn test_discontinuity_preserves_offset() {
        let mut state = RolloverState::default();
        let near_end = WRAP_PERIOD - 90_000;
        state.extend(near_end, near_end);
        state.extend(100, 100); // wrapped; offset is now 2^33
        state.discontinuity();
        // A huge backwards jump after the discontinuity is taken verbatim,
        // still lifted by the preserved offset.
        let (_, dts) = state.extend(50, 50);
        assert_eq!(dts, WRAP_PERIOD + 50);
    }

    #[test]
    fn test_backwards_jump_within_threshold_no_wrap() {
        let mut state = RolloverState::default();
        state.extend(100_000, 100_000);
        // Out-of-order timestamps smaller than 2^32 are not a wrap.
        let (_, dts) = state.extend(10_000, 10_000);
        assert_eq!(dts, 10_000);
    }
}
