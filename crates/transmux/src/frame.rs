//! NAL → frame → GOP grouping and the fusion cache
//!
//! Frames are access units delimited by AUD NALs; GOPs are keyframe-rooted
//! frame runs. Both are plain value types carrying their aggregates
//! (duration, byte length, NAL count) as explicit fields.

use bytes::{BufMut, Bytes, BytesMut};
use codecs::NalUnit;
use mp4::{Sample, SampleFlags};

use crate::events::GopInfo;

/// Bytes a NAL occupies in the AVCC-framed mdat: 4-byte length prefix + data.
fn avcc_len(nal: &NalUnit) -> usize {
    4 + nal.data.len()
}

/// One access unit: the NALs between two AUDs.
#[derive(Debug, Clone)]
pub struct Frame {
    pub nals: Vec<NalUnit>,
    pub pts: u64,
    pub dts: u64,
    pub duration: u64,
    /// AVCC-framed size of the access unit.
    pub byte_length: usize,
    pub key_frame: bool,
}

/// One keyframe-rooted group of pictures.
#[derive(Debug, Clone)]
pub struct Gop {
    pub frames: Vec<Frame>,
    pub pts: u64,
    pub dts: u64,
    pub duration: u64,
    pub byte_length: usize,
    pub nal_count: usize,
}

impl Gop {
    pub fn info(&self) -> GopInfo {
        GopInfo {
            pts: self.pts,
            dts: self.dts,
            byte_length: self.byte_length,
        }
    }
}

/// Group NALs into AUD-delimited frames.
///
/// The caller guarantees the list starts with an AUD; a frame's duration is
/// the DTS step to the next frame, with the final frame inheriting its
/// predecessor's duration.
pub fn group_nals_into_frames(nals: Vec<NalUnit>) -> Vec<Frame> {
    let mut frames: Vec<Frame> = Vec::new();
    let mut current: Option<Frame> = None;

    for nal in nals {
        if nal.is_aud() {
            if let Some(mut finished) = current.take() {
                finished.duration = nal.dts.saturating_sub(finished.dts);
                frames.push(finished);
            }
            current = Some(Frame {
                byte_length: avcc_len(&nal),
                pts: nal.pts,
                dts: nal.dts,
                duration: 0,
                key_frame: false,
                nals: vec![nal],
            });
        } else if let Some(frame) = current.as_mut() {
            frame.key_frame |= nal.is_idr();
            frame.byte_length += avcc_len(&nal);
            frame.nals.push(nal);
        }
    }

    if let Some(mut last) = current.take() {
        if last.duration == 0 {
            last.duration = frames.last().map(|f| f.duration).unwrap_or(0);
        }
        frames.push(last);
    }
    frames
}

/// Group frames into keyframe-started GOPs.
pub fn group_frames_into_gops(frames: Vec<Frame>) -> Vec<Gop> {
    let mut gops: Vec<Gop> = Vec::new();

    for frame in frames {
        let start_new = frame.key_frame || gops.is_empty();
        if start_new {
            gops.push(Gop {
                pts: frame.pts,
                dts: frame.dts,
                duration: frame.duration,
                byte_length: frame.byte_length,
                nal_count: frame.nals.len(),
                frames: vec![frame],
            });
        } else if let Some(gop) = gops.last_mut() {
            gop.duration += frame.duration;
            gop.byte_length += frame.byte_length;
            gop.nal_count += frame.nals.len();
            gop.frames.push(frame);
        }
    }
    gops
}

/// Keyframe-pull: drop a leading keyframe-less GOP and stretch the next
/// keyframe's presentation backwards over the discarded span.
pub fn extend_first_keyframe(mut gops: Vec<Gop>) -> Vec<Gop> {
    if gops.len() > 1 && !gops[0].frames[0].key_frame {
        let removed = gops.remove(0);
        let first = &mut gops[0];
        first.pts = removed.pts;
        first.dts = removed.dts;
        first.duration += removed.duration;
        let frame = &mut first.frames[0];
        frame.pts = removed.pts;
        frame.dts = removed.dts;
        frame.duration += removed.duration;
    }
    gops
}

/// Build the per-sample table for the fragment's `trun`.
pub fn generate_sample_table(gops: &[Gop]) -> Vec<Sample> {
    let mut samples = Vec::new();
    for gop in gops {
        for frame in &gop.frames {
            samples.push(Sample {
                size: frame.byte_length as u32,
                duration: frame.duration as u32,
                composition_time_offset: frame.pts.wrapping_sub(frame.dts) as i64 as i32,
                flags: if frame.key_frame {
                    SampleFlags::sync()
                } else {
                    SampleFlags::non_sync()
                },
            });
        }
    }
    samples
}

/// Concatenate the GOPs' NAL payloads into AVCC framing for the `mdat`.
pub fn concatenate_nal_data(gops: &[Gop]) -> Bytes {
    let total: usize = gops.iter().map(|g| g.byte_length).sum();
    let mut out = BytesMut::with_capacity(total);
    for gop in gops {
        for frame in &gop.frames {
            for nal in &frame.nals {
                out.put_u32(nal.data.len() as u32);
                out.extend_from_slice(&nal.data);
            }
        }
    }
    out.freeze()
}

/// A cached GOP with the parameter sets active when it was emitted.
#[derive(Debug, Clone)]
pub struct CachedGop {
    pub gop: Gop,
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
}

/// Bounded LRU of recently emitted GOPs, newest first, used for fusion.
#[derive(Debug, Default)]
pub struct GopCache {
    entries: Vec<CachedGop>,
}

/// Fusion window below the incoming DTS, in 90 kHz ticks (half a second).
const FUSION_MAX_GAP: i64 = 45_000;

/// Allowed overlap past the incoming DTS, in 90 kHz ticks.
const FUSION_MAX_OVERLAP: i64 = 10_000;

impl GopCache {
    const CAPACITY: usize = 6;

    /// Remember an emitted GOP, evicting the oldest entry beyond capacity.
    pub fn store(&mut self, gop: Gop, sps: Option<Bytes>, pps: Option<Bytes>) {
        self.entries.insert(0, CachedGop { gop, sps, pps });
        self.entries.truncate(Self::CAPACITY);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Find the best GOP to prepend before a segment starting at `next_dts`:
    /// parameter sets must match, the candidate must not predate the
    /// timeline start, and the gap `next_dts − (gop.dts + gop.duration)`
    /// must fall within `[-FUSION_MAX_OVERLAP, FUSION_MAX_GAP]`. The
    /// closest candidate by that gap wins.
    pub fn gop_for_fusion(
        &self,
        next_dts: u64,
        timeline_start_dts: Option<u64>,
        sps: Option<&Bytes>,
        pps: Option<&Bytes>,
    ) -> Option<&Gop> {
        let mut nearest: Option<(&Gop, i64)> = None;

        for entry in &self.entries {
            if entry.sps.as_ref() != sps || entry.pps.as_ref() != pps {
                continue;
            }
            if let Some(start) = timeline_start_dts
                && entry.gop.dts < start
            {
                continue;
            }
            let distance =
                next_dts as i64 - entry.gop.dts as i64 - entry.gop.duration as i64;
            if (-FUSION_MAX_OVERLAP..=FUSION_MAX_GAP).contains(&distance)
                && nearest.is_none_or(|(_, best)| distance < best)
            {
                nearest = Some((&entry.gop, distance));
            }
        }

        nearest.map(|(gop, _)| gop)
    }
}
