//! Video segmentation: NAL units in, `moof`+`mdat` fragments out
//!
//! Buffers NAL units between flushes, then cuts a decoder-valid fragment:
//! the segment always begins with an access-unit delimiter, ends on a
//! complete access unit, and starts with an IDR either natively, by fusing
//! a cached GOP in front, or by pulling the first keyframe back over the
//! leading non-keyframe frames.

use std::sync::Arc;

use bytes::BytesMut;
use codecs::{NalUnit, NalUnitType};
use mp4::FragmentTrack;
use pipeline_common::StreamerContext;
use tracing::debug;

use crate::coalesce::{SegmenterEvent, TrackSegment, segment_timing_info};
use crate::events::{MediaInfo, TimestampPair, TimingInfo, TrackType};
use crate::frame::{
    Gop, GopCache, concatenate_nal_data, extend_first_keyframe, generate_sample_table,
    group_frames_into_gops, group_nals_into_frames,
};
use crate::track::Track;

/// Builds video media segments from a typed NAL stream.
pub struct VideoSegmenter {
    context: Arc<StreamerContext>,
    track: Track,
    nals: Vec<NalUnit>,
    sequence_number: u32,
    /// True initially and after reset/discontinuity: the first emitted
    /// segment must contain a native IDR.
    wait_for_keyframe: bool,
    gop_cache: GopCache,
    gops_to_align_with: Vec<TimestampPair>,
    keep_original_timestamps: bool,
    align_gops_at_end: bool,
}

impl VideoSegmenter {
    pub fn new(
        context: Arc<StreamerContext>,
        pid: u16,
        keep_original_timestamps: bool,
        align_gops_at_end: bool,
    ) -> Self {
        Self {
            context,
            track: Track::new(TrackType::Video, pid, 90_000),
            nals: Vec::new(),
            sequence_number: 0,
            wait_for_keyframe: true,
            gop_cache: GopCache::default(),
            gops_to_align_with: Vec::new(),
            keep_original_timestamps,
            align_gops_at_end,
        }
    }

    pub fn track(&self) -> &Track {
        &self.track
    }

    pub fn track_mut(&mut self) -> &mut Track {
        &mut self.track
    }

    /// Accept one NAL unit; configuration NALs update the track.
    pub fn push(&mut self, nal: NalUnit) {
        match nal.nal_unit_type {
            NalUnitType::SeqParamSet if self.track.sps.is_empty() => {
                self.track.sps = vec![nal.data.clone()];
                if let Some(config) = &nal.config {
                    self.track.width = config.width as u16;
                    self.track.height = config.height as u16;
                    self.track.profile_idc = config.profile_idc;
                    self.track.profile_compatibility = config.profile_compatibility;
                    self.track.level_idc = config.level_idc;
                    self.track.sar_ratio = config.sar_ratio;
                }
            }
            NalUnitType::PicParamSet if self.track.pps.is_empty() => {
                self.track.pps = vec![nal.data.clone()];
            }
            _ => {}
        }
        self.nals.push(nal);
    }

    /// Provide the PTS values segment starts must align with.
    pub fn align_gops_with(&mut self, gops: Vec<TimestampPair>) {
        self.gops_to_align_with = gops;
    }

    /// A timeline discontinuity: the next segment needs a native keyframe.
    pub fn discontinuity(&mut self) {
        self.wait_for_keyframe = true;
    }

    pub fn clear_gop_cache(&mut self) {
        self.gop_cache.clear();
    }

    pub fn flush(&mut self, out: &mut Vec<SegmenterEvent>) {
        let mut nals = std::mem::take(&mut self.nals);

        // A segment can only start at an access-unit delimiter.
        match nals.iter().position(NalUnit::is_aud) {
            Some(first_aud) => {
                nals.drain(..first_aud);
            }
            None => nals.clear(),
        }

        if self.wait_for_keyframe && !nals.iter().any(NalUnit::is_idr) {
            // No clean entry point yet; hold what we have.
            debug!("{} no keyframe yet, deferring segment", self.context.name);
            self.nals = nals;
            self.no_data(out);
            return;
        }

        if nals.is_empty() {
            self.no_data(out);
            return;
        }

        // The segment must end on a complete access unit; everything from
        // the last delimiter onward belongs to the next flush.
        let last_aud = nals.iter().rposition(NalUnit::is_aud).unwrap_or(0);
        if last_aud == 0 {
            self.nals = nals;
            self.no_data(out);
            return;
        }
        let retained = nals.split_off(last_aud);

        let frames = group_nals_into_frames(nals);
        let mut gops = group_frames_into_gops(frames);
        let mut prepended_content_duration = 0u64;

        if !gops[0].frames[0].key_frame {
            let fusion = self
                .gop_cache
                .gop_for_fusion(
                    gops[0].dts,
                    self.track.timeline_start_info.dts,
                    self.track.sps.first(),
                    self.track.pps.first(),
                )
                .cloned();
            match fusion {
                Some(gop) => {
                    debug!(
                        "{} fusing cached GOP at dts {} before segment",
                        self.context.name, gop.dts
                    );
                    prepended_content_duration = gop.duration;
                    gops.insert(0, gop);
                }
                None => gops = extend_first_keyframe(gops),
            }
        }

        if !self.gops_to_align_with.is_empty() {
            let aligned = if self.align_gops_at_end {
                align_gops_at_end(&gops, &self.gops_to_align_with)
            } else {
                align_gops_at_start(&gops, &self.gops_to_align_with)
            };
            match aligned {
                Some(trimmed) => {
                    self.track.clear_dts_info();
                    gops = trimmed;
                }
                None => {
                    debug!("{} unable to align GOPs, deferring segment", self.context.name);
                    if let Some(last) = gops.pop() {
                        self.gop_cache.store(
                            last,
                            self.track.sps.first().cloned(),
                            self.track.pps.first().cloned(),
                        );
                    }
                    self.nals = retained;
                    self.no_data(out);
                    return;
                }
            }
        }

        let first = &gops[0];
        let last = gops.last().unwrap_or(first);
        let (first_pts, first_dts) = (first.pts, first.dts);
        let (end_pts, end_dts) = (last.pts + last.duration, last.dts + last.duration);

        self.track.clear_dts_info();
        self.track.collect_dts_info(first_pts, first_dts);
        self.track.collect_dts_info(end_pts, end_dts);
        self.track.establish_timeline_start();

        let samples = generate_sample_table(&gops);
        let mdat_payload = concatenate_nal_data(&gops);
        let base_media_decode_time = self
            .track
            .calculate_base_media_decode_time(self.keep_original_timestamps);

        let fragment = FragmentTrack {
            id: self.track.id,
            base_media_decode_time,
            samples,
            is_video: true,
        };
        let moof = mp4::moof(self.sequence_number, &fragment);
        self.sequence_number += 1;
        let mdat = mp4::mdat(mdat_payload);

        let mut boxes = BytesMut::with_capacity(moof.len() + mdat.len());
        boxes.extend_from_slice(&moof);
        boxes.extend_from_slice(&mdat);

        out.push(SegmenterEvent::SegmentTiming {
            track_type: TrackType::Video,
            info: segment_timing_info(
                base_media_decode_time,
                first_dts,
                first_pts,
                end_dts,
                end_pts,
                prepended_content_duration,
            ),
        });
        let timing = TimingInfo {
            start: first_pts,
            end: end_pts,
        };
        out.push(SegmenterEvent::Timing {
            track_type: TrackType::Video,
            info: timing,
        });
        out.push(SegmenterEvent::GopInfo(gops.iter().map(Gop::info).collect()));
        out.push(SegmenterEvent::BaseMediaDecodeTime(base_media_decode_time));
        out.push(SegmenterEvent::TimelineStartInfo {
            dts: self.track.timeline_start_info.dts,
            pts: self.track.timeline_start_info.pts,
        });

        // Remember the trailing GOP for future fusion.
        if let Some(last_gop) = gops.pop() {
            self.gop_cache.store(
                last_gop,
                self.track.sps.first().cloned(),
                self.track.pps.first().cloned(),
            );
        }

        out.push(SegmenterEvent::Segment(Box::new(TrackSegment {
            track_type: TrackType::Video,
            pid: self.track.pid,
            codec: mp4::avc_codec_string(
                self.track.profile_idc,
                self.track.profile_compatibility,
                self.track.level_idc,
            ),
            init: video_init_track(&self.track),
            boxes: boxes.freeze(),
            timing,
            timeline_start_pts: self.track.timeline_start_info.pts,
            media_info: MediaInfo {
                width: self.track.width,
                height: self.track.height,
                ..MediaInfo::default()
            },
        })));

        self.wait_for_keyframe = false;
        self.track.clear_dts_info();
        self.nals = retained;
    }

    fn no_data(&self, out: &mut Vec<SegmenterEvent>) {
        out.push(SegmenterEvent::NoData {
            track_type: TrackType::Video,
            pid: self.track.pid,
        });
    }
}

/// Build the init-segment description for a video track.
pub(crate) fn video_init_track(track: &Track) -> mp4::InitTrack {
    mp4::InitTrack {
        id: track.id,
        timescale: track.timescale,
        kind: mp4::TrackKind::Video {
            width: track.width,
            height: track.height,
            sps: track.sps.clone(),
            pps: track.pps.clone(),
            profile_idc: track.profile_idc,
            profile_compatibility: track.profile_compatibility,
            level_idc: track.level_idc,
            sar_ratio: track.sar_ratio,
        },
    }
}

/// Trim leading GOPs until the first retained GOP's PTS matches an
/// alignment point. `None` when no alignment is possible.
fn align_gops_at_start(gops: &[Gop], align_with: &[TimestampPair]) -> Option<Vec<Gop>> {
    let mut align_index = 0;
    let mut gop_index = 0;
    let mut matched = false;

    while align_index < align_with.len() && gop_index < gops.len() {
        let align = align_with[align_index];
        let gop = &gops[gop_index];
        if align.pts == gop.pts {
            matched = true;
            break;
        }
        if gop.pts > align.pts {
            align_index += 1;
            continue;
        }
        gop_index += 1;
    }

    if !matched {
        return None;
    }
    Some(gops[gop_index..].to_vec())
}

/// Trim so the retained run's trailing GOP lands on an alignment point,
/// searching from the end. `None` when no alignment is possible.
fn align_gops_at_end(gops: &[Gop], align_with: &[TimestampPair]) -> Option<Vec<Gop>> {
    let mut align_index = align_with.len() as i64 - 1;
    let mut gop_index = gops.len() as i64 - 1;
    let mut align_end_index: Option<usize> = None;
    let mut match_found = false;

    while align_index >= 0 && gop_index >= 0 {
        let align = align_with[align_index as usize];
        let gop = &gops[gop_index as usize];
        if align.pts == gop.pts {
            match_found = true;
            break;
        }
        if align.pts > gop.pts {
            align_index -= 1;
            continue;
        }
        if align_index == align_with.len() as i64 - 1 {
            align_end_index = Some(gop_index as usize);
        }
        gop_index -= 1;
    }

    if !match_found && align_end_index.is_none() {
        return None;
    }
    let trim_index = if match_found {
        gop_index as usize
    } else {
        align_end_index.unwrap_or(0)
    };
    Some(gops[trim_index..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use codecs::SpsConfig;
    use pipeline_common::test_utils::create_test_context;

    fn nal(nal_unit_type: NalUnitType, pts: u64, dts: u64) -> NalUnit {
        NalUnit {
            nal_unit_type,
            data: vec![0xAB; 8].into(),
            pts,
            dts,
            config: None,
        }
    }

    fn sps_nal() -> NalUnit {
        NalUnit {
            nal_unit_type: NalUnitType::SeqParamSet,
            data: vec![0x67, 0x42, 0xC0, 0x1E].into(),
            pts: 0,
            dts: 0,
            config: Some(SpsConfig {
                profile_idc: 66,
                profile_compatibility: 0xC0,
                level_idc: 30,
                width: 320,
                height: 240,
                sar_ratio: (1, 1),
            }),
        }
    }

    fn pps_nal() -> NalUnit {
        NalUnit {
            nal_unit_type: NalUnitType::PicParamSet,
            data: vec![0x68, 0xCE].into(),
            pts: 0,
            dts: 0,
            config: None,
        }
    }

    fn push_access_unit(segmenter: &mut VideoSegmenter, dts: u64, idr: bool) {
        segmenter.push(nal(NalUnitType::AccessUnitDelimiter, dts, dts));
        if idr {
            segmenter.push(sps_nal());
            segmenter.push(pps_nal());
            segmenter.push(nal(NalUnitType::SliceIdr, dts, dts));
        } else {
            segmenter.push(nal(NalUnitType::SliceNonIdr, dts, dts));
        }
    }

    fn segmenter() -> VideoSegmenter {
        VideoSegmenter::new(create_test_context(), 0x100, false, false)
    }

    /// 30 fps GOP: one IDR then `count - 1` P-frames, 3000-tick spacing.
    fn push_gop(segmenter: &mut VideoSegmenter, start_dts: u64, count: u64) {
        for i in 0..count {
            push_access_unit(segmenter, start_dts + i * 3000, i == 0);
        }
    }

    fn segment_from(out: &[SegmenterEvent]) -> Option<&TrackSegment> {
        out.iter().find_map(|e| match e {
            SegmenterEvent::Segment(seg) => Some(seg.as_ref()),
            _ => None,
        })
    }

    #[test]
    fn test_basic_segment_emission() {
        let mut segmenter = segmenter();
        push_gop(&mut segmenter, 90_000, 10);
        // Close the final access unit so nine frames are complete.
        let mut out = Vec::new();
        segmenter.flush(&mut out);

        let segment = segment_from(&out).expect("segment emitted");
        assert_eq!(segment.track_type, TrackType::Video);
        assert_eq!(segment.codec, "avc1.42c01e");
        assert_eq!(segment.media_info.width, 320);
        // First fragment lands at decode time zero.
        let moof = mp4::find_box_path(&segment.boxes, &[b"moof", b"traf", b"tfdt"]).unwrap();
        let body = &segment.boxes[moof.body_start..moof.body_end];
        assert_eq!(u64::from_be_bytes(body[4..12].try_into().unwrap()), 0);
    }

    #[test]
    fn test_waits_for_keyframe() {
        let mut segmenter = segmenter();
        for i in 0..5 {
            push_access_unit(&mut segmenter, i * 3000, false);
        }
        let mut out = Vec::new();
        segmenter.flush(&mut out);
        assert!(segment_from(&out).is_none());
        assert!(matches!(out[0], SegmenterEvent::NoData { .. }));

        // The keyframe arrives: held NALs plus the new GOP segment together.
        push_gop(&mut segmenter, 15_000, 5);
        let mut out = Vec::new();
        segmenter.flush(&mut out);
        let segment = segment_from(&out).expect("segment after keyframe");
        // Leading non-keyframe frames were dropped by the keyframe pull.
        let trun = mp4::find_box_path(&segment.boxes, &[b"moof", b"traf", b"trun"]).unwrap();
        let body = &segment.boxes[trun.body_start..trun.body_end];
        let sample_count = u32::from_be_bytes(body[4..8].try_into().unwrap());
        assert_eq!(sample_count, 4);
    }

    #[test]
    fn test_segment_ends_on_complete_access_unit() {
        let mut segmenter = segmenter();
        push_gop(&mut segmenter, 0, 3);
        let mut out = Vec::new();
        segmenter.flush(&mut out);
        let segment = segment_from(&out).unwrap();
        let trun = mp4::find_box_path(&segment.boxes, &[b"moof", b"traf", b"trun"]).unwrap();
        let body = &segment.boxes[trun.body_start..trun.body_end];
        // The final access unit is retained for the next flush.
        assert_eq!(u32::from_be_bytes(body[4..8].try_into().unwrap()), 2);
    }

    #[test]
    fn test_gop_fusion_on_non_keyframe_start() {
        let mut segmenter = segmenter();
        push_gop(&mut segmenter, 0, 4);
        let mut out = Vec::new();
        segmenter.flush(&mut out);
        assert!(segment_from(&out).is_some());

        // Next segment starts with P-frames only, continuing the timeline.
        for i in 0..4 {
            push_access_unit(&mut segmenter, 9000 + i * 3000, false);
        }
        let mut out = Vec::new();
        segmenter.flush(&mut out);
        let timing = out
            .iter()
            .find_map(|e| match e {
                SegmenterEvent::SegmentTiming { info, .. } => Some(*info),
                _ => None,
            })
            .unwrap();
        assert!(
            timing.prepended_content_duration > 0,
            "fusion reports prepended duration"
        );
        let segment = segment_from(&out).unwrap();
        // The fused segment starts with the cached GOP's keyframe.
        let trun = mp4::find_box_path(&segment.boxes, &[b"moof", b"traf", b"trun"]).unwrap();
        let body = &segment.boxes[trun.body_start..trun.body_end];
        let flags = u32::from_be_bytes(body[20..24].try_into().unwrap());
        assert_eq!((flags >> 24) & 0x03, 2, "first sample is a keyframe");
    }

    #[test]
    fn test_alignment_failure_defers_segment() {
        let mut segmenter = segmenter();
        segmenter.align_gops_with(vec![TimestampPair { dts: 0, pts: 1 }]);
        push_gop(&mut segmenter, 90_000, 4);
        let mut out = Vec::new();
        segmenter.flush(&mut out);
        assert!(segment_from(&out).is_none());
    }

    #[test]
    fn test_alignment_trims_to_matching_gop() {
        let mut segmenter = segmenter();
        // Two GOPs starting at 0 and 9000; align to the second.
        segmenter.align_gops_with(vec![TimestampPair { dts: 9000, pts: 9000 }]);
        push_gop(&mut segmenter, 0, 3);
        push_gop(&mut segmenter, 9000, 3);
        push_access_unit(&mut segmenter, 18_000, true); // terminator
        let mut out = Vec::new();
        segmenter.flush(&mut out);
        let segment = segment_from(&out).unwrap();
        assert_eq!(segment.timing.start, 9000);
    }

    #[test]
    fn test_align_gops_at_start_helper() {
        let gops: Vec<Gop> = [0u64, 9000, 18_000]
            .iter()
            .map(|&dts| crate::frame::tests::simple_gop(dts, 3, 3000))
            .collect();
        let align = [TimestampPair {
            dts: 9000,
            pts: 9000,
        }];
        let aligned = align_gops_at_start(&gops, &align).unwrap();
        assert_eq!(aligned.len(), 2);
        assert_eq!(aligned[0].pts, 9000);

        assert!(align_gops_at_start(&gops, &[TimestampPair { dts: 1, pts: 1 }]).is_none());
    }

    #[test]
    fn test_align_gops_at_end_helper() {
        let gops: Vec<Gop> = [0u64, 9000, 18_000]
            .iter()
            .map(|&dts| crate::frame::tests::simple_gop(dts, 3, 3000))
            .collect();
        let align = [
            TimestampPair { dts: 0, pts: 0 },
            TimestampPair {
                dts: 18_000,
                pts: 18_000,
            },
        ];
        let aligned = align_gops_at_end(&gops, &align).unwrap();
        assert_eq!(aligned.last().unwrap().pts, 18_000);
    }
}
