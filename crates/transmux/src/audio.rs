//! Audio segmentation: ADTS frames in, `moof`+`mdat` fragments out
//!
//! Keeps one buffer, track, and fragment sequence per audio PID. Each flush
//! trims frames that precede the video timeline, fills append gaps with
//! silence, and emits one fragment per PID with data.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::BytesMut;
use codecs::AdtsFrame;
use mp4::FragmentTrack;
use pipeline_common::StreamerContext;
use tracing::debug;

use crate::audio_frames::{
    audio_frame_duration, concatenate_frame_data, generate_sample_table, prefix_with_silence,
    trim_frames_by_earliest_dts,
};
use crate::clock::audio_ts_to_video_ts;
use crate::coalesce::{SegmenterEvent, TrackSegment, segment_timing_info};
use crate::events::{MediaInfo, TimingInfo, TrackType};
use crate::track::Track;

struct PidState {
    track: Track,
    frames: Vec<AdtsFrame>,
    sequence_number: u32,
}

/// Builds audio media segments per PID.
pub struct AudioSegmenter {
    context: Arc<StreamerContext>,
    /// Keyed and iterated by ascending PID for deterministic emission.
    pids: BTreeMap<u16, PidState>,
    earliest_allowed_dts: Option<u64>,
    audio_append_start_ts: Option<u64>,
    video_base_media_decode_time: Option<u64>,
    keep_original_timestamps: bool,
}

impl AudioSegmenter {
    pub fn new(context: Arc<StreamerContext>, keep_original_timestamps: bool) -> Self {
        Self {
            context,
            pids: BTreeMap::new(),
            earliest_allowed_dts: None,
            audio_append_start_ts: None,
            video_base_media_decode_time: None,
            keep_original_timestamps,
        }
    }

    /// Register an advertised audio PID so the barrier accounts for it even
    /// when it never produces frames.
    pub fn add_pid(&mut self, pid: u16) {
        self.pids.entry(pid).or_insert_with(|| PidState {
            track: Track::new(TrackType::Audio, pid, 90_000),
            frames: Vec::new(),
            sequence_number: 0,
        });
    }

    /// Audio preceding this 90 kHz decode time is dropped, aligning the
    /// audio start with the video timeline.
    pub fn set_earliest_dts(&mut self, dts: u64) {
        self.earliest_allowed_dts = Some(dts);
    }

    /// Where the previous audio append ended, for gap detection.
    pub fn set_audio_append_start(&mut self, ts: u64) {
        self.audio_append_start_ts = Some(ts);
    }

    /// The video fragment's decode time of the current barrier round.
    pub fn set_video_base_media_decode_time(&mut self, value: u64) {
        self.video_base_media_decode_time = Some(value);
    }

    pub fn tracks_mut(&mut self) -> impl Iterator<Item = &mut Track> {
        self.pids.values_mut().map(|state| &mut state.track)
    }

    pub fn push(&mut self, frame: AdtsFrame) {
        self.add_pid(frame.pid);
        let state = match self.pids.get_mut(&frame.pid) {
            Some(state) => state,
            None => return,
        };
        let track = &mut state.track;
        track.samplerate = frame.samplerate;
        track.timescale = frame.samplerate;
        track.channelcount = frame.channelcount;
        track.samplesize = frame.samplesize;
        track.audioobjecttype = frame.audioobjecttype;
        track.collect_dts_info(frame.pts, frame.dts);
        state.frames.push(frame);
    }

    pub fn flush(&mut self, out: &mut Vec<SegmenterEvent>) {
        let earliest_allowed_dts = self.earliest_allowed_dts.unwrap_or(0);

        for (&pid, state) in self.pids.iter_mut() {
            if state.frames.is_empty() {
                out.push(SegmenterEvent::NoData {
                    track_type: TrackType::Audio,
                    pid,
                });
                continue;
            }

            let buffered = std::mem::take(&mut state.frames);
            let mut frames =
                trim_frames_by_earliest_dts(buffered, &mut state.track, earliest_allowed_dts);
            if frames.is_empty() {
                debug!(
                    "{} all audio frames on PID {pid:#06x} precede the timeline",
                    self.context.name
                );
                state.track.clear_dts_info();
                out.push(SegmenterEvent::NoData {
                    track_type: TrackType::Audio,
                    pid,
                });
                continue;
            }

            state.track.establish_timeline_start();
            state
                .track
                .calculate_base_media_decode_time(self.keep_original_timestamps);
            let fill_duration = prefix_with_silence(
                &mut state.track,
                &mut frames,
                self.audio_append_start_ts,
                self.video_base_media_decode_time,
            );

            let samples = generate_sample_table(&frames);
            let mdat = mp4::mdat(concatenate_frame_data(&frames));
            let fragment = FragmentTrack {
                id: state.track.id,
                base_media_decode_time: state.track.base_media_decode_time,
                samples,
                is_video: false,
            };
            let moof = mp4::moof(state.sequence_number, &fragment);
            state.sequence_number += 1;

            let mut boxes = BytesMut::with_capacity(moof.len() + mdat.len());
            boxes.extend_from_slice(&moof);
            boxes.extend_from_slice(&mdat);

            let frame_duration = audio_frame_duration(state.track.samplerate);
            let segment_duration = frames.len() as u64 * frame_duration;
            let first = &frames[0];

            out.push(SegmenterEvent::SegmentTiming {
                track_type: TrackType::Audio,
                info: segment_timing_info(
                    audio_ts_to_video_ts(
                        state.track.base_media_decode_time,
                        state.track.samplerate,
                    ),
                    first.dts,
                    first.pts,
                    first.dts + segment_duration,
                    first.pts + segment_duration,
                    fill_duration,
                ),
            });
            let timing = TimingInfo {
                start: first.pts,
                end: first.pts + segment_duration,
            };
            out.push(SegmenterEvent::Timing {
                track_type: TrackType::Audio,
                info: timing,
            });

            out.push(SegmenterEvent::Segment(Box::new(TrackSegment {
                track_type: TrackType::Audio,
                pid,
                codec: mp4::aac_codec_string(state.track.audioobjecttype),
                init: audio_init_track(&state.track),
                boxes: boxes.freeze(),
                timing,
                timeline_start_pts: state.track.timeline_start_info.pts,
                media_info: MediaInfo {
                    samplerate: state.track.samplerate,
                    channelcount: state.track.channelcount,
                    ..MediaInfo::default()
                },
            })));

            state.track.clear_dts_info();
        }
    }
}

/// Build the init-segment description for an audio track.
pub(crate) fn audio_init_track(track: &Track) -> mp4::InitTrack {
    mp4::InitTrack {
        id: track.id,
        timescale: track.samplerate,
        kind: mp4::TrackKind::Audio {
            samplerate: track.samplerate,
            channelcount: track.channelcount,
            samplesize: track.samplesize,
            audioobjecttype: track.audioobjecttype,
        },
    }
}
