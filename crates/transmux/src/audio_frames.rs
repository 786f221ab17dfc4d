//! Audio frame utilities: earliest-DTS trimming, silence prefixing, and
//! sample-table generation for ADTS frame runs.

use bytes::{Bytes, BytesMut};
use codecs::{AdtsFrame, silent_frame};
use mp4::{Sample, SampleFlags};
use tracing::debug;

use crate::clock::{ONE_SECOND_IN_TS, audio_ts_to_video_ts, video_ts_to_audio_ts};
use crate::track::Track;

/// Samples per AAC frame in the audio timescale.
const AUDIO_SAMPLES_PER_FRAME: u32 = 1024;

/// Duration of one AAC frame in 90 kHz ticks, rounded up.
pub fn audio_frame_duration(samplerate: u32) -> u64 {
    (AUDIO_SAMPLES_PER_FRAME as u64 * ONE_SECOND_IN_TS).div_ceil(samplerate as u64)
}

/// Drop frames that decode before `earliest_allowed_dts`, refreshing the
/// track's observed minimum from the survivors.
pub fn trim_frames_by_earliest_dts(
    frames: Vec<AdtsFrame>,
    track: &mut Track,
    earliest_allowed_dts: u64,
) -> Vec<AdtsFrame> {
    if track
        .min_segment_dts
        .is_some_and(|min| min >= earliest_allowed_dts)
    {
        return frames;
    }

    track.min_segment_dts = None;
    let kept: Vec<AdtsFrame> = frames
        .into_iter()
        .filter(|frame| {
            if frame.dts >= earliest_allowed_dts {
                let min = track.min_segment_dts.map_or(frame.dts, |v| v.min(frame.dts));
                track.min_segment_dts = Some(min);
                track.min_segment_pts = Some(min);
                true
            } else {
                false
            }
        })
        .collect();
    kept
}

/// Prepend silent frames to close the gap between the audio append point
/// and the first real frame. Returns the filled duration in 90 kHz ticks
/// and reduces the track's base media decode time to cover the prefix.
///
/// Gaps shorter than one frame or longer than half a second are left alone.
pub fn prefix_with_silence(
    track: &mut Track,
    frames: &mut Vec<AdtsFrame>,
    audio_append_start_ts: Option<u64>,
    video_base_media_decode_time: Option<u64>,
) -> u64 {
    if frames.is_empty() {
        return 0;
    }
    let (Some(append_start), Some(video_bmdt)) =
        (audio_append_start_ts, video_base_media_decode_time)
    else {
        return 0;
    };

    let base_media_decode_time_ts =
        audio_ts_to_video_ts(track.base_media_decode_time, track.samplerate);
    let frame_duration = audio_frame_duration(track.samplerate);
    let audio_gap_duration =
        base_media_decode_time_ts.saturating_sub(append_start.max(video_bmdt));

    let fill_frame_count = audio_gap_duration / frame_duration;
    let fill_duration = fill_frame_count * frame_duration;
    if fill_frame_count < 1 || fill_duration > ONE_SECOND_IN_TS / 2 {
        return 0;
    }

    // A rate without a canned silent frame falls back to repeating the
    // first real frame, which is at least decodable at the right rate.
    let silent = silent_frame(track.samplerate).unwrap_or_else(|| frames[0].data.clone());

    let template = frames[0].clone();
    for _ in 0..fill_frame_count {
        let first_dts = frames[0].dts;
        let first_pts = frames[0].pts;
        frames.insert(
            0,
            AdtsFrame {
                data: silent.clone(),
                dts: first_dts.saturating_sub(frame_duration),
                pts: first_pts.saturating_sub(frame_duration),
                ..template.clone()
            },
        );
    }

    track.base_media_decode_time = track
        .base_media_decode_time
        .saturating_sub(video_ts_to_audio_ts(fill_duration, track.samplerate));
    debug!(
        pid = track.pid,
        frames = fill_frame_count,
        duration = fill_duration,
        "prefixed audio with silence"
    );
    fill_duration
}

/// Per-frame sample table: sizes from the ADTS payloads, a constant 1024
/// audio-timescale ticks of duration each.
pub fn generate_sample_table(frames: &[AdtsFrame]) -> Vec<Sample> {
    frames
        .iter()
        .map(|frame| Sample {
            size: frame.data.len() as u32,
            duration: AUDIO_SAMPLES_PER_FRAME,
            composition_time_offset: 0,
            flags: SampleFlags::sync(),
        })
        .collect()
}

/// Concatenate the raw AAC payloads into the `mdat` body.
pub fn concatenate_frame_data(frames: &[AdtsFrame]) -> Bytes {
    let total: usize = frames.iter().map(|f| f.data.len()).sum();
    let mut out = BytesMut::with_capacity(total);
    for frame in frames {
        out.extend_from_slice(&frame.data);
    }
    out.freeze()
}
