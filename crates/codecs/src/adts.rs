//! AAC ADTS frame parsing
//!
//! Resynchronizes on the 0xFFF sync pattern inside audio PES payloads,
//! carries partial frames across packet boundaries, and emits raw AAC
//! frames with the codec parameters decoded from the ADTS header.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use pipeline_common::{PipelineError, Stage, StreamerContext};
use rustc_hash::FxHashMap;
use tracing::debug;
use ts::PesPacket;

/// One second in the 90 kHz transport clock.
const ONE_SECOND_IN_TS: u64 = 90_000;

/// Samples per AAC frame.
const SAMPLES_PER_FRAME: u64 = 1024;

/// Sampling frequencies by the 4-bit ADTS sampling_frequency_index.
const SAMPLING_FREQUENCIES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// A single raw AAC frame extracted from ADTS framing.
#[derive(Debug, Clone)]
pub struct AdtsFrame {
    pub pid: u16,
    pub pts: u64,
    pub dts: u64,
    /// Raw AAC payload, ADTS header stripped.
    pub data: Bytes,
    pub samplerate: u32,
    pub channelcount: u8,
    pub samplesize: u16,
    /// MPEG-4 audio object type (2 = AAC-LC).
    pub audioobjecttype: u8,
}

impl AdtsFrame {
    /// Frame duration in 90 kHz ticks, rounded up.
    pub fn duration_90khz(samplerate: u32) -> u64 {
        (SAMPLES_PER_FRAME * ONE_SECOND_IN_TS).div_ceil(samplerate as u64)
    }
}

#[derive(Debug, Default)]
struct PidState {
    buffer: BytesMut,
    base_pts: u64,
    base_dts: u64,
    /// Frames emitted since the last PES timestamp, used to step the PTS.
    frame_index: u64,
}

/// ADTS elementary-stream stage: audio PES packets in, AAC frames out.
///
/// Each audio PID gets its own resync buffer so interleaved multi-language
/// programs do not corrupt one another.
pub struct AdtsStream {
    context: Arc<StreamerContext>,
    pids: FxHashMap<u16, PidState>,
}

impl AdtsStream {
    pub fn new(context: Arc<StreamerContext>) -> Self {
        Self {
            context,
            pids: FxHashMap::default(),
        }
    }

    pub fn reset(&mut self) {
        self.pids.clear();
    }

    fn drain(context: &StreamerContext, pid: u16, state: &mut PidState, out: &mut Vec<AdtsFrame>) {
        let mut i = 0usize;
        let buffer = &state.buffer;

        while i + 7 <= buffer.len() {
            // Look for the ADTS sync word: 12 set bits, layer 00.
            if buffer[i] != 0xFF || (buffer[i + 1] & 0xF6) != 0xF0 {
                i += 1;
                continue;
            }

            let frame_length = ((buffer[i + 3] as usize & 0x03) << 11)
                | ((buffer[i + 4] as usize) << 3)
                | ((buffer[i + 5] as usize & 0xE0) >> 5);
            if frame_length < 7 {
                // Impossible header; skip the false sync.
                i += 1;
                continue;
            }
            if i + frame_length > buffer.len() {
                // Incomplete frame; wait for more payload.
                break;
            }

            let frequency_index = (buffer[i + 2] & 0x3C) >> 2;
            let Some(&samplerate) = SAMPLING_FREQUENCIES.get(frequency_index as usize) else {
                debug!(
                    "{} invalid ADTS sampling_frequency_index {frequency_index} on PID {pid:#06x}",
                    context.name
                );
                i += 1;
                continue;
            };

            // protection_absent == 0 means a 2-byte CRC follows the header.
            let header_length = 7 + if buffer[i + 1] & 0x01 == 0 { 2 } else { 0 };
            if frame_length < header_length {
                i += 1;
                continue;
            }
            let channelcount = ((buffer[i + 2] & 0x01) << 2) | ((buffer[i + 3] & 0xC0) >> 6);
            let audioobjecttype = ((buffer[i + 2] >> 6) & 0x03) + 1;

            let offset = AdtsFrame::duration_90khz(samplerate) * state.frame_index;
            out.push(AdtsFrame {
                pid,
                pts: state.base_pts + offset,
                dts: state.base_dts + offset,
                data: Bytes::copy_from_slice(&buffer[i + header_length..i + frame_length]),
                samplerate,
                channelcount,
                samplesize: 16,
                audioobjecttype,
            });
            state.frame_index += 1;
            i += frame_length;
        }

        let _ = state.buffer.split_to(i);
    }
}

impl Stage for AdtsStream {
    type In = PesPacket;
    type Out = AdtsFrame;

    fn push(&mut self, input: PesPacket, out: &mut Vec<AdtsFrame>) -> Result<(), PipelineError> {
        let state = self.pids.entry(input.pid).or_default();
        if let (Some(pts), Some(dts)) = (input.pts, input.dts) {
            state.base_pts = pts;
            state.base_dts = dts;
            state.frame_index = 0;
        }
        state.buffer.extend_from_slice(&input.data);
        Self::drain(&self.context, input.pid, state, out);
        Ok(())
    }

    fn flush(&mut self, _out: &mut Vec<AdtsFrame>) -> Result<(), PipelineError> {
        // A trailing partial frame stays buffered; it may complete in the
        // next timed segment.
        Ok(())
    }

    fn name(&self) -> &'static str {
        "AdtsStream"
    }
}
