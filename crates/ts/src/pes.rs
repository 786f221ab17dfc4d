//! PES reassembly
//!
//! Elementary-stream payload arrives as TS-sized fragments; this stage
//! accumulates them per PID, detects unit boundaries on the payload-unit
//! start indicator, and parses the PES header including the 33-bit PTS/DTS
//! fields (ISO 13818-1 §2.4.3.7).

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use pipeline_common::{PipelineError, Stage, StreamerContext};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::demux::PesFragment;
use crate::psi::PidRole;

/// Minimum bytes needed before a PES header can be parsed.
const MIN_PES_HEADER: usize = 9;

/// A fully reassembled PES packet with decoded header fields.
#[derive(Debug, Clone)]
pub struct PesPacket {
    pub pid: u16,
    pub role: PidRole,
    pub stream_type: u8,
    /// 33-bit PTS, as carried on the wire (rollover extension happens later).
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub data_alignment: bool,
    /// Raw PES_packet_length field; zero means "until next start" (video only).
    pub packet_length: u16,
    pub data: Bytes,
}

/// Parse a 33-bit PTS or DTS timestamp from 5 bytes.
///
/// Layout: `[marker(4) | ts32..30 | 1 | ts29..15 | 1 | ts14..0 | 1]`
fn parse_timestamp(data: &[u8]) -> u64 {
    (((data[0] as u64 >> 1) & 0x07) << 30)
        | ((data[1] as u64) << 22)
        | (((data[2] as u64 >> 1) & 0x7F) << 15)
        | ((data[3] as u64) << 7)
        | ((data[4] as u64 >> 1) & 0x7F)
}

/// Parse a complete PES packet. Returns `None` for units the stream should
/// silently discard (bad start code while re-aligning, impossible header).
fn parse_pes(pid: u16, role: PidRole, stream_type: u8, data: Bytes) -> Option<PesPacket> {
    if data.len() < MIN_PES_HEADER {
        return None;
    }
    if data[0] != 0x00 || data[1] != 0x00 || data[2] != 0x01 {
        return None;
    }

    let packet_length = ((data[4] as u16) << 8) | data[5] as u16;
    let data_alignment = (data[6] & 0x04) != 0;
    let pts_dts_flags = (data[7] >> 6) & 0x03;
    let pes_header_data_length = data[8] as usize;
    let payload_offset = MIN_PES_HEADER + pes_header_data_length;
    if payload_offset > data.len() {
        return None;
    }

    let (pts, dts) = match pts_dts_flags {
        0b10 => {
            if data.len() < 14 {
                return None;
            }
            let pts = parse_timestamp(&data[9..14]);
            (Some(pts), Some(pts))
        }
        0b11 => {
            if data.len() < 19 {
                return None;
            }
            (
                Some(parse_timestamp(&data[9..14])),
                Some(parse_timestamp(&data[14..19])),
            )
        }
        // The 0b01 flag combination is forbidden by ISO 13818-1; treat it
        // like a malformed header.
        0b01 => return None,
        _ => (None, None),
    };

    Some(PesPacket {
        pid,
        role,
        stream_type,
        pts,
        dts,
        data_alignment,
        packet_length,
        data: data.slice(payload_offset..),
    })
}

#[derive(Debug, Default)]
struct PesAccumulator {
    role: Option<PidRole>,
    stream_type: u8,
    fragments: Vec<Bytes>,
    size: usize,
}

impl PesAccumulator {
    fn clear(&mut self) {
        self.fragments.clear();
        self.size = 0;
    }

    fn concatenate(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size);
        for fragment in &self.fragments {
            buf.extend_from_slice(fragment);
        }
        buf.freeze()
    }
}

/// Reassembles PES packets from TS payload fragments.
pub struct ElementaryStream {
    context: Arc<StreamerContext>,
    accumulators: FxHashMap<u16, PesAccumulator>,
}

impl ElementaryStream {
    pub fn new(context: Arc<StreamerContext>) -> Self {
        Self {
            context,
            accumulators: FxHashMap::default(),
        }
    }

    pub fn reset(&mut self) {
        self.accumulators.clear();
    }

    /// Flush one accumulator.
    ///
    /// Video is emitted on every unit boundary (its length field is usually
    /// zero); audio and metadata are emitted only once the declared packet
    /// length is fully buffered. `force` clears the buffer either way, which
    /// is what a new payload-unit start requires.
    fn flush_pid(&mut self, pid: u16, force: bool, out: &mut Vec<PesPacket>) {
        let Some(acc) = self.accumulators.get_mut(&pid) else {
            return;
        };
        let Some(role) = acc.role else {
            return;
        };

        if acc.size < MIN_PES_HEADER {
            if force {
                acc.clear();
            }
            return;
        }

        let declared_length = if acc.size >= 6 {
            // Peek the length field without concatenating; it lives in the
            // first fragment in practice, but handle the split case too.
            let mut header = [0u8; 6];
            let mut copied = 0;
            for fragment in &acc.fragments {
                let take = (6 - copied).min(fragment.len());
                header[copied..copied + take].copy_from_slice(&fragment[..take]);
                copied += take;
                if copied == 6 {
                    break;
                }
            }
            ((header[4] as usize) << 8) | header[5] as usize
        } else {
            0
        };

        // Completeness: header (6 bytes) + declared body must be buffered.
        let flushable = role == PidRole::Video || 6 + declared_length <= acc.size;

        if flushable {
            let data = acc.concatenate();
            let stream_type = acc.stream_type;
            acc.clear();
            match parse_pes(pid, role, stream_type, data) {
                Some(packet) => out.push(packet),
                None => debug!(
                    "{} discarding unparseable PES unit on PID {pid:#06x}",
                    self.context.name
                ),
            }
        } else if force {
            acc.clear();
        }
    }

    /// Flush everything in the deterministic order the coalescer observes:
    /// video first, then audio PIDs ascending, then private data, then timed
    /// metadata.
    fn flush_all(&mut self, out: &mut Vec<PesPacket>) {
        let mut order: Vec<(u16, PidRole)> = self
            .accumulators
            .iter()
            .filter_map(|(&pid, acc)| acc.role.map(|role| (pid, role)))
            .collect();
        order.sort_by_key(|&(pid, role)| {
            let rank = match role {
                PidRole::Video => 0,
                PidRole::Audio => 1,
                PidRole::PrivateData => 2,
                PidRole::TimedMetadata => 3,
            };
            (rank, pid)
        });
        for (pid, _) in order {
            self.flush_pid(pid, false, out);
        }
    }
}

impl Stage for ElementaryStream {
    type In = PesFragment;
    type Out = PesPacket;

    fn push(&mut self, input: PesFragment, out: &mut Vec<PesPacket>) -> Result<(), PipelineError> {
        if input.payload_unit_start {
            self.flush_pid(input.pid, true, out);
        }

        let acc = self.accumulators.entry(input.pid).or_default();
        if acc.role.is_none() {
            // A unit that began before we started watching cannot be parsed.
            if !input.payload_unit_start {
                return Ok(());
            }
            acc.role = Some(input.role);
            acc.stream_type = input.stream_type;
        }
        acc.size += input.payload.len();
        acc.fragments.push(input.payload);
        Ok(())
    }

    fn flush(&mut self, out: &mut Vec<PesPacket>) -> Result<(), PipelineError> {
        self.flush_all(out);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ElementaryStream"
    }
}
