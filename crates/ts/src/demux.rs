//! TS header routing: PAT → PMT → PES
//!
//! Parses each 188-byte packet's header, learns the PMT PID from the PAT,
//! builds the [`ProgramMap`] from the PMT, and forwards elementary-stream
//! payload fragments to the PES reassembler. PES packets seen before the
//! first PMT are held in a waiting queue and replayed in arrival order once
//! the program map is known.

use std::sync::Arc;

use bytes::Bytes;
use pipeline_common::{PipelineError, Stage, StreamerContext};
use tracing::{debug, warn};

use crate::crc32::validate_section_crc32;
use crate::packet::{PID_PAT, TsPacket};
use crate::psi::{PidRole, ProgramMap, parse_pat, parse_pmt};

/// One elementary-stream payload fragment routed by PID role.
#[derive(Debug, Clone)]
pub struct PesFragment {
    pub pid: u16,
    pub role: PidRole,
    pub stream_type: u8,
    pub payload_unit_start: bool,
    pub payload: Bytes,
}

/// Output records of the [`PacketParser`].
#[derive(Debug, Clone)]
pub enum TsDemuxEvent {
    /// A PMT was accepted; the full program map, swapped atomically.
    ProgramMetadata(ProgramMap),
    /// Elementary-stream payload for a mapped PID.
    Pes(PesFragment),
}

/// Parses TS packet headers and routes PSI/PES.
pub struct PacketParser {
    context: Arc<StreamerContext>,
    pmt_pid: Option<u16>,
    program_map: Option<ProgramMap>,
    /// PES packets seen before the first PMT, replayed once the map exists.
    waiting_for_pmt: Vec<TsPacket>,
    broad_stream_detection: bool,
    validate_crc: bool,
}

impl PacketParser {
    pub fn new(context: Arc<StreamerContext>) -> Self {
        Self {
            context,
            pmt_pid: None,
            program_map: None,
            waiting_for_pmt: Vec::new(),
            broad_stream_detection: false,
            validate_crc: false,
        }
    }

    /// Accept any video/audio-family stream type, not just H.264/ADTS.
    pub fn with_broad_stream_detection(mut self, enable: bool) -> Self {
        self.broad_stream_detection = enable;
        self
    }

    /// Enable CRC-32/MPEG-2 validation of PAT/PMT sections.
    pub fn with_crc_validation(mut self, enable: bool) -> Self {
        self.validate_crc = enable;
        self
    }

    pub fn program_map(&self) -> Option<&ProgramMap> {
        self.program_map.as_ref()
    }

    pub fn reset(&mut self) {
        self.pmt_pid = None;
        self.program_map = None;
        self.waiting_for_pmt.clear();
    }

    fn forward_pes(map: &ProgramMap, packet: &TsPacket, out: &mut Vec<TsDemuxEvent>) {
        let Some(payload) = packet.payload.clone() else {
            return;
        };
        if let Some((role, stream_type)) = map.entry_of(packet.pid) {
            out.push(TsDemuxEvent::Pes(PesFragment {
                pid: packet.pid,
                role,
                stream_type,
                payload_unit_start: packet.payload_unit_start_indicator,
                payload,
            }));
        }
    }

    fn handle_pmt(&mut self, packet: &TsPacket, out: &mut Vec<TsDemuxEvent>) {
        let Some(psi) = packet.psi_payload() else {
            return;
        };
        if self.validate_crc && !self.section_crc_ok(&psi) {
            debug!("{} dropping PMT section with bad CRC", self.context.name);
            return;
        }
        let Some(map) = parse_pmt(&psi, self.broad_stream_detection) else {
            return;
        };

        if let Some(existing) = &self.program_map {
            if *existing == map {
                // Repeated PMT carrying the same program: idempotent.
                return;
            }
            warn!(
                "{} PMT changed mid-timeline; stream roles may differ until reset",
                self.context.name
            );
        }

        debug!(
            "{} program map: video={:?} audio_pids={:?}",
            self.context.name,
            map.video_pid,
            map.audio.iter().map(|a| a.pid).collect::<Vec<_>>()
        );
        self.program_map = Some(map.clone());
        out.push(TsDemuxEvent::ProgramMetadata(map.clone()));

        // Honor packets that arrived ahead of the PMT, in order.
        let queued = std::mem::take(&mut self.waiting_for_pmt);
        for packet in &queued {
            Self::forward_pes(&map, packet, out);
        }
    }

    fn section_crc_ok(&self, psi: &Bytes) -> bool {
        if psi.len() < 3 {
            return false;
        }
        let section_length = ((psi[1] as usize & 0x0F) << 8) | psi[2] as usize;
        let total = 3 + section_length;
        total <= psi.len() && validate_section_crc32(&psi[..total])
    }
}

impl Stage for PacketParser {
    type In = Bytes;
    type Out = TsDemuxEvent;

    fn push(&mut self, input: Bytes, out: &mut Vec<TsDemuxEvent>) -> Result<(), PipelineError> {
        let packet = match TsPacket::parse(input) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("{} dropping malformed TS packet: {e}", self.context.name);
                return Ok(());
            }
        };

        if packet.pid == PID_PAT {
            if let Some(psi) = packet.psi_payload() {
                if self.validate_crc && !self.section_crc_ok(&psi) {
                    debug!("{} dropping PAT section with bad CRC", self.context.name);
                    return Ok(());
                }
                if let Some(pmt_pid) = parse_pat(&psi) {
                    self.pmt_pid = Some(pmt_pid);
                }
            }
            return Ok(());
        }

        if Some(packet.pid) == self.pmt_pid {
            self.handle_pmt(&packet, out);
            return Ok(());
        }

        match &self.program_map {
            Some(map) => Self::forward_pes(map, &packet, out),
            None => {
                if packet.has_payload() {
                    self.waiting_for_pmt.push(packet);
                }
            }
        }
        Ok(())
    }

    fn flush(&mut self, _out: &mut Vec<TsDemuxEvent>) -> Result<(), PipelineError> {
        // Packets still waiting for a PMT at end of stream are unroutable.
        if !self.waiting_for_pmt.is_empty() {
            debug!(
                "{} discarding {} packets never matched by a PMT",
                self.context.name,
                self.waiting_for_pmt.len()
            );
            self.waiting_for_pmt.clear();
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "PacketParser"
    }
}
