//! Synthesizes MPEG-TS fixtures: PAT/PMT sections and PES-wrapped H.264 /
//! ADTS elementary streams, packetized into real 188-byte TS packets with
//! continuity counters and adaptation-field stuffing.

use std::collections::HashMap;

/// Baseline-profile 320x240 SPS (decodes via the workspace SPS parser).
pub const TEST_SPS: &[u8] = &[0x67, 0x42, 0xC0, 0x1E, 0xF4, 0x0A, 0x0F, 0xC8];
pub const TEST_PPS: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];

pub const VIDEO_PID: u16 = 0x100;
pub const AUDIO_PID: u16 = 0x101;
pub const PMT_PID: u16 = 0x1000;

/// 90 kHz ticks per frame at 30 fps.
pub const VIDEO_FRAME_TICKS: u64 = 3000;

/// 90 kHz ticks per AAC frame at 44.1 kHz, rounded up.
pub const AUDIO_FRAME_TICKS: u64 = 2090;

#[derive(Default)]
pub struct TsFixtureBuilder {
    bytes: Vec<u8>,
    continuity: HashMap<u16, u8>,
}

impl TsFixtureBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }

    fn next_continuity(&mut self, pid: u16) -> u8 {
        let counter = self.continuity.entry(pid).or_insert(0);
        let value = *counter;
        *counter = (*counter + 1) & 0x0F;
        value
    }

    /// One PSI packet: pointer field + section, stuffed with 0xFF.
    fn psi_packet(&mut self, pid: u16, section: &[u8]) {
        let mut packet = Vec::with_capacity(188);
        packet.push(0x47);
        packet.push(0x40 | (pid >> 8) as u8);
        packet.push(pid as u8);
        packet.push(0x10 | self.next_continuity(pid));
        packet.push(0x00); // pointer field
        packet.extend_from_slice(section);
        packet.resize(188, 0xFF);
        self.bytes.extend_from_slice(&packet);
    }

    pub fn pat(&mut self) {
        let section = [
            0x00, 0xB0, 0x0D, // table_id, section_length 13
            0x00, 0x01, // transport_stream_id
            0xC1, 0x00, 0x00, // version 0, current, section numbers
            0x00, 0x01, // program_number 1
            0xE0 | (PMT_PID >> 8) as u8,
            PMT_PID as u8,
            0x00, 0x00, 0x00, 0x00, // CRC (unchecked by default)
        ];
        self.psi_packet(0, &section);
    }

    /// PMT advertising the given `(stream_type, pid)` elementary streams.
    pub fn pmt(&mut self, streams: &[(u8, u16)]) {
        let mut es_loop = Vec::new();
        for &(stream_type, pid) in streams {
            es_loop.push(stream_type);
            es_loop.push(0xE0 | (pid >> 8) as u8);
            es_loop.push(pid as u8);
            es_loop.push(0xF0);
            es_loop.push(0x00); // es_info_length 0
        }
        let section_length = 9 + es_loop.len() + 4;
        let mut section = vec![
            0x02,
            0xB0 | (section_length >> 8) as u8,
            section_length as u8,
            0x00,
            0x01, // program_number
            0xC1, // version 0, current
            0x00,
            0x00,
            0xE0 | (VIDEO_PID >> 8) as u8,
            VIDEO_PID as u8, // PCR PID
            0xF0,
            0x00, // program_info_length
        ];
        section.extend_from_slice(&es_loop);
        section.extend_from_slice(&[0, 0, 0, 0]); // CRC
        self.psi_packet(PMT_PID, &section);
    }

    pub fn default_program(&mut self) {
        self.pat();
        self.pmt(&[(0x1B, VIDEO_PID), (0x0F, AUDIO_PID)]);
    }

    /// Packetize one PES packet onto a PID, stuffing the final packet.
    pub fn pes_packets(&mut self, pid: u16, pes: &[u8]) {
        let mut offset = 0;
        let mut first = true;
        while offset < pes.len() {
            let remaining = pes.len() - offset;
            let payload_size = remaining.min(184);
            let mut packet = Vec::with_capacity(188);
            packet.push(0x47);
            packet.push(if first { 0x40 } else { 0x00 } | (pid >> 8) as u8);
            packet.push(pid as u8);
            let continuity = self.next_continuity(pid);
            if payload_size < 184 {
                // Adaptation field stuffing fills the gap.
                packet.push(0x30 | continuity);
                let adaptation_length = 184 - payload_size - 1;
                packet.push(adaptation_length as u8);
                if adaptation_length > 0 {
                    packet.push(0x00); // no flags
                    packet.resize(packet.len() + adaptation_length - 1, 0xFF);
                }
            } else {
                packet.push(0x10 | continuity);
            }
            packet.extend_from_slice(&pes[offset..offset + payload_size]);
            debug_assert_eq!(packet.len(), 188);
            self.bytes.extend_from_slice(&packet);
            offset += payload_size;
            first = false;
        }
    }

    /// One H.264 access unit as a video PES packet (length 0, PTS+DTS).
    pub fn video_access_unit(&mut self, pts: u64, dts: u64, idr: bool, with_params: bool) {
        let mut es = Vec::new();
        es.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x09, 0xF0]); // AUD
        if with_params {
            es.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
            es.extend_from_slice(TEST_SPS);
            es.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
            es.extend_from_slice(TEST_PPS);
        }
        es.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        if idr {
            es.push(0x65);
        } else {
            es.push(0x41);
        }
        es.extend_from_slice(&[0x88; 24]);

        let pes = build_pes(0xE0, Some((pts, dts)), 0, &es);
        self.pes_packets(VIDEO_PID, &pes);
    }

    /// A run of 30 fps access units; the first is an IDR carrying SPS/PPS.
    pub fn video_second(&mut self, base_pts: u64, frames: u64) {
        for i in 0..frames {
            let ts = base_pts + i * VIDEO_FRAME_TICKS;
            self.video_access_unit(ts, ts, i == 0, i == 0);
        }
    }

    /// `count` ADTS frames in one audio PES with a declared length.
    pub fn audio_frames(&mut self, pts: u64, count: usize) {
        let mut es = Vec::new();
        for _ in 0..count {
            es.extend_from_slice(&adts_frame(&[0x5A; 16]));
        }
        let pes = build_pes(0xC0, Some((pts, pts)), es.len(), &es);
        self.pes_packets(AUDIO_PID, &pes);
    }

    /// One second of 44.1 kHz audio in PES packets of four frames each.
    pub fn audio_second(&mut self, base_pts: u64) {
        let mut frame_index = 0u64;
        while frame_index < 43 {
            let batch = 4.min(43 - frame_index);
            self.audio_frames(base_pts + frame_index * AUDIO_FRAME_TICKS, batch as usize);
            frame_index += batch;
        }
    }
}

/// Build a complete PES packet. `es_len` of zero means "until next start"
/// (video); otherwise the PES length field covers the optional header and
/// payload.
pub fn build_pes(stream_id: u8, timestamps: Option<(u64, u64)>, es_len: usize, es: &[u8]) -> Vec<u8> {
    let mut pes = vec![0x00, 0x00, 0x01, stream_id];
    let header_data_len: usize = if timestamps.is_some() { 10 } else { 0 };
    let packet_length = if es_len == 0 {
        0
    } else {
        3 + header_data_len + es_len
    };
    pes.push((packet_length >> 8) as u8);
    pes.push(packet_length as u8);
    pes.push(0x80); // marker bits
    pes.push(if timestamps.is_some() { 0xC0 } else { 0x00 });
    pes.push(header_data_len as u8);
    if let Some((pts, dts)) = timestamps {
        pes.extend_from_slice(&encode_timestamp(0x30, pts));
        pes.extend_from_slice(&encode_timestamp(0x10, dts));
    }
    pes.extend_from_slice(es);
    pes
}

/// Encode a 33-bit timestamp into the 5-byte marker-bit layout.
pub fn encode_timestamp(prefix: u8, ts: u64) -> [u8; 5] {
    let ts = ts & 0x1_FFFF_FFFF; // the wire carries 33 bits
    [
        prefix | (((ts >> 30) as u8 & 0x07) << 1) | 0x01,
        (ts >> 22) as u8,
        ((ts >> 15) as u8 & 0x7F) << 1 | 0x01,
        (ts >> 7) as u8,
        ((ts as u8) & 0x7F) << 1 | 0x01,
    ]
}

/// One ADTS frame: 44.1 kHz, AAC-LC, stereo, no CRC.
pub fn adts_frame(payload: &[u8]) -> Vec<u8> {
    let frame_length = 7 + payload.len();
    let mut frame = vec![
        0xFF,
        0xF1,
        0x50,
        0x80 | ((frame_length >> 11) as u8 & 0x03),
        (frame_length >> 3) as u8,
        ((frame_length as u8 & 0x07) << 5) | 0x1F,
        0xFC,
    ];
    frame.extend_from_slice(payload);
    frame
}
