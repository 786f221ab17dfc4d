//! CEA-608 caption extraction from H.264 SEI messages
//!
//! Caption bytes ride in SEI NALs as ITU-T T.35 user data registered to
//! ATSC (`GA94`). This stage collects the CC byte pairs per access unit,
//! reorders them into presentation order at flush time, and runs a CEA-608
//! decoder for the primary caption service (CC1) covering pop-on, roll-up
//! and paint-on modes.

use std::sync::Arc;

use bytes::Bytes;
use pipeline_common::{PipelineError, Stage, StreamerContext};
use tracing::debug;

use crate::h264::{NalUnit, NalUnitType, ebsp_to_rbsp};

/// sei_payload type carrying registered ITU-T T.35 user data.
const USER_DATA_REGISTERED_ITU_T_T35: u32 = 4;

/// A finished caption cue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caption {
    pub start_pts: u64,
    pub end_pts: u64,
    pub text: String,
}

/// One CC byte pair with its presentation time.
#[derive(Debug, Clone, Copy)]
struct CaptionPacket {
    pts: u64,
    /// cc_type: 0/1 are the two 608 fields.
    cc_type: u8,
    cc_data: u16,
}

/// Extract the first ITU-T T.35 payload from an SEI RBSP.
fn parse_sei(rbsp: &[u8]) -> Option<Bytes> {
    let mut i = 0;
    while i < rbsp.len() {
        if rbsp[i] == 0x80 {
            // rbsp_trailing_bits
            break;
        }

        let mut payload_type = 0u32;
        while i < rbsp.len() && rbsp[i] == 0xFF {
            payload_type += 255;
            i += 1;
        }
        if i >= rbsp.len() {
            break;
        }
        payload_type += rbsp[i] as u32;
        i += 1;

        let mut payload_size = 0usize;
        while i < rbsp.len() && rbsp[i] == 0xFF {
            payload_size += 255;
            i += 1;
        }
        if i >= rbsp.len() {
            break;
        }
        payload_size += rbsp[i] as usize;
        i += 1;

        if i + payload_size > rbsp.len() {
            break;
        }
        if payload_type == USER_DATA_REGISTERED_ITU_T_T35 {
            return Some(Bytes::copy_from_slice(&rbsp[i..i + payload_size]));
        }
        i += payload_size;
    }
    None
}

/// Peel the ATSC GA94 framing off a T.35 payload, returning the cc_data
/// block (including the marker/count byte).
fn parse_user_data(payload: &[u8]) -> Option<&[u8]> {
    // itu_t_t35_country_code (USA), provider code (ATSC), 'GA94', type 3
    if payload.len() < 9 || payload[0] != 0xB5 {
        return None;
    }
    if u16::from_be_bytes([payload[1], payload[2]]) != 0x0031 {
        return None;
    }
    if &payload[3..7] != b"GA94" || payload[7] != 0x03 {
        return None;
    }
    Some(&payload[8..payload.len() - 1])
}

/// Expand a cc_data block into valid caption packets.
fn parse_caption_packets(pts: u64, user_data: &[u8], out: &mut Vec<CaptionPacket>) {
    if user_data.is_empty() || user_data[0] & 0x40 == 0 {
        // process_cc_data_flag unset
        return;
    }
    let count = (user_data[0] & 0x1F) as usize;
    for i in 0..count {
        let offset = i * 3 + 2;
        if offset + 2 >= user_data.len() {
            break;
        }
        // cc_valid
        if user_data[offset] & 0x04 != 0 {
            out.push(CaptionPacket {
                pts,
                cc_type: user_data[offset] & 0x03,
                cc_data: u16::from_be_bytes([user_data[offset + 1], user_data[offset + 2]]),
            });
        }
    }
}

const SCREEN_ROWS: usize = 15;

/// Row assignments by PAC code bits (data & 0x1F20).
const PAC_ROW_CODES: [u16; 15] = [
    0x1100, 0x1120, 0x1200, 0x1220, 0x1500, 0x1520, 0x1600, 0x1620, 0x1700, 0x1720, 0x1000,
    0x1300, 0x1320, 0x1400, 0x1420,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptionMode {
    PopOn,
    RollUp,
    PaintOn,
}

/// CEA-608 decoder for the primary service (field 1, data channel 1).
struct Cea608 {
    mode: CaptionMode,
    row: usize,
    roll_up_rows: usize,
    displayed: Vec<String>,
    non_displayed: Vec<String>,
    start_pts: u64,
    last_control: Option<u16>,
}

impl Cea608 {
    fn new() -> Self {
        Self {
            mode: CaptionMode::PopOn,
            row: SCREEN_ROWS - 1,
            roll_up_rows: 2,
            displayed: vec![String::new(); SCREEN_ROWS],
            non_displayed: vec![String::new(); SCREEN_ROWS],
            start_pts: 0,
            last_control: None,
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    fn flush_displayed(&mut self, pts: u64, out: &mut Vec<Caption>) {
        let text = self
            .displayed
            .iter()
            .map(|row| row.trim())
            .filter(|row| !row.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if !text.is_empty() {
            out.push(Caption {
                start_pts: self.start_pts,
                end_pts: pts,
                text,
            });
        }
    }

    fn buffer_mut(&mut self) -> &mut String {
        let row = self.row.min(SCREEN_ROWS - 1);
        match self.mode {
            CaptionMode::PopOn => &mut self.non_displayed[row],
            CaptionMode::RollUp | CaptionMode::PaintOn => &mut self.displayed[row],
        }
    }

    fn push_pair(&mut self, pts: u64, cc_data: u16, out: &mut Vec<Caption>) {
        // Strip the odd-parity bits.
        let data = cc_data & 0x7F7F;
        let char0 = (data >> 8) as u8;
        let char1 = data as u8;

        // Control codes are doubled on the wire; process each only once.
        // Padding between the two copies does not break the pairing.
        if self.last_control == Some(data) {
            self.last_control = None;
            return;
        }
        if char0 & 0xF0 == 0x10 {
            self.last_control = Some(data);
        } else if data != 0 {
            self.last_control = None;
        }

        // Data channel 2 uses the 0x18..0x1F lead bytes; CC1 ignores it.
        if (0x18..=0x1F).contains(&char0) {
            return;
        }

        match data {
            0x0000 => {} // padding
            0x1420 => {
                // resume caption loading
                self.mode = CaptionMode::PopOn;
            }
            0x142F => {
                // end of caption: display the loaded buffer
                self.flush_displayed(pts, out);
                std::mem::swap(&mut self.displayed, &mut self.non_displayed);
                for row in &mut self.non_displayed {
                    row.clear();
                }
                self.mode = CaptionMode::PopOn;
                self.start_pts = pts;
            }
            0x142C => {
                // erase displayed memory
                self.flush_displayed(pts, out);
                for row in &mut self.displayed {
                    row.clear();
                }
            }
            0x142E => {
                // erase non-displayed memory
                for row in &mut self.non_displayed {
                    row.clear();
                }
            }
            0x1421 => {
                // backspace
                self.buffer_mut().pop();
            }
            0x1425 | 0x1426 | 0x1427 => {
                self.roll_up_rows = (data - 0x1423) as usize;
                self.mode = CaptionMode::RollUp;
                self.row = SCREEN_ROWS - 1;
                self.start_pts = pts;
            }
            0x142D => {
                // carriage return: complete the visible cue and scroll
                if self.mode == CaptionMode::RollUp {
                    self.flush_displayed(pts, out);
                    let top = SCREEN_ROWS - self.roll_up_rows;
                    for row in top..SCREEN_ROWS - 1 {
                        self.displayed[row] = std::mem::take(&mut self.displayed[row + 1]);
                    }
                    self.displayed[SCREEN_ROWS - 1].clear();
                    self.start_pts = pts;
                }
            }
            0x1429 => {
                // resume direct captioning
                self.mode = CaptionMode::PaintOn;
                self.start_pts = pts;
            }
            _ if char0 == 0x11 && (0x30..=0x3F).contains(&char1) => {
                self.buffer_mut().push(special_char(char1 & 0x0F));
            }
            _ if (char0 == 0x12 || char0 == 0x13) && (0x20..=0x3F).contains(&char1) => {
                // Extended characters replace the preceding basic character.
                self.buffer_mut().pop();
                self.buffer_mut().push(extended_char(char0, char1));
            }
            _ if (0x10..=0x17).contains(&char0) && (0x40..=0x7F).contains(&char1) => {
                // Preamble address code: position the cursor row. Roll-up
                // always writes at the bottom of its window, so only the
                // buffered modes honor the row.
                if self.mode != CaptionMode::RollUp
                    && let Some(row) = PAC_ROW_CODES.iter().position(|&code| code == data & 0x1F20)
                {
                    self.row = row;
                }
            }
            _ if char0 == 0x11 && (0x20..=0x2F).contains(&char1) => {
                // Mid-row formatting codes occupy one column.
                self.buffer_mut().push(' ');
            }
            _ if (0x20..=0x7F).contains(&char0) => {
                let buffer = self.buffer_mut();
                buffer.push(basic_char(char0));
                if (0x20..=0x7F).contains(&char1) {
                    buffer.push(basic_char(char1));
                }
            }
            _ => {}
        }
    }
}

/// Basic CEA-608 character set: ASCII with a handful of substitutions.
fn basic_char(code: u8) -> char {
    match code {
        0x2A => 'á',
        0x5C => 'é',
        0x5E => 'í',
        0x5F => 'ó',
        0x60 => 'ú',
        0x7B => 'ç',
        0x7C => '÷',
        0x7D => 'Ñ',
        0x7E => 'ñ',
        0x7F => '█',
        c => c as char,
    }
}

/// Special characters, codes 0x1130–0x113F.
fn special_char(index: u8) -> char {
    const TABLE: [char; 16] = [
        '®', '°', '½', '¿', '™', '¢', '£', '♪', 'à', ' ', 'è', 'â', 'ê', 'î', 'ô', 'û',
    ];
    TABLE[index as usize]
}

/// Extended western-European characters, lead bytes 0x12/0x13.
fn extended_char(char0: u8, char1: u8) -> char {
    const SPANISH_FRENCH: [char; 32] = [
        'Á', 'É', 'Ó', 'Ú', 'Ü', 'ü', '\u{2018}', '¡', '*', '\'', '─', '©', '℠', '·', '“', '”',
        'À', 'Â', 'Ç', 'È', 'Ê', 'Ë', 'ë', 'Î', 'Ï', 'ï', 'Ô', 'Ù', 'ù', 'Û', '«', '»',
    ];
    const PORTUGUESE_GERMAN: [char; 32] = [
        'Ã', 'ã', 'Í', 'Ì', 'ì', 'Ò', 'ò', 'Õ', 'õ', '{', '}', '\\', '^', '_', '|', '~', 'Ä',
        'ä', 'Ö', 'ö', 'ß', '¥', '¤', '│', 'Å', 'å', 'Ø', 'ø', '┌', '┐', '└', '┘',
    ];
    let index = (char1 - 0x20) as usize;
    if char0 == 0x12 {
        SPANISH_FRENCH[index]
    } else {
        PORTUGUESE_GERMAN[index]
    }
}

/// Caption extraction stage: H.264 NAL units in, caption cues out.
pub struct CaptionStream {
    context: Arc<StreamerContext>,
    pending: Vec<CaptionPacket>,
    decoder: Cea608,
}

impl CaptionStream {
    pub fn new(context: Arc<StreamerContext>) -> Self {
        Self {
            context,
            pending: Vec::new(),
            decoder: Cea608::new(),
        }
    }

    /// Drop pending packets and decoder state (caption discontinuity).
    pub fn reset(&mut self) {
        self.pending.clear();
        self.decoder.reset();
    }
}

impl Stage for CaptionStream {
    type In = NalUnit;
    type Out = Caption;

    fn push(&mut self, input: NalUnit, _out: &mut Vec<Caption>) -> Result<(), PipelineError> {
        if input.nal_unit_type != NalUnitType::Sei {
            return Ok(());
        }
        let rbsp = ebsp_to_rbsp(&input.data[1..]);
        let Some(payload) = parse_sei(&rbsp) else {
            return Ok(());
        };
        let Some(user_data) = parse_user_data(&payload) else {
            return Ok(());
        };
        let before = self.pending.len();
        parse_caption_packets(input.pts, user_data, &mut self.pending);
        if self.pending.len() > before {
            debug!(
                "{} collected {} caption byte pairs",
                self.context.name,
                self.pending.len() - before
            );
        }
        Ok(())
    }

    fn flush(&mut self, out: &mut Vec<Caption>) -> Result<(), PipelineError> {
        // SEI messages arrive in decode order; cues are built in
        // presentation order.
        let mut packets = std::mem::take(&mut self.pending);
        packets.sort_by_key(|p| p.pts);
        for packet in packets {
            // Field 1 only; field 2 carries CC3/CC4.
            if packet.cc_type == 0 {
                self.decoder.push_pair(packet.pts, packet.cc_data, out);
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "CaptionStream"
    }
}
